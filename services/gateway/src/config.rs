//! Gateway configuration (env-driven).

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::health::PortRange;
use crate::proxy::ProxyConfig;
use crate::proxy::rewrite::DEFAULT_MAX_HTML_BYTES;
use crate::registry::DiscoverySettings;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gateway listens on (proxy, admin and health endpoints).
    pub listen_addr: SocketAddr,

    /// Host every port probe and discovery sweep runs against.
    pub health_check_host: String,

    pub probe_timeout: Duration,
    pub probe_concurrency: usize,

    pub discovery_range: PortRange,
    pub discovery_concurrency: usize,
    /// Ports never suggested by discovery. Always includes the listen port.
    pub discovery_exclude: BTreeSet<u16>,

    pub upstream_connect_timeout: Duration,
    pub upstream_timeout: Duration,

    /// Largest HTML body buffered for rewriting.
    pub max_html_bytes: usize,

    /// Health refresh interval. `None` disables the refresher.
    pub health_refresh_interval: Option<Duration>,

    /// Optional JSON file the route repository is persisted to.
    pub state_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = lookup("PORTICO_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8000".to_string())
            .parse()
            .context("PORTICO_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8000).")?;

        let health_check_host = lookup("PORTICO_HEALTH_CHECK_HOST")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let probe_timeout_ms: u64 = parse_var(&lookup, "PORTICO_PROBE_TIMEOUT_MS")
            .context("PORTICO_PROBE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let probe_concurrency: usize = parse_var(&lookup, "PORTICO_PROBE_CONCURRENCY")
            .context("PORTICO_PROBE_CONCURRENCY must be an integer.")?
            .unwrap_or(32);

        let discovery_range: PortRange = parse_var(&lookup, "PORTICO_DISCOVERY_RANGE")
            .context("PORTICO_DISCOVERY_RANGE must look like 'start-end' (example: 1-5000).")?
            .unwrap_or_default();
        let discovery_concurrency: usize = parse_var(&lookup, "PORTICO_DISCOVERY_CONCURRENCY")
            .context("PORTICO_DISCOVERY_CONCURRENCY must be an integer.")?
            .unwrap_or(64);
        let mut discovery_exclude = parse_port_list(
            &lookup("PORTICO_DISCOVERY_EXCLUDE").unwrap_or_else(|| "27017".to_string()),
        )
        .context("PORTICO_DISCOVERY_EXCLUDE must be a comma-separated list of ports.")?;
        discovery_exclude.insert(listen_addr.port());

        let upstream_connect_timeout_ms: u64 =
            parse_var(&lookup, "PORTICO_UPSTREAM_CONNECT_TIMEOUT_MS")
                .context("PORTICO_UPSTREAM_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
                .unwrap_or(5000);
        let upstream_timeout_ms: u64 = parse_var(&lookup, "PORTICO_UPSTREAM_TIMEOUT_MS")
            .context("PORTICO_UPSTREAM_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(60_000);

        let max_html_bytes: usize = parse_var(&lookup, "PORTICO_MAX_HTML_BYTES")
            .context("PORTICO_MAX_HTML_BYTES must be an integer (bytes).")?
            .unwrap_or(DEFAULT_MAX_HTML_BYTES);

        let health_refresh_secs: u64 = parse_var(&lookup, "PORTICO_HEALTH_REFRESH_SECS")
            .context("PORTICO_HEALTH_REFRESH_SECS must be an integer (seconds).")?
            .unwrap_or(30);
        let health_refresh_interval =
            (health_refresh_secs > 0).then(|| Duration::from_secs(health_refresh_secs));

        let state_file = lookup("PORTICO_STATE_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let log_level = lookup("PORTICO_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            health_check_host,
            probe_timeout: Duration::from_millis(probe_timeout_ms.max(1)),
            probe_concurrency: probe_concurrency.max(1),
            discovery_range,
            discovery_concurrency: discovery_concurrency.max(1),
            discovery_exclude,
            upstream_connect_timeout: Duration::from_millis(upstream_connect_timeout_ms.max(1)),
            upstream_timeout: Duration::from_millis(upstream_timeout_ms.max(1)),
            max_html_bytes,
            health_refresh_interval,
            state_file,
            log_level,
        })
    }

    pub fn proxy(&self) -> ProxyConfig {
        ProxyConfig {
            connect_timeout: self.upstream_connect_timeout,
            request_timeout: self.upstream_timeout,
            max_html_bytes: self.max_html_bytes,
        }
    }

    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            range: self.discovery_range,
            excluded: self.discovery_exclude.clone(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("Invalid value for {key}"))
}

fn parse_port_list(raw: &str) -> Result<BTreeSet<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u16>().with_context(|| format!("Invalid port '{p}'")))
        .collect()
}
