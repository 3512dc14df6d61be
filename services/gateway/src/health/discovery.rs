//! Port discovery for suggesting new routes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tracing::info;

use super::SharedPortProbe;

/// Inclusive port range. `start` is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("expected 'start-end', got '{0}'")]
    Format(String),

    #[error("invalid port '{0}'")]
    Port(String),

    #[error("range {start}-{end} is empty or starts at 0")]
    Empty { start: u16, end: u16 },
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if start == 0 || start > end {
            return Err(PortRangeError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self { start: 1, end: 5000 }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| PortRangeError::Format(s.to_string()))?;
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| PortRangeError::Port(p.trim().to_string()))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

/// Sweeps a port range with bounded concurrency.
#[derive(Clone)]
pub struct PortScanner {
    prober: SharedPortProbe,
    timeout: Duration,
    concurrency: usize,
}

impl PortScanner {
    pub fn new(prober: SharedPortProbe, timeout: Duration, concurrency: usize) -> Self {
        Self {
            prober,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Returns the open ports of `range` on `host`, skipping `excluded`, ascending.
    pub async fn discover(
        &self,
        host: &str,
        excluded: &BTreeSet<u16>,
        range: PortRange,
    ) -> Vec<u16> {
        let candidates: Vec<u16> = range.iter().filter(|p| !excluded.contains(p)).collect();
        let scanned = candidates.len();

        let mut open: Vec<u16> = stream::iter(candidates)
            .map(|port| async move {
                self.prober
                    .probe(host, port, self.timeout)
                    .await
                    .then_some(port)
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|port| async move { port })
            .collect()
            .await;
        open.sort_unstable();

        info!(host, %range, scanned, open = open.len(), "Port discovery finished");
        open
    }
}

impl fmt::Debug for PortScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortScanner")
            .field("timeout", &self.timeout)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}
