//! TCP port probing.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Why a probe did not reach its port.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection refused")]
    Refused,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A reachability check against `host:port`.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Attempts a single connection. The timeout bounds resolution and connect together.
    async fn check(&self, host: &str, port: u16, timeout: Duration) -> Result<(), ProbeError>;

    /// Like [`check`](Self::check), but every failure collapses to `false`.
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match self.check(host, port, timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!(host, port, error = %e, "port probe failed");
                false
            }
        }
    }
}

/// Shared prober handle.
pub type SharedPortProbe = Arc<dyn PortProbe>;

/// Probes by opening a TCP connection and dropping it immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl PortProbe for TcpProber {
    async fn check(&self, host: &str, port: u16, limit: Duration) -> Result<(), ProbeError> {
        match timeout(limit, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(ProbeError::Refused)
            }
            Ok(Err(e)) => Err(ProbeError::Io(e)),
            Err(_) => Err(ProbeError::Timeout(limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_millis(500);

    /// Binds and immediately drops a listener to get a port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(TcpProber.check("127.0.0.1", port, TIMEOUT).await.is_ok());
        assert!(TcpProber.probe("127.0.0.1", port, TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        let port = closed_port().await;

        let err = TcpProber.check("127.0.0.1", port, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProbeError::Refused | ProbeError::Io(_)));
        assert!(!TcpProber.probe("127.0.0.1", port, TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_unreachable() {
        assert!(!TcpProber.probe("host.invalid", 80, TIMEOUT).await);
    }
}
