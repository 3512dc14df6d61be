//! Batch health evaluation of routes.

use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::debug;

use super::SharedPortProbe;
use crate::route::Route;

/// A route annotated with the result of its most recent probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckedRoute {
    #[serde(flatten)]
    pub route: Route,
    #[serde(rename = "is_healthy")]
    pub reachable: bool,
}

/// Probes routes against the configured health-check host.
#[derive(Clone)]
pub struct HealthEvaluator {
    prober: SharedPortProbe,
    host: String,
    timeout: Duration,
    concurrency: usize,
}

impl HealthEvaluator {
    pub fn new(
        prober: SharedPortProbe,
        host: impl Into<String>,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            prober,
            host: host.into(),
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// The host every probe is executed against.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn prober(&self) -> &SharedPortProbe {
        &self.prober
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// External routes (`check_port == 0`) are reachable without probing.
    pub async fn is_reachable(&self, route: &Route) -> bool {
        if route.is_external() {
            return true;
        }
        self.prober
            .probe(&self.host, route.check_port, self.timeout)
            .await
    }

    /// Evaluates every route, at most `concurrency` probes in flight.
    ///
    /// Resolves once every probe has finished. Output order matches input order.
    pub async fn evaluate(&self, routes: Vec<Route>) -> Vec<HealthCheckedRoute> {
        let total = routes.len();
        let checked: Vec<HealthCheckedRoute> = stream::iter(routes)
            .map(|route| async move {
                let reachable = self.is_reachable(&route).await;
                HealthCheckedRoute { route, reachable }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        debug!(
            host = %self.host,
            total,
            reachable = checked.iter().filter(|c| c.reachable).count(),
            "Evaluated route health"
        );
        checked
    }
}

impl std::fmt::Debug for HealthEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthEvaluator")
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{PortProbe, ProbeError};
    use async_trait::async_trait;
    use chrono::Utc;
    use portico_id::RouteId;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Reports a fixed set of ports as open and tracks peak concurrency.
    #[derive(Default)]
    struct FakeProber {
        open: HashSet<u16>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl PortProbe for FakeProber {
        async fn check(&self, _host: &str, port: u16, _t: Duration) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            // Later ports finish first so ordering is actually exercised.
            tokio::time::sleep(Duration::from_millis(u64::from(50 - port % 50))).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.open.contains(&port) {
                Ok(())
            } else {
                Err(ProbeError::Refused)
            }
        }
    }

    fn route(path: &str, port: u16) -> Route {
        let now = Utc::now();
        Route {
            id: RouteId::new(),
            name: path.trim_start_matches('/').to_string(),
            route_path: path.to_string(),
            target_url: "http://127.0.0.1:9".to_string(),
            check_port: port,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn evaluator(prober: Arc<FakeProber>, concurrency: usize) -> HealthEvaluator {
        HealthEvaluator::new(prober, "127.0.0.1", Duration::from_secs(1), concurrency)
    }

    #[tokio::test]
    async fn test_external_routes_always_reachable_without_probe() {
        let prober = Arc::new(FakeProber::default());
        let eval = evaluator(Arc::clone(&prober), 4);

        let checked = eval.evaluate(vec![route("/ext", 0), route("/ext2", 0)]).await;
        assert!(checked.iter().all(|c| c.reachable));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_output_order_matches_input() {
        let prober = Arc::new(FakeProber {
            open: [3001, 3003].into_iter().collect(),
            ..Default::default()
        });
        let eval = evaluator(prober, 8);

        let routes = vec![
            route("/a", 3001),
            route("/b", 3002),
            route("/c", 3003),
            route("/d", 0),
        ];
        let checked = eval.evaluate(routes.clone()).await;

        let got: Vec<_> = checked
            .iter()
            .map(|c| (c.route.route_path.as_str(), c.reachable))
            .collect();
        assert_eq!(
            got,
            vec![("/a", true), ("/b", false), ("/c", true), ("/d", true)]
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let prober = Arc::new(FakeProber::default());
        let eval = evaluator(Arc::clone(&prober), 3);

        let routes = (1..=12).map(|i| route(&format!("/r{i}"), 3000 + i)).collect();
        let checked = eval.evaluate(routes).await;

        assert_eq!(checked.len(), 12);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 12);
        let peak = prober.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded limit");
        assert!(peak > 1, "probes did not overlap");
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let eval = evaluator(Arc::new(FakeProber::default()), 4);
        assert!(eval.evaluate(Vec::new()).await.is_empty());
    }

    #[test]
    fn test_serializes_with_is_healthy() {
        let checked = HealthCheckedRoute {
            route: route("/a", 3001),
            reachable: true,
        };
        let json = serde_json::to_value(&checked).unwrap();
        assert_eq!(json["is_healthy"], true);
        assert_eq!(json["route_path"], "/a");
    }
}
