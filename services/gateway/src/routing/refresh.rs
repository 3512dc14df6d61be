//! Periodic health refresh.
//!
//! Route writes trigger a compile directly. This worker covers the other
//! direction: backends that come up or go down without any route change.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{CompileOutcome, RouteCompiler};

#[derive(Debug, Clone)]
pub struct HealthRefresherConfig {
    pub interval: Duration,
}

impl Default for HealthRefresherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

pub struct HealthRefresher {
    compiler: Arc<RouteCompiler>,
    config: HealthRefresherConfig,
}

impl HealthRefresher {
    pub fn new(compiler: Arc<RouteCompiler>, config: HealthRefresherConfig) -> Self {
        Self { compiler, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting health refresher"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health refresher shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn refresh(&self) {
        match self.compiler.compile().await {
            Ok(CompileOutcome::Rebuilt { version, entries }) => {
                info!(version, entries, "Health refresh changed the route table");
            }
            Ok(outcome) => {
                debug!(?outcome, "Health refresh found no changes");
            }
            Err(e) => {
                warn!(error = %e, "Health refresh failed");
            }
        }
    }
}
