//! Backend reachability.
//!
//! - [`PortProbe`] / [`TcpProber`]: single TCP connect-and-close checks
//! - [`HealthEvaluator`]: annotates a batch of routes with reachability
//! - [`PortScanner`]: sweeps a port range for unregistered listeners

mod discovery;
mod evaluator;
mod prober;

pub use discovery::{PortRange, PortRangeError, PortScanner};
pub use evaluator::{HealthCheckedRoute, HealthEvaluator};
pub use prober::{PortProbe, ProbeError, SharedPortProbe, TcpProber};
