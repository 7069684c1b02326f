//! Cluster network discovery: which IP ranges a local routing table must
//! cover to reach pods and services

mod discovery;
mod range;

pub use discovery::NetworkDiscovery;
pub use range::{calculate_minimal_ip_range, DEFAULT_PREFIX};
