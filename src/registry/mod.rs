//! Shadow-resource registry and expiry engine
//!
//! There is no database: the registry is the set of labelled objects in the
//! cluster. A resource is active while its heartbeat is fresh and orphaned
//! once the heartbeat is older than the threshold. Orphans are classified by
//! the reversal they need and then reversed best-effort.

pub mod apply;
pub mod classify;
pub mod heartbeat;
pub mod meta;

pub use apply::{apply, preview, ApplyReport};
pub use classify::{scan_and_classify, ExpiryPolicy, ResourceToClean};
pub use heartbeat::HeartbeatKeeper;
pub use meta::{LockRecord, Role, ShadowRecord};
