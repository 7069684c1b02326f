//! External connectivity processes (port-forward, VPN bridge, reverse
//! tunnel) and the local resolver, supervised as one ordered group

pub mod dns;
mod keys;
mod process;
pub mod ssh;
mod stage;
pub mod vpn;

pub use dns::{DnsStage, NameServer, ResolvConf};
pub use keys::SshKeyPair;
pub use process::{run_and_wait, ChildProcess};
pub use ssh::{free_port, PortForwardStage, ReverseTunnelStage};
pub use stage::{Stage, Supervisor};
pub use vpn::{ensure_vpn_binary, VpnRequest, VpnStage};
