//! Minimal covering ranges for a set of addresses

use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

pub const DEFAULT_PREFIX: u8 = 24;

/// Reduce addresses to the distinct networks of `prefix` length containing
/// them. Inputs may be plain addresses or CIDRs (their network address is
/// used). Unparsable entries are skipped. Output order is not meaningful.
pub fn calculate_minimal_ip_range<S: AsRef<str>>(ips: &[S], prefix: u8) -> Vec<String> {
    let mut ranges = BTreeSet::new();
    for ip in ips {
        let ip = ip.as_ref().trim();
        let addr = match ip.parse::<Ipv4Addr>() {
            Ok(addr) => addr,
            Err(_) => match ip.parse::<Ipv4Net>() {
                Ok(net) => net.network(),
                Err(_) => {
                    debug!(ip, "Skipping malformed address");
                    continue;
                }
            },
        };
        match Ipv4Net::new(addr, prefix) {
            Ok(net) => {
                ranges.insert(net.trunc());
            }
            Err(_) => {
                warn!(prefix, "Invalid prefix length");
                return Vec::new();
            }
        }
    }
    ranges.into_iter().map(|net| net.to_string()).collect()
}
