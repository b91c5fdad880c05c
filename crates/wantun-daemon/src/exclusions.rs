//! Routing exclusion policy.
//!
//! Traffic to these subnets must stay off the tunnel: the loopback and
//! private address classes, whatever is reachable directly on the uplink
//! interfaces, operator-supplied subnets, and the tunnel server itself.

use std::collections::BTreeSet;
use std::net::IpAddr;

use wantun_core::TunnelConfig;

use crate::ifscan;

/// Always excluded: loopback plus the three private address classes.
///
/// Excluding the whole class transitively covers every subnet nested in
/// it (pod and service networks, the LAN segment), so those need no
/// individual entries.
pub const FIXED_EXCLUSIONS: [&str; 4] = [
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
];

/// Uplink interfaces whose local subnets must stay directly reachable.
/// Not every deployment has all of them fitted.
pub const UPLINK_INTERFACES: [&str; 3] = ["wan0", "wlan0", "wwan0"];

/// Build the exclusion list for one run.
///
/// `server_ip` is the resolved tunnel server address, widened to /16 so
/// the tunnel's own control connection is never routed into the tunnel it
/// is establishing. The result is deduplicated and sorted, so identical
/// inputs produce identical lists regardless of union order.
pub async fn build(
    config: &TunnelConfig,
    server_ip: IpAddr,
    interfaces: &[&str],
) -> Vec<String> {
    let mut set: BTreeSet<String> = FIXED_EXCLUSIONS.iter().map(|s| (*s).to_string()).collect();

    set.insert(format!("{server_ip}/16"));

    for interface in interfaces {
        set.extend(ifscan::subnets_for(interface).await);
    }

    set.extend(config.excludes.iter().cloned());

    set.into_iter().collect()
}
