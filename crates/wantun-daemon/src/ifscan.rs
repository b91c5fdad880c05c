//! Local interface address introspection.
//!
//! The exclusion policy needs to know which subnets are reachable
//! directly on the uplink interfaces so that traffic to them is never
//! pulled into the tunnel.

use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;
use tracing::debug;

static INET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\binet\s+(\d+\.\d+\.\d+\.\d+/\d+)").expect("static regex is valid")
});

/// Query the IPv4 subnets currently assigned to a network interface.
///
/// A missing interface is an expected condition on many deployments (no
/// cellular modem fitted, WiFi disabled) and yields an empty list, as does
/// any failure of the underlying `ip` invocation.
pub async fn subnets_for(interface: &str) -> Vec<String> {
    let output = match Command::new("ip")
        .args(["-4", "addr", "show", "dev", interface])
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            debug!(interface, error = %err, "interface address query failed");
            return Vec::new();
        }
    };

    if !output.status.success() {
        debug!(interface, status = %output.status, "interface not present");
        return Vec::new();
    }

    scan_interface_subnets(&String::from_utf8_lossy(&output.stdout))
}

/// Extract every `inet <cidr>` token from an `ip addr` dump, in appearance
/// order. Duplicates and ordering are preserved; deduplication belongs to
/// the exclusion builder.
pub fn scan_interface_subnets(text: &str) -> Vec<String> {
    INET_RE
        .captures_iter(text)
        .map(|cap| cap[1].to_string())
        .collect()
}
