//! Stale tunnel state reconciliation.
//!
//! A previous run that crashed or was killed can leave an orphaned
//! tunnel client process and its redirect chains/rules in the kernel NAT
//! table. Both are removed before a new launch and again after the run
//! ends, so tunnel state never outlives one supervision cycle.
//!
//! Reconciliation is idempotent: running it against a clean system is a
//! no-op, and every deletion tolerates the artifact already being gone.

use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

/// Program name of the tunnel client as it appears in the process table.
pub const TUNNEL_PROC_NAME: &str = "sshuttle";

static CHAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^:(sshuttle-\d+)").expect("static regex is valid"));

static RULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^-A\s+(.*sshuttle.*)$").expect("static regex is valid"));

/// One pending deletion in the NAT table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOp {
    /// `iptables -t nat -D <rule spec>`
    DeleteRule(Vec<String>),
    /// `iptables -t nat -X <chain>`
    DeleteChain(String),
}

/// Finds and removes artifacts left behind by a previous tunnel run.
pub struct Reconciler {
    proc_name: &'static str,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub const fn new() -> Self {
        Self {
            proc_name: TUNNEL_PROC_NAME,
        }
    }

    /// Remove all artifacts of a previous tunnel run.
    ///
    /// Two independent passes, both best-effort: a failure in one is
    /// logged and does not abort the other.
    pub async fn reconcile(&self) {
        self.remove_stale_processes().await;
        self.remove_stale_filter_state().await;
    }

    /// Terminate every process whose command name is exactly the tunnel
    /// client's.
    async fn remove_stale_processes(&self) {
        let output = match Command::new("ps").args(["-A", "-o", "comm,pid"]).output().await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(status = %output.status, "process listing failed, skipping process pass");
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to run ps, skipping process pass");
                return;
            }
        };

        for pid in scan_tunnel_pids(&String::from_utf8_lossy(&output.stdout), self.proc_name) {
            debug!(pid, "terminating stale tunnel process");
            // SAFETY: kill(2) with SIGTERM on an arbitrary pid is memory-safe;
            // the worst outcome is ESRCH for a pid that exited meanwhile.
            #[allow(unsafe_code)]
            let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "failed to signal stale tunnel process");
            }
        }
    }

    /// Delete leftover tunnel chains and rules from the NAT table.
    ///
    /// Rules are deleted before the chains they reference; the filter
    /// layer refuses to drop a chain that a surviving rule still points at.
    async fn remove_stale_filter_state(&self) {
        let output = match Command::new("iptables-save").args(["-t", "nat"]).output().await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(status = %output.status, "NAT table dump failed, skipping filter pass");
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to run iptables-save, skipping filter pass");
                return;
            }
        };

        for op in cleanup_plan(&String::from_utf8_lossy(&output.stdout)) {
            let mut args: Vec<&str> = vec!["-t", "nat"];
            match &op {
                FilterOp::DeleteRule(spec) => {
                    debug!(rule = spec.join(" "), "removing stale NAT rule");
                    args.push("-D");
                    args.extend(spec.iter().map(String::as_str));
                }
                FilterOp::DeleteChain(chain) => {
                    debug!(chain = %chain, "removing stale NAT chain");
                    args.push("-X");
                    args.push(chain.as_str());
                }
            }
            match Command::new("iptables").args(&args).output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(?op, stderr = %stderr.trim(), "NAT deletion failed, skipping");
                }
                Err(err) => {
                    warn!(?op, error = %err, "failed to run iptables, skipping");
                }
            }
        }
    }
}

/// Extract the pids of processes whose command name matches `name`
/// exactly from `ps -A -o comm,pid` output.
///
/// Exact token match only: a process merely containing the tunnel client
/// name in a longer command name is left alone.
pub fn scan_tunnel_pids(ps_output: &str, name: &str) -> Vec<i32> {
    ps_output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(comm), Some(pid)) if comm == name => pid.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

/// Compute the ordered deletions that clear every tunnel artifact from a
/// NAT table dump: all rule deletions (in append order) strictly before
/// any chain deletion.
pub fn cleanup_plan(dump: &str) -> Vec<FilterOp> {
    let rules = RULE_RE.captures_iter(dump).map(|cap| {
        FilterOp::DeleteRule(cap[1].split_whitespace().map(str::to_string).collect())
    });
    let chains = CHAIN_RE
        .captures_iter(dump)
        .map(|cap| FilterOp::DeleteChain(cap[1].to_string()));
    rules.chain(chains).collect()
}
