//! Tunnel process supervision.
//!
//! Builds the tunnel client invocation, launches it, watches the combined
//! output stream for the connection marker, signals readiness, relays the
//! rest of the output, and reports the final exit status.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wantun_core::TunnelConfig;

use crate::notify::ReadinessNotifier;

/// Port the tunnel client listens on for its local redirector. Stale NAT
/// chains from prior runs carry this number in their name.
pub const LISTEN_PORT: u16 = 12300;

/// Substring the tunnel client prints once the server connection is up.
/// Matches both the short "Connected." and the long "Connected to server."
/// phrasings.
pub const CONNECTED_MARKER: &str = "Connected";

/// Lifecycle of one tunnel client invocation.
///
/// Transitions are one-directional; `Terminated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Process spawned, connection marker not yet seen.
    Launching,
    /// Connection marker observed; readiness has been signaled.
    Connected,
    /// Child exited with this status code.
    Terminated(i32),
}

/// Errors from tunnel supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to launch tunnel client: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to capture tunnel client output")]
    Stdio,

    #[error("Failed waiting for tunnel client: {0}")]
    Wait(#[source] std::io::Error),
}

/// What the output watcher observed before end-of-stream.
#[derive(Debug, PartialEq, Eq)]
enum WatchOutcome {
    Connected,
    ExitedBeforeConnect,
}

/// Supervises a single tunnel client process from launch to exit.
pub struct TunnelSupervisor {
    config: TunnelConfig,
    exclusions: Vec<String>,
    tunnel_bin: PathBuf,
    verbose: bool,
    state: TunnelState,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig, exclusions: Vec<String>, verbose: bool) -> Self {
        Self {
            config,
            exclusions,
            tunnel_bin: PathBuf::from("sshuttle"),
            verbose,
            state: TunnelState::Launching,
        }
    }

    /// Override the tunnel client binary (default `sshuttle` on `PATH`).
    #[must_use]
    pub fn with_tunnel_bin(mut self, tunnel_bin: PathBuf) -> Self {
        self.tunnel_bin = tunnel_bin;
        self
    }

    pub const fn state(&self) -> TunnelState {
        self.state
    }

    /// Run the tunnel client to completion.
    ///
    /// Returns the child's exit code unchanged; a death by signal maps to
    /// the conventional 128+signo. The readiness notification fires at
    /// most once, on the first output line containing the connection
    /// marker. End-of-stream before the marker is reported as an
    /// unexpected termination and the notifier is never invoked.
    pub async fn run(&mut self, notifier: &dyn ReadinessNotifier) -> Result<i32, SupervisorError> {
        let args = self.build_args();
        info!(bin = %self.tunnel_bin.display(), "launching tunnel client");
        debug!(args = args.join(" "), "tunnel client invocation");

        let mut command = Command::new(&self.tunnel_bin);
        command.args(&args);
        self.supervise_child(command, notifier).await
    }

    /// Launch a prepared command and supervise it to exit.
    async fn supervise_child(
        &mut self,
        mut command: Command,
        notifier: &dyn ReadinessNotifier,
    ) -> Result<i32, SupervisorError> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let stdout = child.stdout.take().ok_or(SupervisorError::Stdio)?;
        let stderr = child.stderr.take().ok_or(SupervisorError::Stdio)?;

        // Funnel both streams into one line channel; the channel closes
        // once both readers hit end-of-stream.
        let (line_tx, mut line_rx) = mpsc::channel(64);
        spawn_line_reader(stdout, line_tx.clone());
        spawn_line_reader(stderr, line_tx);

        let outcome = self
            .relay_output(&mut line_rx, notifier, |line| forward_line(line))
            .await;
        if outcome == WatchOutcome::ExitedBeforeConnect {
            warn!("tunnel client exited before connecting");
        }

        let status = child.wait().await.map_err(SupervisorError::Wait)?;
        let code = exit_code(status);
        self.state = TunnelState::Terminated(code);
        info!(code, "tunnel client exited");
        Ok(code)
    }

    /// Consume the combined output stream: forward every line verbatim,
    /// fire the readiness notification on the first marker line, then
    /// drain to end-of-stream.
    async fn relay_output(
        &mut self,
        lines: &mut mpsc::Receiver<String>,
        notifier: &dyn ReadinessNotifier,
        mut forward: impl FnMut(&str),
    ) -> WatchOutcome {
        while let Some(line) = lines.recv().await {
            forward(&line);
            if line.contains(CONNECTED_MARKER) {
                info!("tunnel connected");
                self.state = TunnelState::Connected;
                notifier.notify_ready();

                while let Some(line) = lines.recv().await {
                    forward(&line);
                }
                return WatchOutcome::Connected;
            }
        }
        WatchOutcome::ExitedBeforeConnect
    }

    /// Full tunnel client argument list for this run.
    fn build_args(&self) -> Vec<String> {
        let config = &self.config;
        let mut args = Vec::new();
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args.push("--listen".to_string());
        args.push(LISTEN_PORT.to_string());
        args.push("--ssh-cmd".to_string());
        args.push(format!(
            "ssh {} -o ServerAliveInterval={} -o ServerAliveCountMax={} -i {}",
            config.ssh_options,
            config.keepalive_interval,
            config.keepalive_count,
            config.key.display()
        ));
        for subnet in &self.exclusions {
            args.push("--exclude".to_string());
            args.push(subnet.clone());
        }
        args.push("--remote".to_string());
        args.push(format!(
            "{}@{}:{}",
            config.remote_user, config.host, config.port
        ));
        // catch-all: everything not excluded goes through the tunnel
        args.push("0/0".to_string());
        args
    }
}

/// Relay one child output line to our own stdout verbatim.
#[allow(clippy::print_stdout)]
fn forward_line(line: &str) {
    println!("{line}");
}

fn spawn_line_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records when the readiness call fired, as the number of lines
    /// already forwarded at that moment.
    struct RecordingNotifier {
        forwarded: Arc<Mutex<Vec<String>>>,
        calls: Mutex<Vec<usize>>,
    }

    impl RecordingNotifier {
        fn new(forwarded: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                forwarded,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ReadinessNotifier for RecordingNotifier {
        fn notify_ready(&self) {
            let seen = self.forwarded.lock().unwrap().len();
            self.calls.lock().unwrap().push(seen);
        }
    }

    fn test_supervisor() -> TunnelSupervisor {
        let config = TunnelConfig {
            host: "tunnel.example.org".into(),
            port: "20022".into(),
            key: PathBuf::from("/etc/wantun/tunnel.key"),
            ssh_options: String::new(),
            keepalive_interval: 60,
            keepalive_count: 3,
            remote_user: "node-1".into(),
            excludes: Vec::new(),
        };
        TunnelSupervisor::new(config, vec!["10.0.0.0/8".into()], false)
    }

    async fn feed_lines(lines: &[&str]) -> (WatchOutcome, Vec<String>, Vec<usize>) {
        let (tx, mut rx) = mpsc::channel(16);
        for line in lines {
            tx.send((*line).to_string()).await.unwrap();
        }
        drop(tx);

        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let notifier = RecordingNotifier::new(Arc::clone(&forwarded));
        let sink = Arc::clone(&forwarded);

        let mut supervisor = test_supervisor();
        let outcome = supervisor
            .relay_output(&mut rx, &notifier, |line| {
                sink.lock().unwrap().push(line.to_string());
            })
            .await;

        let forwarded = forwarded.lock().unwrap().clone();
        let calls = notifier.calls.lock().unwrap().clone();
        (outcome, forwarded, calls)
    }

    #[tokio::test]
    async fn notifies_once_immediately_after_marker() {
        let (outcome, forwarded, calls) =
            feed_lines(&["connecting...", "Connected.", "extra-line-1", "extra-line-2"]).await;

        assert_eq!(outcome, WatchOutcome::Connected);
        // fired exactly once, right after the marker line and before the
        // extra lines were forwarded
        assert_eq!(calls, vec![2]);
        assert_eq!(
            forwarded,
            vec!["connecting...", "Connected.", "extra-line-1", "extra-line-2"]
        );
    }

    #[tokio::test]
    async fn end_of_stream_without_marker_never_notifies() {
        let (outcome, forwarded, calls) =
            feed_lines(&["connecting...", "failed: connection refused"]).await;

        assert_eq!(outcome, WatchOutcome::ExitedBeforeConnect);
        assert!(calls.is_empty());
        assert_eq!(forwarded, vec!["connecting...", "failed: connection refused"]);
    }

    #[tokio::test]
    async fn marker_transitions_state_to_connected() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send("Connected.".to_string()).await.unwrap();
        drop(tx);

        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let notifier = RecordingNotifier::new(Arc::clone(&forwarded));
        let mut supervisor = test_supervisor();
        assert_eq!(supervisor.state(), TunnelState::Launching);

        supervisor.relay_output(&mut rx, &notifier, |_| {}).await;
        assert_eq!(supervisor.state(), TunnelState::Connected);
    }

    #[tokio::test]
    async fn exit_code_passes_through_unchanged() {
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let notifier = RecordingNotifier::new(Arc::clone(&forwarded));
        let mut supervisor = test_supervisor();

        let mut command = Command::new("sh");
        command.args(["-c", "exit 7"]);
        let code = supervisor.supervise_child(command, &notifier).await.unwrap();

        assert_eq!(code, 7);
        assert_eq!(supervisor.state(), TunnelState::Terminated(7));
        assert!(notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connected_child_notifies_and_exits_zero() {
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let notifier = RecordingNotifier::new(Arc::clone(&forwarded));
        let mut supervisor = test_supervisor();

        let mut command = Command::new("sh");
        command.args(["-c", "echo Connected."]);
        let code = supervisor.supervise_child(command, &notifier).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(notifier.calls.lock().unwrap().len(), 1);
        assert_eq!(supervisor.state(), TunnelState::Terminated(0));
    }

    #[test]
    fn args_embed_config_and_exclusions() {
        let supervisor = test_supervisor();
        let args = supervisor.build_args();

        assert_eq!(args[0], "--listen");
        assert_eq!(args[1], "12300");
        assert!(args.contains(&"--exclude".to_string()));
        assert!(args.contains(&"10.0.0.0/8".to_string()));
        assert!(
            args.contains(&"node-1@tunnel.example.org:20022".to_string()),
            "remote endpoint missing: {args:?}"
        );
        assert_eq!(args.last().map(String::as_str), Some("0/0"));
        assert!(!args.contains(&"--verbose".to_string()));

        let ssh_cmd = &args[3];
        assert!(ssh_cmd.contains("-o ServerAliveInterval=60"));
        assert!(ssh_cmd.contains("-o ServerAliveCountMax=3"));
        assert!(ssh_cmd.contains("-i /etc/wantun/tunnel.key"));
    }

    #[test]
    fn debug_mode_adds_verbose_flag() {
        let mut supervisor = test_supervisor();
        supervisor.verbose = true;
        let args = supervisor.build_args();
        assert_eq!(args[0], "--verbose");
    }
}
