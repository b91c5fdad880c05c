//! Readiness signaling to the service manager.

use tracing::warn;

/// Fire-and-forget readiness signal, sent once when the tunnel connects.
///
/// The signal is best-effort: a failure to deliver it must never abort a
/// working tunnel.
pub trait ReadinessNotifier: Send + Sync {
    /// Report the tunnel as usable.
    fn notify_ready(&self);
}

/// Notifies systemd through the `sd_notify` socket.
pub struct SystemdNotifier;

impl ReadinessNotifier for SystemdNotifier {
    #[cfg(unix)]
    fn notify_ready(&self) {
        if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            warn!(error = %err, "failed to notify service manager of readiness");
        }
    }

    #[cfg(not(unix))]
    fn notify_ready(&self) {}
}
