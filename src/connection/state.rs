use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Snapshot of the transport health as last observed by the prober.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub last_error: Option<String>,
    /// Consecutive failed probes since the last success or reset
    pub attempt_count: u32,
    /// When the last probe finished, if any ran since the last reset
    pub last_checked: Option<DateTime<Utc>>,
}

/// Shared holder of the [`ConnectionStatus`].
///
/// Updates swap the whole struct inside a `watch` channel, so readers never observe a
/// partially written status, and UI code can await changes through [`Self::subscribe`].
/// Only the prober records probe outcomes; anyone may [`reset`](Self::reset).
#[derive(Debug)]
pub struct ConnectionTracker {
    state_tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionStatus::default());
        Self { state_tx }
    }

    /// Read-only copy of the current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state_tx.borrow().clone()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.state_tx.subscribe()
    }

    /// Back to the initial disconnected state with no history.
    pub fn reset(&self) {
        self.state_tx.send_replace(ConnectionStatus::default());
    }

    pub(crate) fn record_success(&self) {
        self.state_tx.send_modify(|status| {
            status.is_connected = true;
            status.last_error = None;
            status.attempt_count = 0;
            status.last_checked = Some(Utc::now());
        });
    }

    pub(crate) fn record_failure(&self, error: String) {
        self.state_tx.send_modify(|status| {
            status.is_connected = false;
            status.last_error = Some(error);
            status.attempt_count = status.attempt_count.saturating_add(1);
            status.last_checked = Some(Utc::now());
        });
    }
}
