#![expect(
    clippy::module_name_repetitions,
    reason = "MonitorHandle includes the module name for clarity"
)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::registry::{ListenerRegistry, PerformanceMetrics};

/// Background task sampling [`PerformanceMetrics`] at a fixed cadence.
///
/// Stops when [`stop`](Self::stop) is called or the handle is dropped.
#[must_use = "dropping a MonitorHandle stops the monitor"]
#[derive(Debug)]
pub struct MonitorHandle {
    token: CancellationToken,
    latest: watch::Receiver<PerformanceMetrics>,
}

impl MonitorHandle {
    /// Most recent sample; all zeros until the first tick.
    #[must_use]
    pub fn latest(&self) -> PerformanceMetrics {
        self.latest.borrow().clone()
    }

    /// Receiver notified after every sample.
    #[must_use]
    pub fn receiver(&self) -> watch::Receiver<PerformanceMetrics> {
        self.latest.clone()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub(crate) fn spawn(registry: Arc<ListenerRegistry>, every: Duration) -> MonitorHandle {
    let token = CancellationToken::new();
    let (metrics_tx, latest) = watch::channel(PerformanceMetrics::default());
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token_clone.cancelled() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Metrics monitor cancellation requested, terminating...");
                    break;
                }
                _ = ticker.tick() => {
                    let metrics = registry.global_metrics();
                    check_thresholds(&registry, &metrics);
                    if metrics_tx.send(metrics).is_err() {
                        break;
                    }
                }
            }
        }
    });

    MonitorHandle { token, latest }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "Thresholds are compared against fractional megabytes"
)]
fn check_thresholds(registry: &ListenerRegistry, metrics: &PerformanceMetrics) {
    let config = registry.config();

    if metrics.memory_usage_mb > config.memory_threshold_mb as f64 {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            memory_mb = metrics.memory_usage_mb,
            threshold_mb = config.memory_threshold_mb,
            "Memory usage above threshold"
        );
    }

    if metrics.active_listeners > config.max_listeners {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            active = metrics.active_listeners,
            max = config.max_listeners,
            "Too many active listeners"
        );
    }

    if metrics.average_response_time_ms > config.response_time_threshold.as_millis() as f64 {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            average_ms = metrics.average_response_time_ms,
            threshold_ms = config.response_time_threshold.as_millis(),
            "Average listener response time above threshold"
        );
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(?metrics, "Listener metrics sampled");
}
