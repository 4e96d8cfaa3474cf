use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use serde::Serialize;
use tokio::time::{sleep, timeout};

use super::config::ProbeConfig;
use super::state::ConnectionTracker;
use crate::store::{DocumentStore, StoreError, Transport};

/// Escalating checks run by a probe, in order.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ProbeStage {
    /// The store handle exists and is initialized
    Init,
    /// Point read of the sentinel document
    Read,
    /// Bounded, ordered collection query
    Query,
    /// Live subscription delivering a first event
    Subscribe,
}

/// Outcome of one probe. Transient; nothing keeps it around.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub elapsed_ms: u64,
    pub failure_stage: Option<ProbeStage>,
    pub error: Option<String>,
    /// The SUBSCRIBE stage gave up waiting for a first event
    pub timed_out: bool,
    /// Error reported by the store, when the failing stage got that far
    pub store_error: Option<StoreError>,
}

struct StageFailure {
    stage: ProbeStage,
    message: String,
    timed_out: bool,
    store_error: Option<StoreError>,
}

impl StageFailure {
    fn new<M: ToString>(stage: ProbeStage, message: &M) -> Self {
        Self {
            stage,
            message: message.to_string(),
            timed_out: false,
            store_error: None,
        }
    }

    fn store(stage: ProbeStage, error: StoreError) -> Self {
        Self {
            store_error: Some(error.clone()),
            ..Self::new(stage, &error)
        }
    }
}

/// Checks whether the transport to the store is usable and records the verdict in the
/// [`ConnectionTracker`].
pub struct Prober {
    store: Arc<dyn DocumentStore>,
    tracker: Arc<ConnectionTracker>,
    config: ProbeConfig,
}

impl Prober {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tracker: Arc<ConnectionTracker>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Runs every stage and reports only whether all of them passed.
    pub async fn test_connection(&self) -> bool {
        self.probe().await.success
    }

    /// Runs the INIT, READ, QUERY and SUBSCRIBE stages, stopping at the first failure.
    pub async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        let outcome = self.run_stages().await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(()) => {
                let was_connected = self.tracker.status().is_connected;
                self.tracker.record_success();
                #[cfg(feature = "tracing")]
                if was_connected {
                    tracing::debug!(elapsed_ms, "Connection probe succeeded");
                } else {
                    tracing::info!(elapsed_ms, "Connection to document store established");
                }
                #[cfg(not(feature = "tracing"))]
                let _ = was_connected;

                ProbeResult {
                    success: true,
                    elapsed_ms,
                    failure_stage: None,
                    error: None,
                    timed_out: false,
                    store_error: None,
                }
            }
            Err(failure) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    stage = %failure.stage,
                    error = %failure.message,
                    elapsed_ms,
                    "Connection probe failed"
                );
                self.tracker.record_failure(failure.message.clone());

                ProbeResult {
                    success: false,
                    elapsed_ms,
                    failure_stage: Some(failure.stage),
                    error: Some(failure.message),
                    timed_out: failure.timed_out,
                    store_error: failure.store_error,
                }
            }
        }
    }

    /// Re-probes after an exponential delay based on the tracker's consecutive failure count.
    ///
    /// Returns `false` without probing once the configured attempt limit is reached; call
    /// [`ConnectionTracker::reset`] to start over.
    pub async fn attempt_reconnection(&self) -> bool {
        let attempts = self.tracker.status().attempt_count;
        let reconnect = &self.config.reconnect;

        if !reconnect.allows(attempts) {
            #[cfg(feature = "tracing")]
            tracing::warn!(attempts, "Reconnection attempts exhausted");
            return false;
        }

        let delay = reconnect.delay_for_attempt(attempts);
        #[cfg(feature = "tracing")]
        tracing::debug!(attempt = attempts + 1, ?delay, "Waiting before reconnection attempt");
        sleep(delay).await;

        self.test_connection().await
    }

    async fn run_stages(&self) -> Result<(), StageFailure> {
        if !self.store.is_ready() {
            return Err(StageFailure::new(
                ProbeStage::Init,
                &"document store is not initialized",
            ));
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(stage = %ProbeStage::Init, "Probe stage passed");

        match self
            .store
            .get_document(&self.config.sentinel_collection, &self.config.sentinel_document)
            .await
        {
            // A missing sentinel still proves the store answered.
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(StageFailure::store(ProbeStage::Read, e)),
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(stage = %ProbeStage::Read, "Probe stage passed");

        self.store
            .query_collection(&self.config.probe_query)
            .await
            .map_err(|e| StageFailure::store(ProbeStage::Query, e))?;
        #[cfg(feature = "tracing")]
        tracing::trace!(stage = %ProbeStage::Query, "Probe stage passed");

        self.probe_subscription().await?;
        #[cfg(feature = "tracing")]
        tracing::trace!(stage = %ProbeStage::Subscribe, "Probe stage passed");

        Ok(())
    }

    async fn probe_subscription(&self) -> Result<(), StageFailure> {
        let mut stream = self
            .store
            .subscribe(&self.config.probe_query, Transport::default())
            .await
            .map_err(|e| StageFailure::store(ProbeStage::Subscribe, e))?;

        let first = timeout(self.config.subscribe_timeout, stream.next()).await;
        // Unsubscribe before looking at the outcome so no path leaves the listener open.
        drop(stream);

        match first {
            Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(e))) => Err(StageFailure::store(ProbeStage::Subscribe, e)),
            Ok(None) => Err(StageFailure::new(
                ProbeStage::Subscribe,
                &"listen channel closed before the first event",
            )),
            Err(_) => Err(StageFailure {
                stage: ProbeStage::Subscribe,
                message: timeout_message(self.config.subscribe_timeout),
                timed_out: true,
                store_error: None,
            }),
        }
    }
}

fn timeout_message(after: Duration) -> String {
    format!("subscription timeout: no event within {}ms", after.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_display_uppercase() {
        assert_eq!(ProbeStage::Subscribe.to_string(), "SUBSCRIBE");
        assert_eq!(ProbeStage::Init.to_string(), "INIT");
    }

    #[test]
    fn timeout_message_mentions_bound() {
        assert_eq!(
            timeout_message(Duration::from_millis(5000)),
            "subscription timeout: no event within 5000ms"
        );
    }
}
