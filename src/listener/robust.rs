use std::error::Error as StdError;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::StreamExt as _;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::options::SubscriptionOptions;
use super::registry::{ListenerRegistry, Registration, panic_message};
use crate::classify::{ErrorClass, ErrorClassifier};
use crate::connection::{ProbeResult, ProbeStage, Prober};
use crate::error::Error;
use crate::store::{DocumentStore, Query, Snapshot, SnapshotStream, StoreError, codes};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Receiver of a listener's deliveries.
///
/// An `Err` returned from [`on_data`](Self::on_data), or a panic inside it, is routed to
/// [`on_error`](Self::on_error); the subscription keeps running.
pub trait Handler: Send + 'static {
    fn on_data(&mut self, snapshot: Snapshot) -> Result<(), BoxError>;

    fn on_error(&mut self, error: Error);
}

/// [`Handler`] built from a pair of closures.
pub struct Callbacks<D, E> {
    on_data: D,
    on_error: E,
}

impl<D, E> Callbacks<D, E>
where
    D: FnMut(Snapshot) -> Result<(), BoxError> + Send + 'static,
    E: FnMut(Error) + Send + 'static,
{
    pub fn new(on_data: D, on_error: E) -> Self {
        Self { on_data, on_error }
    }
}

impl<D, E> Handler for Callbacks<D, E>
where
    D: FnMut(Snapshot) -> Result<(), BoxError> + Send + 'static,
    E: FnMut(Error) + Send + 'static,
{
    fn on_data(&mut self, snapshot: Snapshot) -> Result<(), BoxError> {
        (self.on_data)(snapshot)
    }

    fn on_error(&mut self, error: Error) {
        (self.on_error)(error);
    }
}

/// Lifecycle of a single listener.
///
/// `Init → Probing → {Subscribed | RetryWait | Failed}`, `RetryWait → Probing`,
/// `Subscribed → RetryWait` on a transient error, and any live state → `Terminated` on
/// unsubscribe. `Failed` and `Terminated` are final.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ListenerState {
    Init,
    Probing,
    Subscribed,
    RetryWait {
        /// Retry about to be made, starting at 1
        attempt: u32,
    },
    Failed,
    Terminated,
}

impl ListenerState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// Everything a listener task needs from the composition root.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) prober: Arc<Prober>,
    pub(crate) registry: Arc<ListenerRegistry>,
    pub(crate) classifier: Arc<dyn ErrorClassifier>,
}

type RegistrationSlot = Arc<Mutex<Option<Registration>>>;

/// Owner of a running listener. [`unsubscribe`](Self::unsubscribe) (or dropping the handle)
/// stops it.
#[must_use = "dropping a ListenerHandle unsubscribes the listener"]
pub struct ListenerHandle {
    id: String,
    token: CancellationToken,
    state_tx: Arc<watch::Sender<ListenerState>>,
    registration: RegistrationSlot,
    closed: AtomicBool,
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl ListenerHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the listener reaches `Failed` or `Terminated`.
    pub async fn finished(&self) -> ListenerState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Stops delivery, cancels any pending retry and removes the registry entry.
    ///
    /// Idempotent: only the first call has an effect. A probe already in flight runs to
    /// completion but its result is discarded.
    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.token.cancel();
        transition(&self.id, &self.state_tx, ListenerState::Terminated);
        release(&self.registration);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Starts a self-healing listener on the current tokio runtime.
pub(crate) fn spawn<H: Handler>(
    context: ListenerContext,
    query: Query,
    options: SubscriptionOptions,
    handler: H,
) -> ListenerHandle {
    let id = options
        .listener_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let token = CancellationToken::new();
    let (state_tx, _) = watch::channel(ListenerState::Init);
    let state_tx = Arc::new(state_tx);
    let registration: RegistrationSlot = Arc::new(Mutex::new(None));

    let worker = Worker {
        context,
        id: id.clone(),
        query,
        options,
        handler,
        token: token.clone(),
        state_tx: Arc::clone(&state_tx),
        registration: Arc::clone(&registration),
        last_good: None,
    };
    tokio::spawn(worker.run());

    ListenerHandle {
        id,
        token,
        state_tx,
        registration,
        closed: AtomicBool::new(false),
    }
}

/// Why a subscription stopped pumping events.
enum Outcome {
    /// Unsubscribed, or evicted from the registry
    Cancelled,
    Failed(Error),
}

struct Worker<H> {
    context: ListenerContext,
    id: String,
    query: Query,
    options: SubscriptionOptions,
    handler: H,
    token: CancellationToken,
    state_tx: Arc<watch::Sender<ListenerState>>,
    registration: RegistrationSlot,
    /// Last delivered snapshot, kept only when offline fallback is enabled
    last_good: Option<Snapshot>,
}

impl<H: Handler> Worker<H> {
    async fn run(mut self) {
        let reconnect = self.options.reconnect();
        let mut backoff: ExponentialBackoff = reconnect.clone().into();
        let mut retries = 0_u32;

        loop {
            if self.token.is_cancelled() {
                break;
            }

            self.transition(ListenerState::Probing);
            let probe = self.context.prober.probe().await;
            // An unsubscribe during the probe wins; its result is dropped.
            if self.token.is_cancelled() {
                break;
            }

            let failure = if probe.success {
                let opened = self
                    .context
                    .store
                    .subscribe(&self.query, self.options.transport())
                    .await
                    .map_err(|e| self.classified(e));
                match opened {
                    Ok(stream) => match self.pump(stream, &mut retries, &mut backoff).await {
                        Outcome::Cancelled => break,
                        Outcome::Failed(error) => error,
                    },
                    Err(error) => error,
                }
            } else {
                self.probe_failure(probe)
            };

            if self.token.is_cancelled() {
                break;
            }

            if !failure.is_retryable() {
                #[cfg(feature = "tracing")]
                tracing::error!(listener = %self.id, error = %failure, "Listener failed with a non-retryable error");
                self.fail(failure);
                return;
            }

            if !reconnect.allows(retries) {
                #[cfg(feature = "tracing")]
                tracing::error!(listener = %self.id, retries, error = %failure, "Listener retries exhausted");
                self.exhausted(retries, &failure);
                return;
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| reconnect.delay_for_attempt(retries));
            retries += 1;
            self.transition(ListenerState::RetryWait { attempt: retries });

            #[cfg(feature = "tracing")]
            tracing::warn!(
                listener = %self.id,
                attempt = retries,
                max = self.options.retry_attempts,
                ?delay,
                error = %failure,
                "Retrying listener setup"
            );

            tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        self.transition(ListenerState::Terminated);
        release(&self.registration);
    }

    async fn pump(
        &mut self,
        mut stream: SnapshotStream,
        retries: &mut u32,
        backoff: &mut ExponentialBackoff,
    ) -> Outcome {
        // Eviction from the registry ends this subscription only. Our own unregister runs the
        // same cleanup, so it must never reach the listener's token.
        let subscription = self.token.child_token();
        let evict = subscription.clone();
        let registration = self
            .context
            .registry
            .register(self.id.clone(), move || evict.cancel());
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);

        // The handle may have been closed while the registration was being stored.
        if self.token.is_cancelled() {
            release(&self.registration);
            return Outcome::Cancelled;
        }
        self.transition(ListenerState::Subscribed);
        let subscribed_at = tokio::time::Instant::now();

        let outcome = loop {
            tokio::select! {
                biased;
                () = subscription.cancelled() => break Outcome::Cancelled,
                item = stream.next() => match item {
                    Some(Ok(snapshot)) => self.deliver(snapshot),
                    Some(Err(e)) => {
                        self.context.registry.track_error(&self.id, &e);
                        break Outcome::Failed(self.classified(e));
                    }
                    None => {
                        break Outcome::Failed(Error::from_store(
                            StoreError::new(codes::UNAVAILABLE, "listen channel closed by the store"),
                            ErrorClass::Transient,
                        ));
                    }
                },
            }
        };

        drop(stream);

        // Only a subscription that stayed up for a full backoff window earns a fresh budget.
        if subscribed_at.elapsed() >= self.options.max_retry_delay {
            *retries = 0;
            backoff.reset();
        }

        if self.retire() {
            outcome
        } else {
            Outcome::Cancelled
        }
    }

    /// Unregisters the current subscription. `false` when the entry was already gone, i.e. the
    /// handle released it or the registry evicted it.
    fn retire(&self) -> bool {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        registration.is_some_and(|registration| registration.unregister())
    }

    fn deliver(&mut self, snapshot: Snapshot) {
        let cached = self.options.fallback_to_offline.then(|| snapshot.clone());
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| self.handler.on_data(snapshot)));
        self.context
            .registry
            .track_activity(&self.id, Some(started.elapsed()));

        if cached.is_some() {
            self.last_good = cached;
        }

        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let error = Error::handler(failure);
        self.context.registry.track_error(&self.id, &error);
        self.notify(error);
    }

    /// Hands an error to the caller's handler, containing any panic it raises.
    fn notify(&mut self, error: Error) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.handler.on_error(error))) {
            let reason = panic_message(panic.as_ref());
            #[cfg(feature = "tracing")]
            tracing::error!(listener = %self.id, %reason, "Listener error handler panicked");
            self.context
                .registry
                .track_error(&self.id, &Error::handler(reason));
        }
    }

    fn fail(&mut self, error: Error) {
        release(&self.registration);
        if self.transition(ListenerState::Failed) {
            self.notify(error);
        }
    }

    fn exhausted(&mut self, retries: u32, last: &Error) {
        release(&self.registration);
        if !self.transition(ListenerState::Failed) {
            return;
        }

        if let Some(snapshot) = self.last_good.take() {
            #[cfg(feature = "tracing")]
            tracing::warn!(listener = %self.id, "Falling back to last known snapshot");
            self.deliver(snapshot.into_cached());
            return;
        }

        self.notify(Error::connection_failed(
            retries.saturating_add(1),
            Some(last.to_string()),
        ));
    }

    /// Store errors behind a failed probe go through the classifier so that e.g. a permission
    /// error on the sentinel read is not retried.
    fn probe_failure(&self, probe: ProbeResult) -> Error {
        if let Some(store_error) = probe.store_error {
            match self.context.classifier.classify(&store_error) {
                class @ (ErrorClass::Fatal | ErrorClass::Permanent) => {
                    return Error::from_store(store_error, class);
                }
                ErrorClass::Transient | ErrorClass::Timeout => {}
            }
        }

        Error::probe_failed(
            probe.failure_stage.unwrap_or(ProbeStage::Init),
            probe.error.unwrap_or_default(),
            probe.timed_out,
        )
    }

    fn classified(&self, error: StoreError) -> Error {
        let class = self.context.classifier.classify(&error);
        Error::from_store(error, class)
    }

    fn transition(&self, next: ListenerState) -> bool {
        transition(&self.id, &self.state_tx, next)
    }
}

/// Moves to `next` unless the listener already reached a final state.
fn transition(id: &str, state_tx: &watch::Sender<ListenerState>, next: ListenerState) -> bool {
    let changed = state_tx.send_if_modified(|state| {
        if state.is_terminal() || *state == next {
            return false;
        }
        *state = next;
        true
    });

    #[cfg(feature = "tracing")]
    if changed {
        tracing::debug!(listener = %id, state = %next, "Listener state changed");
    }
    #[cfg(not(feature = "tracing"))]
    let _ = id;

    changed
}

fn release(slot: &RegistrationSlot) {
    let registration = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(registration) = registration {
        registration.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ListenerState::Failed.is_terminal());
        assert!(ListenerState::Terminated.is_terminal());
        assert!(!ListenerState::RetryWait { attempt: 1 }.is_terminal());
        assert!(!ListenerState::Subscribed.is_terminal());
    }

    #[test]
    fn transition_never_leaves_final_states() {
        let (state_tx, _) = watch::channel(ListenerState::Init);

        assert!(transition("t", &state_tx, ListenerState::Probing));
        assert!(!transition("t", &state_tx, ListenerState::Probing), "no-op on same state");
        assert!(transition("t", &state_tx, ListenerState::Failed));
        assert!(!transition("t", &state_tx, ListenerState::Probing), "Failed is final");
        assert!(!transition("t", &state_tx, ListenerState::Terminated), "Failed is final");
        assert_eq!(*state_tx.borrow(), ListenerState::Failed);
    }

    #[test]
    fn callbacks_forward_to_closures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut callbacks = Callbacks::new(
            |snapshot: Snapshot| -> Result<(), BoxError> {
                if snapshot.is_empty() {
                    Err("empty".into())
                } else {
                    Ok(())
                }
            },
            move |error: Error| sink.lock().unwrap().push(error.kind()),
        );

        assert!(callbacks.on_data(Snapshot::new(Vec::new())).is_err(), "closure error surfaces");
        callbacks.on_error(Error::handler("x"));
        assert_eq!(*seen.lock().unwrap(), vec![crate::error::Kind::Handler]);
    }
}
