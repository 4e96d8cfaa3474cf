use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use futures::Stream;
use tokio::sync::{mpsc, watch};

use crate::classify::{DefaultClassifier, ErrorClassifier};
use crate::connection::{ConnectionStatus, ConnectionTracker, ProbeConfig, ProbeResult, Prober};
use crate::error::Error;
use crate::listener::registry::{ListenerInfo, ListenerRegistry, PerformanceMetrics, RegistryConfig};
use crate::listener::robust::{self, BoxError, Callbacks, Handler, ListenerContext};
use crate::listener::{ListenerHandle, MonitorHandle, SubscriptionOptions, monitor};
use crate::store::{DocumentStore, Query, Snapshot};
use crate::Result;

/// Configuration for [`Client`]
#[non_exhaustive]
#[derive(Clone, Debug, Default, Builder)]
pub struct Config {
    /// Sentinel locations, subscribe timeout and reconnection backoff for the prober
    #[builder(default)]
    pub probe: ProbeConfig,
    /// Warning thresholds for the listener registry
    #[builder(default)]
    pub registry: RegistryConfig,
}

/// Entry point to the resilience layer, wrapping one [`DocumentStore`].
///
/// Cloning is cheap; clones share the connection tracker and the listener registry. Create one
/// `Client` per store at the application's composition root and hand clones to UI code.
///
/// ```rust, no_run
/// use std::sync::Arc;
///
/// use futures::StreamExt as _;
/// use listen_guard::listener::SubscriptionOptions;
/// use listen_guard::store::{DocumentStore, Query};
/// use listen_guard::{Client, Config};
///
/// async fn watch_trades(store: Arc<dyn DocumentStore>) {
///     let client = Client::new(store, Config::default());
///
///     let stream = client.listen(Query::new("trades", "createdAt"), SubscriptionOptions::default());
///     let mut stream = Box::pin(stream);
///     while let Some(snapshot) = stream.next().await {
///         match snapshot {
///             Ok(snapshot) => println!("{} trades", snapshot.len()),
///             Err(e) if e.is_permission_denied() => println!("no trades visible"),
///             Err(e) => println!("offline: {e}"),
///         }
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Config,
    store: Arc<dyn DocumentStore>,
    tracker: Arc<ConnectionTracker>,
    prober: Arc<Prober>,
    registry: Arc<ListenerRegistry>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("status", &self.inner.tracker.status())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client with its own connection tracker and listener registry.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: Config) -> Self {
        let tracker = Arc::new(ConnectionTracker::new());
        let registry = Arc::new(ListenerRegistry::new(config.registry.clone()));
        Self::from_parts(store, config, tracker, registry)
    }

    /// Creates a client around existing shared state, e.g. a process-wide registry.
    ///
    /// The registry keeps its own [`RegistryConfig`]; `config.registry` is ignored here.
    #[must_use]
    pub fn from_parts(
        store: Arc<dyn DocumentStore>,
        config: Config,
        tracker: Arc<ConnectionTracker>,
        registry: Arc<ListenerRegistry>,
    ) -> Self {
        let prober = Arc::new(Prober::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            config.probe.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                tracker,
                prober,
                registry,
                classifier: Arc::new(DefaultClassifier),
            }),
        }
    }

    /// Replaces the error classifier used for retry decisions.
    ///
    /// Must be called before the client is cloned or used to create listeners.
    pub fn with_classifier<C: ErrorClassifier>(self, classifier: C) -> Result<Self> {
        let inner = Arc::into_inner(self.inner).ok_or_else(|| {
            Error::validation(
                "Cannot replace the classifier while other references to this client exist",
            )
        })?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                classifier: Arc::new(classifier),
                ..inner
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.inner.tracker
    }

    /// Probes the store; `true` when every stage passed.
    pub async fn test_connection(&self) -> bool {
        self.inner.prober.test_connection().await
    }

    /// Probes the store and reports which stage failed, if any.
    pub async fn probe(&self) -> ProbeResult {
        self.inner.prober.probe().await
    }

    /// Waits out the exponential backoff for the current failure count, then probes again.
    pub async fn attempt_reconnection(&self) -> bool {
        self.inner.prober.attempt_reconnection().await
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.tracker.status()
    }

    #[must_use]
    pub fn connection_status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.tracker.subscribe()
    }

    /// Forgets probe history, e.g. before a manual reconnect.
    pub fn reset_connection(&self) {
        self.inner.tracker.reset();
    }

    /// Opens a self-healing listener on `query`.
    ///
    /// `on_data` receives every snapshot in store order. `on_error` receives handler failures,
    /// non-retryable store errors and, once retries are exhausted, a terminal
    /// [`Kind::Connection`](crate::error::Kind::Connection) error. Must be called from within a
    /// tokio runtime.
    pub fn create_robust_listener<D, E>(
        &self,
        query: Query,
        on_data: D,
        on_error: E,
        options: SubscriptionOptions,
    ) -> ListenerHandle
    where
        D: FnMut(Snapshot) -> std::result::Result<(), BoxError> + Send + 'static,
        E: FnMut(Error) + Send + 'static,
    {
        self.listen_with(query, Callbacks::new(on_data, on_error), options)
    }

    /// Like [`Self::create_robust_listener`], with a [`Handler`] implementation.
    pub fn listen_with<H: Handler>(
        &self,
        query: Query,
        handler: H,
        options: SubscriptionOptions,
    ) -> ListenerHandle {
        robust::spawn(self.listener_context(), query, options, handler)
    }

    /// Stream flavour of [`Self::create_robust_listener`].
    ///
    /// Errors are yielded in-line. The stream ends after a terminal error, and dropping it
    /// unsubscribes.
    pub fn listen(
        &self,
        query: Query,
        options: SubscriptionOptions,
    ) -> impl Stream<Item = Result<Snapshot>> + use<> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<Snapshot>>();
        let data_tx = tx.clone();

        let handle = self.create_robust_listener(
            query,
            move |snapshot| {
                data_tx
                    .send(Ok(snapshot))
                    .map_err(|_e| BoxError::from("listener stream was dropped"))
            },
            move |error| {
                _ = tx.send(Err(error));
            },
            options,
        );

        async_stream::stream! {
            let _handle = handle;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }
    }

    #[must_use]
    pub fn global_listener_metrics(&self) -> PerformanceMetrics {
        self.inner.registry.global_metrics()
    }

    #[must_use]
    pub fn active_listeners(&self) -> Vec<ListenerInfo> {
        self.inner.registry.listeners()
    }

    /// Listeners idle for at least `max_idle`; candidates for leak investigation.
    #[must_use]
    pub fn stale_listeners(&self, max_idle: Duration) -> Vec<ListenerInfo> {
        self.inner.registry.stale_listeners(max_idle)
    }

    /// Last-resort teardown of every tracked listener. Returns how many were removed.
    pub fn emergency_cleanup_listeners(&self) -> usize {
        self.inner.registry.emergency_cleanup_all()
    }

    /// Samples listener metrics every `every` and logs threshold breaches.
    pub fn spawn_metrics_monitor(&self, every: Duration) -> MonitorHandle {
        monitor::spawn(Arc::clone(&self.inner.registry), every)
    }

    fn listener_context(&self) -> ListenerContext {
        ListenerContext {
            store: Arc::clone(&self.inner.store),
            prober: Arc::clone(&self.inner.prober),
            registry: Arc::clone(&self.inner.registry),
            classifier: Arc::clone(&self.inner.classifier),
        }
    }
}
