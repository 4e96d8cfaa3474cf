#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper in this module"
)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Stream, StreamExt as _, stream};
use listen_guard::connection::ProbeConfig;
use listen_guard::error::Error;
use listen_guard::store::{
    Document, DocumentStore, Query, Snapshot, SnapshotStream, StoreError, Transport,
};
use listen_guard::{Client, Config};
use serde_json::json;

pub const SENTINEL_COLLECTION: &str = "_connection_test";
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// How the sentinel subscription opened by the SUBSCRIBE probe stage behaves.
#[derive(Debug, Clone)]
pub enum Sentinel {
    /// Delivers one empty snapshot right away
    Respond,
    /// Never delivers anything, so the probe times out
    Silent,
    /// Refuses to open
    Reject(StoreError),
}

/// What the next application subscription returns.
enum Feed {
    Channel(mpsc::UnboundedReceiver<Result<Snapshot, StoreError>>),
    Reject(StoreError),
}

/// In-memory [`DocumentStore`] with scripted failures and subscription accounting.
pub struct MockStore {
    ready: AtomicBool,
    read_error: Mutex<Option<StoreError>>,
    query_error: Mutex<Option<StoreError>>,
    sentinel: Mutex<Sentinel>,
    feeds: Mutex<VecDeque<Feed>>,
    transports: Mutex<Vec<Transport>>,
    open: Arc<AtomicUsize>,
    probe_subscriptions: AtomicUsize,
    app_subscriptions: AtomicUsize,
}

impl Default for MockStore {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(true),
            read_error: Mutex::new(None),
            query_error: Mutex::new(None),
            sentinel: Mutex::new(Sentinel::Respond),
            feeds: Mutex::new(VecDeque::new()),
            transports: Mutex::new(Vec::new()),
            open: Arc::new(AtomicUsize::new(0)),
            probe_subscriptions: AtomicUsize::new(0),
            app_subscriptions: AtomicUsize::new(0),
        }
    }
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, error: Option<StoreError>) {
        *self.read_error.lock().unwrap() = error;
    }

    pub fn fail_queries(&self, error: Option<StoreError>) {
        *self.query_error.lock().unwrap() = error;
    }

    pub fn set_sentinel(&self, sentinel: Sentinel) {
        *self.sentinel.lock().unwrap() = sentinel;
    }

    /// Queues a live feed for the next application subscription.
    ///
    /// Dropping the returned sender closes the stream on the listener's side.
    pub fn push_feed(&self) -> mpsc::UnboundedSender<Result<Snapshot, StoreError>> {
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().push_back(Feed::Channel(rx));
        tx
    }

    /// Makes the next application subscription fail to open.
    pub fn reject_next_subscribe(&self, error: StoreError) {
        self.feeds.lock().unwrap().push_back(Feed::Reject(error));
    }

    /// Subscriptions (probe and application) that are currently open.
    pub fn open_subscriptions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn probe_subscriptions(&self) -> usize {
        self.probe_subscriptions.load(Ordering::SeqCst)
    }

    pub fn app_subscriptions(&self) -> usize {
        self.app_subscriptions.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Transport> {
        self.transports.lock().unwrap().clone()
    }

    fn track(&self, inner: SnapshotStream) -> SnapshotStream {
        self.open.fetch_add(1, Ordering::SeqCst);
        Tracked {
            inner,
            open: Arc::clone(&self.open),
        }
        .boxed()
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn get_document(
        &self,
        _collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        match self.read_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(Some(Document::new(document_id, json!({ "ok": true })))),
        }
    }

    async fn query_collection(&self, _query: &Query) -> Result<Vec<Document>, StoreError> {
        match self.query_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(Vec::new()),
        }
    }

    async fn subscribe(
        &self,
        query: &Query,
        transport: Transport,
    ) -> Result<SnapshotStream, StoreError> {
        if query.collection == SENTINEL_COLLECTION {
            self.probe_subscriptions.fetch_add(1, Ordering::SeqCst);
            let sentinel = self.sentinel.lock().unwrap().clone();
            return match sentinel {
                Sentinel::Respond => Ok(self.track(
                    stream::once(async { Ok(Snapshot::new(Vec::new())) })
                        .chain(stream::pending())
                        .boxed(),
                )),
                Sentinel::Silent => Ok(self.track(stream::pending().boxed())),
                Sentinel::Reject(error) => Err(error),
            };
        }

        self.app_subscriptions.fetch_add(1, Ordering::SeqCst);
        self.transports.lock().unwrap().push(transport);
        let feed = self.feeds.lock().unwrap().pop_front();
        match feed {
            Some(Feed::Channel(rx)) => Ok(self.track(rx.boxed())),
            Some(Feed::Reject(error)) => Err(error),
            None => Ok(self.track(stream::pending().boxed())),
        }
    }
}

/// Decrements the open count when the listener drops its stream.
struct Tracked {
    inner: SnapshotStream,
    open: Arc<AtomicUsize>,
}

impl Stream for Tracked {
    type Item = Result<Snapshot, StoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Client whose SUBSCRIBE probe stage gives up after [`PROBE_TIMEOUT`].
pub fn client(store: &Arc<MockStore>) -> Client {
    let config = Config::builder()
        .probe(ProbeConfig::builder().subscribe_timeout(PROBE_TIMEOUT).build())
        .build();
    Client::new(Arc::clone(store) as Arc<dyn DocumentStore>, config)
}

pub fn trades() -> Query {
    Query::builder()
        .collection("trades")
        .order_by("createdAt")
        .limit(20)
        .build()
}

pub fn snapshot(ids: &[&str]) -> Snapshot {
    Snapshot::new(
        ids.iter()
            .map(|id| Document::new(*id, json!({ "id": id })))
            .collect(),
    )
}

/// Everything a listener handed to its callbacks.
#[derive(Default)]
pub struct Recorder {
    pub data: Mutex<Vec<Snapshot>>,
    pub errors: Mutex<Vec<Error>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data(&self) -> Vec<Snapshot> {
        self.data.lock().unwrap().clone()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

/// Installs a `tracing` subscriber honouring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Lets spawned listener tasks run until they block again.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Polls `condition` every millisecond of (possibly paused) tokio time.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition was not met in time");
}
