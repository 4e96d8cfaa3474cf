//! Capability contract for the external document store.
//!
//! The resilience layer never talks to a concrete backend. Anything that can serve point reads,
//! ordered collection queries and push-based snapshot streams implements [`DocumentStore`] and
//! can be wrapped by [`crate::Client`].
//!
//! Streams returned by [`DocumentStore::subscribe`] own the underlying listener: dropping the
//! stream is the unsubscribe operation.

pub mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use types::{Direction, Document, Query, Snapshot, StoreError, Transport, codes};

/// A live subscription. Dropping it tears the listener down.
pub type SnapshotStream = BoxStream<'static, Result<Snapshot, StoreError>>;

#[expect(
    clippy::module_name_repetitions,
    reason = "DocumentStore includes the module name for clarity when used outside this module"
)]
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Whether the client handle behind this store has been initialized.
    ///
    /// Checked by the first probe stage before any network call is made.
    fn is_ready(&self) -> bool {
        true
    }

    /// Point read. A missing document is `Ok(None)`, not an error.
    async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError>;

    /// Ordered (and optionally bounded) collection query.
    async fn query_collection(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Opens a push-based subscription to `query`.
    ///
    /// `transport` is a hint; backends without a long-polling mode may ignore it.
    async fn subscribe(
        &self,
        query: &Query,
        transport: Transport,
    ) -> Result<SnapshotStream, StoreError>;
}
