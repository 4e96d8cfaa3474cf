use std::error::Error as StdError;
use std::fmt;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes commonly reported by document-store backends.
pub mod codes {
    pub const NOT_FOUND: &str = "not-found";
    pub const PERMISSION_DENIED: &str = "permission-denied";
    pub const UNAUTHENTICATED: &str = "unauthenticated";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const RESOURCE_EXHAUSTED: &str = "resource-exhausted";
    pub const DEADLINE_EXCEEDED: &str = "deadline-exceeded";
    pub const ABORTED: &str = "aborted";
    pub const CANCELLED: &str = "cancelled";
    pub const INTERNAL: &str = "internal";
    pub const FAILED_PRECONDITION: &str = "failed-precondition";
    pub const INVALID_ARGUMENT: &str = "invalid-argument";
    pub const NOT_INITIALIZED: &str = "not-initialized";
    pub const APP_DELETED: &str = "app-deleted";
}

#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

/// Preferred transport for a live subscription.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Transport {
    /// Lower latency, but more sensitive to proxies and flaky networks
    #[default]
    Streaming,
    /// Degrades gracefully where streaming connections get cut
    LongPolling,
}

/// Descriptor for the data a subscription or query targets.
///
/// ```
/// use listen_guard::store::{Direction, Query};
///
/// let query = Query::builder()
///     .collection("trades")
///     .order_by("createdAt")
///     .direction(Direction::Desc)
///     .limit(20)
///     .build();
/// assert_eq!(query.to_string(), "trades order by createdAt desc limit 20");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Builder, Serialize, Deserialize)]
pub struct Query {
    /// Collection path, e.g. `trades` or `users/abc/notifications`
    #[builder(into)]
    pub collection: String,
    #[builder(into)]
    pub order_by: String,
    #[builder(default)]
    pub direction: Direction,
    pub limit: Option<u32>,
}

impl Query {
    /// Shorthand for an unbounded, descending query.
    pub fn new<C: Into<String>, O: Into<String>>(collection: C, order_by: O) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            direction: Direction::Desc,
            limit: None,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} order by {} {}",
            self.collection, self.order_by, self.direction
        )?;
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new<I: Into<String>>(id: I, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// One delivery from a live subscription.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub documents: Vec<Document>,
    /// Set when the snapshot is a re-delivery of the last known good state
    pub from_cache: bool,
    pub received_at: DateTime<Utc>,
}

impl Snapshot {
    #[must_use]
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            from_cache: false,
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub(crate) fn into_cached(mut self) -> Self {
        self.from_cache = true;
        self
    }
}

/// Error reported by the store collaborator.
///
/// Backends report loosely typed errors; `code` carries whatever status string the backend
/// uses and [`crate::classify`] maps it onto the retry taxonomy.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreError {
    pub code: String,
    pub message: String,
}

impl StoreError {
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == codes::NOT_FOUND
    }

    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        self.code == codes::PERMISSION_DENIED || self.code == codes::UNAUTHENTICATED
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_display_omits_missing_limit() {
        let query = Query::new("proposals", "updatedAt");
        assert_eq!(query.to_string(), "proposals order by updatedAt desc");
    }

    #[test]
    fn cached_snapshot_keeps_documents() {
        let snapshot = Snapshot::new(vec![Document::new("a", Value::Null)]).into_cached();

        assert!(snapshot.from_cache, "re-delivered snapshots are flagged");
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn unauthenticated_counts_as_permission_denied() {
        assert!(StoreError::new(codes::UNAUTHENTICATED, "sign in").is_permission_denied());
        assert!(!StoreError::new(codes::UNAVAILABLE, "down").is_permission_denied());
    }
}
