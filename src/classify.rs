//! Mapping from backend error codes and messages onto the retry taxonomy.
//!
//! Every retry decision in the crate goes through an [`ErrorClassifier`]. Backends whose error
//! vocabulary differs from the defaults provide their own implementation to
//! [`crate::Client::with_classifier`].

use crate::store::{StoreError, codes};

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ErrorClass {
    /// The store handle is unusable; surfaced immediately, never retried
    Fatal,
    /// Expected to clear up on retry (network blip, rate limit, dropped listen channel)
    Transient,
    /// The operation ran out of time; retried like a transient failure
    Timeout,
    /// Surfaced on first occurrence (permission denied, invalid query, ...)
    Permanent,
}

impl ErrorClass {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

pub trait ErrorClassifier: Send + Sync + 'static {
    fn classify(&self, error: &StoreError) -> ErrorClass;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&StoreError) -> ErrorClass + Send + Sync + 'static,
{
    fn classify(&self, error: &StoreError) -> ErrorClass {
        self(error)
    }
}

const FATAL_CODES: &[&str] = &[codes::NOT_INITIALIZED, codes::APP_DELETED, "failed-to-initialize"];

const TRANSIENT_CODES: &[&str] = &[
    codes::UNAVAILABLE,
    codes::RESOURCE_EXHAUSTED,
    codes::ABORTED,
    codes::CANCELLED,
    codes::INTERNAL,
];

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out"];

const TRANSIENT_MARKERS: &[&str] = &[
    "listen",
    "channel",
    "network",
    "connection",
    "offline",
    "rate limit",
    "quota",
    "too many",
];

/// Classifier for backends speaking the common `kebab-case` status vocabulary.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &StoreError) -> ErrorClass {
        let code = error.code.as_str();
        if FATAL_CODES.contains(&code) {
            return ErrorClass::Fatal;
        }

        let message = error.message.to_lowercase();
        if code == codes::DEADLINE_EXCEEDED || TIMEOUT_MARKERS.iter().any(|m| message.contains(m))
        {
            return ErrorClass::Timeout;
        }

        // Permission problems can mention the connection in their message; the code wins.
        if error.is_permission_denied() {
            return ErrorClass::Permanent;
        }

        if TRANSIENT_CODES.contains(&code) || TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
        {
            return ErrorClass::Transient;
        }

        ErrorClass::Permanent
    }
}
