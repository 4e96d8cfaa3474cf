use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::classify::ErrorClass;
use crate::connection::ProbeStage;
use crate::store::StoreError;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Kind {
    /// The document store handle is missing or was never initialized
    Initialization,
    /// Transient transport failure (unavailable, rate limited, dropped listen channel)
    Transport,
    /// An operation against the store did not complete in time
    Timeout,
    /// The store refused access to the requested data
    Permission,
    /// Any other non-transient rejection from the store
    Rejected,
    /// Retries were exhausted without establishing a subscription
    Connection,
    /// A caller-supplied handler returned an error or panicked
    Handler,
    /// Error related to invalid input or configuration
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    /// Whether the retry policy applies to this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, Kind::Transport | Kind::Timeout)
    }

    /// Permission errors are expected to render as "no data" rather than as a failure.
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self.kind, Kind::Permission)
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    /// Wraps a store error, picking the [`Kind`] from its classification.
    #[must_use]
    pub fn from_store(error: StoreError, class: ErrorClass) -> Self {
        let kind = match class {
            ErrorClass::Fatal => Kind::Initialization,
            ErrorClass::Transient => Kind::Transport,
            ErrorClass::Timeout => Kind::Timeout,
            ErrorClass::Permanent if error.is_permission_denied() => Kind::Permission,
            ErrorClass::Permanent => Kind::Rejected,
        };
        Self::with_source(kind, error)
    }

    #[must_use]
    pub fn connection_failed(attempts: u32, last_error: Option<String>) -> Self {
        ConnectionFailed {
            attempts,
            last_error,
        }
        .into()
    }

    /// A failed connection probe. Only a missing store handle is fatal; later stages count as
    /// transport trouble (or a timeout) and are retried.
    pub fn probe_failed<S: Into<String>>(stage: ProbeStage, message: S, timed_out: bool) -> Self {
        let kind = match stage {
            ProbeStage::Init => Kind::Initialization,
            _ if timed_out => Kind::Timeout,
            _ => Kind::Transport,
        };
        Self::with_source(
            kind,
            ProbeFailed {
                stage,
                message: message.into(),
            },
        )
    }

    pub fn handler<S: Into<String>>(message: S) -> Self {
        HandlerFailure {
            message: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// Terminal failure reported once every retry has been used up.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionFailed {
    /// Number of setup attempts made, including the first one
    pub attempts: u32,
    /// Message of the last failure observed, if any
    pub last_error: Option<String>,
}

impl fmt::Display for ConnectionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to establish connection after {} attempt(s)",
            self.attempts
        )?;
        if let Some(last) = &self.last_error {
            write!(f, ": {last}")?;
        }
        Ok(())
    }
}

impl StdError for ConnectionFailed {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ProbeFailed {
    pub stage: ProbeStage,
    pub message: String,
}

impl fmt::Display for ProbeFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection probe failed at {}: {}", self.stage, self.message)
    }
}

impl StdError for ProbeFailed {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener handler failed: {}", self.message)
    }
}

impl StdError for HandlerFailure {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<ConnectionFailed> for Error {
    fn from(err: ConnectionFailed) -> Self {
        Error::with_source(Kind::Connection, err)
    }
}

impl From<HandlerFailure> for Error {
    fn from(err: HandlerFailure) -> Self {
        Error::with_source(Kind::Handler, err)
    }
}
