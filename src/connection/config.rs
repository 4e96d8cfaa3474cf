#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

use crate::store::{Direction, Query};

const DEFAULT_SENTINEL_COLLECTION: &str = "_connection_test";
const DEFAULT_SENTINEL_DOCUMENT: &str = "ping";
const DEFAULT_PROBE_ORDER_FIELD: &str = "createdAt";
const DEFAULT_SUBSCRIBE_TIMEOUT_DURATION: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the connection prober.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ProbeConfig {
    /// Collection holding the sentinel document read by the READ stage
    #[builder(into, default = DEFAULT_SENTINEL_COLLECTION.to_owned())]
    pub sentinel_collection: String,
    /// Sentinel document id; it does not need to exist
    #[builder(into, default = DEFAULT_SENTINEL_DOCUMENT.to_owned())]
    pub sentinel_document: String,
    /// Bounded, ordered query used by the QUERY and SUBSCRIBE stages
    #[builder(default = default_probe_query())]
    pub probe_query: Query,
    /// How long the SUBSCRIBE stage waits for a first event
    #[builder(default = DEFAULT_SUBSCRIBE_TIMEOUT_DURATION)]
    pub subscribe_timeout: Duration,
    /// Backoff used by [`crate::connection::Prober::attempt_reconnection`]
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_probe_query() -> Query {
    Query::builder()
        .collection(DEFAULT_SENTINEL_COLLECTION)
        .order_by(DEFAULT_PROBE_ORDER_FIELD)
        .direction(Direction::Desc)
        .limit(1)
        .build()
}

/// Exponential backoff shared by the prober and the listener retry loop.
///
/// The delay before retry `n` (zero based) is `initial_backoff * backoff_multiplier^n`, capped at
/// `max_backoff`. `randomization_factor` adds jitter on top; it is zero by default so retry
/// timing stays predictable.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter applied to each delay, in `[0, 1)`
    pub randomization_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            randomization_factor: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Backoff with the given base delay and retry bound, other settings left at their defaults.
    #[must_use]
    pub fn new(max_attempts: Option<u32>, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Jitter-free delay before retry `attempt`.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Fractional multiplier; the result is clamped below max_backoff before the cast"
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_backoff.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    #[must_use]
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(config.randomization_factor)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}
