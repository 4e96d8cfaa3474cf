#![expect(
    clippy::module_name_repetitions,
    reason = "Option types deliberately include the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;

use crate::connection::ReconnectConfig;
use crate::store::Transport;

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_DURATION: Duration = Duration::from_millis(2000);
const DEFAULT_MAX_RETRY_DELAY_DURATION: Duration = Duration::from_secs(30);

/// Per-listener resilience settings.
///
/// ```
/// use std::time::Duration;
///
/// use listen_guard::listener::SubscriptionOptions;
///
/// let options = SubscriptionOptions::builder()
///     .retry_attempts(5)
///     .retry_delay(Duration::from_millis(500))
///     .fallback_to_offline(true)
///     .build();
/// assert!(!options.use_long_polling);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct SubscriptionOptions {
    /// Ask the store for its long-polling transport instead of streaming
    #[builder(default)]
    pub use_long_polling: bool,
    /// Retries allowed before the terminal error is reported
    #[builder(default = DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,
    /// Base delay; doubles with every consecutive retry
    #[builder(default = DEFAULT_RETRY_DELAY_DURATION)]
    pub retry_delay: Duration,
    /// Upper bound for a single retry delay
    #[builder(default = DEFAULT_MAX_RETRY_DELAY_DURATION)]
    pub max_retry_delay: Duration,
    /// Re-deliver the last good snapshot instead of an error once retries are exhausted
    #[builder(default)]
    pub fallback_to_offline: bool,
    /// Registry id for the listener; a fresh UUID when absent
    #[builder(into)]
    pub listener_id: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SubscriptionOptions {
    pub(crate) fn transport(&self) -> Transport {
        if self.use_long_polling {
            Transport::LongPolling
        } else {
            Transport::Streaming
        }
    }

    pub(crate) fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig::new(Some(self.retry_attempts), self.retry_delay)
            .with_max_backoff(self.max_retry_delay)
    }
}
