#![expect(
    clippy::module_name_repetitions,
    reason = "Registry types deliberately include the module name for clarity"
)]

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bon::Builder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Number of response times kept per listener for the rolling average.
pub const RESPONSE_WINDOW: usize = 10;

const DEFAULT_MAX_LISTENERS: usize = 10;
const DEFAULT_MEMORY_THRESHOLD_MB: u64 = 50;
const DEFAULT_RESPONSE_TIME_THRESHOLD_DURATION: Duration = Duration::from_millis(1000);

type Cleanup = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Warning thresholds for the registry. Exceeding any of them only logs.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct RegistryConfig {
    #[builder(default = DEFAULT_MAX_LISTENERS)]
    pub max_listeners: usize,
    #[builder(default = DEFAULT_MEMORY_THRESHOLD_MB)]
    pub memory_threshold_mb: u64,
    #[builder(default = DEFAULT_RESPONSE_TIME_THRESHOLD_DURATION)]
    pub response_time_threshold: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Computed snapshot of registry health.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub active_listeners: usize,
    pub total_listeners: usize,
    /// Resident memory of the process; 0 where the platform does not expose it
    pub memory_usage_mb: f64,
    /// Mean over every listener's last [`RESPONSE_WINDOW`] response times
    pub average_response_time_ms: f64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Information about a registered listener.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub id: String,
    /// Wall-clock registration time
    pub started_at: DateTime<Utc>,
    /// Time since the listener last delivered or was registered
    pub idle_for: Duration,
    pub error_count: u64,
}

struct ListenerEntry {
    serial: u64,
    started_at: DateTime<Utc>,
    last_activity: Instant,
    error_count: u64,
    response_times: VecDeque<Duration>,
    cleanup: Cleanup,
}

impl ListenerEntry {
    fn info(&self, id: &str, now: Instant) -> ListenerInfo {
        ListenerInfo {
            id: id.to_owned(),
            started_at: self.started_at,
            idle_for: now.saturating_duration_since(self.last_activity),
            error_count: self.error_count,
        }
    }
}

/// Process-wide table of live listeners, used for leak detection and emergency teardown.
///
/// Every entry owns the cleanup of its listener. The registry invokes it exactly once, when the
/// entry leaves the table: through its [`Registration`], through an id collision, or through
/// [`Self::emergency_cleanup_all`]. No operation returns an error or propagates a panic from a
/// cleanup.
pub struct ListenerRegistry {
    config: RegistryConfig,
    entries: DashMap<String, ListenerEntry>,
    next_serial: AtomicU64,
    error_count: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("config", &self.config)
            .field("listeners", &self.entries.len())
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ListenerRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            next_serial: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Tracks a listener under `id`, replacing any entry already registered under it.
    ///
    /// A replaced entry has its cleanup invoked immediately, and its [`Registration`] no longer
    /// affects the table.
    pub fn register<I, F>(self: &Arc<Self>, id: I, cleanup: F) -> Registration
    where
        I: Into<String>,
        F: FnOnce() + Send + Sync + 'static,
    {
        let id = id.into();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let entry = ListenerEntry {
            serial,
            started_at: Utc::now(),
            last_activity: Instant::now(),
            error_count: 0,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
            cleanup: Box::new(cleanup),
        };

        let replaced = self.entries.insert(id.clone(), entry);
        let count = self.entries.len();

        #[cfg(feature = "tracing")]
        tracing::debug!(listener = %id, count, "Listener registered");

        if count > self.config.max_listeners {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                count,
                max = self.config.max_listeners,
                "Listener count above threshold, possible leak"
            );
        }

        if let Some(previous) = replaced {
            #[cfg(feature = "tracing")]
            tracing::warn!(listener = %id, "Listener id reused, cleaning up the replaced listener");
            run_cleanup(&id, previous.cleanup);
        }

        Registration {
            registry: Arc::clone(self),
            id,
            serial,
            done: AtomicBool::new(false),
        }
    }

    /// Records a delivery, and optionally how long it took to handle.
    pub fn track_activity(&self, id: &str, response_time: Option<Duration>) {
        let Some(mut entry) = self.entries.get_mut(id) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(listener = %id, "Activity for unknown listener ignored");
            return;
        };

        entry.last_activity = Instant::now();

        if let Some(elapsed) = response_time {
            if entry.response_times.len() == RESPONSE_WINDOW {
                entry.response_times.pop_front();
            }
            entry.response_times.push_back(elapsed);

            if elapsed > self.config.response_time_threshold {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    listener = %id,
                    elapsed_ms = elapsed.as_millis(),
                    threshold_ms = self.config.response_time_threshold.as_millis(),
                    "Slow listener response"
                );
            }
        }
    }

    /// Counts an error against `id` (if registered) and the global counters.
    pub fn track_error<E: fmt::Display + ?Sized>(&self, id: &str, error: &E) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.error_count = entry.error_count.saturating_add(1);
        }

        self.error_count.fetch_add(1, Ordering::Relaxed);
        // We can recover from poisoned lock because Option<String> has no inconsistent intermediate state.
        *self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());

        #[cfg(feature = "tracing")]
        tracing::debug!(listener = %id, %error, "Listener error recorded");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Get information about all registered listeners.
    #[must_use]
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        let now = Instant::now();
        self.entries
            .iter()
            .map(|entry| entry.value().info(entry.key(), now))
            .collect()
    }

    /// Listeners without any activity for at least `max_idle`; likely leaked.
    #[must_use]
    pub fn stale_listeners(&self, max_idle: Duration) -> Vec<ListenerInfo> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_activity) >= max_idle)
            .map(|entry| entry.value().info(entry.key(), now))
            .collect()
    }

    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        reason = "Averages are reported as fractional milliseconds"
    )]
    pub fn global_metrics(&self) -> PerformanceMetrics {
        let mut total = Duration::ZERO;
        let mut samples = 0_u32;
        for entry in &self.entries {
            for elapsed in &entry.response_times {
                total = total.saturating_add(*elapsed);
                samples = samples.saturating_add(1);
            }
        }

        let average_response_time_ms = if samples == 0 {
            0.0
        } else {
            total.as_secs_f64() * 1000.0 / f64::from(samples)
        };
        let count = self.entries.len();

        PerformanceMetrics {
            active_listeners: count,
            total_listeners: count,
            memory_usage_mb: resident_memory_mb(),
            average_response_time_ms,
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Tears down every registered listener and empties the table.
    ///
    /// A cleanup that panics is logged and counted as done; the remaining cleanups still run.
    pub fn emergency_cleanup_all(&self) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let mut cleaned = 0_usize;

        for id in ids {
            if let Some((id, entry)) = self.entries.remove(&id) {
                run_cleanup(&id, entry.cleanup);
                cleaned += 1;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(cleaned, "Emergency cleanup removed all listeners");

        cleaned
    }

    fn unregister(&self, id: &str, serial: u64) -> bool {
        let Some((id, entry)) = self.entries.remove_if(id, |_, entry| entry.serial == serial)
        else {
            return false;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(listener = %id, remaining = self.entries.len(), "Listener unregistered");

        run_cleanup(&id, entry.cleanup);
        true
    }
}

/// Handle returned by [`ListenerRegistry::register`].
///
/// Unregistering is idempotent, and dropping the handle unregisters.
#[must_use = "dropping a Registration unregisters the listener"]
pub struct Registration {
    registry: Arc<ListenerRegistry>,
    id: String,
    serial: u64,
    done: AtomicBool,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Registration {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Removes the entry and runs its cleanup.
    ///
    /// Returns `false` if this registration was already unregistered, or its entry was replaced
    /// or emergency-cleaned in the meantime.
    pub fn unregister(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.registry.unregister(&self.id, self.serial)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn run_cleanup(id: &str, cleanup: Cleanup) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(cleanup)) {
        let reason = panic_message(panic.as_ref());
        #[cfg(feature = "tracing")]
        tracing::error!(listener = %id, %reason, "Listener cleanup panicked");
        #[cfg(not(feature = "tracing"))]
        let _ = (id, reason);
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Resident set size of the current process.
#[cfg(target_os = "linux")]
#[must_use]
pub fn resident_memory_mb() -> f64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| vm_rss_kb(&status))
        .map_or(0.0, kb_to_mb)
}

/// Reads `VmRSS:    123456 kB` out of `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
fn vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
#[expect(
    clippy::float_arithmetic,
    clippy::cast_precision_loss,
    reason = "Memory is reported as fractional megabytes"
)]
fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

/// Resident set size of the current process.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn resident_memory_mb() -> f64 {
    0.0
}
