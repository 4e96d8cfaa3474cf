//! Self-healing live listeners and the registry that keeps track of them.
//!
//! # Architecture
//!
//! - [`robust`]: one task per listener. It probes the connection, opens the store
//!   subscription, forwards events to a [`Handler`] and retries transient failures with
//!   exponential backoff.
//! - [`ListenerRegistry`]: process-wide table of open subscriptions, used for leak detection,
//!   metrics and emergency teardown.
//! - [`monitor`]: optional background sampling of [`PerformanceMetrics`].
//!
//! Listeners are created through [`crate::Client::create_robust_listener`].

pub mod monitor;
pub mod options;
pub mod registry;
pub mod robust;

pub use monitor::MonitorHandle;
pub use options::SubscriptionOptions;
pub use registry::{PerformanceMetrics, Registration, RegistryConfig};
#[expect(
    clippy::module_name_repetitions,
    reason = "Listener types include the module name for clarity when used outside this module"
)]
pub use registry::{ListenerInfo, ListenerRegistry};
pub use robust::{BoxError, Callbacks, Handler};
#[expect(
    clippy::module_name_repetitions,
    reason = "Listener types include the module name for clarity when used outside this module"
)]
pub use robust::{ListenerHandle, ListenerState};
