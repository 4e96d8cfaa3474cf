//! Transport health: probing the store and tracking the verdict.
//!
//! - [`Prober`]: runs the INIT → READ → QUERY → SUBSCRIBE checks against the store
//! - [`ConnectionTracker`]: shared, observable [`ConnectionStatus`] updated by each probe
//! - [`ReconnectConfig`]: the exponential backoff policy used across the crate

pub mod config;
pub mod prober;
pub mod state;

pub use config::{ProbeConfig, ReconnectConfig};
pub use prober::{ProbeResult, ProbeStage, Prober};
#[expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]
pub use state::{ConnectionStatus, ConnectionTracker};
