//! Deterministic test harness for the murmur realtime core.
//!
//! In-memory implementations of the collaborator traits, scripted so tests
//! can force subscribe, publish and persistence failures at exact points, and
//! inspect everything the core sent. Run them under
//! `#[tokio::test(start_paused = true)]` so every timer is driven by virtual
//! time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaotic;
pub mod read_store;
pub mod recorder;
pub mod sim_transport;

pub use chaotic::ChaoticReadStore;
pub use read_store::{MemoryReadStore, PersistCall};
pub use recorder::TransitionRecorder;
pub use sim_transport::{PublishedEvent, SimTransport};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}
