//! Core utilities and shared types for the AV discovery toolkit.

pub mod codec;
pub mod error;

pub use codec::LineEnding;
pub use error::{AvError, AvResult};

use std::sync::OnceLock;
use std::time::Instant;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the process first asked for the time.
///
/// Timestamps on captures and scan results use this clock, so they are only
/// comparable with each other, never with wall-clock time.
pub fn monotonic_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
