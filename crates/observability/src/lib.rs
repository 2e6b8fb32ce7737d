//! Tracing and logging setup shared by the EchoBoard binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LogSettings;

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(settings: &LogSettings) {
    tracing::init(settings);
}
