//! Process-wide structured logging setup shared by the worker binaries.

/// Initialize tracing with JSON output and `RUST_LOG` filtering (default `info`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogSettings::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;
