//! Tracing, logging and failure diagnostics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, formats).
pub mod tracing;

/// Side channel for failures recovered inside background workers.
pub mod diagnostics;

pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use self::tracing::{LogFormat, init_with};
