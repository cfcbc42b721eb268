//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

// =============================================================================
// Lurker Defaults
// =============================================================================

/// Pause between lurker passes that did work, in milliseconds.
pub fn default_lurker_sleep_ms() -> u64 {
    10
}

/// Pause while the lurker is disabled or has nothing to do, in milliseconds.
pub fn default_lurker_idle_ms() -> u64 {
    1000
}

// =============================================================================
// Journal Defaults
// =============================================================================

/// Dead journal bytes that trigger compaction.
pub fn default_journal_compact_bytes() -> u64 {
    crate::journal::DEFAULT_COMPACT_BYTES
}
