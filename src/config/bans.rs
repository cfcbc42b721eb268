//! Ban list and lurker configuration.

use super::defaults::{default_lurker_idle_ms, default_lurker_sleep_ms, default_true};
use serde::Deserialize;
use std::time::Duration;

/// Ban engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BansConfig {
    /// Mark older bans with identical conditions as gone on insert
    /// (default: true).
    #[serde(default = "default_true")]
    pub dedup: bool,
    /// Lurker pause between passes, in milliseconds (default: 10).
    /// Zero disables object re-testing; dead bans are still reclaimed.
    #[serde(default = "default_lurker_sleep_ms")]
    pub lurker_sleep_ms: u64,
    /// Lurker pause when idle or disabled, in milliseconds (default: 1000).
    #[serde(default = "default_lurker_idle_ms")]
    pub lurker_idle_ms: u64,
}

impl Default for BansConfig {
    fn default() -> Self {
        Self {
            dedup: default_true(),
            lurker_sleep_ms: default_lurker_sleep_ms(),
            lurker_idle_ms: default_lurker_idle_ms(),
        }
    }
}

impl BansConfig {
    pub fn lurker_sleep(&self) -> Duration {
        Duration::from_millis(self.lurker_sleep_ms)
    }

    pub fn lurker_idle(&self) -> Duration {
        Duration::from_millis(self.lurker_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_correct() {
        let config = BansConfig::default();
        assert!(config.dedup);
        assert_eq!(config.lurker_sleep(), Duration::from_millis(10));
        assert_eq!(config.lurker_idle(), Duration::from_secs(1));
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let config: BansConfig = toml::from_str("lurker_sleep_ms = 0").unwrap();
        assert!(config.dedup);
        assert_eq!(config.lurker_sleep_ms, 0);
        assert_eq!(config.lurker_idle_ms, 1000);
    }
}
