//! Core configuration types and loading.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::bans::BansConfig;
use super::defaults::default_journal_compact_bytes;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Ban list and lurker tuning.
    #[serde(default)]
    pub bans: BansConfig,
    /// Ban persistence.
    #[serde(default)]
    pub journal: JournalConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Ban journal configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    /// Journal file. Bans are not persisted when unset.
    pub path: Option<PathBuf>,
    /// Dead bytes that trigger a rewrite from the live bans.
    #[serde(default = "default_journal_compact_bytes")]
    pub compact_bytes: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: None,
            compact_bytes: default_journal_compact_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.bans.dedup);
        assert!(config.journal.path.is_none());
        assert_eq!(config.journal.compact_bytes, 64 * 1024);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[bans]\ndedup = false\nlurker_sleep_ms = 25\n\n[journal]\npath = \"/var/lib/cacheban/bans.journal\"\ncompact_bytes = 4096"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(!config.bans.dedup);
        assert_eq!(config.bans.lurker_sleep_ms, 25);
        assert_eq!(
            config.journal.path.as_deref(),
            Some(Path::new("/var/lib/cacheban/bans.journal"))
        );
        assert_eq!(config.journal.compact_bytes, 4096);
    }

    #[test]
    fn bad_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bans\n").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            Config::load("/nonexistent/cacheban.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
