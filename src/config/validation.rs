//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("journal.path parent directory does not exist: {0}")]
    JournalPathInvalid(String),
    #[error("bans.lurker_idle_ms must be greater than zero")]
    ZeroLurkerIdle,
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.bans.lurker_idle_ms == 0 {
        errors.push(ValidationError::ZeroLurkerIdle);
    }

    if let Some(ref path) = config.journal.path
        && let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        errors.push(ValidationError::JournalPathInvalid(path.display().to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = Config::default();
        config.bans.lurker_idle_ms = 0;
        config.journal.path = Some("/nonexistent/dir/bans.journal".into());
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], ValidationError::ZeroLurkerIdle);
        assert!(matches!(errors[1], ValidationError::JournalPathInvalid(_)));
    }

    #[test]
    fn relative_journal_path_is_valid() {
        let mut config = Config::default();
        config.journal.path = Some("bans.journal".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn zero_sleep_is_valid() {
        let mut config = Config::default();
        config.bans.lurker_sleep_ms = 0;
        assert!(validate(&config).is_ok());
    }
}
