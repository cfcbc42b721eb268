//! Unified error handling for cacheban.
//!
//! This module provides the error hierarchy of the ban engine: validation
//! errors raised while building a ban, and the errors of the administrative
//! command layer with their CLI status numbers and metric labels.

use thiserror::Error;

// ============================================================================
// Ban Errors (spec building, insertion, reload)
// ============================================================================

/// Errors raised while building, inserting or reloading a ban.
///
/// All of these are reported before the ban list is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BanError {
    #[error("unknown or unsupported field \"{0}\"")]
    InvalidField(String),

    #[error("expected conditional (~, !~, == or !=) got \"{0}\"")]
    InvalidOperator(String),

    /// Diagnostic from the pattern engine, passed through verbatim.
    #[error("{0}")]
    PatternError(String),

    #[error("argument for \"{0}\" contains a NUL byte")]
    InvalidLiteral(String),

    #[error("ban has no conditions")]
    NoConditions,

    #[error("could not get memory")]
    OutOfMemory,

    #[error("corrupt ban spec: {0}")]
    Corrupt(&'static str),

    #[error("Shutting down")]
    ShuttingDown,
}

impl BanError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidField(_) => "invalid_field",
            Self::InvalidOperator(_) => "invalid_operator",
            Self::PatternError(_) => "pattern_error",
            Self::InvalidLiteral(_) => "invalid_literal",
            Self::NoConditions => "no_conditions",
            Self::OutOfMemory => "out_of_memory",
            Self::Corrupt(_) => "corrupt",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

// ============================================================================
// Admin Errors (command processing)
// ============================================================================

/// CLI reply status numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CliStatus {
    Syntax = 100,
    Unknown = 101,
    TooFew = 104,
    TooMany = 105,
    Param = 106,
    Ok = 200,
    Cant = 300,
}

impl CliStatus {
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for CliStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors that can occur while executing an administrative command.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Wrong number of arguments")]
    WrongArgumentCount,

    #[error("Found \"{0}\" expected &&")]
    ExpectedAnd(String),

    #[error("Unknown request \"{0}\"")]
    UnknownCommand(String),

    #[error("Missing '\"'")]
    UnclosedQuote,

    #[error("Too few parameters")]
    TooFew,

    #[error("Too many parameters")]
    TooMany,

    #[error(transparent)]
    Ban(#[from] BanError),
}

impl AdminError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WrongArgumentCount => "wrong_argument_count",
            Self::ExpectedAnd(_) => "expected_and",
            Self::UnknownCommand(_) => "unknown_command",
            Self::UnclosedQuote => "unclosed_quote",
            Self::TooFew => "too_few",
            Self::TooMany => "too_many",
            Self::Ban(e) => e.error_code(),
        }
    }

    /// CLI status reported alongside the error text.
    pub fn status(&self) -> CliStatus {
        match self {
            Self::UnclosedQuote => CliStatus::Syntax,
            Self::UnknownCommand(_) => CliStatus::Unknown,
            Self::TooFew => CliStatus::TooFew,
            Self::TooMany => CliStatus::TooMany,
            Self::Ban(BanError::OutOfMemory | BanError::ShuttingDown) => CliStatus::Cant,
            Self::WrongArgumentCount | Self::ExpectedAnd(_) | Self::Ban(_) => CliStatus::Param,
        }
    }
}

/// Result type for command handlers.
pub type AdminResult = Result<String, AdminError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_error_codes() {
        assert_eq!(BanError::InvalidField("x".into()).error_code(), "invalid_field");
        assert_eq!(BanError::OutOfMemory.error_code(), "out_of_memory");
        assert_eq!(BanError::Corrupt("short").error_code(), "corrupt");
    }

    #[test]
    fn test_pattern_diagnostic_is_verbatim() {
        let err = BanError::PatternError("regex parse error: unclosed group".into());
        assert_eq!(err.to_string(), "regex parse error: unclosed group");
    }

    #[test]
    fn test_admin_error_status() {
        assert_eq!(AdminError::WrongArgumentCount.status(), CliStatus::Param);
        assert_eq!(AdminError::UnknownCommand("foo".into()).status().code(), 101);
        assert_eq!(AdminError::Ban(BanError::OutOfMemory).status(), CliStatus::Cant);
        assert_eq!(AdminError::Ban(BanError::ShuttingDown).status(), CliStatus::Cant);
        assert_eq!(
            AdminError::Ban(BanError::InvalidOperator("<".into())).error_code(),
            "invalid_operator"
        );
    }
}
