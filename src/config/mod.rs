//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: top-level `Config`, `ConfigError` and loading
//! - [`bans`]: ban list and lurker tuning (`BansConfig`)
//! - [`defaults`]: serde default functions
//! - [`validation`]: startup checks

mod bans;
mod defaults;
mod types;
mod validation;

pub use bans::BansConfig;
pub use types::{Config, ConfigError, JournalConfig};
pub use validation::{ValidationError, validate};
