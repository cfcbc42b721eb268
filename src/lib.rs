//! cacheban - cache invalidation by ban lists.
//!
//! Bans are AND-ed conditions over request and cached-object data. They are
//! checked lazily when an object is read and by a background lurker, so a ban
//! costs nothing up front no matter how many objects it covers.

pub mod ban;
pub mod config;
pub mod error;
pub mod handlers;
pub mod journal;
pub mod metrics;
pub mod store;
