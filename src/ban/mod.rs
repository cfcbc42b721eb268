//! The ban engine.
//!
//! - [`spec`]: the wire format and the builder that produces it
//! - [`pattern`]: the pattern engine collaborator (`~`, `!~`)
//! - [`eval`]: evaluating one ban against an object and a request
//! - [`list`]: the newest-first ban list
//! - [`object`]: watermarks and the per-object check
//! - [`lurker`]: background re-checking and tail reclaim
//! - [`engine`]: the facade tying it together

pub mod engine;
pub mod eval;
pub mod list;
pub mod lurker;
pub mod object;
pub mod pattern;
pub mod spec;

pub use engine::{BanEngine, BanListing};
pub use eval::{ObjectView, RequestView, Verdict, evaluate};
pub use list::{Ban, BanId, BanList, ReloadOutcome, TailPin};
pub use lurker::{LurkStep, Lurker, ObjectStore, PinOutcome, spawn_lurker};
pub use object::{CachedObject, CheckOutcome, ObjCore, ObjectId, Watermark};
pub use pattern::{Diagnostic, Pattern, PatternEngine, RegexEngine};
pub use spec::{BanBuilder, BanSpec, BanTest, Operator, Subject, encode};
