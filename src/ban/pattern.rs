//! Pattern engine collaborator for `~` and `!~` conditions.
//!
//! The ban spec stores an engine-specific blob for every pattern test; the
//! rest of the crate only ever sees the [`PatternEngine`] trait.

use dashmap::DashMap;
use regex::Regex;
use std::fmt;
use tracing::warn;

/// Diagnostic produced by a pattern engine when a pattern does not compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic(pub String);

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A compiled pattern.
pub trait Pattern: Send + Sync {
    /// Unanchored search of `subject`.
    fn matches(&self, subject: &str) -> bool;
}

impl Pattern for Regex {
    fn matches(&self, subject: &str) -> bool {
        self.is_match(subject)
    }
}

/// Compiles pattern literals into storable blobs and matches subjects
/// against previously stored blobs.
pub trait PatternEngine: Send + Sync {
    /// Compile `literal`, returning the serialized form to embed in a ban spec.
    fn compile(&self, literal: &str) -> Result<Vec<u8>, Diagnostic>;

    /// Test `subject` against a blob produced by [`compile`](Self::compile).
    ///
    /// A blob that does not compile never matches.
    fn matches(&self, blob: &[u8], subject: &str) -> bool;

    /// A linked ban carries `blob`. Fails if the blob does not compile, in
    /// which case nothing is retained.
    fn retain(&self, _blob: &[u8]) -> Result<(), Diagnostic> {
        Ok(())
    }

    /// A ban carrying `blob` was unlinked.
    fn release(&self, _blob: &[u8]) {}
}

struct Memo {
    re: Regex,
    /// Linked bans carrying this blob.
    bans: usize,
}

/// [`PatternEngine`] backed by the `regex` crate.
///
/// The stored blob is the validated pattern source. Blobs of linked bans are
/// compiled once and kept until the last ban carrying them is reclaimed.
#[derive(Default)]
pub struct RegexEngine {
    compiled: DashMap<Box<[u8]>, Memo>,
}

impl fmt::Debug for RegexEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegexEngine")
            .field("cached", &self.compiled.len())
            .finish()
    }
}

impl RegexEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct patterns currently memoized.
    pub fn cached(&self) -> usize {
        self.compiled.len()
    }

    fn build(blob: &[u8]) -> Result<Regex, Diagnostic> {
        let source = std::str::from_utf8(blob)
            .map_err(|_| Diagnostic("pattern is not valid UTF-8".into()))?;
        Regex::new(source).map_err(|e| Diagnostic(e.to_string()))
    }
}

impl PatternEngine for RegexEngine {
    fn compile(&self, literal: &str) -> Result<Vec<u8>, Diagnostic> {
        Regex::new(literal).map_err(|e| Diagnostic(e.to_string()))?;
        Ok(literal.as_bytes().to_vec())
    }

    fn matches(&self, blob: &[u8], subject: &str) -> bool {
        if let Some(memo) = self.compiled.get(blob) {
            return Pattern::matches(&memo.re, subject);
        }
        // Not carried by any linked ban: compile for this call only.
        match Self::build(blob) {
            Ok(re) => Pattern::matches(&re, subject),
            Err(e) => {
                warn!(len = blob.len(), error = %e, "Stored pattern does not compile");
                false
            }
        }
    }

    fn retain(&self, blob: &[u8]) -> Result<(), Diagnostic> {
        if let Some(mut memo) = self.compiled.get_mut(blob) {
            memo.bans += 1;
            return Ok(());
        }
        let re = Self::build(blob)?;
        self.compiled
            .entry(blob.into())
            .and_modify(|memo| memo.bans += 1)
            .or_insert(Memo { re, bans: 1 });
        Ok(())
    }

    fn release(&self, blob: &[u8]) {
        if let Some(mut memo) = self.compiled.get_mut(blob) {
            memo.bans = memo.bans.saturating_sub(1);
        }
        self.compiled.remove_if(blob, |_, memo| memo.bans == 0);
    }
}
