//! The ban engine facade.
//!
//! [`BanEngine`] ties the list, the pattern engine and the persistence
//! collaborator together and exposes the operations used by the admin
//! commands, the object store and the lurker. The object protocol lives in
//! [`super::object`].

use super::list::{Ban, BanList, ReloadOutcome, TailPin};
use super::pattern::{PatternEngine, RegexEngine};
use super::spec::{BanBuilder, BanSpec};
use crate::error::BanError;
use crate::journal::{BanEvent, BanPersistence, NoopPersistence};
use crate::metrics::BanStats;
use std::sync::Arc;
use tracing::{debug, info};

/// One row of `ban.list`.
#[derive(Debug, Clone, PartialEq)]
pub struct BanListing {
    pub timestamp: f64,
    /// Seconds since the ban was created.
    pub age: f64,
    pub refcount: u64,
    pub gone: bool,
    pub request_dependent: bool,
    pub conditions: String,
}

/// Shared ban engine state.
pub struct BanEngine {
    pub(super) list: BanList,
    pub(super) patterns: Arc<dyn PatternEngine>,
    persistence: Arc<dyn BanPersistence>,
}

impl BanEngine {
    /// Engine with the regex pattern engine and no persistence.
    pub fn new(dedup: bool) -> Self {
        Self {
            list: BanList::new(dedup, BanStats::new()),
            patterns: Arc::new(RegexEngine::new()),
            persistence: Arc::new(NoopPersistence),
        }
    }

    pub fn with_patterns(mut self, patterns: Arc<dyn PatternEngine>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn BanPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn list(&self) -> &BanList {
        &self.list
    }

    pub fn stats(&self) -> &BanStats {
        self.list.stats()
    }

    pub fn patterns(&self) -> &dyn PatternEngine {
        &*self.patterns
    }

    /// Start building a ban.
    pub fn builder(&self) -> BanBuilder<'_> {
        BanBuilder::new(&*self.patterns)
    }

    /// Finish `builder` and link the ban at the head of the list.
    ///
    /// Nothing is linked if finishing fails or the engine is shutting down.
    pub fn insert(&self, builder: BanBuilder<'_>) -> Result<Arc<Ban>, BanError> {
        let spec = builder.finish()?;
        self.retain_patterns(&spec)?;
        let (ban, dups) = match self.list.insert(spec.clone()) {
            Ok(linked) => linked,
            Err(e) => {
                self.release_patterns(&spec);
                return Err(e);
            }
        };
        self.persistence.ban_info(BanEvent::New, ban.spec());
        info!(
            timestamp = ban.timestamp(),
            dups,
            conditions = %ban.spec(),
            "Ban added"
        );
        Ok(ban)
    }

    /// Build and insert a ban from `(field, op, arg)` triples.
    pub fn insert_conditions(&self, conditions: &[(&str, &str, &str)]) -> Result<Arc<Ban>, BanError> {
        let mut builder = self.builder();
        for (field, op, arg) in conditions {
            builder.add_test(field, op, arg)?;
        }
        self.insert(builder)
    }

    /// Re-link a persisted ban. Not reported back to persistence.
    ///
    /// Pattern blobs are compiled up front, so a ban whose patterns no longer
    /// compile is rejected instead of linked.
    pub fn reload(&self, bytes: &[u8]) -> Result<ReloadOutcome, BanError> {
        let spec = BanSpec::from_bytes(bytes)?;
        self.retain_patterns(&spec)?;
        let outcome = self.list.reload(spec.clone());
        if outcome == ReloadOutcome::AlreadyPresent {
            self.release_patterns(&spec);
        }
        Ok(outcome)
    }

    /// End of startup reload.
    pub fn finish_reload(&self) {
        self.list.finish_reload();
    }

    pub fn tail_reference(&self) -> TailPin<'_> {
        self.list.tail_reference()
    }

    /// Unlink the oldest ban if unreferenced, reporting the drop.
    pub fn reclaim_tail(&self) -> bool {
        match self.list.reclaim_tail() {
            Some(ban) => {
                if !ban.is_sentinel() {
                    self.release_patterns(ban.spec());
                    self.persistence.ban_info(BanEvent::Drop, ban.spec());
                }
                true
            }
            None => false,
        }
    }

    /// Refuse further inserts. Bans already linked stay usable.
    pub fn shutdown(&self) {
        self.list.shutdown();
        info!("Ban engine shutting down");
    }

    /// Hold every pattern blob of `spec` in the pattern engine.
    fn retain_patterns(&self, spec: &BanSpec) -> Result<(), BanError> {
        let mut held = 0;
        for blob in spec.tests().filter_map(|t| t.pattern) {
            if let Err(d) = self.patterns.retain(blob) {
                for blob in spec.tests().filter_map(|t| t.pattern).take(held) {
                    self.patterns.release(blob);
                }
                return Err(BanError::PatternError(d.0));
            }
            held += 1;
        }
        Ok(())
    }

    fn release_patterns(&self, spec: &BanSpec) {
        for blob in spec.tests().filter_map(|t| t.pattern) {
            self.patterns.release(blob);
        }
    }

    /// Snapshot every ban except the sentinel, newest first.
    pub fn list_bans(&self) -> Vec<BanListing> {
        let pin = self.list.tail_reference();
        let rows: Vec<BanListing> = self
            .list
            .iter(&pin)
            .filter(|b| !b.is_sentinel())
            .map(|b| {
                let mut refcount = b.refcount();
                if Arc::ptr_eq(&b, pin.ban()) {
                    refcount -= 1;
                }
                BanListing {
                    timestamp: b.timestamp(),
                    age: b.age(),
                    refcount,
                    gone: b.is_gone(),
                    request_dependent: b.is_request_dependent(),
                    conditions: b.spec().render(),
                }
            })
            .collect();
        debug!(bans = rows.len(), "Ban list rendered");
        rows
    }
}
