//! Object side of the ban protocol.
//!
//! Every cached object carries an [`ObjCore`] recording the newest ban it has
//! been checked against (its watermark). Objects are created at the newest ban,
//! lazily re-checked against anything newer when read, and reaped once a ban
//! matches.
//!
//! The caller serializes checks of a single object (the store's bucket lock);
//! the watermark and membership ticket are only ever written with the list
//! mutex held.

use super::engine::BanEngine;
use super::eval::{ObjectView, RequestView, Verdict, evaluate};
use super::list::{Ban, BanList};
use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, trace};

/// Identity of a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Where an object stands relative to the ban list.
#[derive(Debug, Clone)]
pub enum Watermark {
    /// Never registered, or already destroyed.
    Detached,
    /// Checked against every ban up to and including this one.
    At(Arc<Ban>),
    /// Matched a ban; waiting to be reaped.
    Banned,
}

/// Per-object ban bookkeeping.
pub struct ObjCore {
    id: ObjectId,
    watermark: ArcSwapOption<Ban>,
    ticket: AtomicU64,
    banned: AtomicBool,
}

impl ObjCore {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            watermark: ArcSwapOption::empty(),
            ticket: AtomicU64::new(0),
            banned: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn watermark(&self) -> Watermark {
        if self.is_banned() {
            return Watermark::Banned;
        }
        match self.watermark.load_full() {
            Some(ban) => Watermark::At(ban),
            None => Watermark::Detached,
        }
    }

    /// Timestamp of the watermark ban, if attached.
    pub fn watermark_timestamp(&self) -> Option<f64> {
        self.watermark.load_full().map(|b| b.timestamp())
    }

    #[inline]
    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ObjCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjCore")
            .field("id", &self.id)
            .field("watermark", &self.watermark_timestamp())
            .field("banned", &self.is_banned())
            .finish()
    }
}

/// A cache object as the ban engine sees it.
pub trait CachedObject: ObjectView + Send + Sync {
    fn core(&self) -> &ObjCore;

    /// Clear the object's expiry so the cache reaps it.
    fn expire_now(&self);
}

/// Result of checking one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No newer ban matches; the watermark is at the newest ban.
    Fresh,
    /// No newer ban matches, but some could not be decided without a
    /// request. The watermark stays put.
    Deferred,
    /// A ban matched and the object has been expired.
    Banned,
}

impl BanEngine {
    /// Register a new object at the newest ban.
    pub fn on_object_created(&self, obj: &dyn CachedObject) {
        let core = obj.core();
        let mut inner = self.list.lock();
        debug_assert!(core.watermark.load_full().is_none(), "{} registered twice", core.id);
        let ban = self.list.newest();
        let ticket = inner.attach(&ban, core.id);
        core.ticket.store(ticket, Ordering::Release);
        core.watermark.store(Some(ban));
    }

    /// Attach an object restored from storage to the ban it was last checked
    /// against: the ban with `timestamp`, else the newest older one, else the
    /// oldest ban on the list.
    pub fn ref_ban(&self, obj: &dyn CachedObject, timestamp: f64) {
        let core = obj.core();
        let mut inner = self.list.lock();
        let ban = BanList::find_at_or_before(&inner, timestamp);
        let ticket = inner.attach(&ban, core.id);
        core.ticket.store(ticket, Ordering::Release);
        core.watermark.store(Some(ban));
    }

    /// Drop the object's claim on its watermark and give the tail a chance
    /// to be reclaimed.
    pub fn on_object_destroyed(&self, obj: &dyn CachedObject) {
        let core = obj.core();
        {
            let mut inner = self.list.lock();
            if let Some(ban) = core.watermark.swap(None) {
                inner.detach(&ban, core.ticket.load(Ordering::Acquire));
            }
        }
        self.reclaim_tail();
    }

    /// Test `obj` against every ban newer than its watermark.
    ///
    /// `req` is `None` on the lurker path; bans reading request data are then
    /// skipped and the watermark is not advanced past them.
    pub fn check(&self, obj: &dyn CachedObject, req: Option<&dyn RequestView>) -> CheckOutcome {
        let core = obj.core();
        if core.is_banned() {
            return CheckOutcome::Banned;
        }
        let Some(mark) = core.watermark.load_full() else {
            return CheckOutcome::Fresh;
        };
        let newest = self.list.newest();
        if Arc::ptr_eq(&newest, &mark) {
            return CheckOutcome::Fresh;
        }

        let mut tests = 0;
        let mut deferred = false;
        let mut hit = None;
        let mut cur = newest.clone();
        while !Arc::ptr_eq(&cur, &mark) {
            if !cur.is_gone() {
                if req.is_none() && cur.is_request_dependent() {
                    deferred = true;
                } else {
                    match evaluate(cur.spec(), &*self.patterns, obj, req, &mut tests) {
                        Verdict::Match => {
                            hit = Some(cur);
                            break;
                        }
                        Verdict::NoMatch => {}
                        Verdict::Indeterminate => deferred = true,
                    }
                }
            }
            cur = match cur.older() {
                Some(older) => older,
                None => {
                    error!(
                        obj = %core.id,
                        watermark = mark.timestamp(),
                        "Watermark not found on ban list"
                    );
                    return CheckOutcome::Deferred;
                }
            };
        }

        let stats = self.list.stats();
        stats.bans_tested.inc();
        stats.bans_tests_tested.inc_by(tests);

        if let Some(ban) = hit {
            {
                let mut inner = self.list.lock();
                if let Some(old) = core.watermark.swap(None) {
                    inner.detach(&old, core.ticket.load(Ordering::Acquire));
                }
                core.banned.store(true, Ordering::Release);
            }
            stats.bans_obj_killed.inc();
            obj.expire_now();
            debug!(obj = %core.id, ban = %ban.id(), tests, "Object banned");
            return CheckOutcome::Banned;
        }

        if deferred {
            trace!(obj = %core.id, tests, "Ban check deferred");
            return CheckOutcome::Deferred;
        }

        let mut inner = self.list.lock();
        let unchanged = core
            .watermark
            .load_full()
            .is_some_and(|cur| Arc::ptr_eq(&cur, &mark));
        if unchanged {
            inner.detach(&mark, core.ticket.load(Ordering::Acquire));
            let ticket = inner.attach(&newest, core.id);
            core.ticket.store(ticket, Ordering::Release);
            core.watermark.store(Some(newest));
        }
        CheckOutcome::Fresh
    }

    /// Check `obj`, returning whether it was banned.
    pub fn check_object(&self, obj: &dyn CachedObject, req: Option<&dyn RequestView>) -> bool {
        self.check(obj, req) == CheckOutcome::Banned
    }

    /// Move a deferred object behind the other members of `ban`.
    pub(crate) fn requeue(&self, obj: &dyn CachedObject, ban: &Arc<Ban>) {
        let core = obj.core();
        let mut inner = self.list.lock();
        let attached = core
            .watermark
            .load_full()
            .is_some_and(|cur| Arc::ptr_eq(&cur, ban));
        if attached
            && let Some(ticket) = inner.requeue(ban, core.ticket.load(Ordering::Acquire))
        {
            core.ticket.store(ticket, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Obj {
        core: ObjCore,
        headers: HashMap<&'static str, &'static str>,
        expired: AtomicBool,
    }

    impl Obj {
        fn new(id: u64, headers: &[(&'static str, &'static str)]) -> Self {
            Self {
                core: ObjCore::new(ObjectId(id)),
                headers: headers.iter().copied().collect(),
                expired: AtomicBool::new(false),
            }
        }
    }

    impl ObjectView for Obj {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
        }

        fn status(&self) -> u16 {
            200
        }
    }

    impl CachedObject for Obj {
        fn core(&self) -> &ObjCore {
            &self.core
        }

        fn expire_now(&self) {
            self.expired.store(true, Ordering::SeqCst);
        }
    }

    fn ban(engine: &BanEngine, conditions: &[(&str, &str, &str)]) -> Arc<Ban> {
        engine.insert_conditions(conditions).unwrap()
    }

    #[test]
    fn created_object_is_fresh() {
        let engine = BanEngine::new(true);
        let o = Obj::new(1, &[]);
        engine.on_object_created(&o);
        assert_eq!(engine.check(&o, None), CheckOutcome::Fresh);
        assert_eq!(engine.list().newest().refcount(), 1);
    }

    #[test]
    fn object_ban_matches_without_request() {
        let engine = BanEngine::new(true);
        let o = Obj::new(1, &[("x-tag", "a")]);
        engine.on_object_created(&o);
        let sentinel = engine.list().newest();
        ban(&engine, &[("obj.http.X-Tag", "==", "a")]);

        assert!(engine.check_object(&o, None));
        assert!(o.expired.load(Ordering::SeqCst));
        assert!(matches!(o.core.watermark(), Watermark::Banned));
        assert_eq!(sentinel.refcount(), 0);
        // Banned objects are not checked again.
        assert_eq!(engine.check(&o, None), CheckOutcome::Banned);
        assert_eq!(engine.stats().bans_obj_killed.get(), 1);
    }

    #[test]
    fn no_match_advances_watermark() {
        let engine = BanEngine::new(true);
        let o = Obj::new(1, &[("x-tag", "a")]);
        engine.on_object_created(&o);
        let sentinel = engine.list().newest();
        let b = ban(&engine, &[("obj.http.X-Tag", "==", "b")]);

        assert_eq!(engine.check(&o, None), CheckOutcome::Fresh);
        assert!(matches!(o.core.watermark(), Watermark::At(w) if Arc::ptr_eq(&w, &b)));
        assert_eq!(sentinel.refcount(), 0);
        assert_eq!(b.refcount(), 1);
    }

    #[test]
    fn request_ban_defers_lurker_check() {
        let engine = BanEngine::new(true);
        let o = Obj::new(1, &[]);
        engine.on_object_created(&o);
        let sentinel = engine.list().newest();
        ban(&engine, &[("req.http.Cookie", "==", "x")]);

        assert_eq!(engine.check(&o, None), CheckOutcome::Deferred);
        assert!(!engine.check_object(&o, None));
        assert!(matches!(o.core.watermark(), Watermark::At(w) if Arc::ptr_eq(&w, &sentinel)));

        // With a request the ban can be decided.
        let req = http::Request::builder().uri("/").body(()).unwrap();
        assert_eq!(engine.check(&o, Some(&req)), CheckOutcome::Fresh);
    }

    #[test]
    fn gone_bans_are_skipped() {
        let engine = BanEngine::new(true);
        let o = Obj::new(1, &[("x-tag", "a")]);
        engine.on_object_created(&o);
        ban(&engine, &[("obj.http.X-Tag", "==", "a")]);
        ban(&engine, &[("obj.http.X-Tag", "==", "a")]);

        assert!(engine.check_object(&o, None));
        // One evaluation: the shadowed copy is never tested.
        assert_eq!(engine.stats().bans_tests_tested.get(), 1);
    }

    #[test]
    fn destroy_releases_and_reclaims() {
        let engine = BanEngine::new(true);
        let o = Obj::new(1, &[]);
        engine.on_object_created(&o);
        ban(&engine, &[("req.url", "==", "/a")]);
        assert_eq!(engine.list().len(), 2);

        engine.on_object_destroyed(&o);
        assert!(matches!(o.core.watermark(), Watermark::Detached));
        assert_eq!(engine.list().len(), 1);
    }

    #[test]
    fn ref_ban_attaches_at_or_before_timestamp() {
        let engine = BanEngine::new(true);
        let a = ban(&engine, &[("req.url", "==", "/a")]);
        let b = ban(&engine, &[("req.url", "==", "/b")]);

        let exact = Obj::new(1, &[]);
        engine.ref_ban(&exact, b.timestamp());
        assert!(matches!(exact.core.watermark(), Watermark::At(w) if Arc::ptr_eq(&w, &b)));

        let between = Obj::new(2, &[]);
        engine.ref_ban(&between, (a.timestamp() + b.timestamp()) / 2.0);
        assert!(matches!(between.core.watermark(), Watermark::At(w) if Arc::ptr_eq(&w, &a)));

        let ancient = Obj::new(3, &[]);
        engine.ref_ban(&ancient, 0.0);
        assert!(matches!(ancient.core.watermark(), Watermark::At(w) if w.is_sentinel()));
    }
}
