//! Background ban lurker.
//!
//! Objects that are never read would otherwise keep old bans alive forever.
//! The lurker walks the oldest ban's members and re-checks them without a
//! request, moving their watermarks forward so the tail can be reclaimed.
//!
//! Each pass takes the list mutex and then only *tries* the object's bucket
//! lock. Object destruction takes the bucket lock first and the list mutex
//! second, so a blocking acquire here could deadlock.

use super::engine::BanEngine;
use super::list::LurkTarget;
use super::object::{CachedObject, CheckOutcome, ObjectId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Result of trying to lock an object's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// The object was locked and the closure ran.
    Done,
    /// The bucket is busy; try again later.
    Contended,
    /// The object no longer exists.
    Gone,
}

/// The cache's object table, as seen by the lurker.
pub trait ObjectStore: Send + Sync {
    /// Lock `id`'s bucket without blocking and run `f` on the object.
    fn try_with_object(&self, id: ObjectId, f: &mut dyn FnMut(&dyn CachedObject)) -> PinOutcome;
}

/// What one lurker pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LurkStep {
    /// Freed the oldest ban.
    Reclaimed,
    /// Re-testing is disabled.
    Disabled,
    /// Only one ban is left to compare against.
    Settled,
    /// The oldest ban is referenced only by pins.
    NoMembers,
    /// Checked one object.
    Checked(CheckOutcome),
    /// The object's bucket was busy.
    Contended,
    /// The object went away before it could be locked.
    Vanished,
}

/// One-object-per-pass background checker.
pub struct Lurker {
    engine: Arc<BanEngine>,
    store: Arc<dyn ObjectStore>,
    sleep: Duration,
    idle: Duration,
}

impl Lurker {
    /// `sleep` paces passes that did work; zero disables re-testing.
    /// `idle` is the pause when there is nothing to do.
    pub fn new(
        engine: Arc<BanEngine>,
        store: Arc<dyn ObjectStore>,
        sleep: Duration,
        idle: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            sleep,
            idle,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.sleep.is_zero()
    }

    /// Run one pass.
    pub fn step(&self) -> LurkStep {
        if self.engine.reclaim_tail() {
            return LurkStep::Reclaimed;
        }
        if !self.is_enabled() {
            return LurkStep::Disabled;
        }

        let (ban, id) = match self.engine.list.lurk_target() {
            LurkTarget::Settled => return LurkStep::Settled,
            LurkTarget::NoMembers => return LurkStep::NoMembers,
            LurkTarget::Object(ban, id) => (ban, id),
        };

        let engine = &*self.engine;
        let mut outcome = CheckOutcome::Fresh;
        let pinned = self.store.try_with_object(id, &mut |obj: &dyn CachedObject| {
            outcome = engine.check(obj, None);
            if outcome == CheckOutcome::Deferred {
                engine.requeue(obj, &ban);
            }
        });

        match pinned {
            PinOutcome::Done => {
                trace!(obj = %id, ban = %ban.id(), ?outcome, "Lurker checked object");
                LurkStep::Checked(outcome)
            }
            PinOutcome::Contended => {
                self.engine.stats().bans_lurker_contention.inc();
                LurkStep::Contended
            }
            PinOutcome::Gone => LurkStep::Vanished,
        }
    }

    /// Pause before the pass following `step`.
    pub fn pause(&self, step: LurkStep) -> Duration {
        match step {
            LurkStep::Disabled | LurkStep::Settled | LurkStep::NoMembers => self.idle,
            _ => self.sleep,
        }
    }
}

/// Run `lurker` on a tokio task for the life of the runtime.
pub fn spawn_lurker(lurker: Lurker) -> JoinHandle<()> {
    info!(
        enabled = lurker.is_enabled(),
        sleep_ms = lurker.sleep.as_millis() as u64,
        idle_ms = lurker.idle.as_millis() as u64,
        "Ban lurker started"
    );
    tokio::spawn(async move {
        loop {
            let step = lurker.step();
            if step == LurkStep::Reclaimed {
                debug!("Lurker reclaimed a ban");
            }
            tokio::time::sleep(lurker.pause(step)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::eval::ObjectView;
    use crate::ban::object::{ObjCore, Watermark};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct Obj {
        core: ObjCore,
        tag: &'static str,
    }

    impl ObjectView for Obj {
        fn header(&self, name: &str) -> Option<&str> {
            name.eq_ignore_ascii_case("x-tag").then_some(self.tag)
        }

        fn status(&self) -> u16 {
            200
        }
    }

    impl CachedObject for Obj {
        fn core(&self) -> &ObjCore {
            &self.core
        }

        fn expire_now(&self) {}
    }

    /// Objects behind per-object mutexes standing in for bucket locks.
    #[derive(Default)]
    struct Table(HashMap<ObjectId, Mutex<Obj>>);

    impl ObjectStore for Table {
        fn try_with_object(
            &self,
            id: ObjectId,
            f: &mut dyn FnMut(&dyn CachedObject),
        ) -> PinOutcome {
            let Some(slot) = self.0.get(&id) else {
                return PinOutcome::Gone;
            };
            match slot.try_lock() {
                Some(obj) => {
                    f(&*obj);
                    PinOutcome::Done
                }
                None => PinOutcome::Contended,
            }
        }
    }

    fn setup(tags: &[&'static str]) -> (Arc<BanEngine>, Arc<Table>) {
        let engine = Arc::new(BanEngine::new(true));
        let mut table = Table::default();
        for (i, &tag) in tags.iter().enumerate() {
            let obj = Obj {
                core: ObjCore::new(ObjectId(i as u64)),
                tag,
            };
            engine.on_object_created(&obj);
            table.0.insert(obj.core.id(), Mutex::new(obj));
        }
        (engine, Arc::new(table))
    }

    fn lurker(engine: &Arc<BanEngine>, table: &Arc<Table>, sleep_ms: u64) -> Lurker {
        Lurker::new(
            engine.clone(),
            table.clone(),
            Duration::from_millis(sleep_ms),
            Duration::from_millis(1000),
        )
    }

    #[test]
    fn settled_list_idles() {
        let (engine, table) = setup(&["a"]);
        let l = lurker(&engine, &table, 10);
        assert_eq!(l.step(), LurkStep::Settled);
        assert_eq!(l.pause(LurkStep::Settled), Duration::from_millis(1000));
    }

    #[test]
    fn advances_and_reclaims_tail() {
        let (engine, table) = setup(&["a", "b"]);
        engine.insert_conditions(&[("obj.http.X-Tag", "==", "a")]).unwrap();
        let l = lurker(&engine, &table, 10);

        assert_eq!(l.step(), LurkStep::Checked(CheckOutcome::Banned));
        assert_eq!(l.step(), LurkStep::Checked(CheckOutcome::Fresh));
        assert_eq!(l.step(), LurkStep::Reclaimed);
        assert_eq!(l.step(), LurkStep::Settled);
        assert_eq!(engine.list().len(), 1);

        let b = table.0[&ObjectId(1)].lock();
        assert!(matches!(b.core.watermark(), Watermark::At(w) if !w.is_sentinel()));
    }

    #[test]
    fn deferred_objects_rotate() {
        let (engine, table) = setup(&["a", "b"]);
        engine.insert_conditions(&[("req.http.Cookie", "==", "x")]).unwrap();
        let l = lurker(&engine, &table, 10);

        assert_eq!(l.step(), LurkStep::Checked(CheckOutcome::Deferred));
        match engine.list().lurk_target() {
            LurkTarget::Object(_, id) => assert_eq!(id, ObjectId(1)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(l.step(), LurkStep::Checked(CheckOutcome::Deferred));
        // Nothing can be reclaimed while both objects wait for a request.
        assert_eq!(engine.list().len(), 2);
    }

    #[test]
    fn contended_bucket_is_skipped() {
        let (engine, table) = setup(&["a"]);
        engine.insert_conditions(&[("obj.http.X-Tag", "==", "zzz")]).unwrap();
        let l = lurker(&engine, &table, 10);

        let held = table.0[&ObjectId(0)].lock();
        assert_eq!(l.step(), LurkStep::Contended);
        assert_eq!(engine.stats().bans_lurker_contention.get(), 1);
        drop(held);

        assert_eq!(l.step(), LurkStep::Checked(CheckOutcome::Fresh));
    }

    #[test]
    fn disabled_lurker_still_reclaims() {
        let (engine, table) = setup(&[]);
        engine.insert_conditions(&[("req.url", "==", "/a")]).unwrap();
        let l = lurker(&engine, &table, 0);
        assert!(!l.is_enabled());
        assert_eq!(l.step(), LurkStep::Reclaimed);
        assert_eq!(l.step(), LurkStep::Disabled);
        assert_eq!(l.pause(LurkStep::Disabled), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn spawned_lurker_makes_progress() {
        let (engine, table) = setup(&["a"]);
        engine.insert_conditions(&[("obj.http.X-Tag", "==", "b")]).unwrap();
        let handle = spawn_lurker(lurker(&engine, &table, 10));

        for _ in 0..100 {
            if engine.list().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(engine.list().len(), 1);
    }
}
