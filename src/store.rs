//! In-memory object store.
//!
//! A DashMap of cached responses that speaks the ban protocol: objects are
//! registered on insert, released on removal, checked on lookup and exposed to
//! the lurker through a non-blocking shard lock. The shard lock is the
//! object's bucket lock.

use crate::ban::{BanEngine, CachedObject, ObjCore, ObjectId, ObjectStore, ObjectView, PinOutcome, RequestView};
use dashmap::DashMap;
use dashmap::try_result::TryResult;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// One cached response.
pub struct MemObject {
    core: ObjCore,
    status: StatusCode,
    headers: HeaderMap,
    expired: AtomicBool,
}

impl MemObject {
    pub fn new(id: ObjectId, status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            core: ObjCore::new(id),
            status,
            headers,
            expired: AtomicBool::new(false),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

impl ObjectView for MemObject {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn status(&self) -> u16 {
        self.status.as_u16()
    }
}

impl CachedObject for MemObject {
    fn core(&self) -> &ObjCore {
        &self.core
    }

    fn expire_now(&self) {
        self.expired.store(true, Ordering::Release);
    }
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Miss,
    /// A ban matched; the object has been removed.
    Banned,
    Hit(StatusCode),
}

/// Cached objects keyed by id.
pub struct MemStore {
    engine: Arc<BanEngine>,
    objects: DashMap<ObjectId, MemObject>,
    next_id: AtomicU64,
}

impl MemStore {
    pub fn new(engine: Arc<BanEngine>) -> Self {
        Self {
            engine,
            objects: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<BanEngine> {
        &self.engine
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Cache a response, registering it at the newest ban.
    pub fn insert(&self, status: StatusCode, headers: HeaderMap) -> ObjectId {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let obj = self.objects.entry(id).insert(MemObject::new(id, status, headers));
        self.engine.on_object_created(&*obj);
        id
    }

    /// Run `f` on an object under its bucket lock.
    pub fn with_object<R>(&self, id: ObjectId, f: impl FnOnce(&MemObject) -> R) -> Option<R> {
        self.objects.get_mut(&id).map(|obj| f(&obj))
    }

    /// Drop an object, releasing its ban reference under the bucket lock.
    pub fn remove(&self, id: ObjectId) -> bool {
        self.objects
            .remove_if(&id, |_, obj| {
                self.engine.on_object_destroyed(obj);
                true
            })
            .is_some()
    }

    /// Look an object up for `req`, checking it against newer bans first.
    pub fn lookup(&self, id: ObjectId, req: &dyn RequestView) -> Lookup {
        let outcome = {
            // Write guard: checks of one object are serialized.
            let Some(obj) = self.objects.get_mut(&id) else {
                return Lookup::Miss;
            };
            if obj.is_expired() || self.engine.check_object(&*obj, Some(req)) {
                None
            } else {
                Some(obj.status)
            }
        };

        match outcome {
            Some(status) => Lookup::Hit(status),
            None => {
                self.remove(id);
                Lookup::Banned
            }
        }
    }

    /// Remove every object that has been expired, returning how many.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|e| e.is_expired())
            .map(|e| *e.key())
            .collect();
        let removed = expired.into_iter().filter(|id| self.remove(*id)).count();
        if removed > 0 {
            debug!(removed, "Purged expired objects");
        }
        removed
    }
}

impl ObjectStore for MemStore {
    fn try_with_object(&self, id: ObjectId, f: &mut dyn FnMut(&dyn CachedObject)) -> PinOutcome {
        match self.objects.try_get_mut(&id) {
            TryResult::Present(obj) => {
                f(&*obj);
                PinOutcome::Done
            }
            TryResult::Absent => PinOutcome::Gone,
            TryResult::Locked => PinOutcome::Contended,
        }
    }
}
