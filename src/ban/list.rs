//! The ban list.
//!
//! Bans are kept newest first. A single mutex protects every mutation and
//! every reference count change; worker threads read the cached newest ban
//! and walk the `older` links without it.
//!
//! # Traversal invariant
//!
//! An object holds a counted reference on its watermark ban. Only the oldest
//! ban is ever unlinked, and only when nothing references it, so the span
//! from the newest ban down to any referenced ban stays linked for as long as
//! the reference is held. That is what makes the unlocked walk in
//! `check_object` safe.

use super::object::ObjectId;
use super::spec::BanSpec;
use crate::error::BanError;
use crate::metrics::BanStats;
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const BAN_F_GONE: u8 = 1 << 0;
const BAN_F_REQ: u8 = 1 << 2;

/// Stable identity of a ban for as long as it is linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BanId(u64);

impl fmt::Display for BanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ban#{}", self.0)
    }
}

/// One linked ban.
///
/// `spec` never changes once linked. `flags`, `refcount` and `older` are only
/// written with the list mutex held.
pub struct Ban {
    id: BanId,
    spec: BanSpec,
    sentinel: bool,
    flags: AtomicU8,
    refcount: AtomicU64,
    older: ArcSwapOption<Ban>,
}

impl Ban {
    fn new(id: BanId, spec: BanSpec, sentinel: bool, older: Option<Arc<Ban>>) -> Self {
        let flags = if spec.is_request_dependent() { BAN_F_REQ } else { 0 };
        Self {
            id,
            spec,
            sentinel,
            flags: AtomicU8::new(flags),
            refcount: AtomicU64::new(0),
            older: ArcSwapOption::new(older),
        }
    }

    #[inline]
    pub fn id(&self) -> BanId {
        self.id
    }

    #[inline]
    pub fn spec(&self) -> &BanSpec {
        &self.spec
    }

    #[inline]
    pub fn timestamp(&self) -> f64 {
        self.spec.timestamp()
    }

    /// Seconds since the ban was created.
    pub fn age(&self) -> f64 {
        (now() - self.timestamp()).max(0.0)
    }

    /// Shadowed by a newer identical ban, or the sentinel.
    #[inline]
    pub fn is_gone(&self) -> bool {
        self.flags.load(Ordering::Acquire) & BAN_F_GONE != 0
    }

    #[inline]
    pub fn is_request_dependent(&self) -> bool {
        self.flags.load(Ordering::Acquire) & BAN_F_REQ != 0
    }

    /// The permanent ban inserted when the list is created.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    /// Live holders: watermarked objects plus tail pins.
    #[inline]
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Next older ban on the list.
    #[inline]
    pub fn older(&self) -> Option<Arc<Ban>> {
        self.older.load_full()
    }

    fn mark_gone(&self) {
        self.flags.fetch_or(BAN_F_GONE, Ordering::Release);
    }

    fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    fn decref(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "{} refcount underflow", self.id);
    }
}

impl fmt::Debug for Ban {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ban")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp())
            .field("refcount", &self.refcount())
            .field("gone", &self.is_gone())
            .field("req", &self.is_request_dependent())
            .finish()
    }
}

/// Wall clock in seconds, the unit of ban timestamps.
pub(crate) fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================================================
// Locked state
// ============================================================================

/// State guarded by the list mutex.
pub(crate) struct ListInner {
    /// Front is the newest ban, back the oldest.
    bans: VecDeque<Arc<Ban>>,
    /// Objects watermarked at each ban, in membership-ticket order.
    members: HashMap<BanId, BTreeMap<u64, ObjectId>>,
    next_id: u64,
    next_ticket: u64,
    shutting_down: bool,
}

impl ListInner {
    fn alloc_id(&mut self) -> BanId {
        self.next_id += 1;
        BanId(self.next_id)
    }

    /// Take a counted membership on `ban` for `obj`, returning its ticket.
    pub(crate) fn attach(&mut self, ban: &Arc<Ban>, obj: ObjectId) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        ban.incref();
        self.members.entry(ban.id).or_default().insert(ticket, obj);
        ticket
    }

    /// Release the membership `ticket` holds on `ban`.
    pub(crate) fn detach(&mut self, ban: &Arc<Ban>, ticket: u64) {
        ban.decref();
        if let Some(members) = self.members.get_mut(&ban.id) {
            members.remove(&ticket);
            if members.is_empty() {
                self.members.remove(&ban.id);
            }
        }
    }

    /// Move membership `ticket` to the back of `ban`'s queue.
    pub(crate) fn requeue(&mut self, ban: &Arc<Ban>, ticket: u64) -> Option<u64> {
        let members = self.members.get_mut(&ban.id)?;
        let obj = members.remove(&ticket)?;
        self.next_ticket += 1;
        members.insert(self.next_ticket, obj);
        Some(self.next_ticket)
    }

    fn head(&self) -> &Arc<Ban> {
        // Never empty: the sentinel is linked at construction.
        &self.bans[0]
    }

    fn tail(&self) -> &Arc<Ban> {
        &self.bans[self.bans.len() - 1]
    }
}

// ============================================================================
// BanList
// ============================================================================

/// What [`BanList::reload`] did with a persisted ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Linked; `gone` if a newer identical ban already existed.
    Inserted { gone: bool },
    /// A ban with the same timestamp is already on the list.
    AlreadyPresent,
}

/// Next thing the lurker should look at.
#[derive(Debug)]
pub(crate) enum LurkTarget {
    /// Only the newest ban is left; nothing to advance.
    Settled,
    /// The oldest ban has no watermarked objects.
    NoMembers,
    /// First object watermarked at the oldest ban.
    Object(Arc<Ban>, ObjectId),
}

/// The newest-first ban list.
pub struct BanList {
    inner: Mutex<ListInner>,
    newest: ArcSwap<Ban>,
    dedup: bool,
    stats: BanStats,
}

impl BanList {
    /// Create a list holding only the sentinel ban.
    pub fn new(dedup: bool, stats: BanStats) -> Self {
        let mut spec = BanSpec::sentinel();
        spec.set_timestamp(now());
        let sentinel = Arc::new(Ban::new(BanId(1), spec, true, None));
        sentinel.mark_gone();

        stats.bans.inc();
        stats.bans_added.inc();
        stats.bans_gone.inc();

        Self {
            inner: Mutex::new(ListInner {
                bans: VecDeque::from([sentinel.clone()]),
                members: HashMap::new(),
                next_id: 1,
                next_ticket: 0,
                shutting_down: false,
            }),
            newest: ArcSwap::new(sentinel),
            dedup,
            stats,
        }
    }

    pub fn stats(&self) -> &BanStats {
        &self.stats
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ListInner> {
        self.inner.lock()
    }

    /// The newest ban, read without the lock.
    ///
    /// May be one insert stale, which only delays a check.
    #[inline]
    pub fn newest(&self) -> Arc<Ban> {
        self.newest.load_full()
    }

    /// The ban at the head of the list.
    pub fn head(&self) -> Arc<Ban> {
        self.inner.lock().head().clone()
    }

    /// The oldest ban on the list.
    pub fn tail(&self) -> Arc<Ban> {
        self.inner.lock().tail().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bans.len()
    }

    /// Never true: the list always holds at least the sentinel.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Link a finished spec at the head, stamping its timestamp.
    ///
    /// Timestamps strictly decrease from head to tail; a clock that has not
    /// moved past the current head is nudged to the next representable value.
    /// With duplicate elimination enabled every older ban with identical
    /// conditions is marked gone. Returns the new ban and the number of bans
    /// it shadowed, or [`BanError::ShuttingDown`] once [`shutdown`] was called.
    ///
    /// [`shutdown`]: BanList::shutdown
    pub fn insert(&self, mut spec: BanSpec) -> Result<(Arc<Ban>, u64), BanError> {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return Err(BanError::ShuttingDown);
        }

        let head = inner.head().clone();
        let mut t = now();
        if t <= head.timestamp() {
            t = head.timestamp().next_up();
        }
        spec.set_timestamp(t);

        let id = inner.alloc_id();
        let ban = Arc::new(Ban::new(id, spec, false, Some(head)));
        inner.bans.push_front(ban.clone());
        self.newest.store(ban.clone());

        self.stats.bans.inc();
        self.stats.bans_added.inc();
        if ban.is_request_dependent() {
            self.stats.bans_req.inc();
        }

        let mut dups = 0;
        if self.dedup {
            for older in inner.bans.iter().skip(1) {
                if older.is_gone() || !ban.spec.same_conditions(&older.spec) {
                    continue;
                }
                older.mark_gone();
                self.stats.bans_gone.inc();
                dups += 1;
            }
            self.stats.bans_dups.inc_by(dups);
        }
        drop(inner);

        debug!(id = %ban.id, timestamp = ban.timestamp(), dups, "Ban inserted");
        Ok((ban, dups))
    }

    /// Refuse every later [`insert`](BanList::insert).
    pub fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
    }

    /// Re-link a ban read back from persistent storage.
    ///
    /// The ban goes where its timestamp puts it, not necessarily at the head,
    /// and the cached newest ban is left alone until [`finish_reload`].
    /// Identical older bans are marked gone; if an identical newer ban exists
    /// the reloaded one is linked already gone.
    ///
    /// [`finish_reload`]: BanList::finish_reload
    pub fn reload(&self, spec: BanSpec) -> ReloadOutcome {
        let t0 = spec.timestamp();
        let mut inner = self.inner.lock();

        let mut pos = inner.bans.len();
        let mut gone = false;
        for (i, b) in inner.bans.iter().enumerate() {
            let t1 = b.timestamp();
            if t1 == t0 {
                return ReloadOutcome::AlreadyPresent;
            }
            if t1 < t0 {
                pos = i;
                break;
            }
            if !gone && b.spec.same_conditions(&spec) {
                gone = true;
                self.stats.bans_dups.inc();
            }
        }

        let id = inner.alloc_id();
        let ban = Arc::new(Ban::new(id, spec, false, inner.bans.get(pos).cloned()));
        if gone {
            ban.mark_gone();
            self.stats.bans_gone.inc();
        }
        if pos > 0 {
            inner.bans[pos - 1].older.store(Some(ban.clone()));
        }
        inner.bans.insert(pos, ban.clone());

        self.stats.bans.inc();
        self.stats.bans_added.inc();
        if ban.is_request_dependent() {
            self.stats.bans_req.inc();
        }

        for older in inner.bans.iter().skip(pos + 1) {
            if older.is_gone() || !ban.spec.same_conditions(&older.spec) {
                continue;
            }
            older.mark_gone();
            self.stats.bans_gone.inc();
            self.stats.bans_dups.inc();
        }

        ReloadOutcome::Inserted { gone }
    }

    /// All persisted bans are back: point the newest cache at the head.
    pub fn finish_reload(&self) {
        let inner = self.inner.lock();
        self.newest.store(inner.head().clone());
        info!(bans = inner.bans.len(), "Ban list reloaded");
    }

    /// Pin the oldest ban so a traversal down to it stays valid.
    pub fn tail_reference(&self) -> TailPin<'_> {
        let inner = self.inner.lock();
        let ban = inner.tail().clone();
        ban.incref();
        TailPin { list: self, ban }
    }

    fn tail_release(&self, ban: &Arc<Ban>) {
        let _inner = self.inner.lock();
        ban.decref();
    }

    /// Unlink the oldest ban if nothing references it and it is not the
    /// only ban left. The caller drops the returned ban outside the lock.
    pub fn reclaim_tail(&self) -> Option<Arc<Ban>> {
        let mut inner = self.inner.lock();
        if inner.bans.len() <= 1 || inner.tail().refcount() != 0 {
            return None;
        }
        let ban = inner.bans.pop_back()?;
        inner.tail().older.store(None);
        inner.members.remove(&ban.id);
        drop(inner);

        self.stats.bans.dec();
        self.stats.bans_deleted.inc();
        if ban.is_gone() {
            self.stats.bans_gone.dec();
        }
        if ban.is_request_dependent() {
            self.stats.bans_req.dec();
        }
        debug!(id = %ban.id, timestamp = ban.timestamp(), "Ban reclaimed");
        Some(ban)
    }

    /// Find the ban with timestamp `t0`, or the newest one older than it,
    /// falling back to the tail. Used to re-attach objects restored from
    /// storage to the ban they were last checked against.
    pub(crate) fn find_at_or_before(inner: &ListInner, t0: f64) -> Arc<Ban> {
        inner
            .bans
            .iter()
            .find(|b| b.timestamp() <= t0)
            .unwrap_or_else(|| inner.tail())
            .clone()
    }

    /// Pick the object the lurker should re-test next.
    pub(crate) fn lurk_target(&self) -> LurkTarget {
        let inner = self.inner.lock();
        let tail = inner.tail();
        if Arc::ptr_eq(tail, &self.newest.load_full()) {
            return LurkTarget::Settled;
        }
        match inner
            .members
            .get(&tail.id)
            .and_then(|m| m.first_key_value())
        {
            Some((_, &obj)) => LurkTarget::Object(tail.clone(), obj),
            None => LurkTarget::NoMembers,
        }
    }

    /// Walk every ban from the head down to the pinned tail.
    pub fn iter<'p>(&self, pin: &'p TailPin<'_>) -> BanIter<'p> {
        BanIter {
            next: Some(self.head()),
            stop: &pin.ban,
        }
    }
}

/// Iterator over the list from head to a pinned tail, without the lock.
pub struct BanIter<'p> {
    next: Option<Arc<Ban>>,
    stop: &'p Arc<Ban>,
}

impl Iterator for BanIter<'_> {
    type Item = Arc<Ban>;

    fn next(&mut self) -> Option<Arc<Ban>> {
        let cur = self.next.take()?;
        if !Arc::ptr_eq(&cur, self.stop) {
            self.next = cur.older();
        }
        Some(cur)
    }
}

/// Reference on the oldest ban, released on drop.
pub struct TailPin<'a> {
    list: &'a BanList,
    ban: Arc<Ban>,
}

impl TailPin<'_> {
    /// The pinned ban.
    pub fn ban(&self) -> &Arc<Ban> {
        &self.ban
    }
}

impl Drop for TailPin<'_> {
    fn drop(&mut self) {
        self.list.tail_release(&self.ban);
    }
}
