//! Hazard pointers.
//!
//! Each thread owns a small, lazily grown set of hazard slots drawn from a
//! process-wide list. Before dereferencing a loaded pointer, a thread
//! publishes it into one of its slots (`(HAZ:1)`); a thread that wants to
//! reclaim a retired record first takes a `SeqCst` fence and then scans
//! every slot in the list (`(HAZ:2)`), and only frees records whose address
//! was not found protected by anyone.
//!
//! Grounded directly on the teacher repo's `hazard.rs`/`global.rs`/
//! `local.rs`/`hazard/list.rs`, generalized from the teacher's
//! `conquer_reclaim`-specific plumbing to the crate-wide [`Reclaimable`]/
//! [`Scheme`] contract and built on the generic [`SlotList`] in
//! [`crate::registry`] instead of a hand-rolled hazard-only list.

use core::cell::{Cell, RefCell};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use std::collections::HashSet;
use std::sync::OnceLock;

use arrayvec::ArrayVec;

use crate::config::Config;
use crate::marked_ptr::{Atomic, MarkedPtr};
use crate::reclaim::{Guard as GuardTrait, NotEqual, Reclaimable, Scheme};
use crate::registry::{RawNode, RawStack, Slot, SlotList};

const ELEMENTS_PER_NODE: usize = 128;
const RECYCLE_CACHE_CAPACITY: usize = 16;

static CONFIG: OnceLock<Config> = OnceLock::new();

fn config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

/// Sets the process-wide configuration for the hazard-pointer scheme.
pub fn configure(new_config: Config) {
    let _ = CONFIG.set(new_config);
}

const FREE: *mut () = ptr::null_mut();
const RESERVED: *mut () = 1 as *mut ();

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

struct HazardSlot {
    protected: AtomicPtr<()>,
}

impl Default for HazardSlot {
    fn default() -> Self {
        Self { protected: AtomicPtr::new(FREE) }
    }
}

impl Slot for HazardSlot {
    fn try_claim(&self) -> bool {
        self.protected.compare_exchange(FREE, RESERVED, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }

    fn release(&self) {
        self.protected.store(FREE, Ordering::Release);
    }
}

impl HazardSlot {
    #[inline]
    fn is_protecting(&self, order: Ordering) -> Option<usize> {
        let addr = self.protected.load(order) as usize;
        if addr == FREE as usize || addr == RESERVED as usize {
            None
        } else {
            Some(addr)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Retired {
    ptr: *mut (),
    reclaim: unsafe fn(*mut ()),
    next: *mut Retired,
}

unsafe impl Send for Retired {}

impl Retired {
    unsafe fn new<T: Reclaimable>(ptr: NonNull<T>) -> Self {
        unsafe fn call<T: Reclaimable>(ptr: *mut ()) {
            T::reclaim(ptr as *mut T);
        }
        Self { ptr: ptr.as_ptr() as *mut (), reclaim: call::<T>, next: ptr::null_mut() }
    }

    #[inline]
    fn address(&self) -> usize {
        self.ptr as usize
    }

    unsafe fn reclaim(self) {
        (self.reclaim)(self.ptr)
    }
}

impl RawNode for Retired {
    unsafe fn next(node: *mut Self) -> *mut Self {
        unsafe { (*node).next }
    }

    unsafe fn set_next(node: *mut Self, next: *mut Self) {
        unsafe { (*node).next = next };
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Global
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Global {
    hazards: SlotList<HazardSlot, ELEMENTS_PER_NODE>,
}

impl Global {
    const fn new() -> Self {
        Self { hazards: SlotList::new() }
    }

    /// Builds the set of addresses currently protected by any thread.
    ///
    /// (HAZ:2) The `SeqCst` fence pairs with every slot's `(HAZ:1)` `SeqCst`
    /// store: once the fence has executed, this scan is guaranteed to
    /// observe any protection published before it, so any address absent
    /// from the resulting set cannot be dereferenced by another thread
    /// after this point.
    fn collect_protected(&self) -> HashSet<usize> {
        std::sync::atomic::fence(Ordering::SeqCst);
        self.hazards.iter().filter_map(|slot| slot.is_protecting(Ordering::Acquire)).collect()
    }
}

static GLOBAL: Global = Global::new();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Local
////////////////////////////////////////////////////////////////////////////////////////////////////

struct LocalState {
    cache: RefCell<ArrayVec<[&'static HazardSlot; RECYCLE_CACHE_CAPACITY]>>,
    retired: RefCell<Vec<Retired>>,
    ops_since_scan: Cell<u32>,
}

impl LocalState {
    fn new() -> Self {
        Self {
            cache: RefCell::new(ArrayVec::new()),
            retired: RefCell::new(Vec::with_capacity(config().init_cache())),
            ops_since_scan: Cell::new(0),
        }
    }

    fn acquire_slot(&self) -> &'static HazardSlot {
        if let Some(slot) = self.cache.borrow_mut().pop() {
            return slot;
        }
        GLOBAL.hazards.claim()
    }

    /// Like [`acquire_slot`](Self::acquire_slot), but honors
    /// [`Config::max_slots`]: once the registry has hit that cap, this
    /// returns `Err` instead of growing it further.
    fn try_acquire_slot(&self) -> Result<&'static HazardSlot, BadHazardAlloc> {
        if let Some(slot) = self.cache.borrow_mut().pop() {
            return Ok(slot);
        }
        match config().max_slots() {
            Some(max) => GLOBAL.hazards.claim_bounded(max).ok_or(BadHazardAlloc),
            None => Ok(GLOBAL.hazards.claim()),
        }
    }

    fn recycle_slot(&self, slot: &'static HazardSlot) {
        slot.protected.store(RESERVED, Ordering::Release);
        let mut cache = self.cache.borrow_mut();
        if cache.len() < cache.capacity() {
            cache.push(slot);
        } else {
            drop(cache);
            slot.release();
        }
    }

    fn note_retire(&self, retired: Retired) {
        self.retired.borrow_mut().push(retired);
        let ops = self.ops_since_scan.get() + 1;
        let enough_records = self.retired.borrow().len() as u32 >= config().min_required_records();
        if ops >= config().scan_threshold() && enough_records {
            self.ops_since_scan.set(0);
            self.scan();
        } else {
            self.ops_since_scan.set(ops);
        }
    }

    fn scan(&self) {
        let protected = GLOBAL.collect_protected();
        self.retired.borrow_mut().retain(|retired| {
            if protected.contains(&retired.address()) {
                true
            } else {
                // SAFETY: not present in the protected set just sampled, so no guard can
                // still be dereferencing it
                unsafe { ptr::read(retired).reclaim() };
                false
            }
        });
    }
}

impl Drop for LocalState {
    fn drop(&mut self) {
        for slot in self.cache.get_mut().drain(..) {
            slot.release();
        }
        self.scan();
        // any record that survived the final scan is handed to whichever thread happens
        // to retire next and triggers a scan that observes it as unprotected; since hazard
        // slots are released above, no reachable protection can keep them alive forever
        let remaining = self.retired.get_mut();
        for retired in remaining.drain(..) {
            let node = Box::into_raw(Box::new(retired));
            unsafe { ABANDONED.push(node) };
        }
    }
}

static ABANDONED: RawStack<Retired> = RawStack::new();

thread_local! {
    static LOCAL: LocalState = LocalState::new();
}

/// Adopts and scans any records abandoned by threads that have since
/// exited, reclaiming whatever is no longer protected.
pub fn adopt_abandoned() {
    let mut curr = ABANDONED.take_all();
    if curr.is_null() {
        return;
    }
    let protected = GLOBAL.collect_protected();
    while !curr.is_null() {
        let node = unsafe { Box::from_raw(curr) };
        curr = node.next;
        let retired = *node;
        if protected.contains(&retired.address()) {
            let node = Box::into_raw(Box::new(retired));
            unsafe { ABANDONED.push(node) };
        } else {
            unsafe { retired.reclaim() };
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// BadHazardAlloc
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Returned by [`Hp::try_guard`] when [`Config::max_slots`] is set and the
/// registry has no free slot and has already reached its cap (the
/// `static_strategy` allocation-exhaustion error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadHazardAlloc;

impl core::fmt::Display for BadHazardAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("hazard-pointer registry has reached its configured slot limit")
    }
}

impl std::error::Error for BadHazardAlloc {}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single hazard-pointer guard, protecting the one pointer last loaded
/// through it.
pub struct Guard {
    slot: &'static HazardSlot,
}

impl Default for Guard {
    fn default() -> Self {
        LOCAL.with(|local| Self { slot: local.acquire_slot() })
    }
}

impl Guard {
    /// Like [`Hp::guard`], but fails instead of growing the registry once
    /// [`Config::max_slots`] has been reached.
    fn try_new() -> Result<Self, BadHazardAlloc> {
        LOCAL.with(|local| local.try_acquire_slot().map(|slot| Self { slot }))
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        LOCAL.with(|local| local.recycle_slot(self.slot));
    }
}

impl GuardTrait<Hp> for Guard {
    fn acquire<T, const NTAG: usize>(
        &mut self,
        atomic: &Atomic<T, NTAG>,
        order: Ordering,
    ) -> MarkedPtr<T, NTAG>
    where
        T: Reclaimable,
    {
        loop {
            let snapshot = atomic.load(Ordering::Relaxed);
            // (HAZ:1) see Global::collect_protected
            self.slot.protected.store(snapshot.ptr() as *mut (), Ordering::SeqCst);
            let current = atomic.load(order);
            if current == snapshot {
                return current;
            }
        }
    }

    fn acquire_if_equal<T, const NTAG: usize>(
        &mut self,
        atomic: &Atomic<T, NTAG>,
        expected: MarkedPtr<T, NTAG>,
        order: Ordering,
    ) -> Result<MarkedPtr<T, NTAG>, NotEqual>
    where
        T: Reclaimable,
    {
        let current = atomic.load(Ordering::Relaxed);
        if current != expected {
            return Err(NotEqual);
        }

        // (HAZ:1) see Global::collect_protected
        self.slot.protected.store(current.ptr() as *mut (), Ordering::SeqCst);
        let revalidated = atomic.load(order);
        if revalidated == expected {
            Ok(revalidated)
        } else {
            self.reset();
            Err(NotEqual)
        }
    }

    fn reset(&mut self) {
        self.slot.protected.store(RESERVED, Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Hp
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Hazard-pointer reclamation scheme marker type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hp;

/// Hazard pointers protect per-acquire, not per-region, so entering or
/// leaving a region has nothing to publish.
#[derive(Debug, Default)]
pub struct RegionGuard(());

impl Scheme for Hp {
    type Guard = Guard;
    type RegionGuard = RegionGuard;

    #[inline]
    fn guard() -> Guard {
        Guard::default()
    }

    unsafe fn retire<T>(ptr: NonNull<T>)
    where
        T: Reclaimable,
    {
        LOCAL.with(|local| local.note_retire(Retired::new(ptr)));
    }
}

impl Hp {
    /// Creates a new hazard-pointer guard, or fails with [`BadHazardAlloc`]
    /// if [`Config::max_slots`] is set (`static_strategy`) and the registry
    /// has no free slot left within that cap.
    ///
    /// With the default configuration (`max_slots` unset, `dynamic_strategy`)
    /// this never fails; prefer the infallible [`Hp::guard`] in that case.
    pub fn try_guard() -> Result<Guard, BadHazardAlloc> {
        Guard::try_new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        #[allow(dead_code)]
        value: u32,
    }

    unsafe impl Reclaimable for Node {}

    #[test]
    fn region_guard_is_a_plain_marker() {
        let _region = Hp::region_guard();
    }

    #[test]
    fn try_guard_succeeds_under_default_dynamic_strategy() {
        assert!(Hp::try_guard().is_ok());
    }

    #[test]
    fn acquire_protects_current_value() {
        let atomic: Atomic<Node, 0> = Atomic::from_marked_ptr(crate::marked_ptr::alloc(Node { value: 7 }));
        let mut guard = Hp::guard();
        let loaded = guard.acquire(&atomic, Ordering::Acquire);
        assert_eq!(unsafe { &*loaded.ptr() }.value, 7);
        unsafe { crate::marked_ptr::dealloc(loaded.ptr()) };
    }

    #[test]
    fn acquire_if_equal_detects_change() {
        let atomic: Atomic<Node, 0> = Atomic::from_marked_ptr(crate::marked_ptr::alloc(Node { value: 1 }));
        let stale = atomic.load(Ordering::Relaxed);
        let replacement = crate::marked_ptr::alloc(Node { value: 2 });
        atomic.store(replacement, Ordering::Release);

        let mut guard = Hp::guard();
        matches::assert_matches!(guard.acquire_if_equal(&atomic, stale, Ordering::Acquire), Err(NotEqual));

        unsafe { crate::marked_ptr::dealloc(stale.ptr()) };
        unsafe { crate::marked_ptr::dealloc(replacement.ptr()) };
    }

    #[test]
    fn retired_record_protected_by_guard_survives_scan() {
        static DROPPED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

        struct Counted;
        unsafe impl Reclaimable for Counted {
            unsafe fn reclaim(ptr: *mut Self) {
                drop(Box::from_raw(ptr));
                DROPPED.store(true, Ordering::Relaxed);
            }
        }

        let atomic: Atomic<Counted, 0> = Atomic::from_marked_ptr(crate::marked_ptr::alloc(Counted));
        let mut guard = Hp::guard();
        let loaded = guard.acquire(&atomic, Ordering::Acquire);

        unsafe { Hp::retire(NonNull::new_unchecked(loaded.ptr())) };
        assert!(!DROPPED.load(Ordering::Relaxed), "retired record is still protected by `guard`");

        drop(guard);
        LOCAL.with(|local| local.scan());
        assert!(DROPPED.load(Ordering::Relaxed));
    }
}
