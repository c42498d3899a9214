//! Hazard eras.
//!
//! A generalization of hazard pointers that announces a timestamp (an
//! "era") instead of an address. A global, monotonically increasing era
//! counter is bumped once per retire; each retired record remembers the era
//! it was retired at. Reclaiming a record only requires checking that no
//! live thread's announced era is still behind the record's retire era —
//! there is no need to know which specific address a thread is protecting,
//! which avoids the address-comparison retry some hazard-pointer
//! implementations need on every acquire.
//!
//! This crate's hazard-pointer scheme ([`crate::schemes::hp`]) is grounded
//! directly on the teacher repo; this module reuses the same
//! [`SlotList`]/thread-local-cache shape but swaps the per-slot protected
//! *address* for a per-slot protected *era*, following the teacher's own
//! `Local`/`Global` split rather than inventing a new one. Birth eras are
//! intentionally not tracked (every record is conservatively treated as
//! having existed since era 0): wiring a precise birth era into every
//! container's publish path would require a container-level hook this
//! crate's generic [`Reclaimable`] contract does not expose.

use core::cell::{Cell, RefCell};
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use arrayvec::ArrayVec;

use crate::config::Config;
use crate::marked_ptr::{Atomic, MarkedPtr};
use crate::reclaim::{Guard as GuardTrait, NotEqual, Reclaimable, Scheme};
use crate::registry::{RawNode, RawStack, Slot, SlotList};

const ELEMENTS_PER_NODE: usize = 128;
const RECYCLE_CACHE_CAPACITY: usize = 16;

const IDLE: u64 = u64::MAX;
const RESERVED: u64 = u64::MAX - 1;

static CONFIG: OnceLock<Config> = OnceLock::new();

fn config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

/// Sets the process-wide configuration for the hazard-era scheme.
pub fn configure(new_config: Config) {
    let _ = CONFIG.set(new_config);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// EraSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

struct EraSlot {
    era: AtomicU64,
}

impl Default for EraSlot {
    fn default() -> Self {
        Self { era: AtomicU64::new(IDLE) }
    }
}

impl Slot for EraSlot {
    fn try_claim(&self) -> bool {
        self.era.compare_exchange(IDLE, RESERVED, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }

    fn release(&self) {
        self.era.store(IDLE, Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Retired {
    ptr: *mut (),
    reclaim: unsafe fn(*mut ()),
    retire_era: u64,
    next: *mut Retired,
}

unsafe impl Send for Retired {}

impl Retired {
    unsafe fn new<T: Reclaimable>(ptr: NonNull<T>, retire_era: u64) -> Self {
        unsafe fn call<T: Reclaimable>(ptr: *mut ()) {
            T::reclaim(ptr as *mut T);
        }
        Self { ptr: ptr.as_ptr() as *mut (), reclaim: call::<T>, retire_era, next: ptr::null_mut() }
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
    era: AtomicU64,
    slots: SlotList<EraSlot, ELEMENTS_PER_NODE>,
}

impl Global {
    const fn new() -> Self {
        Self { era: AtomicU64::new(0), slots: SlotList::new() }
    }

    /// Returns the oldest era any live thread is still announced at, or
    /// `IDLE` if no thread currently protects anything.
    ///
    /// (ERA:2) pairs with every announcing thread's `(ERA:1)` `SeqCst`
    /// store: a record retired at era `r` is safe to reclaim once this scan
    /// observes no slot below `r`.
    fn min_announced_era(&self) -> u64 {
        std::sync::atomic::fence(Ordering::SeqCst);
        self.slots
            .iter()
            .map(|slot| slot.era.load(Ordering::Acquire))
            .filter(|&era| era != IDLE && era != RESERVED)
            .min()
            .unwrap_or(IDLE)
    }
}

static GLOBAL: Global = Global::new();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Local
////////////////////////////////////////////////////////////////////////////////////////////////////

struct LocalState {
    cache: RefCell<ArrayVec<[&'static EraSlot; RECYCLE_CACHE_CAPACITY]>>,
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

    fn acquire_slot(&self) -> &'static EraSlot {
        if let Some(slot) = self.cache.borrow_mut().pop() {
            return slot;
        }
        GLOBAL.slots.claim()
    }

    /// Like [`acquire_slot`](Self::acquire_slot), but honors
    /// [`Config::max_slots`]: once the registry has hit that cap, this
    /// returns `Err` instead of growing it further.
    fn try_acquire_slot(&self) -> Result<&'static EraSlot, BadEraAlloc> {
        if let Some(slot) = self.cache.borrow_mut().pop() {
            return Ok(slot);
        }
        match config().max_slots() {
            Some(max) => GLOBAL.slots.claim_bounded(max).ok_or(BadEraAlloc),
            None => Ok(GLOBAL.slots.claim()),
        }
    }

    fn recycle_slot(&self, slot: &'static EraSlot) {
        slot.era.store(RESERVED, Ordering::Release);
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
        let min_era = GLOBAL.min_announced_era();
        self.retired.borrow_mut().retain(|retired| {
            if min_era < retired.retire_era {
                true
            } else {
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
    let min_era = GLOBAL.min_announced_era();
    while !curr.is_null() {
        let node = unsafe { Box::from_raw(curr) };
        curr = node.next;
        let retired = *node;
        if min_era < retired.retire_era {
            let node = Box::into_raw(Box::new(retired));
            unsafe { ABANDONED.push(node) };
        } else {
            unsafe { retired.reclaim() };
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// BadEraAlloc
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Returned by [`He::try_guard`] when [`Config::max_slots`] is set and the
/// registry has no free slot and has already reached its cap (the
/// `static_strategy` allocation-exhaustion error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadEraAlloc;

impl core::fmt::Display for BadEraAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("hazard-era registry has reached its configured slot limit")
    }
}

impl std::error::Error for BadEraAlloc {}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single hazard-era guard, protecting whatever era was current when it
/// last acquired a pointer.
pub struct Guard {
    slot: &'static EraSlot,
}

impl Default for Guard {
    fn default() -> Self {
        LOCAL.with(|local| Self { slot: local.acquire_slot() })
    }
}

impl Guard {
    /// Like [`He::guard`], but fails instead of growing the registry once
    /// [`Config::max_slots`] has been reached.
    fn try_new() -> Result<Self, BadEraAlloc> {
        LOCAL.with(|local| local.try_acquire_slot().map(|slot| Self { slot }))
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        LOCAL.with(|local| local.recycle_slot(self.slot));
    }
}

impl GuardTrait<He> for Guard {
    fn acquire<T, const NTAG: usize>(
        &mut self,
        atomic: &Atomic<T, NTAG>,
        order: Ordering,
    ) -> MarkedPtr<T, NTAG>
    where
        T: Reclaimable,
    {
        loop {
            let era = GLOBAL.era.load(Ordering::Relaxed);
            // (ERA:1) see Global::min_announced_era
            self.slot.era.store(era, Ordering::SeqCst);
            let current = atomic.load(order);
            if GLOBAL.era.load(Ordering::Relaxed) == era {
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

        let era = GLOBAL.era.load(Ordering::Relaxed);
        // (ERA:1) see Global::min_announced_era
        self.slot.era.store(era, Ordering::SeqCst);
        let revalidated = atomic.load(order);
        if revalidated == expected && GLOBAL.era.load(Ordering::Relaxed) == era {
            Ok(revalidated)
        } else {
            self.reset();
            Err(NotEqual)
        }
    }

    fn reset(&mut self) {
        self.slot.era.store(RESERVED, Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// He
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Hazard-era reclamation scheme marker type.
#[derive(Debug, Clone, Copy, Default)]
pub struct He;

/// Hazard eras protect per-acquire, not per-region, so entering or leaving
/// a region has nothing to publish.
#[derive(Debug, Default)]
pub struct RegionGuard(());

impl Scheme for He {
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
        let retire_era = GLOBAL.era.fetch_add(1, Ordering::AcqRel) + 1;
        LOCAL.with(|local| local.note_retire(Retired::new(ptr, retire_era)));
    }
}

impl He {
    /// Creates a new hazard-era guard, or fails with [`BadEraAlloc`] if
    /// [`Config::max_slots`] is set (`static_strategy`) and the registry has
    /// no free slot left within that cap.
    ///
    /// With the default configuration (`max_slots` unset, `dynamic_strategy`)
    /// this never fails; prefer the infallible [`He::guard`] in that case.
    pub fn try_guard() -> Result<Guard, BadEraAlloc> {
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
    fn try_guard_succeeds_under_default_dynamic_strategy() {
        assert!(He::try_guard().is_ok());
    }

    #[test]
    fn acquire_protects_current_value() {
        let atomic: Atomic<Node, 0> = Atomic::from_marked_ptr(crate::marked_ptr::alloc(Node { value: 9 }));
        let mut guard = He::guard();
        let loaded = guard.acquire(&atomic, Ordering::Acquire);
        assert_eq!(unsafe { &*loaded.ptr() }.value, 9);
        unsafe { crate::marked_ptr::dealloc(loaded.ptr()) };
    }

    #[test]
    fn protected_record_survives_scan_until_guard_drops() {
        static DROPPED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

        struct Counted;
        unsafe impl Reclaimable for Counted {
            unsafe fn reclaim(ptr: *mut Self) {
                drop(Box::from_raw(ptr));
                DROPPED.store(true, Ordering::Relaxed);
            }
        }

        let atomic: Atomic<Counted, 0> = Atomic::from_marked_ptr(crate::marked_ptr::alloc(Counted));
        let mut guard = He::guard();
        let loaded = guard.acquire(&atomic, Ordering::Acquire);

        unsafe { He::retire(NonNull::new_unchecked(loaded.ptr())) };
        LOCAL.with(|local| local.scan());
        assert!(!DROPPED.load(Ordering::Relaxed));

        drop(guard);
        LOCAL.with(|local| local.scan());
        assert!(DROPPED.load(Ordering::Relaxed));
    }
}
