//! Epoch-based reclamation.
//!
//! A global epoch counter cycles through three values. Retired records are
//! filed into one of three garbage bags according to the epoch active at
//! retire time. A thread that wants to load a shared pointer first pins
//! itself to the current epoch (publishing that it may be holding
//! references from this epoch onward); the epoch can only be advanced once
//! every pinned thread has been observed at the current value, which
//! guarantees the bag two epochs behind is no longer reachable by anyone
//! and can be reclaimed.
//!
//! Grounded on the `EpochState`/`Participants` design in
//! `schets-crossbeam`'s `mem::epoch::global`, generalized here from a
//! single hardcoded data structure to any [`Reclaimable`] node type.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::cache_padded::CachePadded;
use crate::config::{Config, ConfigBuilder, RegionExtension, ScanStrategy};
use crate::marked_ptr::{Atomic, MarkedPtr};
use crate::reclaim::{Guard as GuardTrait, NotEqual, Reclaimable, Scheme};
use crate::registry::{RawNode, RawStack, Slot, SlotList};

const BAG_COUNT: usize = 3;
const PARTICIPANTS_PER_NODE: usize = 32;

static CONFIG: OnceLock<Config> = OnceLock::new();

fn config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

/// Sets the process-wide configuration for the epoch scheme.
///
/// Has no effect once any thread has already pinned, since the
/// configuration is read lazily on first use and then cached.
pub fn configure(new_config: Config) {
    let _ = CONFIG.set(new_config);
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
// Participant
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Participant {
    in_use: AtomicBool,
    active: AtomicBool,
    local_epoch: AtomicUsize,
}

impl Default for Participant {
    fn default() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            active: AtomicBool::new(false),
            local_epoch: AtomicUsize::new(0),
        }
    }
}

impl Slot for Participant {
    fn try_claim(&self) -> bool {
        self.in_use.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }

    fn release(&self) {
        self.active.store(false, Ordering::Release);
        self.in_use.store(false, Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Global
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Global {
    epoch: CachePadded<AtomicUsize>,
    bags: [RawStack<Retired>; BAG_COUNT],
    participants: SlotList<Participant, PARTICIPANTS_PER_NODE>,
}

impl Global {
    const fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicUsize::new(0)),
            bags: [RawStack::new(), RawStack::new(), RawStack::new()],
            participants: SlotList::new(),
        }
    }

    /// Attempts to advance the global epoch and reclaims whatever garbage
    /// that makes safe to free.
    ///
    /// (EBR:1) Every pinned participant publishes its `local_epoch` with a
    /// `SeqCst` store before doing any protected load; this scan reads every
    /// participant's `local_epoch` with `Acquire` and only advances once all
    /// of them agree with the current epoch, so nothing retired before the
    /// bag being reclaimed can still be reachable.
    fn try_advance(&self) {
        let current = self.epoch.load(Ordering::SeqCst);

        for participant in self.participants.iter() {
            if participant.active.load(Ordering::Acquire)
                && participant.local_epoch.load(Ordering::Acquire) != current
            {
                return;
            }
        }

        let new_epoch = current.wrapping_add(1);
        if self
            .epoch
            .compare_exchange(current, new_epoch, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            let safe_bag = (new_epoch + 1) % BAG_COUNT;
            let mut curr = self.bags[safe_bag].take_all();
            while !curr.is_null() {
                let node = unsafe { Box::from_raw(curr) };
                curr = node.next;
                unsafe { node.reclaim() };
            }
        }
    }
}

static GLOBAL: Global = Global::new();

////////////////////////////////////////////////////////////////////////////////////////////////////
// Local
////////////////////////////////////////////////////////////////////////////////////////////////////

struct LocalState {
    participant: &'static Participant,
    nesting: Cell<u32>,
    ops_since_retire: Cell<u32>,
}

impl LocalState {
    fn new() -> Self {
        Self {
            participant: GLOBAL.participants.claim(),
            nesting: Cell::new(0),
            ops_since_retire: Cell::new(0),
        }
    }
}

impl Drop for LocalState {
    fn drop(&mut self) {
        self.participant.release();
    }
}

thread_local! {
    static LOCAL: LocalState = LocalState::new();
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An epoch guard. Dereferencing a shared pointer loaded through this guard
/// is sound for as long as the guard is alive (or, under
/// [`RegionExtension::Lazy`], for as long as any guard nested inside it on
/// the same thread is alive).
pub struct Guard {
    _not_send_sync: PhantomData<*const ()>,
}

impl Default for Guard {
    fn default() -> Self {
        LOCAL.with(|local| {
            let nesting = local.nesting.get();
            if nesting == 0 {
                local.participant.local_epoch.store(GLOBAL.epoch.load(Ordering::Relaxed), Ordering::Relaxed);
                // (EBR:1) see Global::try_advance
                local.participant.active.store(true, Ordering::SeqCst);
            }
            local.nesting.set(nesting + 1);
        });
        Self { _not_send_sync: PhantomData }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        LOCAL.with(|local| {
            let nesting = local.nesting.get() - 1;
            local.nesting.set(nesting);

            let eager = config().region_extension() == RegionExtension::Eager;
            if nesting == 0 || eager {
                local.participant.active.store(false, Ordering::Release);
            }
        });
    }
}

impl GuardTrait<Ebr> for Guard {
    #[inline]
    fn acquire<T, const NTAG: usize>(
        &mut self,
        atomic: &Atomic<T, NTAG>,
        order: Ordering,
    ) -> MarkedPtr<T, NTAG>
    where
        T: Reclaimable,
    {
        atomic.load(order)
    }

    #[inline]
    fn acquire_if_equal<T, const NTAG: usize>(
        &mut self,
        atomic: &Atomic<T, NTAG>,
        expected: MarkedPtr<T, NTAG>,
        order: Ordering,
    ) -> Result<MarkedPtr<T, NTAG>, NotEqual>
    where
        T: Reclaimable,
    {
        let current = atomic.load(order);
        if current == expected {
            Ok(current)
        } else {
            Err(NotEqual)
        }
    }

    #[inline]
    fn reset(&mut self) {
        LOCAL.with(|local| {
            local.participant.local_epoch.store(GLOBAL.epoch.load(Ordering::Relaxed), Ordering::SeqCst);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Ebr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Epoch-based reclamation scheme marker type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ebr;

impl Ebr {
    /// Pins the calling thread to the current epoch and returns a guard
    /// protecting every shared pointer loaded through it.
    #[inline]
    pub fn pin() -> Guard {
        Guard::default()
    }

    /// Configures strict, Fraser-style epoch advancement: every retire
    /// attempts to advance the global epoch, and every guard pins and unpins
    /// independently of any guard nested around it.
    ///
    /// Like [`configure`], this has no effect once any thread has already
    /// pinned; call it before the scheme is otherwise used.
    pub fn fraser() -> Guard {
        configure(
            ConfigBuilder::new()
                .scan_strategy(ScanStrategy::Fraser)
                .region_extension(RegionExtension::Eager)
                .build(),
        );
        Guard::default()
    }

    /// Configures DEBRA-style epoch advancement: a thread only attempts to
    /// advance the epoch while it is not itself pinned, and nested guards on
    /// the same thread share a single pin, trading reclamation promptness
    /// for fewer wasted advance attempts.
    ///
    /// Like [`configure`], this has no effect once any thread has already
    /// pinned; call it before the scheme is otherwise used.
    pub fn debra() -> Guard {
        configure(
            ConfigBuilder::new()
                .scan_strategy(ScanStrategy::Debra)
                .region_extension(RegionExtension::Lazy)
                .build(),
        );
        Guard::default()
    }

    /// Configures eager region extension with the default (`OpsCount`) scan
    /// strategy: every guard pins and unpins independently, but epoch
    /// advancement is still only attempted once every `scan_threshold`
    /// retires.
    ///
    /// Like [`configure`], this has no effect once any thread has already
    /// pinned; call it before the scheme is otherwise used.
    pub fn nebr() -> Guard {
        configure(ConfigBuilder::new().region_extension(RegionExtension::Eager).build());
        Guard::default()
    }
}

impl Scheme for Ebr {
    type Guard = Guard;
    type RegionGuard = Guard;

    #[inline]
    fn guard() -> Guard {
        Guard::default()
    }

    unsafe fn retire<T>(ptr: NonNull<T>)
    where
        T: Reclaimable,
    {
        let bag_idx = GLOBAL.epoch.load(Ordering::Relaxed) % BAG_COUNT;
        let node = Box::into_raw(Box::new(unsafe { Retired::new(ptr) }));
        unsafe { GLOBAL.bags[bag_idx].push(node) };

        match config().scan_strategy() {
            ScanStrategy::Fraser => GLOBAL.try_advance(),
            ScanStrategy::Debra => {
                let is_pinned = LOCAL.with(|local| local.nesting.get() > 0);
                if !is_pinned {
                    GLOBAL.try_advance();
                }
            }
            ScanStrategy::OpsCount => LOCAL.with(|local| {
                let ops = local.ops_since_retire.get() + 1;
                if ops >= config().scan_threshold() {
                    local.ops_since_retire.set(0);
                    GLOBAL.try_advance();
                } else {
                    local.ops_since_retire.set(ops);
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct Node {
        #[allow(dead_code)]
        value: u32,
    }

    unsafe impl Reclaimable for Node {}

    #[test]
    fn nebr_configures_eager_region_extension() {
        let _guard = Ebr::nebr();
        assert_eq!(config().region_extension(), RegionExtension::Eager);
    }

    #[test]
    fn region_guard_pins_like_a_regular_guard() {
        let atomic: Atomic<Node, 0> = Atomic::from_marked_ptr(crate::marked_ptr::alloc(Node { value: 2 }));
        let mut region = Ebr::region_guard();
        let loaded = GuardTrait::<Ebr>::acquire(&mut region, &atomic, Ordering::Acquire);
        assert_eq!(unsafe { &*loaded.ptr() }.value, 2);
        unsafe { crate::marked_ptr::dealloc(loaded.ptr()) };
    }

    #[test]
    fn pin_and_load() {
        let atomic: Atomic<Node, 0> = Atomic::from_marked_ptr(crate::marked_ptr::alloc(Node { value: 1 }));
        let mut guard = Ebr::guard();
        let loaded = guard.acquire(&atomic, Ordering::Acquire);
        assert!(!loaded.is_null());
        unsafe { crate::marked_ptr::dealloc(loaded.ptr()) };
    }

    #[test]
    fn retire_eventually_reclaims() {
        static DROPS: StdAtomicUsize = StdAtomicUsize::new(0);

        struct Counted;
        unsafe impl Reclaimable for Counted {
            unsafe fn reclaim(ptr: *mut Self) {
                drop(Box::from_raw(ptr));
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        configure(crate::config::ConfigBuilder::new().scan_threshold(1).build());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..64 {
                        let guard = Ebr::guard();
                        drop(guard);
                        let ptr = Box::into_raw(Box::new(Counted));
                        unsafe { Ebr::retire(NonNull::new_unchecked(ptr)) };
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // give the background-free scan-on-retire scheme a final chance to drain
        for _ in 0..8 {
            let _ = Ebr::guard();
            GLOBAL.try_advance();
        }

        assert!(DROPS.load(Ordering::Relaxed) > 0);
    }
}
