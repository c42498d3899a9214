//! The traits every reclamation scheme and every concurrent container in
//! this crate are built against.
//!
//! [`Scheme`] is the entry point a container is generic over (`Ebr`, `Hp` or
//! `He`, see the `schemes` module). [`Guard`] is the per-thread protection
//! token a scheme hands out; its `acquire`/`acquire_if_equal`/`reset` trio is
//! the one contract every container uses regardless of which scheme backs
//! it. [`Reclaimable`] replaces the mixin base class a node type would
//! inherit from in a non-generic implementation: it supplies the intrusive
//! link used while a node sits on a retire list and the function used to
//! finally drop it.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::marked_ptr::{Atomic, MarkedPtr};

/// A node type that can be retired and later reclaimed by a [`Scheme`].
///
/// # Safety
///
/// Implementors must guarantee that [`reclaim`](Reclaimable::reclaim) is
/// safe to call exactly once on any pointer that was previously produced by
/// [`crate::marked_ptr::alloc`] (or `Box::into_raw`) for `Self`, once no
/// thread can still be in the process of dereferencing it.
pub unsafe trait Reclaimable: Sized {
    /// Reclaims the value behind `ptr`.
    ///
    /// The default implementation drops it as a `Box`; node types that were
    /// allocated differently (e.g. with a custom deleter) override this.
    #[inline]
    unsafe fn reclaim(ptr: *mut Self) {
        drop(Box::from_raw(ptr));
    }
}

/// The error returned by [`Guard::acquire_if_equal`] when the atomic's
/// current value no longer matches the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotEqual;

/// A per-thread protection token.
///
/// A guard is how a thread tells a reclamation scheme "I may be holding a
/// reference derived from this load; don't reclaim whatever I observe until
/// I drop or reset this guard". Every scheme's guard type honors the same
/// three operations so that containers can be written once, generic over
/// `S: Scheme`.
pub trait Guard<S: Scheme>: Default {
    /// Loads `atomic` and protects the observed value for as long as `self`
    /// is not reset or dropped.
    fn acquire<T, const NTAG: usize>(
        &mut self,
        atomic: &Atomic<T, NTAG>,
        order: Ordering,
    ) -> MarkedPtr<T, NTAG>
    where
        T: Reclaimable;

    /// Like [`acquire`](Self::acquire), but only protects and returns the
    /// loaded value if it equals `expected`; otherwise leaves the guard's
    /// previous protection untouched and returns [`NotEqual`].
    fn acquire_if_equal<T, const NTAG: usize>(
        &mut self,
        atomic: &Atomic<T, NTAG>,
        expected: MarkedPtr<T, NTAG>,
        order: Ordering,
    ) -> Result<MarkedPtr<T, NTAG>, NotEqual>
    where
        T: Reclaimable;

    /// Releases whatever `self` currently protects.
    fn reset(&mut self);

    /// Releases whatever `self` currently protects and enlists `ptr` for
    /// destruction through the scheme's own retire path.
    ///
    /// # Safety
    ///
    /// `ptr` must not be retired more than once, and the caller must have
    /// already unlinked it from every structure reachable by other threads.
    #[inline]
    unsafe fn reclaim<T>(&mut self, ptr: NonNull<T>)
    where
        T: Reclaimable,
        S: Sized,
    {
        self.reset();
        unsafe { S::retire(ptr) };
    }
}

/// A safe memory reclamation scheme.
///
/// Implemented by the zero-sized marker types in the `schemes` module
/// (`Ebr`, `Hp`, `He`). A scheme owns no per-instance state of its own: its
/// bookkeeping lives in thread-locals and a process-wide static, matching
/// the teacher's `Local`/`Global` split.
pub trait Scheme: 'static {
    /// The guard type this scheme hands out.
    type Guard: Guard<Self>
    where
        Self: Sized;

    /// A region marker with no protective role of its own.
    ///
    /// For the hazard-based schemes this is a no-op `Drop` guard (protection
    /// there is per-acquire, not per-region). For [`crate::schemes::Ebr`]
    /// this is the same epoch-entering [`Guard`] type `guard()` returns,
    /// since entering an epoch region *is* what pins the thread.
    type RegionGuard: Default
    where
        Self: Sized;

    /// Creates a new, unprotecting guard for the calling thread.
    fn guard() -> Self::Guard
    where
        Self: Sized;

    /// Marks the start of a region without protecting any particular
    /// pointer. See [`RegionGuard`](Self::RegionGuard).
    #[inline]
    fn region_guard() -> Self::RegionGuard
    where
        Self: Sized,
    {
        Self::RegionGuard::default()
    }

    /// Retires `ptr`, scheduling it for reclamation once no guard can still
    /// observe it.
    ///
    /// # Safety
    ///
    /// `ptr` must not be retired more than once, and the caller must have
    /// already unlinked it from every structure reachable by other threads.
    unsafe fn retire<T>(ptr: NonNull<T>)
    where
        T: Reclaimable;
}
