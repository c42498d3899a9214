//! A fine-grained-locking hash map with lock-free reads.
//!
//! Ported from `examples/original_source/xenium/vyukov_hash_map.hpp` and its
//! `impl/vyukov_hash_map.hpp` companion: each bucket has its own spinlock
//! and an attached version counter. Writers serialize on a bucket's lock;
//! readers never take it; instead they snapshot the version before and
//! after reading a bucket's contents and retry if it changed underneath
//! them (the textbook "seqlock" read pattern also used by, e.g., the
//! `seqlock` crate). A bucket that is merely locked, but not at a new
//! version yet, is still safe to read: the lock only blocks other writers,
//! never a lock-free reader.
//!
//! The original additionally supports online growth, migrating buckets into
//! a larger block once a bucket's extension chain is exhausted. This port
//! keeps that protocol: `data` points at the current [`Block`], swapped out
//! from under readers and writers alike by a single-writer `resize_lock`
//! (`grow`/`do_grow`, mirroring lines 608-713 of the original). A writer
//! that finds its bucket's inline slots and extension chain both full
//! releases the bucket with its original (unbumped) state word and tries to
//! become the thread that grows the map; the loser of that race simply
//! waits for the winner to finish and retries against the new block.
//! [`lock_bucket`](VyukovHashMap::lock_bucket) reloads `data` on every
//! retry specifically so a writer can never deadlock against a bucket that
//! a finished grow has permanently locked (old buckets are never unlocked
//! again; they are simply abandoned once their block is retired).
//!
//! It also replaces the original's batched extension blocks
//! (`bucket_to_extension_ratio`-many items per allocation, restricted to
//! trivial 4/8-byte keys/values) with a simple singly-linked chain of
//! individually boxed, arbitrary-`K`/`V` extension nodes, reusing this
//! crate's [`Scheme`]/[`Reclaimable`] machinery (the same one backing the
//! queues in [`crate::queue`]) to reclaim a chain node once it is unlinked,
//! instead of requiring `K`/`V` to be trivially destructible. Since a
//! bucket's extension chain can no longer grow without bound (there is no
//! pooled allocator to exhaust), this port instead grows the whole map once
//! a bucket's chain would exceed [`MAX_EXTENSION_CHAIN`].

use core::cell::UnsafeCell;
use core::hash::{Hash, Hasher};
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::collections::hash_map::DefaultHasher;

use crate::marked_ptr::{self, Atomic};
use crate::reclaim::{Guard, Reclaimable, Scheme};

const BUCKET_ITEMS: usize = 4;

/// A bucket's extension chain triggers a whole-map grow once it would
/// exceed this many nodes, in place of the original's pooled-allocator
/// exhaustion check.
const MAX_EXTENSION_CHAIN: usize = BUCKET_ITEMS;

////////////////////////////////////////////////////////////////////////////////////////////////////
// BucketState
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Packs a lock bit, an inline item count, a transient delete marker and a
/// version counter into one word, so a writer's unlock-and-bump is a single
/// atomic store and a reader's before/after snapshot is a single atomic
/// load each.
///
/// `item_count` bounds which of a bucket's inline `slots` are live (there is
/// no per-slot occupied flag: slots `0..item_count` are always packed and
/// live, exactly as the original keeps them). `delete_marker` is `slot + 1`
/// while a writer is mid-move of the entry at `slot` (e.g. pulling an
/// extension item inline to fill a gap), or `0` otherwise; a lock-free
/// reader that lands on `slot` while the marker is set skips it rather than
/// risking a torn read, without forcing a full retry.
struct BucketState(AtomicU32);

const LOCK_BIT: u32 = 1;
const ITEM_COUNT_SHIFT: u32 = 1;
const ITEM_COUNT_BITS: u32 = 3;
const ITEM_COUNT_MASK: u32 = ((1 << ITEM_COUNT_BITS) - 1) << ITEM_COUNT_SHIFT;
const DELETE_MARKER_SHIFT: u32 = ITEM_COUNT_SHIFT + ITEM_COUNT_BITS;
const DELETE_MARKER_BITS: u32 = 3;
const DELETE_MARKER_MASK: u32 = ((1 << DELETE_MARKER_BITS) - 1) << DELETE_MARKER_SHIFT;
const VERSION_SHIFT: u32 = DELETE_MARKER_SHIFT + DELETE_MARKER_BITS;

impl BucketState {
    const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    fn is_locked(raw: u32) -> bool {
        raw & LOCK_BIT != 0
    }

    #[inline]
    fn item_count(raw: u32) -> u32 {
        (raw & ITEM_COUNT_MASK) >> ITEM_COUNT_SHIFT
    }

    #[inline]
    fn delete_marker(raw: u32) -> u32 {
        (raw & DELETE_MARKER_MASK) >> DELETE_MARKER_SHIFT
    }

    #[inline]
    fn version(raw: u32) -> u32 {
        raw >> VERSION_SHIFT
    }

    #[inline]
    fn pack(item_count: u32, delete_marker: u32, version: u32) -> u32 {
        (version << VERSION_SHIFT) | (delete_marker << DELETE_MARKER_SHIFT) | (item_count << ITEM_COUNT_SHIFT)
    }

    #[inline]
    fn read_snapshot(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    fn read_relaxed(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_raw(&self, raw: u32, order: Ordering) {
        self.0.store(raw, order);
    }

    /// Attempts to set the lock bit on top of the (unlocked) `expected_unlocked`
    /// word, without touching any other field.
    #[inline]
    fn try_lock(&self, expected_unlocked: u32) -> bool {
        self.0
            .compare_exchange_weak(expected_unlocked, expected_unlocked | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Announces, while still holding the lock, that `slot` is mid-move.
    /// Does not touch the version: a reader mid-scan only ever retries on a
    /// version change, so this is invisible to anyone not looking at `slot`.
    #[inline]
    fn mark_deleting(&self, pre_lock_raw: u32, slot: usize) {
        let marked = Self::pack(Self::item_count(pre_lock_raw), slot as u32 + 1, Self::version(pre_lock_raw)) | LOCK_BIT;
        self.0.store(marked, Ordering::Relaxed);
    }

    /// Releases the lock, clears any delete marker and publishes a new
    /// version alongside `new_item_count` — used whenever this unlock
    /// follows a mutation a reader must be able to detect.
    #[inline]
    fn unlock_with_new_version(&self, pre_lock_raw: u32, new_item_count: u32, new_delete_marker: u32) {
        let new_version = Self::version(pre_lock_raw).wrapping_add(1);
        self.0.store(Self::pack(new_item_count, new_delete_marker, new_version), Ordering::Release);
    }

    /// Releases the lock without bumping the version, for unlocks where
    /// nothing a reader cares about changed (duplicate key on insert, key
    /// not found on erase, an extension node appended behind the inline
    /// slots).
    #[inline]
    fn unlock_unchanged(&self, pre_lock_raw: u32, order: Ordering) {
        self.0.store(pre_lock_raw, order);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Slot / ExtItem
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Slot<K, V> {
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Self { key: UnsafeCell::new(MaybeUninit::uninit()), value: UnsafeCell::new(MaybeUninit::uninit()) }
    }
}

struct ExtItem<K, V> {
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
    occupied: AtomicBool,
    next: Atomic<ExtItem<K, V>, 0>,
}

unsafe impl<K, V> Reclaimable for ExtItem<K, V> {
    unsafe fn reclaim(ptr: *mut Self) {
        let node = Box::from_raw(ptr);
        if node.occupied.load(Ordering::Relaxed) {
            unsafe { (*node.key.get()).assume_init_drop() };
            unsafe { (*node.value.get()).assume_init_drop() };
        }
    }
}

impl<K, V> ExtItem<K, V> {
    fn new(key: K, value: V) -> Self {
        Self {
            key: UnsafeCell::new(MaybeUninit::new(key)),
            value: UnsafeCell::new(MaybeUninit::new(value)),
            occupied: AtomicBool::new(true),
            next: Atomic::null(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Bucket
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Bucket<K, V> {
    state: BucketState,
    slots: [Slot<K, V>; BUCKET_ITEMS],
    extension: Atomic<ExtItem<K, V>, 0>,
}

impl<K, V> Bucket<K, V> {
    fn new() -> Self {
        Self {
            state: BucketState::new(),
            slots: [Slot::empty(), Slot::empty(), Slot::empty(), Slot::empty()],
            extension: Atomic::null(),
        }
    }

    /// Drops every live inline slot and every extension node (deallocating
    /// the latter). Used for a block that was never migrated away from by a
    /// `grow()`.
    fn drop_contents(&mut self) {
        let item_count = BucketState::item_count(*self.state.0.get_mut()) as usize;
        for slot in &mut self.slots[..item_count] {
            unsafe {
                (*slot.key.get()).assume_init_drop();
                (*slot.value.get()).assume_init_drop();
            }
        }
        self.free_extension_chain(true);
    }

    /// Deallocates every extension node without touching `K`/`V`: used for a
    /// block whose every live key/value was already moved out by `do_grow`.
    fn drop_migrated(&mut self) {
        self.free_extension_chain(false);
    }

    fn free_extension_chain(&mut self, drop_values: bool) {
        let mut current = self.extension.load(Ordering::Relaxed).ptr();
        while !current.is_null() {
            let mut node = unsafe { Box::from_raw(current) };
            current = node.next.load(Ordering::Relaxed).ptr();
            if drop_values && *node.occupied.get_mut() {
                unsafe {
                    (*node.key.get()).assume_init_drop();
                    (*node.value.get()).assume_init_drop();
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Block
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The currently active set of buckets. Swapped out wholesale by `do_grow`;
/// everything else addresses buckets through this indirection so a grow is
/// invisible except for the moment a writer's `lock_bucket` happens to
/// reload it.
struct Block<K, V> {
    mask: usize,
    buckets: Box<[Bucket<K, V>]>,
    /// Set once `do_grow` has moved every live entry out of this block and
    /// into its replacement. A migrated block's `Drop` must not touch any
    /// inline slot's `K`/`V` (already moved out) but must still deallocate
    /// each extension node (never moved, only read).
    migrated: AtomicBool,
}

impl<K, V> Block<K, V> {
    fn with_bucket_count(bucket_count: usize) -> Self {
        let buckets = (0..bucket_count).map(|_| Bucket::new()).collect::<Vec<_>>().into_boxed_slice();
        Self { mask: bucket_count - 1, buckets, migrated: AtomicBool::new(false) }
    }
}

unsafe impl<K, V> Reclaimable for Block<K, V> {
    unsafe fn reclaim(ptr: *mut Self) {
        let mut block = unsafe { Box::from_raw(ptr) };
        let migrated = *block.migrated.get_mut();
        for bucket in block.buckets.iter_mut() {
            if migrated {
                bucket.drop_migrated();
            } else {
                bucket.drop_contents();
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// VyukovHashMap
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fine-grained-locking hash map with lock-free reads and an
/// online-growing bucket array.
pub struct VyukovHashMap<K, V, S: Scheme> {
    data: Atomic<Block<K, V>, 0>,
    resize_lock: AtomicBool,
    _scheme: core::marker::PhantomData<S>,
}

unsafe impl<K: Send, V: Send, S: Scheme> Send for VyukovHashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Scheme> Sync for VyukovHashMap<K, V, S> {}

impl<K, V, S: Scheme> VyukovHashMap<K, V, S> {
    /// Creates a map with room for at least `capacity` buckets (rounded up
    /// to the next power of two) before it first grows.
    pub fn with_capacity(capacity: usize) -> Self {
        let bucket_count = capacity.max(1).next_power_of_two();
        let block = Block::with_bucket_count(bucket_count);
        let data = Atomic::from_marked_ptr(marked_ptr::alloc::<Block<K, V>, 0>(block));
        Self { data, resize_lock: AtomicBool::new(false), _scheme: core::marker::PhantomData }
    }
}

impl<K, V, S: Scheme> Default for VyukovHashMap<K, V, S> {
    fn default() -> Self {
        Self::with_capacity(128)
    }
}

impl<K: Hash + Eq, V, S: Scheme> VyukovHashMap<K, V, S> {
    fn hash_key(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    /// Returns a clone of the value associated with `key`, if present.
    pub fn try_get_value(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let mut guard = S::guard();
        let block_ptr = guard.acquire(&self.data, Ordering::Acquire);
        let block = unsafe { &*block_ptr.ptr() };
        let bucket = &block.buckets[Self::hash_key(key) & block.mask];

        let mut state = bucket.state.read_snapshot();
        'retry: loop {
            let item_count = BucketState::item_count(state) as usize;
            for i in 0..item_count {
                let slot = &bucket.slots[i];
                let k = unsafe { (*slot.key.get()).assume_init_ref() };
                if k != key {
                    continue;
                }
                let value = unsafe { (*slot.value.get()).assume_init_ref() }.clone();

                let state2 = bucket.state.read_relaxed();
                if BucketState::version(state) != BucketState::version(state2) {
                    state = state2;
                    continue 'retry;
                }
                if BucketState::delete_marker(state2) == i as u32 + 1 {
                    // somebody is mid-move of this exact slot; the key we just read is
                    // either the one being deleted or one being moved in to replace it,
                    // and we cannot tell which — skip it and keep scanning
                    continue;
                }
                return Some(value);
            }

            let mut current = guard.acquire(&bucket.extension, Ordering::Acquire);
            while !current.is_null() {
                let node = unsafe { &*current.ptr() };
                if node.occupied.load(Ordering::Relaxed) {
                    let k = unsafe { (*node.key.get()).assume_init_ref() };
                    if k == key {
                        let value = unsafe { (*node.value.get()).assume_init_ref() }.clone();
                        let state2 = bucket.state.read_relaxed();
                        if BucketState::version(state) != BucketState::version(state2) {
                            state = state2;
                            continue 'retry;
                        }
                        return Some(value);
                    }
                }
                current = guard.acquire(&node.next, Ordering::Acquire);
                let state2 = bucket.state.read_relaxed();
                if BucketState::version(state) != BucketState::version(state2) {
                    state = state2;
                    continue 'retry;
                }
            }

            let state2 = bucket.state.read_relaxed();
            if BucketState::version(state) != BucketState::version(state2) {
                state = state2;
                continue 'retry;
            }
            return None;
        }
    }

    /// Returns `true` if `key` is present in the map.
    pub fn contains(&self, key: &K) -> bool
    where
        V: Clone,
    {
        self.try_get_value(key).is_some()
    }

    /// Returns a clone of the first entry for which `predicate` returns
    /// `true`, scanning buckets in index order.
    ///
    /// Like [`iter`](Self::iter), this observes a snapshot per bucket, not
    /// one consistent snapshot of the whole map.
    pub fn find<F>(&self, mut predicate: F) -> Option<(K, V)>
    where
        K: Clone,
        V: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        self.iter().find(|(k, v)| predicate(k, v))
    }

    /// Returns a snapshot of every key/value pair currently in the map.
    ///
    /// Each bucket is read under the same optimistic seqlock protocol as
    /// [`try_get_value`](Self::try_get_value), but there is no synchronization
    /// across buckets, so entries inserted or removed from other buckets
    /// while this call is running may or may not be reflected.
    pub fn iter(&self) -> std::vec::IntoIter<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::new();
        let mut guard = S::guard();
        let block_ptr = guard.acquire(&self.data, Ordering::Acquire);
        let block = unsafe { &*block_ptr.ptr() };

        for bucket in block.buckets.iter() {
            Self::collect_bucket(bucket, &mut guard, &mut out);
        }

        out.into_iter()
    }

    fn collect_bucket(bucket: &Bucket<K, V>, guard: &mut S::Guard, out: &mut Vec<(K, V)>)
    where
        K: Clone,
        V: Clone,
    {
        let mut state = bucket.state.read_snapshot();
        'retry: loop {
            let mut entries = Vec::new();
            let item_count = BucketState::item_count(state) as usize;
            for i in 0..item_count {
                if BucketState::delete_marker(state) == i as u32 + 1 {
                    continue;
                }
                let slot = &bucket.slots[i];
                let k = unsafe { (*slot.key.get()).assume_init_ref() };
                let v = unsafe { (*slot.value.get()).assume_init_ref() };
                entries.push((k.clone(), v.clone()));
            }

            let mut current = guard.acquire(&bucket.extension, Ordering::Acquire);
            while !current.is_null() {
                let node = unsafe { &*current.ptr() };
                if node.occupied.load(Ordering::Relaxed) {
                    let k = unsafe { (*node.key.get()).assume_init_ref() };
                    let v = unsafe { (*node.value.get()).assume_init_ref() };
                    entries.push((k.clone(), v.clone()));
                }
                current = guard.acquire(&node.next, Ordering::Acquire);
            }

            let state2 = bucket.state.read_relaxed();
            if BucketState::version(state) != BucketState::version(state2) {
                state = state2;
                continue 'retry;
            }
            out.extend(entries);
            return;
        }
    }

    /// Caller must already hold `bucket`'s writer lock.
    unsafe fn find_in_locked(bucket: &Bucket<K, V>, item_count: usize, key: &K) -> Option<usize> {
        (0..item_count).find(|&i| unsafe { (*bucket.slots[i].key.get()).assume_init_ref() } == key)
    }

    /// Caller must already hold `bucket`'s writer lock.
    unsafe fn find_in_extension<'a>(bucket: &'a Bucket<K, V>, key: &K) -> Option<&'a ExtItem<K, V>> {
        let mut current = bucket.extension.load(Ordering::Relaxed);
        while !current.is_null() {
            let node = unsafe { &*current.ptr() };
            if node.occupied.load(Ordering::Relaxed) && unsafe { (*node.key.get()).assume_init_ref() } == key {
                return Some(node);
            }
            current = node.next.load(Ordering::Relaxed);
        }
        None
    }

    fn extension_len(bucket: &Bucket<K, V>) -> usize {
        let mut current = bucket.extension.load(Ordering::Relaxed);
        let mut len = 0;
        while !current.is_null() {
            len += 1;
            current = unsafe { &*current.ptr() }.next.load(Ordering::Relaxed);
        }
        len
    }

    /// Locks and returns the bucket `key` hashes to under the block
    /// currently installed in `self.data`, reloading `data` on every retry.
    ///
    /// Reloading on every iteration (rather than once) is what lets a
    /// writer escape a bucket that a finished `grow()` has locked forever:
    /// once the new block is published, the very next reload lands on a
    /// fresh, unlocked bucket instead of spinning against the old one.
    fn lock_bucket(&self, key: &K, guard: &mut S::Guard) -> (*const Bucket<K, V>, u32) {
        loop {
            let block_ptr = guard.acquire(&self.data, Ordering::Acquire);
            let block = unsafe { &*block_ptr.ptr() };
            let bucket = &block.buckets[Self::hash_key(key) & block.mask] as *const Bucket<K, V>;

            let pre_lock = unsafe { &*bucket }.state.read_relaxed();
            if BucketState::is_locked(pre_lock) {
                core::hint::spin_loop();
                continue;
            }
            if unsafe { &*bucket }.state.try_lock(pre_lock) {
                return (bucket, pre_lock);
            }
            core::hint::spin_loop();
        }
    }

    /// Inserts `key`/`value` if `key` is not already present.
    ///
    /// Returns `true` if the insertion happened.
    pub fn emplace(&self, key: K, value: V) -> bool {
        let mut guard = S::guard();
        loop {
            let (bucket_ptr, pre_lock) = self.lock_bucket(&key, &mut guard);
            let bucket = unsafe { &*bucket_ptr };
            let item_count = BucketState::item_count(pre_lock) as usize;

            if unsafe { Self::find_in_locked(bucket, item_count, &key) }.is_some()
                || unsafe { Self::find_in_extension(bucket, &key) }.is_some()
            {
                bucket.state.unlock_unchanged(pre_lock, Ordering::Relaxed);
                return false;
            }

            if item_count < BUCKET_ITEMS {
                let slot = &bucket.slots[item_count];
                unsafe {
                    (*slot.key.get()).write(key);
                    (*slot.value.get()).write(value);
                }
                bucket.state.unlock_with_new_version(pre_lock, item_count as u32 + 1, 0);
                return true;
            }

            if Self::extension_len(bucket) < MAX_EXTENSION_CHAIN {
                let node = marked_ptr::alloc::<ExtItem<K, V>, 0>(ExtItem::new(key, value));
                let old_head = bucket.extension.load(Ordering::Relaxed);
                unsafe { &*node.ptr() }.next.store(old_head, Ordering::Relaxed);
                // the lock serializes writers, so this plain store is the only mutation in
                // flight; `Release` is what lets a lock-free reader's `Acquire` load observe
                // a fully built node
                bucket.extension.store(node, Ordering::Release);
                bucket.state.unlock_unchanged(pre_lock, Ordering::Release);
                return true;
            }

            // bucket and its extension chain are both full: release it untouched, grow the
            // map, then retry against the larger block
            self.grow(bucket, pre_lock, &mut guard);
        }
    }

    /// Returns a clone of the existing value for `key`, or inserts and
    /// returns the result of `make` if it is absent.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        let mut guard = S::guard();
        loop {
            let (bucket_ptr, pre_lock) = self.lock_bucket(&key, &mut guard);
            let bucket = unsafe { &*bucket_ptr };
            let item_count = BucketState::item_count(pre_lock) as usize;

            if let Some(i) = unsafe { Self::find_in_locked(bucket, item_count, &key) } {
                let existing = unsafe { (*bucket.slots[i].value.get()).assume_init_ref() }.clone();
                bucket.state.unlock_unchanged(pre_lock, Ordering::Relaxed);
                return existing;
            }
            if let Some(node) = unsafe { Self::find_in_extension(bucket, &key) } {
                let existing = unsafe { (*node.value.get()).assume_init_ref() }.clone();
                bucket.state.unlock_unchanged(pre_lock, Ordering::Relaxed);
                return existing;
            }

            let value = make();
            if item_count < BUCKET_ITEMS {
                let slot = &bucket.slots[item_count];
                unsafe {
                    (*slot.key.get()).write(key);
                    (*slot.value.get()).write(value.clone());
                }
                bucket.state.unlock_with_new_version(pre_lock, item_count as u32 + 1, 0);
                return value;
            }

            if Self::extension_len(bucket) < MAX_EXTENSION_CHAIN {
                let node = marked_ptr::alloc::<ExtItem<K, V>, 0>(ExtItem::new(key, value.clone()));
                let old_head = bucket.extension.load(Ordering::Relaxed);
                unsafe { &*node.ptr() }.next.store(old_head, Ordering::Relaxed);
                bucket.extension.store(node, Ordering::Release);
                bucket.state.unlock_unchanged(pre_lock, Ordering::Release);
                return value;
            }

            self.grow(bucket, pre_lock, &mut guard);
        }
    }

    /// Removes the entry produced by a prior [`iter`](Self::iter)/[`find`](Self::find)
    /// call, returning its value if it is still present.
    ///
    /// `iter`/`find` hand back an owned snapshot rather than a live cursor
    /// into the map (see their docs), so this is equivalent to
    /// `erase(&entry.0)`; it exists so callers that walked the map via
    /// `iter`/`find` can remove what they found without re-deriving the key
    /// type's borrowed form themselves.
    pub fn erase_entry(&self, entry: (K, V)) -> Option<V> {
        self.erase(&entry.0)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn erase(&self, key: &K) -> Option<V> {
        let mut guard = S::guard();
        let (bucket_ptr, pre_lock) = self.lock_bucket(key, &mut guard);
        let bucket = unsafe { &*bucket_ptr };
        let item_count = BucketState::item_count(pre_lock) as usize;

        if let Some(i) = unsafe { Self::find_in_locked(bucket, item_count, key) } {
            let removed = unsafe { (*bucket.slots[i].value.get()).assume_init_read() };
            unsafe { (*bucket.slots[i].key.get()).assume_init_drop() };

            let head = bucket.extension.load(Ordering::Relaxed);
            if !head.is_null() {
                // pull the extension chain's head into the gap, keeping the inline slots
                // packed without touching item_count
                bucket.state.mark_deleting(pre_lock, i);

                let node_ptr = head.ptr();
                let node = unsafe { &*node_ptr };
                let moved_key = unsafe { (*node.key.get()).assume_init_read() };
                let moved_value = unsafe { (*node.value.get()).assume_init_read() };
                unsafe {
                    (*bucket.slots[i].key.get()).write(moved_key);
                    (*bucket.slots[i].value.get()).write(moved_value);
                }

                bucket.extension.store(node.next.load(Ordering::Relaxed), Ordering::Relaxed);
                bucket.state.unlock_with_new_version(pre_lock, item_count as u32, 0);
                unsafe { guard.reclaim(NonNull::new_unchecked(node_ptr)) };
            } else if i != item_count - 1 {
                // no extension items to pull in: swap the last inline item down to fill
                // the gap and shrink item_count
                let last = item_count - 1;
                bucket.state.mark_deleting(pre_lock, i);

                let moved_key = unsafe { (*bucket.slots[last].key.get()).assume_init_read() };
                let moved_value = unsafe { (*bucket.slots[last].value.get()).assume_init_read() };
                unsafe {
                    (*bucket.slots[i].key.get()).write(moved_key);
                    (*bucket.slots[i].value.get()).write(moved_value);
                }
                bucket.state.unlock_with_new_version(pre_lock, item_count as u32 - 1, 0);
            } else {
                bucket.state.unlock_with_new_version(pre_lock, item_count as u32 - 1, 0);
            }

            return Some(removed);
        }

        let mut prev = &bucket.extension;
        let mut current = bucket.extension.load(Ordering::Relaxed);
        while !current.is_null() {
            let node = unsafe { &*current.ptr() };
            if node.occupied.load(Ordering::Relaxed) && unsafe { (*node.key.get()).assume_init_ref() } == key {
                let value = unsafe { (*node.value.get()).assume_init_read() };
                unsafe { (*node.key.get()).assume_init_drop() };
                node.occupied.store(false, Ordering::Relaxed);

                prev.store(node.next.load(Ordering::Relaxed), Ordering::Relaxed);
                bucket.state.unlock_with_new_version(pre_lock, item_count as u32, 0);
                unsafe { guard.reclaim(NonNull::new_unchecked(current.ptr())) };
                return Some(value);
            }
            prev = &node.next;
            current = node.next.load(Ordering::Relaxed);
        }

        bucket.state.unlock_unchanged(pre_lock, Ordering::Relaxed);
        None
    }

    /// Doubles the bucket count and migrates every live entry into the new
    /// block, unless another writer is already doing so (in which case this
    /// just waits for it).
    ///
    /// `bucket` must be the caller's just-full, still-locked bucket;
    /// `pre_lock_raw` the word `lock_bucket` observed before locking it.
    /// Mirrors `grow`/`do_grow` (lines 608-713 of the original): the bucket
    /// that triggered the grow is released with its own original,
    /// unbumped state word regardless of who wins the race for
    /// `resize_lock`, since whoever does grow relocks every old bucket from
    /// scratch anyway.
    fn grow(&self, bucket: &Bucket<K, V>, pre_lock_raw: u32, guard: &mut S::Guard) {
        let already_resizing = self.resize_lock.swap(true, Ordering::Relaxed);
        bucket.state.unlock_unchanged(pre_lock_raw, Ordering::Relaxed);

        if already_resizing {
            while self.resize_lock.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            return;
        }

        unsafe { self.do_grow(guard) };
    }

    /// # Safety
    ///
    /// Caller must hold `resize_lock`.
    unsafe fn do_grow(&self, guard: &mut S::Guard) {
        let old_ptr = self.data.load(Ordering::Acquire);
        let old_block = unsafe { &*old_ptr.ptr() };
        let new_block = Block::with_bucket_count((old_block.mask + 1) * 2);

        // lock every old bucket and never release it again: once the new block below is
        // published, `lock_bucket`'s per-retry reload means no writer will ever contend on
        // these buckets again, so there is nothing to unlock for
        for old_bucket in old_block.buckets.iter() {
            loop {
                let raw = old_bucket.state.read_relaxed();
                if !BucketState::is_locked(raw) && old_bucket.state.try_lock(raw) {
                    break;
                }
                core::hint::spin_loop();
            }
        }

        // migrate every entry; relaxed ordering throughout is fine since the new block
        // isn't published yet and every old bucket is locked and will stay that way
        for old_bucket in old_block.buckets.iter() {
            let item_count = BucketState::item_count(old_bucket.state.read_relaxed()) as usize;
            for slot in &old_bucket.slots[..item_count] {
                let key = unsafe { (*slot.key.get()).assume_init_read() };
                let value = unsafe { (*slot.value.get()).assume_init_read() };
                Self::rehash_insert(&new_block, key, value);
            }

            // extension nodes are read, not consumed: the old block stays fully intact
            // (any reader still scanning it via a stale guard sees exactly what it would
            // have before the grow) and is only freed once the old block itself is
            // reclaimed, via `Block::reclaim`'s migrated path
            let mut current = old_bucket.extension.load(Ordering::Relaxed);
            while !current.is_null() {
                let node = unsafe { &*current.ptr() };
                if node.occupied.load(Ordering::Relaxed) {
                    let key = unsafe { (*node.key.get()).assume_init_read() };
                    let value = unsafe { (*node.value.get()).assume_init_read() };
                    Self::rehash_insert(&new_block, key, value);
                }
                current = node.next.load(Ordering::Relaxed);
            }
        }

        old_block.migrated.store(true, Ordering::Relaxed);

        let new_ptr = marked_ptr::alloc::<Block<K, V>, 0>(new_block);
        // (31)-equivalent: synchronizes-with every `lock_bucket`/`try_get_value`
        // acquire-load of `data`
        self.data.store(new_ptr, Ordering::Release);
        self.resize_lock.store(false, Ordering::Release);

        unsafe { guard.reclaim(NonNull::new_unchecked(old_ptr.ptr())) };
    }

    /// Inserts `key`/`value` into `block` without locking: only called from
    /// `do_grow`, on a block no other thread can yet observe.
    fn rehash_insert(block: &Block<K, V>, key: K, value: V) {
        let bucket = &block.buckets[Self::hash_key(&key) & block.mask];
        let raw = bucket.state.read_relaxed();
        let item_count = BucketState::item_count(raw) as usize;

        if item_count < BUCKET_ITEMS {
            let slot = &bucket.slots[item_count];
            unsafe {
                (*slot.key.get()).write(key);
                (*slot.value.get()).write(value);
            }
            bucket.state.set_raw(BucketState::pack(item_count as u32 + 1, 0, BucketState::version(raw)), Ordering::Relaxed);
        } else {
            let node = marked_ptr::alloc::<ExtItem<K, V>, 0>(ExtItem::new(key, value));
            let old_head = bucket.extension.load(Ordering::Relaxed);
            unsafe { &*node.ptr() }.next.store(old_head, Ordering::Relaxed);
            bucket.extension.store(node, Ordering::Relaxed);
        }
    }
}

impl<K, V, S: Scheme> Drop for VyukovHashMap<K, V, S> {
    fn drop(&mut self) {
        let block_ptr = self.data.load(Ordering::Relaxed).ptr();
        if block_ptr.is_null() {
            return;
        }
        let mut block = unsafe { Box::from_raw(block_ptr) };
        for bucket in block.buckets.iter_mut() {
            bucket.drop_contents();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemes::{Ebr, Hp};
    use std::sync::Arc;
    use std::thread;

    fn insert_get_remove<S: Scheme>() {
        let map: VyukovHashMap<u32, u32, S> = VyukovHashMap::with_capacity(8);
        assert!(map.emplace(1, 100));
        assert!(!map.emplace(1, 200));
        assert_eq!(map.try_get_value(&1), Some(100));
        assert_eq!(map.try_get_value(&2), None);
        assert_eq!(map.erase(&1), Some(100));
        assert_eq!(map.try_get_value(&1), None);
        assert_eq!(map.erase(&1), None);
    }

    #[test]
    fn insert_get_remove_ebr() {
        insert_get_remove::<Ebr>();
    }

    #[test]
    fn insert_get_remove_hp() {
        insert_get_remove::<Hp>();
    }

    #[test]
    fn overflows_into_extension_chain_before_growing() {
        let map: VyukovHashMap<u32, u32, Ebr> = VyukovHashMap::with_capacity(8);
        for i in 0..(BUCKET_ITEMS + MAX_EXTENSION_CHAIN) as u32 {
            assert!(map.emplace(i, i * 10));
        }
        for i in 0..(BUCKET_ITEMS + MAX_EXTENSION_CHAIN) as u32 {
            assert_eq!(map.try_get_value(&i), Some(i * 10));
        }
    }

    #[test]
    fn grows_past_initial_capacity() {
        let map: VyukovHashMap<u32, u32, Ebr> = VyukovHashMap::with_capacity(1);
        for i in 0..64u32 {
            assert!(map.emplace(i, i * 10));
        }
        for i in 0..64u32 {
            assert_eq!(map.try_get_value(&i), Some(i * 10));
        }
        for i in 0..64u32 {
            assert_eq!(map.erase(&i), Some(i * 10));
        }
        for i in 0..64u32 {
            assert_eq!(map.try_get_value(&i), None);
        }
    }

    #[test]
    fn grows_to_fit_two_hundred_keys_from_eight_buckets() {
        let map: VyukovHashMap<u32, u32, Ebr> = VyukovHashMap::with_capacity(8);
        for i in 0..200u32 {
            assert!(map.emplace(i, i));
        }
        for i in 0..200u32 {
            assert_eq!(map.try_get_value(&i), Some(i));
        }
    }

    #[test]
    fn get_or_insert_with_only_runs_once() {
        let map: VyukovHashMap<u32, u32, Ebr> = VyukovHashMap::with_capacity(8);
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let a = map.get_or_insert_with(1, || {
            calls.fetch_add(1, Ordering::Relaxed);
            42
        });
        let b = map.get_or_insert_with(1, || {
            calls.fetch_add(1, Ordering::Relaxed);
            99
        });
        assert_eq!(a, 42);
        assert_eq!(b, 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn concurrent_insert_distinct_keys() {
        let map = Arc::new(VyukovHashMap::<u32, u32, Ebr>::with_capacity(64));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..200u32 {
                        map.emplace(t * 200 + i, i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for t in 0..4u32 {
            for i in 0..200u32 {
                assert_eq!(map.try_get_value(&(t * 200 + i)), Some(i));
            }
        }
    }

    #[test]
    fn iter_and_find_see_every_entry() {
        let map: VyukovHashMap<u32, u32, Ebr> = VyukovHashMap::with_capacity(4);
        for i in 0..40u32 {
            map.emplace(i, i * 2);
        }

        let mut seen: Vec<_> = map.iter().collect();
        seen.sort_unstable();
        let expected: Vec<_> = (0..40u32).map(|i| (i, i * 2)).collect();
        assert_eq!(seen, expected);

        assert_eq!(map.find(|_, v| *v == 16), Some((8, 16)));
        assert_eq!(map.find(|_, v| *v == 1_000), None);

        let entry = map.find(|_, v| *v == 16).unwrap();
        assert_eq!(map.erase_entry(entry), Some(16));
        assert_eq!(map.try_get_value(&8), None);
    }

    /// Mirrors a reference `std::collections::HashMap` against random
    /// insert/remove/get traffic restricted to a small key space, so
    /// overflow into the extension chain, growth and repeated slot reuse
    /// all get exercised.
    #[test]
    fn matches_reference_map_under_random_traffic() {
        use rand::Rng;
        use std::collections::HashMap;

        let map: VyukovHashMap<u32, u32, Ebr> = VyukovHashMap::with_capacity(4);
        let mut reference: HashMap<u32, u32> = HashMap::new();
        let mut rng = rand::thread_rng();

        for step in 0..2_000u32 {
            let key = rng.gen_range(0, 16);
            match rng.gen_range(0, 3) {
                0 => {
                    let inserted = map.emplace(key, step);
                    assert_eq!(inserted, !reference.contains_key(&key));
                    reference.entry(key).or_insert(step);
                }
                1 => {
                    assert_eq!(map.erase(&key), reference.remove(&key));
                }
                _ => {
                    assert_eq!(map.try_get_value(&key), reference.get(&key).copied());
                }
            }
        }
    }

    #[test]
    fn values_with_destructors_drop_exactly_once_on_grow_and_drop() {
        use std::sync::atomic::AtomicUsize;

        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted(#[allow(dead_code)] u32);
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let map: VyukovHashMap<u32, Counted, Ebr> = VyukovHashMap::with_capacity(1);
            for i in 0..64u32 {
                assert!(map.emplace(i, Counted(i)));
            }
            for i in 0..32u32 {
                drop(map.erase(&i));
            }
            assert_eq!(DROPS.load(Ordering::Relaxed), 32);
        }
        assert_eq!(DROPS.load(Ordering::Relaxed), 64);
    }
}
