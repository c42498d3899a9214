//! An unbounded, intrusive, lock-free multi-producer multi-consumer queue.
//!
//! Direct translation of the classic Michael & Scott two-lock-free-CAS
//! queue algorithm, generalized from the fixed-ownership-scheme original in
//! `examples/original_source/xenium/michael_scott_queue.hpp` to work with
//! any of this crate's three reclamation schemes via the [`Scheme`]
//! abstraction. The synchronizes-with relationships below carry the same
//! numbering as the original header so the two can be read side by side.

use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::marked_ptr::{self, Atomic, MarkedPtr};
use crate::reclaim::{Guard, Reclaimable, Scheme};

struct Node<T> {
    value: MaybeUninit<T>,
    next: Atomic<Node<T>, 0>,
}

unsafe impl<T> Reclaimable for Node<T> {}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self { value: MaybeUninit::uninit(), next: Atomic::null() }
    }

    fn with_value(value: T) -> Self {
        Self { value: MaybeUninit::new(value), next: Atomic::null() }
    }
}

/// An unbounded FIFO queue backed by the Michael & Scott algorithm.
///
/// `S` selects which of this crate's reclamation schemes ([`crate::schemes::Ebr`],
/// [`crate::schemes::Hp`] or [`crate::schemes::He`]) protects nodes while
/// they are concurrently dequeued and retired.
pub struct MichaelScottQueue<T, S: Scheme> {
    head: Atomic<Node<T>, 0>,
    tail: Atomic<Node<T>, 0>,
    _scheme: core::marker::PhantomData<S>,
}

unsafe impl<T: Send, S: Scheme> Send for MichaelScottQueue<T, S> {}
unsafe impl<T: Send, S: Scheme> Sync for MichaelScottQueue<T, S> {}

impl<T, S: Scheme> Default for MichaelScottQueue<T, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S: Scheme> MichaelScottQueue<T, S> {
    /// Creates a new, empty queue.
    pub fn new() -> Self {
        let sentinel = marked_ptr::alloc::<Node<T>, 0>(Node::sentinel());
        Self {
            head: Atomic::from_marked_ptr(sentinel),
            tail: Atomic::from_marked_ptr(sentinel),
            _scheme: core::marker::PhantomData,
        }
    }

    /// Appends `value` to the back of the queue.
    pub fn push(&self, value: T) {
        let new_node: MarkedPtr<Node<T>, 0> = marked_ptr::alloc(Node::with_value(value));
        let mut guard = S::guard();

        loop {
            // (1) acquire the tail we will try to extend
            let tail = guard.acquire(&self.tail, Ordering::Acquire);
            let tail_ref = unsafe { &*tail.ptr() };
            // (2) relaxed here is sound: only a successful CAS on `next` below publishes
            // anything, and we re-read with Acquire via the guard on every retry
            let next = tail_ref.next.load(Ordering::Acquire);

            if next.is_null() {
                // (3) tail really is the last node: try to link the new node after it
                if tail_ref
                    .next
                    .compare_exchange(next, new_node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    // (4) best-effort: advance tail; if this CAS loses, the next pusher (or a
                    // popper) will finish the swing for us
                    let _ = self.tail.compare_exchange(tail, new_node, Ordering::Release, Ordering::Relaxed);
                    return;
                }
            } else {
                // (5) tail is lagging behind; help swing it forward before retrying
                let _ = self.tail.compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
        }
    }

    /// Removes and returns the value at the front of the queue, or `None`
    /// if it is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut head_guard = S::guard();
        let mut next_guard = S::guard();

        loop {
            // (6) acquire head and the tail snapshot used to detect the "queue may be empty
            // or lagging" case
            let head = head_guard.acquire(&self.head, Ordering::Acquire);
            let head_ref = unsafe { &*head.ptr() };
            let tail = self.tail.load(Ordering::Acquire);
            let next = next_guard.acquire(&head_ref.next, Ordering::Acquire);

            // (7) re-validate head is still current before acting on `next`; otherwise head
            // may already have been retired by a concurrent popper
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head.ptr() == tail.ptr() {
                if next.is_null() {
                    return None;
                }
                // (8) tail lags one behind head.next; help swing it forward and retry
                let _ = self.tail.compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                continue;
            }

            let next_ref = unsafe { &*next.ptr() };
            // (9) tentatively take the value out of `next` before knowing whether this
            // thread wins the race to dequeue it; on failure the value is forgotten, not
            // dropped, since it logically still belongs to whichever thread does win
            let value = unsafe { next_ref.value.as_ptr().read() };

            match self.head.compare_exchange(head, next, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => {
                    // (10) `head` (the old sentinel) is now unreachable; `next` becomes the
                    // new sentinel and its `value` slot is considered moved-out (never
                    // dropped, since `MaybeUninit` does not drop on its own)
                    unsafe { S::retire(NonNull::new_unchecked(head.ptr())) };
                    return Some(value);
                }
                Err(_) => {
                    core::mem::forget(value);
                }
            }
        }
    }

    /// Returns `true` if the queue currently has no elements.
    ///
    /// This is inherently racy under concurrent access and is meant for
    /// diagnostics, not as a synchronization primitive.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let head_ref = unsafe { &*head.ptr() };
        head_ref.next.load(Ordering::Acquire).is_null()
    }
}

impl<T, S: Scheme> Drop for MichaelScottQueue<T, S> {
    fn drop(&mut self) {
        let mut curr = self.head.load(Ordering::Relaxed).ptr();
        // the sentinel's `value` is never initialized; every subsequent node's value was
        // already moved out by `pop`, so dropping the boxed nodes never double-drops `T`
        while !curr.is_null() {
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next.load(Ordering::Relaxed).ptr();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemes::{Ebr, He, Hp};
    use std::sync::Arc;
    use std::thread;

    fn push_pop_fifo_order<S: Scheme>() {
        let queue: MichaelScottQueue<u32, S> = MichaelScottQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);

        for i in 0..100 {
            queue.push(i);
        }
        assert!(!queue.is_empty());

        for i in 0..100 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn fifo_order_ebr() {
        push_pop_fifo_order::<Ebr>();
    }

    #[test]
    fn fifo_order_hp() {
        push_pop_fifo_order::<Hp>();
    }

    #[test]
    fn fifo_order_he() {
        push_pop_fifo_order::<He>();
    }

    fn concurrent_push_pop<S: Scheme + Send + Sync + 'static>() {
        let queue = Arc::new(MichaelScottQueue::<u32, S>::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..1_000u32 {
                        queue.push(t * 1_000 + i);
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let mut popped = 0;
        while queue.try_pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 4 * 1_000);
    }

    #[test]
    fn concurrent_push_pop_ebr() {
        concurrent_push_pop::<Ebr>();
    }

    #[test]
    fn concurrent_push_pop_hp() {
        concurrent_push_pop::<Hp>();
    }

    #[test]
    fn values_with_destructors_drop_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};

        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, O::Relaxed);
            }
        }

        let queue: MichaelScottQueue<Counted, Ebr> = MichaelScottQueue::new();
        for _ in 0..10 {
            queue.push(Counted);
        }
        for _ in 0..5 {
            queue.try_pop().unwrap();
        }
        assert_eq!(DROPS.load(O::Relaxed), 5);
        drop(queue);
        assert_eq!(DROPS.load(O::Relaxed), 10);
    }
}
