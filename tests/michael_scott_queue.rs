use lockfree::queue::MichaelScottQueue;
use lockfree::{Ebr, He, Hp};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn single_threaded_fifo_order() {
    let queue: MichaelScottQueue<i32, Ebr> = MichaelScottQueue::new();
    assert_eq!(queue.try_pop(), None);

    for i in 0..50 {
        queue.push(i);
    }
    for i in 0..50 {
        assert_eq!(queue.try_pop(), Some(i));
    }
    assert_eq!(queue.try_pop(), None);
}

fn concurrent_producers_single_consumer<S: lockfree::Scheme + Send + Sync + 'static>() {
    const PRODUCERS: u32 = 6;
    const PER_PRODUCER: u32 = 2_000;

    let queue = Arc::new(MichaelScottQueue::<u32, S>::new());
    let barrier = Arc::new(Barrier::new(PRODUCERS as usize + 1));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|t| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_PRODUCER {
                    queue.push(t * PER_PRODUCER + i);
                }
            })
        })
        .collect();

    barrier.wait();
    let mut seen = HashSet::new();
    let mut popped = 0u32;
    while popped < PRODUCERS * PER_PRODUCER {
        if let Some(value) = queue.try_pop() {
            assert!(seen.insert(value), "value {value} observed twice");
            popped += 1;
        }
    }

    for handle in producers {
        handle.join().unwrap();
    }
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn concurrent_producers_single_consumer_ebr() {
    concurrent_producers_single_consumer::<Ebr>();
}

#[test]
fn concurrent_producers_single_consumer_hp() {
    concurrent_producers_single_consumer::<Hp>();
}

#[test]
fn concurrent_producers_single_consumer_he() {
    concurrent_producers_single_consumer::<He>();
}

#[test]
fn every_pushed_value_is_dropped_exactly_once() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Counted;
    impl Drop for Counted {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    let queue: MichaelScottQueue<Counted, Ebr> = MichaelScottQueue::new();
    for _ in 0..20 {
        queue.push(Counted);
    }
    for _ in 0..8 {
        queue.try_pop().unwrap();
    }
    assert_eq!(DROPS.load(Ordering::Relaxed), 8);
    drop(queue);
    assert_eq!(DROPS.load(Ordering::Relaxed), 20);
}
