use lockfree::{Atomic, MarkedPtr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

#[repr(align(8))]
struct Aligned(u64);

#[test]
fn tag_survives_concurrent_cas_races() {
    let boxed = Box::into_raw(Box::new(Aligned(0)));
    let atomic = Arc::new(Atomic::<Aligned, 3>::from_marked_ptr(MarkedPtr::new(boxed, 0)));

    let handles: Vec<_> = (1..=7u8)
        .map(|tag| {
            let atomic = Arc::clone(&atomic);
            thread::spawn(move || loop {
                let current = atomic.load(Ordering::Acquire);
                let replacement = current.with_tag(tag as usize);
                if atomic.compare_exchange(current, replacement, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                    break;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let final_value = atomic.load(Ordering::Acquire);
    assert_eq!(final_value.ptr(), boxed);
    assert!((1..=7).contains(&final_value.tag()));

    unsafe { drop(Box::from_raw(boxed)) };
}

#[test]
fn null_marked_ptr_round_trips_through_atomic() {
    let atomic = Atomic::<Aligned, 2>::null();
    let loaded = atomic.load(Ordering::Acquire);
    assert!(loaded.is_null());
    assert_eq!(loaded.tag(), 0);

    let boxed = Box::into_raw(Box::new(Aligned(9)));
    let marked = MarkedPtr::new(boxed, 1);
    atomic.store(marked, Ordering::Release);

    let loaded = atomic.load(Ordering::Acquire);
    assert_eq!(loaded.ptr(), boxed);
    assert_eq!(loaded.tag(), 1);

    unsafe { drop(Box::from_raw(boxed)) };
}
