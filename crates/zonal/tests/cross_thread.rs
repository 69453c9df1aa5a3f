//! Cross-Thread Free Tests
//!
//! A non-owner thread freeing a slot must set the region's notified
//! bitmap and enqueue the region on the owner exactly once; the owner
//! observes the slots as free after its next drain.

mod common;

use common::setup;
use std::sync::{Arc, Barrier};
use std::thread;
use zonal::objects::region::ObjectRegion;
use zonal::space::{region_layout, space};

/// Regions covering a batch of slab pointers.
fn regions_of(ptrs: &[*mut u8]) -> Vec<ObjectRegion> {
    let mut bases: Vec<usize> = ptrs
        .iter()
        .map(|&ptr| {
            let location = space().resolve(ptr as usize).unwrap();
            assert!(region_layout::is_object(location.layout()));
            location.region_base()
        })
        .collect();
    bases.sort_unstable();
    bases.dedup();
    bases
        .into_iter()
        .map(|base| unsafe { ObjectRegion::from_base(base) })
        .collect()
}

#[test]
fn test_cross_thread_free_observed_after_drain() {
    setup();
    zonal::attach_current_thread();

    // Owner thread allocates a couple of thousand small slots.
    const COUNT: usize = 2000;
    let ptrs: Vec<*mut u8> = (0..COUNT).map(|_| zonal::malloc(48)).collect();
    assert!(ptrs.iter().all(|ptr| !ptr.is_null()));
    let regions = regions_of(&ptrs);

    // A foreign thread frees every one of them.
    let addresses: Vec<usize> = ptrs.iter().map(|&ptr| ptr as usize).collect();
    thread::spawn(move || {
        for address in addresses {
            unsafe { zonal::free(address as *mut u8) };
        }
    })
    .join()
    .unwrap();

    // Every slot reads as free once pending notifications are counted.
    for region in &regions {
        assert!(
            region.is_empty(),
            "region {:#x} still has live slots",
            region.base()
        );
        assert!(region.notified_count() > 0);
    }

    // The owner's drain reconciles the bitmaps.
    zonal::flush_cache();
    assert!(space().validate_state().is_ok());

    zonal::detach_current_thread();
}

#[test]
fn test_used_plus_notified_is_conserved() {
    setup();
    zonal::attach_current_thread();

    let ptrs: Vec<*mut u8> = (0..64).map(|_| zonal::malloc(1024)).collect();
    let regions = regions_of(&ptrs);

    // Free half from a foreign thread, keep half live.
    let foreign: Vec<usize> = ptrs
        .iter()
        .step_by(2)
        .map(|&ptr| ptr as usize)
        .collect();
    thread::spawn(move || {
        for address in foreign {
            unsafe { zonal::free(address as *mut u8) };
        }
    })
    .join()
    .unwrap();

    for region in &regions {
        let used = region.used_map().count_ones();
        let notified = region.notified_map().count_ones();
        let capacity = region.infos().object_count as u32;
        // Notified slots still hold their used bit until the drain.
        assert!(notified <= used);
        assert!(used <= capacity);
    }

    for (index, &ptr) in ptrs.iter().enumerate() {
        if index % 2 == 1 {
            unsafe { zonal::free(ptr) };
        }
    }
    zonal::flush_cache();
    zonal::detach_current_thread();
}

#[test]
fn test_concurrent_malloc_free_stress() {
    setup();

    const THREADS: usize = 4;
    const ROUNDS: usize = 300;
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for lane in 0..THREADS {
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            zonal::attach_current_thread();
            barrier.wait();
            let sizes = [16usize, 48, 200, 1500, 9000];
            let mut live: Vec<*mut u8> = Vec::new();
            for round in 0..ROUNDS {
                let size = sizes[(round + lane) % sizes.len()];
                let ptr = zonal::malloc(size);
                assert!(!ptr.is_null());
                unsafe { *ptr = lane as u8 };
                live.push(ptr);
                if live.len() > 32 {
                    // Free an old pointer, not necessarily our newest.
                    let victim = live.remove((round * 7) % live.len());
                    unsafe { zonal::free(victim) };
                }
            }
            for ptr in live {
                unsafe { zonal::free(ptr) };
            }
            zonal::flush_cache();
            zonal::detach_current_thread();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(space().validate_state().is_ok());
}

#[test]
fn test_detached_context_owns_nothing() {
    setup();

    // A cleanly detached context gives everything up; the space-level
    // bookkeeping stays consistent afterwards.
    let handle = thread::spawn(|| {
        zonal::attach_current_thread();
        let ptrs: Vec<*mut u8> = (0..500).map(|_| zonal::malloc(96)).collect();
        for &ptr in &ptrs {
            unsafe { zonal::free(ptr) };
        }
        zonal::detach_current_thread();
    });
    handle.join().unwrap();

    assert!(space().validate_state().is_ok());
}

#[test]
fn test_producer_consumer_handoff() {
    setup();

    // One producer allocates, one consumer frees, through a channel.
    let (sender, receiver) = std::sync::mpsc::channel::<usize>();

    let producer = thread::spawn(move || {
        zonal::attach_current_thread();
        for index in 0..1000usize {
            let ptr = zonal::malloc(128);
            assert!(!ptr.is_null());
            unsafe { *(ptr as *mut usize) = index };
            sender.send(ptr as usize).unwrap();
        }
        zonal::flush_cache();
        zonal::detach_current_thread();
    });

    let consumer = thread::spawn(move || {
        zonal::attach_current_thread();
        let mut expected = 0usize;
        while let Ok(address) = receiver.recv() {
            assert_eq!(unsafe { *(address as *const usize) }, expected);
            expected += 1;
            unsafe { zonal::free(address as *mut u8) };
        }
        assert_eq!(expected, 1000);
        zonal::detach_current_thread();
    });

    producer.join().unwrap();
    consumer.join().unwrap();
    assert!(space().validate_state().is_ok());
}
