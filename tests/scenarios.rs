//! Crate-level scenario tests (S1-S6), exercised purely through the
//! public `CollectedSpace` API, the way an embedding VM would.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracegc::policy::CollectedSpace;
use tracegc::util::options::{CollectedSpaceConfig, GcWorkerSpec};
use tracegc::util::vaddr::NULL_VADDR;

fn small_cs() -> CollectedSpace {
    CollectedSpace::new(CollectedSpaceConfig { table_cap: 32, default_block_bytes: 1000, seed: 0xA5A5_A5A5 })
}

/// S1: a rooted object survives collection; derooting it lets the next
/// collection reclaim it.
#[test]
fn s1_basic_lifecycle() {
    let cs = small_cs();
    let r = cs.malloc_root(1, 0).unwrap();
    let v = cs.malloc_object(0, 8).unwrap();
    cs.get_write_ind(v).data_mut()[0] = 0x42;

    let root_v = cs.get_root_vaddr(r).unwrap();
    cs.get_write_ind(root_v).set_rt(0, v);

    cs.collect_garbage();
    assert!(cs.allocated(v));
    assert_eq!(cs.get_read_ind(v).data()[0], 0x42);

    cs.get_write_ind(root_v).set_rt(0, NULL_VADDR);
    cs.collect_garbage();
    assert!(!cs.allocated(v));
}

/// S2: a reference cycle with no path from any root is fully reclaimed.
#[test]
fn s2_cycle_reclamation() {
    let cs = small_cs();
    let a = cs.malloc_object(1, 0).unwrap();
    let b = cs.malloc_object(1, 0).unwrap();
    cs.get_write_ind(a).set_rt(0, b);
    cs.get_write_ind(b).set_rt(0, a);

    cs.collect_garbage();
    assert!(!cs.allocated(a));
    assert!(!cs.allocated(b));
}

/// S3: shifting a block to a fixed point preserves surviving objects'
/// contents and reclaims exactly the freed space.
#[test]
fn s3_shift_preserves_contents() {
    let cs = small_cs();
    let root = cs.malloc_root(6, 0).unwrap();
    let root_v = cs.get_root_vaddr(root).unwrap();

    let sizes = [16usize, 24, 32, 16, 24, 32];
    let mut vaddrs = Vec::new();
    for (i, &sz) in sizes.iter().enumerate() {
        let v = cs.malloc_object(0, sz).unwrap();
        cs.get_write_ind(v).data_mut().fill((i + 1) as u8);
        cs.get_write_ind(root_v).set_rt(i, v);
        vaddrs.push(v);
    }

    // Unroot the 1st, 3rd, 5th (0-indexed 0, 2, 4) and collect so they are
    // physically freed, then compact.
    for &i in &[0usize, 2, 4] {
        cs.null_reference(root_v, i).unwrap();
    }
    cs.collect_garbage();
    cs.try_full_shift();

    for &i in &[1usize, 3, 5] {
        let v = vaddrs[i];
        assert!(cs.allocated(v));
        let view = cs.get_read_ind(v);
        assert!(view.data().iter().all(|&b| b == (i + 1) as u8), "object {i} corrupted after shift");
    }
    for &i in &[0usize, 2, 4] {
        assert!(!cs.allocated(vaddrs[i]));
    }
}

/// S4: derooted ids are reused by subsequent `malloc_root` calls.
#[test]
fn s4_root_free_list_reuse() {
    let cs = small_cs();
    let ids: Vec<usize> = (0..8).map(|_| cs.malloc_root(1, 0).unwrap()).collect();
    for &i in &[0usize, 2, 4, 6] {
        cs.deroot(ids[i]).unwrap();
    }
    cs.collect_garbage();

    let mut reused: Vec<usize> = (0..4).map(|_| cs.malloc_root(1, 0).unwrap()).collect();
    reused.sort_unstable();
    let mut expected = vec![ids[0], ids[2], ids[4], ids[6]];
    expected.sort_unstable();
    assert_eq!(reused, expected);
}

/// S5: 20 threads each performing 50 allocations into a shared
/// `CollectedSpace` all succeed and remain allocated.
#[test]
fn s5_concurrent_allocations() {
    let cs = Arc::new(small_cs());
    let mut handles = Vec::new();
    for _ in 0..20 {
        let cs = cs.clone();
        handles.push(thread::spawn(move || {
            let mut vaddrs = Vec::with_capacity(50);
            for _ in 0..50 {
                vaddrs.push(cs.malloc_object(4, 64).unwrap());
            }
            vaddrs
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    assert_eq!(all.len(), 1000);
    assert_eq!(cs.ms_count(), 1000);
    for v in all {
        assert!(cs.allocated(v));
    }
}

/// S6: a thread holding a write lock on an object does not deadlock a
/// concurrent `try_full_shift`; the shifter reports `BUSY`/makes bounded
/// progress and returns promptly.
#[test]
fn s6_shift_contention_does_not_deadlock() {
    let cs = Arc::new(small_cs());
    let held = cs.malloc_object(0, 16).unwrap();
    let other = cs.malloc_object(0, 16).unwrap();
    // Free `other` so there is something to shift into, while `held`
    // stays allocated and locked for the duration of this test.
    let root = cs.malloc_root(1, 0).unwrap();
    let root_v = cs.get_root_vaddr(root).unwrap();
    cs.get_write_ind(root_v).set_rt(0, held);
    cs.collect_garbage(); // reclaims `other`, leaves `held` live

    let guard = cs.get_write_ind(held);

    let cs2 = cs.clone();
    let shifter = thread::spawn(move || {
        cs2.try_full_shift();
    });
    // The shifter must return within a bounded time even though `held`'s
    // cell lock is held by this thread the whole time.
    shifter.join().unwrap();

    drop(guard);
    assert!(cs.allocated(held));
    assert!(!cs.allocated(other));
}

/// The background GC worker reclaims unreachable objects without the
/// mutator ever calling `collect_garbage` itself.
#[test]
fn background_worker_reclaims_garbage() {
    let cs = Arc::new(small_cs());
    let root = cs.malloc_root(1, 0).unwrap();
    let root_v = cs.get_root_vaddr(root).unwrap();
    let v = cs.malloc_object(0, 8).unwrap();
    cs.get_write_ind(root_v).set_rt(0, v);
    cs.get_write_ind(root_v).set_rt(0, NULL_VADDR);

    cs.start_gc(GcWorkerSpec { delay: Duration::from_millis(5), shift: true, shift_trigger: 0 });
    let mut waited = Duration::ZERO;
    while cs.allocated(v) && waited < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    cs.stop_gc();
    assert!(!cs.allocated(v));
}
