//! End-to-end behavior of anonymous objects and copy-on-write clones

use std::sync::{Arc, Mutex};
use std::thread;

use env_logger::{Builder, Env};
use mach_vmo::{
    stats, zero_page, CreateOptions, FaultFlags, LookupAction, PageArena, RangeChangeListener,
    VmContext, VmError, VmObject, PAGE_SIZE,
};

const PG: u64 = PAGE_SIZE as u64;

fn init_logging() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

fn setup(pages: usize) -> (Arc<VmContext>, Arc<PageArena>) {
    init_logging();
    let arena = PageArena::new(pages).unwrap();
    (VmContext::new(arena.clone()), arena)
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(u64, u64)>>);

impl Recorder {
    fn take(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl RangeChangeListener for Recorder {
    fn range_change_update(&self, offset: u64, len: u64) {
        self.0.lock().unwrap().push((offset, len));
    }
}

fn read_vec(vmo: &VmObject, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    vmo.read(&mut buf, offset).unwrap();
    buf
}

#[test]
fn three_page_object_lifecycle() {
    let (ctx, arena) = setup(16);
    let vmo = VmObject::create(&ctx, CreateOptions::RESIZABLE, 3 * PG).unwrap();

    vmo.write(b"head", 0).unwrap();
    vmo.write(b"tail", 3 * PG - 4).unwrap();
    assert_eq!(vmo.allocated_pages(), 2);
    assert_eq!(vmo.allocated_pages_in_range(PG, PG), 0);

    // The middle page reads as zeros without being allocated
    assert_eq!(read_vec(&vmo, PG, 16), vec![0; 16]);
    assert_eq!(vmo.allocated_pages(), 2);
    assert_eq!(arena.free_count(), 14);

    assert_eq!(read_vec(&vmo, 0, 4), b"head");
    assert_eq!(read_vec(&vmo, 3 * PG - 4, 4), b"tail");

    vmo.resize(PG).unwrap();
    assert_eq!(vmo.allocated_pages(), 1);
    assert_eq!(vmo.read(&mut [0; 4], 3 * PG - 4).unwrap_err(), VmError::OutOfRange);

    vmo.resize(3 * PG).unwrap();
    assert_eq!(read_vec(&vmo, 3 * PG - 4, 4), vec![0; 4]);

    drop(vmo);
    assert_eq!(arena.free_count(), 16);
}

#[test]
fn clone_is_isolated_both_ways() {
    let (ctx, arena) = setup(16);
    let parent = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();
    parent.write(b"parent-0", 0).unwrap();
    parent.write(b"parent-1", PG).unwrap();

    let child = parent.clone_cow(0, 2 * PG, false, false).unwrap();
    assert_eq!(read_vec(&child, PG, 8), b"parent-1");

    child.write(b"child-00", 0).unwrap();
    assert_eq!(read_vec(&parent, 0, 8), b"parent-0");
    assert_eq!(read_vec(&child, 0, 8), b"child-00");
    assert_eq!(child.allocated_pages(), 1);

    // A parent write after the split is invisible to the child's copy
    parent.write(b"PARENT-0", 0).unwrap();
    assert_eq!(read_vec(&child, 0, 8), b"child-00");

    // Until the child drops its copy
    child.decommit_range(0, PG).unwrap();
    assert_eq!(read_vec(&child, 0, 8), b"PARENT-0");

    drop(child);
    assert_eq!(parent.num_children(), 0);
    drop(parent);
    assert_eq!(arena.free_count(), 16);
}

#[test]
fn clone_outlives_parent_handle() {
    let (ctx, arena) = setup(8);
    let parent = VmObject::create(&ctx, CreateOptions::empty(), PG).unwrap();
    parent.write(b"kept", 0).unwrap();
    let child = parent.clone_cow(0, PG, true, false).unwrap();
    drop(parent);

    assert_eq!(read_vec(&child, 0, 4), b"kept");
    drop(child);
    assert_eq!(arena.free_count(), 8);
}

#[test]
fn range_changes_reach_grandchildren() {
    let (ctx, _arena) = setup(16);
    let parent = VmObject::create(&ctx, CreateOptions::empty(), 4 * PG).unwrap();
    let child = parent.clone_cow(PG, 2 * PG, false, false).unwrap();
    let grandchild = child.clone_cow(PG, PG, false, false).unwrap();

    let parent_map = Arc::new(Recorder::default());
    let child_map = Arc::new(Recorder::default());
    let grandchild_map = Arc::new(Recorder::default());
    parent.add_mapping(parent_map.clone());
    child.add_mapping(child_map.clone());
    grandchild.add_mapping(grandchild_map.clone());

    parent.write(&[1], 2 * PG).unwrap();
    assert_eq!(parent_map.take(), vec![(2 * PG, PG)]);
    assert_eq!(child_map.take(), vec![(PG, PG)]);
    assert_eq!(grandchild_map.take(), vec![(0, PG)]);

    // Outside every clone window
    parent.write(&[1], 0).unwrap();
    assert_eq!(parent_map.take(), vec![(0, PG)]);
    assert!(child_map.take().is_empty());
    assert!(grandchild_map.take().is_empty());

    // Child's own write does not travel up
    child.write(&[2], 0).unwrap();
    assert!(parent_map.take().is_empty());
    assert_eq!(child_map.take(), vec![(0, PG)]);
    assert!(grandchild_map.take().is_empty());
}

#[test]
fn holes_share_the_zero_page() {
    let (ctx, arena) = setup(4);
    let a = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();
    let b = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();

    let mut addrs = Vec::new();
    for vmo in [&a, &b] {
        vmo.lookup(0, 2 * PG, |_, _, pa| {
            addrs.push(pa);
            Ok(LookupAction::Next)
        })
        .unwrap();
    }
    assert!(addrs.iter().all(|&pa| pa == zero_page().phys_addr()));
    assert_eq!(arena.free_count(), 4);
}

#[test]
fn pin_and_unpin_balance() {
    let (ctx, arena) = setup(8);
    let vmo = VmObject::create(&ctx, CreateOptions::RESIZABLE, 4 * PG).unwrap();
    vmo.commit_range(0, 4 * PG).unwrap();

    vmo.pin(0, 2 * PG).unwrap();
    vmo.pin(PG, 2 * PG).unwrap();
    assert_eq!(vmo.resize(2 * PG).unwrap_err(), VmError::BadState);

    vmo.unpin(PG, 2 * PG);
    vmo.resize(2 * PG).unwrap();
    assert_eq!(vmo.decommit_range(0, 2 * PG).unwrap_err(), VmError::BadState);

    vmo.unpin(0, 2 * PG);
    let page = vmo.get_page(PG, FaultFlags::empty(), None).unwrap();
    assert_eq!(page.pin_count(), 0);
    drop(page);

    vmo.decommit_range(0, 2 * PG).unwrap();
    assert_eq!(arena.free_count(), 8);
}

#[test]
fn concurrent_writers_fault_disjoint_pages() {
    let (ctx, arena) = setup(64);
    let vmo = VmObject::create(&ctx, CreateOptions::empty(), 16 * PG).unwrap();
    let before = stats().snapshot();

    thread::scope(|s| {
        for t in 0..4u64 {
            let vmo = &vmo;
            s.spawn(move || {
                for i in 0..4 {
                    let offset = (t * 4 + i) * PG + 8;
                    vmo.write(&[t as u8 + 1; 32], offset).unwrap();
                }
            });
        }
        s.spawn(|| {
            let mut buf = [0u8; 32];
            for i in 0..16 {
                vmo.read(&mut buf, i * PG).unwrap();
            }
        });
    });

    assert_eq!(vmo.allocated_pages(), 16);
    for t in 0..4u64 {
        for i in 0..4 {
            let offset = (t * 4 + i) * PG + 8;
            assert_eq!(read_vec(&vmo, offset, 32), vec![t as u8 + 1; 32]);
        }
    }
    assert!(stats().snapshot().zero_fill >= before.zero_fill + 16);

    drop(vmo);
    assert_eq!(arena.free_count(), 64);
}

#[test]
fn concurrent_clone_writers_stay_private() {
    let (ctx, arena) = setup(64);
    let parent = VmObject::create(&ctx, CreateOptions::empty(), 4 * PG).unwrap();
    parent.write(&[0xee; 64], 0).unwrap();

    let clones: Vec<_> = (0..4)
        .map(|_| parent.clone_cow(0, 4 * PG, false, false).unwrap())
        .collect();

    thread::scope(|s| {
        for (n, clone) in clones.iter().enumerate() {
            s.spawn(move || {
                clone.write(&[n as u8; 64], 0).unwrap();
                clone.commit_range(0, 4 * PG).unwrap();
            });
        }
    });

    for (n, clone) in clones.iter().enumerate() {
        assert_eq!(read_vec(clone, 0, 64), vec![n as u8; 64]);
        assert_eq!(clone.allocated_pages(), 4);
    }
    assert_eq!(read_vec(&parent, 0, 64), vec![0xee; 64]);

    drop(clones);
    drop(parent);
    assert_eq!(arena.free_count(), 64);
}

#[test]
fn commit_and_shrink_scenario() {
    let (ctx, _arena) = setup(16);
    let vmo = VmObject::create(&ctx, CreateOptions::RESIZABLE, 12288).unwrap();
    vmo.write(&[1], 0).unwrap();
    vmo.write(&[1], 8192).unwrap();
    assert_eq!(vmo.allocated_pages_in_range(0, 12288), 2);

    vmo.commit_range(0, 12288).unwrap();
    assert_eq!(vmo.allocated_pages_in_range(0, 12288), 3);

    vmo.pin(8192, PG).unwrap();
    assert_eq!(vmo.resize(PG).unwrap_err(), VmError::BadState);
    vmo.unpin(8192, PG);

    vmo.resize(PG).unwrap();
    assert!(vmo.allocated_pages_in_range(0, 12288) <= 1);
}

#[test]
fn clone_write_over_absent_parent_page() {
    let (ctx, _arena) = setup(16);
    let parent = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();
    parent.write(&[0x11; 8], 0).unwrap();

    let clone = parent.clone_cow(0, 2 * PG, false, false).unwrap();
    clone.write(&[0x22; 8], PG).unwrap();

    assert_eq!(clone.allocated_pages_in_range(PG, PG), 1);
    assert_eq!(parent.allocated_pages_in_range(PG, PG), 0);
    let page = clone.get_page(PG, FaultFlags::empty(), None).unwrap();
    assert!(!page.is_zero_page());
    assert_eq!(read_vec(&parent, PG, 8), vec![0; 8]);
}

#[test]
fn clone_shares_frames_until_written() {
    let (ctx, _arena) = setup(16);
    let parent = VmObject::create(&ctx, CreateOptions::empty(), 3 * PG).unwrap();
    parent.commit_range(0, 3 * PG).unwrap();
    parent.write(b"shared", PG).unwrap();
    let clone = parent.clone_cow(0, 3 * PG, false, false).unwrap();

    fn frames(vmo: &VmObject) -> Vec<u64> {
        let mut pas = Vec::new();
        vmo.lookup(0, 3 * PG, |_, _, pa| {
            pas.push(pa);
            Ok(LookupAction::Next)
        })
        .unwrap();
        pas
    }
    assert_eq!(frames(&parent), frames(&clone));
    assert_eq!(read_vec(&clone, PG, 6), b"shared");

    clone.write(b"mine", PG).unwrap();
    let (p, c) = (frames(&parent), frames(&clone));
    assert_eq!(p[0], c[0]);
    assert_ne!(p[1], c[1]);
    assert_eq!(p[2], c[2]);
    assert_eq!(read_vec(&parent, PG, 6), b"shared");
}
