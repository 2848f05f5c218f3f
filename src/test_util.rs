//! Shared fixtures for unit tests

use alloc::sync::Arc;
use alloc::vec::Vec;
use env_logger::{Builder, Env};
use spin::Mutex;

use crate::cache::{CacheMaintenance, CacheOpType};
use crate::config::{VmConfig, VmContext};
use crate::pmm::PageArena;
use crate::range_change::RangeChangeListener;
use crate::vm_page::{read_frame, write_frame, PageRef, PAGE_SIZE};

/// Route `log` output through the test harness; `RUST_LOG` overrides
pub fn init_logging() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// Context over a fresh arena of `pages` frames
pub fn setup(pages: usize) -> (Arc<VmContext>, Arc<PageArena>) {
    setup_with(pages, VmConfig::default(), Arc::new(crate::CoherentCache))
}

pub fn setup_with(
    pages: usize,
    config: VmConfig,
    cache: Arc<dyn CacheMaintenance>,
) -> (Arc<VmContext>, Arc<PageArena>) {
    init_logging();
    let arena = PageArena::new(pages).unwrap();
    let ctx = VmContext::with_config(arena.clone(), cache, config);
    (ctx, arena)
}

pub fn fill_page(page: &PageRef, byte: u8) {
    write_frame(page, 0, &[byte; PAGE_SIZE]);
}

pub fn page_byte(page: &PageRef, offset: usize) -> u8 {
    let mut buf = [0u8; 1];
    read_frame(page, offset, &mut buf);
    buf[0]
}

/// Mapping that records every range change it is told about
#[derive(Default)]
pub struct Recorder {
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<(u64, u64)> {
        core::mem::take(&mut *self.ranges.lock())
    }
}

impl RangeChangeListener for Recorder {
    fn range_change_update(&self, offset: u64, len: u64) {
        self.ranges.lock().push((offset, len));
    }
}

/// Cache hooks that record each operation, reporting a non-coherent cache
#[derive(Default)]
pub struct RecordingCache {
    ops: Mutex<Vec<(CacheOpType, usize, usize)>>,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<(CacheOpType, usize, usize)> {
        core::mem::take(&mut *self.ops.lock())
    }

    fn record(&self, op: CacheOpType, vaddr: usize, len: usize) {
        self.ops.lock().push((op, vaddr, len));
    }
}

impl CacheMaintenance for RecordingCache {
    fn clean(&self, vaddr: usize, len: usize) {
        self.record(CacheOpType::Clean, vaddr, len);
    }

    fn invalidate(&self, vaddr: usize, len: usize) {
        self.record(CacheOpType::Invalidate, vaddr, len);
    }

    fn clean_invalidate(&self, vaddr: usize, len: usize) {
        self.record(CacheOpType::CleanInvalidate, vaddr, len);
    }

    fn sync(&self, vaddr: usize, len: usize) {
        self.record(CacheOpType::Sync, vaddr, len);
    }

    fn coherent(&self) -> bool {
        false
    }
}
