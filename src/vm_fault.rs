//! VM Fault - Page Lookup and Fault Resolution
//!
//! Based on Mach4 vm/vm_fault.h/c
//! Resolves a page of a VM object, optionally faulting it in.
//!
//! ## Resolution Order
//!
//! 1. The object's own page table
//! 2. The parent chain (read-only lookup, write faults copy the page up)
//! 3. The page source, if the object has one
//! 4. The shared zero page (read) or a fresh zeroed page (write)
//!
//! A page source that cannot answer immediately returns
//! [`VmError::ShouldWait`] or [`VmError::Batched`]; the caller drops the
//! object lock, waits on the [`PageRequest`] and retries.

use alloc::sync::Arc;
use alloc::vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use log::trace;

use crate::cache::CachePolicy;
use crate::error::{VmError, VmResult};
use crate::page_source::PageRequest;
use crate::vm_object::{VmObject, VmObjectInner};
use crate::vm_page::{
    copy_page_frame, paddr_to_kvaddr, trunc_page, zero_page, zero_page_frame, PageList, PageRef,
    PAGE_SIZE,
};

bitflags! {
    /// How a page is being looked up
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// The caller will write the page
        const WRITE = 1 << 0;
        /// Software fault (kernel access on behalf of a caller)
        const SW_FAULT = 1 << 1;
        /// Hardware fault (access through a mapping)
        const HW_FAULT = 1 << 2;
        /// Either kind of fault; without one, missing pages are not created
        const FAULT_MASK = Self::SW_FAULT.bits() | Self::HW_FAULT.bits();
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Global fault statistics
static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Total page lookups
    pub total: AtomicU64,
    /// Copy-on-write faults
    pub cow: AtomicU64,
    /// Zero-fill faults
    pub zero_fill: AtomicU64,
    /// Reads answered with the zero page
    pub zero_page_reads: AtomicU64,
    /// Page-in faults (from pager)
    pub page_in: AtomicU64,
    /// Faults left waiting on a pager
    pub pager_waits: AtomicU64,
    /// Committed ranges
    pub commits: AtomicU64,
    /// Decommitted ranges
    pub decommits: AtomicU64,
}

/// Point in time copy of [`FaultStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub total: u64,
    pub cow: u64,
    pub zero_fill: u64,
    pub zero_page_reads: u64,
    pub page_in: u64,
    pub pager_waits: u64,
    pub commits: u64,
    pub decommits: u64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            zero_page_reads: AtomicU64::new(0),
            page_in: AtomicU64::new(0),
            pager_waits: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            decommits: AtomicU64::new(0),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_total(&self) {
        Self::incr(&self.total);
    }

    pub fn incr_cow(&self) {
        Self::incr(&self.cow);
    }

    pub fn incr_zero_fill(&self) {
        Self::incr(&self.zero_fill);
    }

    pub fn incr_zero_page_reads(&self) {
        Self::incr(&self.zero_page_reads);
    }

    pub fn incr_page_in(&self) {
        Self::incr(&self.page_in);
    }

    pub fn incr_pager_waits(&self) {
        Self::incr(&self.pager_waits);
    }

    pub fn incr_commits(&self) {
        Self::incr(&self.commits);
    }

    pub fn incr_decommits(&self) {
        Self::incr(&self.decommits);
    }

    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            cow: self.cow.load(Ordering::Relaxed),
            zero_fill: self.zero_fill.load(Ordering::Relaxed),
            zero_page_reads: self.zero_page_reads.load(Ordering::Relaxed),
            page_in: self.page_in.load(Ordering::Relaxed),
            pager_waits: self.pager_waits.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            decommits: self.decommits.load(Ordering::Relaxed),
        }
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Page Lookup
// ============================================================================

impl VmObject {
    /// Look up or fault in the page at `offset`
    ///
    /// Returns [`VmError::ShouldWait`] or [`VmError::Batched`] if `request`
    /// must be waited on before retrying.
    pub fn get_page(
        &self,
        offset: u64,
        flags: FaultFlags,
        request: Option<&Arc<PageRequest>>,
    ) -> VmResult<PageRef> {
        let mut inner = self.inner.lock();
        self.get_page_locked(&mut inner, offset, flags, None, request)
    }

    /// Resolve the page at `offset` with the page lock held
    ///
    /// Pages allocated here come from `free_list` first, then the
    /// allocator.
    pub(crate) fn get_page_locked(
        &self,
        inner: &mut VmObjectInner,
        offset: u64,
        flags: FaultFlags,
        mut free_list: Option<&mut PageList>,
        request: Option<&Arc<PageRequest>>,
    ) -> VmResult<PageRef> {
        if offset >= self.size() {
            return Err(VmError::OutOfRange);
        }
        let offset = trunc_page(offset);
        FAULT_STATS.incr_total();

        if let Some(page) = inner.page_list.get_page(offset) {
            return Ok(Arc::clone(page));
        }

        if let Some(parent) = self.parent() {
            let parent_offset = self
                .parent_offset()
                .checked_add(offset)
                .ok_or(VmError::OutOfRange)?;

            // Keep the parent locked until its page has been copied
            let mut parent_inner = parent.inner.lock();
            match parent.get_page_locked(
                &mut parent_inner,
                parent_offset,
                flags - FaultFlags::WRITE,
                None,
                request,
            ) {
                Ok(src) => {
                    if !flags.contains(FaultFlags::WRITE) {
                        return Ok(src);
                    }

                    let page = self.alloc_page_locked(free_list.as_deref_mut())?;
                    if src.is_zero_page() {
                        zero_page_frame(&page);
                        FAULT_STATS.incr_zero_fill();
                    } else {
                        copy_page_frame(&src, &page);
                        FAULT_STATS.incr_cow();
                    }
                    drop(parent_inner);

                    trace!(
                        "vm_object {}: cow page {:#x} from parent {:#x}",
                        self.id().0,
                        offset,
                        src.phys_addr()
                    );
                    return self.install_faulted_page(inner, page, offset);
                }
                Err(e) if e.is_pending() => {
                    FAULT_STATS.incr_pager_waits();
                    return Err(e);
                }
                // Window past the parent's end, or a non-faulting miss
                Err(VmError::OutOfRange) | Err(VmError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        if !flags.intersects(FaultFlags::FAULT_MASK) {
            return Err(VmError::NotFound);
        }

        if let Some(source) = &self.page_source {
            let page = match source.get_page(offset, request) {
                Ok(page) => page,
                Err(e) => {
                    if e.is_pending() {
                        FAULT_STATS.incr_pager_waits();
                    }
                    return Err(e);
                }
            };
            FAULT_STATS.incr_page_in();
            return self.install_faulted_page(inner, page, offset);
        }

        if !flags.contains(FaultFlags::WRITE) {
            FAULT_STATS.incr_zero_page_reads();
            return Ok(Arc::clone(zero_page()));
        }

        let page = self.alloc_page_locked(free_list)?;
        zero_page_frame(&page);
        if inner.cache_policy != CachePolicy::Cached && !self.ctx.cache.coherent() {
            self.ctx
                .cache
                .clean_invalidate(paddr_to_kvaddr(page.phys_addr()), PAGE_SIZE);
        }
        FAULT_STATS.incr_zero_fill();
        trace!("vm_object {}: zero fill {:#x}", self.id().0, offset);
        self.install_faulted_page(inner, page, offset)
    }

    /// Insert a freshly resolved page and invalidate stale translations
    ///
    /// If a page is already present the new one is freed and the resident
    /// page is returned instead.
    fn install_faulted_page(
        &self,
        inner: &mut VmObjectInner,
        page: PageRef,
        offset: u64,
    ) -> VmResult<PageRef> {
        match self.add_page_locked(inner, Arc::clone(&page), offset) {
            Ok(()) => {}
            Err(VmError::AlreadyExists) => {
                self.free_pages(vec![page]);
                return inner
                    .page_list
                    .get_page(offset)
                    .cloned()
                    .ok_or(VmError::NotFound);
            }
            Err(e) => {
                self.free_pages(vec![page]);
                return Err(e);
            }
        }
        self.range_change_update(offset, PAGE_SIZE as u64);
        Ok(page)
    }

    fn alloc_page_locked(&self, free_list: Option<&mut PageList>) -> VmResult<PageRef> {
        if let Some(page) = free_list.and_then(|list| list.pop()) {
            return Ok(page);
        }
        self.ctx.allocator.alloc_page(self.ctx.config.alloc_flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{fill_page, page_byte, setup, Recorder};
    use crate::vm_object::CreateOptions;
    use crate::{PageSource, PagerQueue};

    const PG: u64 = PAGE_SIZE as u64;
    const READ: FaultFlags = FaultFlags::SW_FAULT;
    const WRITE: FaultFlags = FaultFlags::SW_FAULT.union(FaultFlags::WRITE);

    /// Source whose backing store is unreadable
    struct BrokenSource;

    impl PageSource for BrokenSource {
        fn get_page(&self, _offset: u64, _request: Option<&Arc<PageRequest>>) -> VmResult<PageRef> {
            Err(VmError::Io)
        }

        fn on_pages_supplied(&self, _offset: u64, _len: u64) {}

        fn finalize_request(&self, _request: &Arc<PageRequest>) -> VmResult<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn test_fault_stats() {
        let stats = FaultStats::new();
        stats.incr_total();
        stats.incr_cow();
        let snap = stats.snapshot();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.cow, 1);
        assert_eq!(snap.page_in, 0);
    }

    #[test]
    fn test_read_fault_returns_zero_page() {
        let (ctx, arena) = setup(4);
        let vmo = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();
        let page = vmo.get_page(PG + 7, READ, None).unwrap();
        assert!(page.is_zero_page());
        assert_eq!(vmo.allocated_pages(), 0);
        assert_eq!(arena.free_count(), 4);
    }

    #[test]
    fn test_lookup_without_fault_flags() {
        let (ctx, _arena) = setup(4);
        let vmo = VmObject::create(&ctx, CreateOptions::empty(), PG).unwrap();
        assert_eq!(
            vmo.get_page(0, FaultFlags::empty(), None).unwrap_err(),
            VmError::NotFound
        );
        assert_eq!(vmo.get_page(PG, READ, None).unwrap_err(), VmError::OutOfRange);
    }

    #[test]
    fn test_write_fault_allocates_zeroed_page() {
        let (ctx, arena) = setup(4);
        let vmo = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();
        let rec = Recorder::new();
        vmo.add_mapping(rec.clone());

        let page = vmo.get_page(PG, WRITE, None).unwrap();
        assert!(!page.is_zero_page());
        assert_eq!(page_byte(&page, 100), 0);
        assert_eq!(vmo.allocated_pages(), 1);
        assert_eq!(arena.free_count(), 3);
        assert_eq!(rec.take(), alloc::vec![(PG, PG)]);

        let again = vmo.get_page(PG, WRITE, None).unwrap();
        assert!(Arc::ptr_eq(&page, &again));
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_clone_reads_parent_and_copies_on_write() {
        let (ctx, _arena) = setup(8);
        let parent = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();
        let parent_page = parent.get_page(PG, WRITE, None).unwrap();
        fill_page(&parent_page, 0xab);

        let child = parent.clone_cow(0, 2 * PG, false, false).unwrap();
        let shared = child.get_page(PG, READ, None).unwrap();
        assert!(Arc::ptr_eq(&shared, &parent_page));
        assert_eq!(child.allocated_pages(), 0);

        let private = child.get_page(PG, WRITE, None).unwrap();
        assert!(!private.is_same_frame(&parent_page));
        assert_eq!(page_byte(&private, 4095), 0xab);
        assert_eq!(child.allocated_pages(), 1);
        assert_eq!(parent.allocated_pages(), 1);

        // Parent untouched by the split
        fill_page(&private, 0x11);
        assert_eq!(page_byte(&parent_page, 0), 0xab);
    }

    #[test]
    fn test_clone_write_over_parent_hole_is_zero_fill() {
        let (ctx, _arena) = setup(8);
        let parent = VmObject::create(&ctx, CreateOptions::empty(), 2 * PG).unwrap();
        let child = parent.clone_cow(PG, PG, false, false).unwrap();

        assert!(child.get_page(0, READ, None).unwrap().is_zero_page());
        let page = child.get_page(0, WRITE, None).unwrap();
        assert!(!page.is_zero_page());
        assert_eq!(page_byte(&page, 0), 0);
        assert_eq!(parent.allocated_pages(), 0);
    }

    #[test]
    fn test_clone_beyond_parent_end_is_private() {
        let (ctx, _arena) = setup(8);
        let parent = VmObject::create(&ctx, CreateOptions::empty(), PG).unwrap();
        let child = parent.clone_cow(0, 3 * PG, false, false).unwrap();
        assert!(child.get_page(2 * PG, READ, None).unwrap().is_zero_page());
        child.get_page(2 * PG, WRITE, None).unwrap();
        assert_eq!(child.allocated_pages(), 1);
    }

    #[test]
    fn test_pager_fault_waits_then_installs() {
        let (ctx, arena) = setup(8);
        let pager = PagerQueue::new();
        let vmo =
            VmObject::create_external(&ctx, pager.clone(), CreateOptions::empty(), 2 * PG).unwrap();
        let request = PageRequest::new(false);

        assert_eq!(
            vmo.get_page(PG, READ, Some(&request)).unwrap_err(),
            VmError::ShouldWait
        );
        assert_eq!(pager.next_request(), Some((PG, PG)));

        let page = ctx.allocator().alloc_page(ctx.config().alloc_flags).unwrap();
        fill_page(&page, 0x42);
        let mut pages = crate::SpliceList::from_pages(alloc::vec![page], ctx.allocator().clone());
        assert_eq!(vmo.supply_pages(PG, PG, &mut pages).unwrap(), 0);
        request.wait().unwrap();

        let page = vmo.get_page(PG, READ, Some(&request)).unwrap();
        assert_eq!(page_byte(&page, 9), 0x42);
        drop(page);
        drop(vmo);
        assert_eq!(arena.free_count(), 8);
    }

    #[test]
    fn test_clone_sees_root_source_errors() {
        let (ctx, arena) = setup(4);
        let root =
            VmObject::create_external(&ctx, Arc::new(BrokenSource), CreateOptions::empty(), PG)
                .unwrap();
        let child = root.clone_cow(0, PG, false, false).unwrap();
        let grandchild = child.clone_cow(0, PG, false, false).unwrap();
        let request = PageRequest::new(false);

        assert_eq!(root.get_page(0, READ, Some(&request)).unwrap_err(), VmError::Io);
        assert_eq!(child.get_page(0, READ, Some(&request)).unwrap_err(), VmError::Io);
        assert_eq!(child.get_page(0, WRITE, Some(&request)).unwrap_err(), VmError::Io);
        assert_eq!(grandchild.get_page(0, WRITE, None).unwrap_err(), VmError::Io);
        assert_eq!(child.commit_range(0, PG).unwrap_err(), VmError::Io);

        assert_eq!(child.allocated_pages(), 0);
        assert_eq!(grandchild.allocated_pages(), 0);
        assert_eq!(arena.free_count(), 4);
    }

    #[test]
    fn test_clone_of_pager_object_propagates_wait() {
        let (ctx, _arena) = setup(8);
        let pager = PagerQueue::new();
        let parent =
            VmObject::create_external(&ctx, pager.clone(), CreateOptions::empty(), PG).unwrap();
        let child = parent.clone_cow(0, PG, false, false).unwrap();
        let request = PageRequest::new(false);
        assert_eq!(
            child.get_page(0, WRITE, Some(&request)).unwrap_err(),
            VmError::ShouldWait
        );
        assert_eq!(child.allocated_pages(), 0);
        assert_eq!(pager.outstanding(), 1);
    }
}
