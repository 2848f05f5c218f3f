//! VM Page - Physical Page Descriptors
//!
//! Based on Mach4 vm/vm_page.h
//! A [`VmPage`] describes one physical frame. Frames are reached through
//! the physmap, which is an identity mapping: a physical address handed
//! out by a [`PageAllocator`](crate::pmm::PageAllocator) can be used
//! directly as a kernel pointer.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

// ============================================================================
// Page State
// ============================================================================

/// Lifecycle state of a physical page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// On the allocator's free queue
    Free = 0,
    /// Handed out by the allocator, not owned by an object
    Alloc = 1,
    /// Owned by a VM object's page list
    Object = 2,
    /// Permanently resident, never returned to the allocator
    Wired = 3,
}

impl PageState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Free,
            1 => Self::Alloc,
            2 => Self::Object,
            _ => Self::Wired,
        }
    }
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Physical page descriptor
#[derive(Debug)]
pub struct VmPage {
    /// Physical address of this page
    phys_addr: u64,

    /// Current [`PageState`]
    state: AtomicU8,

    /// Pin count; only changed under the owning object's lock
    pin_count: AtomicU32,
}

/// Shared handle to a page descriptor
pub type PageRef = Arc<VmPage>;

/// An ordered run of pages, used for free lists and allocator batches
pub type PageList = Vec<PageRef>;

impl VmPage {
    /// Create a descriptor for the frame at `phys_addr`
    pub fn new(phys_addr: u64, state: PageState) -> Self {
        debug_assert!(is_page_aligned(phys_addr));
        Self {
            phys_addr,
            state: AtomicU8::new(state as u8),
            pin_count: AtomicU32::new(0),
        }
    }

    /// Physical address of the frame
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Check if page is wired
    pub fn is_wired(&self) -> bool {
        self.state() == PageState::Wired
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Increment the pin count, returns the new count
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the pin count, returns the new count
    pub(crate) fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin of unpinned page {:#x}", self.phys_addr);
        prev - 1
    }

    /// Whether two handles name the same physical frame
    pub fn is_same_frame(&self, other: &VmPage) -> bool {
        self.phys_addr == other.phys_addr
    }

    /// Whether this is the global zero page
    pub fn is_zero_page(&self) -> bool {
        self.phys_addr == zero_page().phys_addr
    }
}

// ============================================================================
// Zero Page
// ============================================================================

#[repr(C, align(4096))]
struct ZeroFrame([u8; PAGE_SIZE]);

static ZERO_FRAME: ZeroFrame = ZeroFrame([0; PAGE_SIZE]);

static ZERO_PAGE: spin::Once<PageRef> = spin::Once::new();

/// The shared, read-only zero page
///
/// Read faults on never-written memory resolve to this page without
/// allocating. It is never inserted into a page list and never written.
pub fn zero_page() -> &'static PageRef {
    ZERO_PAGE.call_once(|| {
        let pa = &ZERO_FRAME as *const ZeroFrame as u64;
        Arc::new(VmPage::new(pa, PageState::Wired))
    })
}

// ============================================================================
// Physmap Access
// ============================================================================

fn physmap(pa: u64) -> *mut u8 {
    pa as usize as *mut u8
}

/// Zero a physical page
pub(crate) fn zero_page_frame(page: &VmPage) {
    debug_assert!(!page.is_zero_page());
    // SAFETY: the page is owned by the caller and mapped by the physmap
    unsafe {
        core::ptr::write_bytes(physmap(page.phys_addr), 0, PAGE_SIZE);
    }
}

/// Copy physical page contents
pub(crate) fn copy_page_frame(src: &VmPage, dst: &VmPage) {
    debug_assert!(!dst.is_zero_page());
    // SAFETY: both frames are PAGE_SIZE bytes in the physmap and distinct
    unsafe {
        core::ptr::copy_nonoverlapping(physmap(src.phys_addr), physmap(dst.phys_addr), PAGE_SIZE);
    }
}

/// Copy bytes out of a page starting at `page_offset`
pub fn read_frame(page: &VmPage, page_offset: usize, out: &mut [u8]) {
    assert!(page_offset + out.len() <= PAGE_SIZE);
    // SAFETY: range checked against the frame size above
    unsafe {
        core::ptr::copy_nonoverlapping(
            physmap(page.phys_addr).add(page_offset),
            out.as_mut_ptr(),
            out.len(),
        );
    }
}

/// Copy bytes into a page starting at `page_offset`
///
/// Used by the fault path on pages it owns, and by pagers to fill pages
/// before supplying them.
pub fn write_frame(page: &VmPage, page_offset: usize, data: &[u8]) {
    assert!(page_offset + data.len() <= PAGE_SIZE);
    assert!(!page.is_zero_page(), "write to the zero page");
    // SAFETY: range checked against the frame size above
    unsafe {
        core::ptr::copy_nonoverlapping(
            data.as_ptr(),
            physmap(page.phys_addr).add(page_offset),
            data.len(),
        );
    }
}

/// Kernel virtual address of a physical address
pub fn paddr_to_kvaddr(pa: u64) -> usize {
    physmap(pa) as usize
}

// ============================================================================
// Address Helpers
// ============================================================================

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round address up to page boundary, `None` on overflow
pub const fn round_page(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK == 0
}

/// Convert a byte count to a page count
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes >> PAGE_SHIFT
}
