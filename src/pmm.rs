//! Physical Memory Manager Interface
//!
//! VM objects never touch raw frames directly; they ask a [`PageAllocator`]
//! for pages and give them back when they are decommitted, truncated or
//! destroyed. [`PageArena`] is a simple allocator over one page aligned
//! heap region, usable wherever the physmap is the kernel heap.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::vm_page::{PageList, PageRef, PageState, VmPage, PAGE_SHIFT, PAGE_SIZE};

// ============================================================================
// Allocation Flags
// ============================================================================

/// Opaque allocation policy hint, passed through to the allocator unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(pub u32);

impl AllocFlags {
    /// No placement preference
    pub const ANY: Self = Self(0);
}

// ============================================================================
// Allocator Interface
// ============================================================================

/// Source of physical pages
///
/// Pages returned must be page aligned and reachable through the physmap.
pub trait PageAllocator: Send + Sync {
    /// Allocate a single page
    fn alloc_page(&self, flags: AllocFlags) -> VmResult<PageRef>;

    /// Allocate `count` pages; either all of them or none
    fn alloc_pages(&self, count: usize, flags: AllocFlags) -> VmResult<PageList> {
        let mut list = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc_page(flags) {
                Ok(page) => list.push(page),
                Err(e) => {
                    self.free(list);
                    return Err(e);
                }
            }
        }
        Ok(list)
    }

    /// Allocate `count` physically contiguous pages, with the base aligned
    /// to `1 << align_log2` bytes
    fn alloc_contiguous(
        &self,
        count: usize,
        flags: AllocFlags,
        align_log2: u8,
    ) -> VmResult<(u64, PageList)>;

    /// Return pages to the allocator
    fn free(&self, pages: PageList);
}

// ============================================================================
// Page Arena
// ============================================================================

struct ArenaState {
    /// Free frame indices, FIFO
    free_queue: VecDeque<u32>,
    /// Free map for contiguous searches
    free_map: Vec<bool>,
    /// Whether an index currently sits in `free_queue`
    queued: Vec<bool>,
}

/// Allocator over a page aligned region of the kernel heap
pub struct PageArena {
    base: u64,
    page_count: usize,
    pages: Vec<PageRef>,
    state: Mutex<ArenaState>,
    free_count: AtomicU32,
}

impl PageArena {
    /// Create an arena of `page_count` zeroed frames
    pub fn new(page_count: usize) -> VmResult<Arc<Self>> {
        if page_count == 0 || page_count > u32::MAX as usize {
            return Err(VmError::InvalidArgs);
        }
        let layout = Self::layout(page_count)?;
        // SAFETY: layout has non-zero size
        let region = unsafe { alloc_zeroed(layout) };
        if region.is_null() {
            return Err(VmError::NoMemory);
        }
        let base = region as usize as u64;

        let mut pages = Vec::with_capacity(page_count);
        let mut free_queue = VecDeque::with_capacity(page_count);
        for i in 0..page_count {
            let pa = base + ((i as u64) << PAGE_SHIFT);
            pages.push(Arc::new(VmPage::new(pa, PageState::Free)));
            free_queue.push_back(i as u32);
        }

        Ok(Arc::new(Self {
            base,
            page_count,
            pages,
            state: Mutex::new(ArenaState {
                free_queue,
                free_map: alloc::vec![true; page_count],
                queued: alloc::vec![true; page_count],
            }),
            free_count: AtomicU32::new(page_count as u32),
        }))
    }

    fn layout(page_count: usize) -> VmResult<Layout> {
        let bytes = page_count.checked_mul(PAGE_SIZE).ok_or(VmError::InvalidArgs)?;
        Layout::from_size_align(bytes, PAGE_SIZE).map_err(|_| VmError::InvalidArgs)
    }

    /// Total frames managed by the arena
    pub fn total(&self) -> usize {
        self.page_count
    }

    /// Get number of free pages
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::SeqCst) as usize
    }

    /// Whether `pa` lies inside this arena
    pub fn contains(&self, pa: u64) -> bool {
        pa >= self.base && pa < self.base + ((self.page_count as u64) << PAGE_SHIFT)
    }

    fn index_of(&self, pa: u64) -> Option<usize> {
        self.contains(pa).then(|| ((pa - self.base) >> PAGE_SHIFT) as usize)
    }

    fn take(&self, state: &mut ArenaState, index: usize) -> PageRef {
        state.free_map[index] = false;
        self.free_count.fetch_sub(1, Ordering::SeqCst);
        let page = Arc::clone(&self.pages[index]);
        page.set_state(PageState::Alloc);
        page
    }
}

impl fmt::Debug for PageArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageArena")
            .field("base", &format_args!("{:#x}", self.base))
            .field("total", &self.page_count)
            .field("free", &self.free_count())
            .finish()
    }
}

impl PageAllocator for PageArena {
    fn alloc_page(&self, _flags: AllocFlags) -> VmResult<PageRef> {
        let mut state = self.state.lock();
        loop {
            let index = state.free_queue.pop_front().ok_or(VmError::NoMemory)? as usize;
            state.queued[index] = false;
            // Entries claimed by a contiguous allocation are skipped lazily
            if state.free_map[index] {
                return Ok(self.take(&mut state, index));
            }
        }
    }

    fn alloc_pages(&self, count: usize, flags: AllocFlags) -> VmResult<PageList> {
        if count > self.free_count() {
            return Err(VmError::NoMemory);
        }
        let mut list = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc_page(flags) {
                Ok(page) => list.push(page),
                Err(e) => {
                    self.free(list);
                    return Err(e);
                }
            }
        }
        Ok(list)
    }

    fn alloc_contiguous(
        &self,
        count: usize,
        _flags: AllocFlags,
        align_log2: u8,
    ) -> VmResult<(u64, PageList)> {
        if count == 0 {
            return Err(VmError::InvalidArgs);
        }
        let align = 1u64.checked_shl(align_log2 as u32).ok_or(VmError::InvalidArgs)?;
        let align = align.max(PAGE_SIZE as u64);

        let mut state = self.state.lock();
        let mut index = 0usize;
        while index + count <= self.page_count {
            let pa = self.base + ((index as u64) << PAGE_SHIFT);
            if pa % align != 0 {
                index += 1;
                continue;
            }
            match (index..index + count).find(|&i| !state.free_map[i]) {
                Some(busy) => index = busy + 1,
                None => {
                    let list = (index..index + count)
                        .map(|i| self.take(&mut state, i))
                        .collect();
                    return Ok((pa, list));
                }
            }
        }
        Err(VmError::NoMemory)
    }

    fn free(&self, pages: PageList) {
        if pages.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for page in pages {
            let index = match self.index_of(page.phys_addr()) {
                Some(i) => i,
                None => panic!("freeing foreign page {:#x}", page.phys_addr()),
            };
            assert!(!state.free_map[index], "double free of page {:#x}", page.phys_addr());
            assert!(!page.is_pinned(), "freeing pinned page {:#x}", page.phys_addr());
            page.set_state(PageState::Free);
            state.free_map[index] = true;
            // A frame claimed by a contiguous run may still have its old entry
            if !state.queued[index] {
                state.queued[index] = true;
                state.free_queue.push_back(index as u32);
            }
            self.free_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.page_count) {
            // SAFETY: allocated in `new` with the same layout
            unsafe { dealloc(self.base as usize as *mut u8, layout) };
        }
    }
}
