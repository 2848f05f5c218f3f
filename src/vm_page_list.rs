//! VM Page List - Per-Object Page Ownership Table
//!
//! Sparse map from page aligned object offset to the page owned at that
//! offset. Pages are grouped into fixed fan-out nodes keyed by the node's
//! base offset, so dense runs cost one tree entry per 16 pages.
//!
//! The list only tracks ownership. Freeing pages, checking pin counts and
//! propagating range changes are the owning object's job.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{VmError, VmResult};
use crate::pmm::PageAllocator;
use crate::vm_page::{is_page_aligned, PageList, PageRef, PageState, PAGE_SHIFT, PAGE_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Pages per list node
pub const PAGE_FAN_OUT: usize = 16;

const NODE_SPAN: u64 = (PAGE_FAN_OUT * PAGE_SIZE) as u64;

/// Largest size a paged object may have; keeps node arithmetic from wrapping
pub const MAX_SIZE: u64 = u64::MAX & !(2 * NODE_SPAN - 1);

/// Visitor verdict for range walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterAction {
    /// Keep walking
    Next,
    /// End the walk early, successfully
    Stop,
}

// ============================================================================
// Nodes
// ============================================================================

struct PageListNode {
    pages: [Option<PageRef>; PAGE_FAN_OUT],
    count: usize,
}

impl PageListNode {
    fn new() -> Self {
        Self {
            pages: Default::default(),
            count: 0,
        }
    }
}

const fn node_base(offset: u64) -> u64 {
    offset & !(NODE_SPAN - 1)
}

const fn node_index(offset: u64) -> usize {
    ((offset % NODE_SPAN) >> PAGE_SHIFT) as usize
}

// ============================================================================
// Page List
// ============================================================================

/// Pages owned by one VM object
#[derive(Default)]
pub struct VmPageList {
    nodes: BTreeMap<u64, PageListNode>,
    count: usize,
}

impl VmPageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `page` at `offset`
    pub fn add_page(&mut self, page: PageRef, offset: u64) -> VmResult<()> {
        debug_assert!(is_page_aligned(offset));
        if offset >= MAX_SIZE {
            return Err(VmError::OutOfRange);
        }
        let node = self.nodes.entry(node_base(offset)).or_insert_with(PageListNode::new);
        let slot = &mut node.pages[node_index(offset)];
        if slot.is_some() {
            return Err(VmError::AlreadyExists);
        }
        *slot = Some(page);
        node.count += 1;
        self.count += 1;
        Ok(())
    }

    /// Look up the page at `offset`
    pub fn get_page(&self, offset: u64) -> Option<&PageRef> {
        self.nodes
            .get(&node_base(offset))
            .and_then(|node| node.pages[node_index(offset)].as_ref())
    }

    /// Unbind and return the page at `offset`
    pub fn remove_page(&mut self, offset: u64) -> Option<PageRef> {
        let base = node_base(offset);
        let node = self.nodes.get_mut(&base)?;
        let page = node.pages[node_index(offset)].take()?;
        node.count -= 1;
        self.count -= 1;
        if node.count == 0 {
            self.nodes.remove(&base);
        }
        Some(page)
    }

    /// Visit every page in `[start, end)` in ascending offset order
    ///
    /// Gaps are visible to the visitor as jumps between successive offsets.
    pub fn for_every_page_in_range<F>(&self, mut f: F, start: u64, end: u64) -> VmResult<()>
    where
        F: FnMut(&PageRef, u64) -> VmResult<IterAction>,
    {
        if start >= end {
            return Ok(());
        }
        for (&base, node) in self.nodes.range(node_base(start)..end) {
            for (i, slot) in node.pages.iter().enumerate() {
                let offset = base + ((i as u64) << PAGE_SHIFT);
                if offset < start {
                    continue;
                }
                if offset >= end {
                    return Ok(());
                }
                if let Some(page) = slot {
                    if f(page, offset)? == IterAction::Stop {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Visit pages and the gaps between them in `[start, end)`
    ///
    /// `per_gap` receives each maximal run of empty offsets as `[gap_start, gap_end)`.
    pub fn for_every_page_and_gap_in_range<P, G>(
        &self,
        mut per_page: P,
        mut per_gap: G,
        start: u64,
        end: u64,
    ) -> VmResult<()>
    where
        P: FnMut(&PageRef, u64) -> VmResult<IterAction>,
        G: FnMut(u64, u64) -> VmResult<IterAction>,
    {
        let mut expected = start;
        let mut stopped = false;
        self.for_every_page_in_range(
            |page, offset| {
                if offset > expected && per_gap(expected, offset)? == IterAction::Stop {
                    stopped = true;
                    return Ok(IterAction::Stop);
                }
                expected = offset + PAGE_SIZE as u64;
                let action = per_page(page, offset)?;
                stopped = action == IterAction::Stop;
                Ok(action)
            },
            start,
            end,
        )?;
        if !stopped && expected < end {
            per_gap(expected, end)?;
        }
        Ok(())
    }

    /// Unbind every page in `[start, end)` and return them in offset order
    pub fn remove_pages(&mut self, start: u64, end: u64) -> PageList {
        let mut offsets = Vec::new();
        let _ = self.for_every_page_in_range(
            |_, offset| {
                offsets.push(offset);
                Ok(IterAction::Next)
            },
            start,
            end,
        );
        offsets
            .into_iter()
            .filter_map(|offset| self.remove_page(offset))
            .collect()
    }

    /// Unbind every page
    pub fn remove_all_pages(&mut self) -> PageList {
        let mut list = Vec::with_capacity(self.count);
        for (_, node) in core::mem::take(&mut self.nodes) {
            list.extend(node.pages.into_iter().flatten());
        }
        self.count = 0;
        list
    }

    /// Detach the run `[offset, offset + len)` into a splice list
    ///
    /// Slots keep their relative position; empty offsets become gaps.
    /// Only resident pages are visited.
    pub fn take_pages(&mut self, offset: u64, len: u64) -> SpliceList {
        debug_assert!(is_page_aligned(offset) && is_page_aligned(len));
        let mut offsets = Vec::new();
        let _ = self.for_every_page_in_range(
            |_, page_offset| {
                offsets.push(page_offset);
                Ok(IterAction::Next)
            },
            offset,
            offset.saturating_add(len),
        );

        let mut pages = BTreeMap::new();
        for page_offset in offsets {
            if let Some(page) = self.remove_page(page_offset) {
                page.set_state(PageState::Alloc);
                pages.insert((page_offset - offset) >> PAGE_SHIFT, page);
            }
        }
        SpliceList::new(offset, len, pages)
    }

    /// Number of pages in `[start, end)`
    pub fn count_in_range(&self, start: u64, end: u64) -> usize {
        let mut count = 0;
        let _ = self.for_every_page_in_range(
            |_, _| {
                count += 1;
                Ok(IterAction::Next)
            },
            start,
            end,
        );
        count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

// ============================================================================
// Splice List
// ============================================================================

/// An ordered run of detached page slots, handed between objects and pagers
///
/// Slots are indexed from the start of the run; only occupied slots are
/// stored. Pages still in the list when it is dropped go back to the
/// allocator the list was taken with.
pub struct SpliceList {
    offset: u64,
    length: u64,
    /// Occupied slots by index
    pages: BTreeMap<u64, PageRef>,
    /// Index of the next slot to hand out
    cursor: u64,
    allocator: Option<Arc<dyn PageAllocator>>,
}

impl SpliceList {
    fn new(offset: u64, length: u64, pages: BTreeMap<u64, PageRef>) -> Self {
        Self {
            offset,
            length,
            pages,
            cursor: 0,
            allocator: None,
        }
    }

    /// Build a list from freshly allocated pages, one slot per page
    pub fn from_pages(pages: PageList, allocator: Arc<dyn PageAllocator>) -> Self {
        let length = (pages.len() as u64) << PAGE_SHIFT;
        let pages = (0u64..).zip(pages).collect();
        let mut list = Self::new(0, length, pages);
        list.allocator = Some(allocator);
        list
    }

    pub(crate) fn set_allocator(&mut self, allocator: Arc<dyn PageAllocator>) {
        self.allocator = Some(allocator);
    }

    fn slots(&self) -> u64 {
        self.length >> PAGE_SHIFT
    }

    /// Offset the run was taken from
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte length covered by the run
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Remaining slots
    pub fn len(&self) -> u64 {
        self.slots() - self.cursor
    }

    /// Remaining slots holding a page
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every slot has been consumed
    pub fn is_done(&self) -> bool {
        self.cursor == self.slots()
    }

    /// Next slot; the inner `None` is a gap
    pub fn pop(&mut self) -> Option<Option<PageRef>> {
        if self.is_done() {
            return None;
        }
        let page = self.pages.remove(&self.cursor);
        self.cursor += 1;
        Some(page)
    }

    /// Consume up to `max` gap slots in one step, returning how many
    pub fn skip_gaps(&mut self, max: u64) -> u64 {
        let next_page = match self.pages.keys().next() {
            Some(&index) => index,
            None => self.slots(),
        };
        let skipped = (next_page - self.cursor).min(max);
        self.cursor += skipped;
        skipped
    }
}

impl fmt::Debug for SpliceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpliceList")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("remaining", &self.len())
            .field("pages", &self.page_count())
            .finish()
    }
}

impl Drop for SpliceList {
    fn drop(&mut self) {
        let leftover: PageList = core::mem::take(&mut self.pages).into_values().collect();
        if leftover.is_empty() {
            return;
        }
        match &self.allocator {
            Some(allocator) => allocator.free(leftover),
            None => log::warn!("splice list dropped {} pages without an allocator", leftover.len()),
        }
    }
}
