//! Page Splicing
//!
//! Moves runs of pages between objects and pagers without copying:
//! [`VmObject::take_pages`] detaches a run from a plain anonymous object,
//! [`VmObject::supply_pages`] pushes a run into a pager-backed object and
//! resolves the page requests waiting on it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, warn};

use crate::error::{VmError, VmResult};
use crate::page_source::PageSource;
use crate::vm_object::{in_range, VmObject};
use crate::vm_page::{is_page_aligned, PAGE_SIZE};
use crate::vm_page_list::SpliceList;

const PG: u64 = PAGE_SIZE as u64;

/// Reports runs of supplied pages to a page source, one call per run
struct SupplyRun<'a> {
    source: &'a Arc<dyn PageSource>,
    start: u64,
    len: u64,
}

impl SupplyRun<'_> {
    fn push(&mut self, offset: u64) {
        if self.len == 0 {
            self.start = offset;
        }
        self.len += PG;
    }

    fn flush(&mut self) {
        if self.len > 0 {
            self.source.on_pages_supplied(self.start, self.len);
            self.len = 0;
        }
    }
}

impl VmObject {
    /// Detach the pages of `[offset, offset + len)`
    ///
    /// Only an unparented, unpaged, unmapped object without children can
    /// give up its pages. Offsets without a page become gaps in the list.
    pub fn take_pages(&self, offset: u64, len: u64) -> VmResult<SpliceList> {
        let mut inner = self.inner.lock();
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }
        if !is_page_aligned(offset) || !is_page_aligned(len) {
            return Err(VmError::InvalidArgs);
        }
        if self.any_pages_pinned_locked(&inner, offset, len)
            || self.parent().is_some()
            || self.page_source.is_some()
            || self.mappings.lock().len() != 0
            || !self.children.lock().is_empty()
        {
            return Err(VmError::BadState);
        }

        let mut pages = inner.page_list.take_pages(offset, len);
        pages.set_allocator(Arc::clone(&self.ctx.allocator));
        debug!(
            "vm_object {}: took {} pages from [{:#x}, {:#x})",
            self.id().0,
            pages.page_count(),
            offset,
            offset + len
        );
        Ok(pages)
    }

    /// Install pages from `pages` at `[offset, offset + len)`, one slot per
    /// page in order
    ///
    /// Slots landing on an offset that already has a page are freed rather
    /// than installed. Returns how many pages were discarded that way.
    pub fn supply_pages(&self, offset: u64, len: u64, pages: &mut SpliceList) -> VmResult<usize> {
        let source = self.page_source.as_ref().ok_or(VmError::BadState)?;
        if !is_page_aligned(offset) || !is_page_aligned(len) {
            return Err(VmError::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }

        let end = offset + len;
        let mut run = SupplyRun {
            source,
            start: offset,
            len: 0,
        };
        let mut discarded = Vec::new();
        let mut status = Ok(());
        let mut cur = offset;
        while cur < end {
            let gaps = pages.skip_gaps((end - cur) / PG);
            if gaps > 0 {
                run.flush();
                cur += gaps * PG;
                continue;
            }
            let Some(slot) = pages.pop() else {
                break;
            };
            match slot {
                Some(page) => match self.add_page_locked(&mut inner, Arc::clone(&page), cur) {
                    Ok(()) => run.push(cur),
                    Err(VmError::AlreadyExists) => {
                        run.flush();
                        discarded.push(page);
                    }
                    Err(e) => {
                        discarded.push(page);
                        status = Err(e);
                        break;
                    }
                },
                None => run.flush(),
            }
            cur += PG;
        }
        run.flush();
        drop(inner);

        let count = discarded.len();
        if count > 0 {
            warn!(
                "vm_object {}: discarded {} late pages supplied at [{:#x}, {:#x})",
                self.id().0,
                count,
                offset,
                end
            );
            self.free_pages(discarded);
        }
        status.map(|()| count)
    }
}
