//! VM Object Range Operations
//!
//! Operations over byte ranges of a VM object: commit, decommit, pin,
//! unpin, kernel reads and writes, physical lookup and cache maintenance.
//! All of them trim or reject ranges against the current size and act on
//! whole pages.

use alloc::vec::Vec;
use log::{debug, trace, warn};

use crate::cache::{CacheOpType, CachePolicy};
use crate::error::{VmError, VmResult};
use crate::page_source::PageRequest;
use crate::vm_fault::{stats, FaultFlags};
use crate::vm_object::{in_range, trim_range, VmObject, VmObjectInner};
use crate::vm_page::{
    bytes_to_pages, paddr_to_kvaddr, read_frame, round_page, trunc_page, write_frame, PageList,
    PageRef, PAGE_SIZE,
};
use crate::vm_page_list::IterAction;

const PG: u64 = PAGE_SIZE as u64;

/// What a [`VmObject::lookup`] callback wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupAction {
    /// Continue with the next page
    Next,
    /// End the walk successfully
    Stop,
}

/// Page aligned bounds of `[offset, offset + len)`; the end must not
/// overflow
fn page_bounds(offset: u64, len: u64) -> VmResult<(u64, u64)> {
    let end = offset
        .checked_add(len)
        .and_then(round_page)
        .ok_or(VmError::OutOfRange)?;
    Ok((trunc_page(offset), end))
}

impl VmObject {
    // ========================================================================
    // Commit / Decommit
    // ========================================================================

    /// Make every page of `[offset, offset + len)` resident and private
    ///
    /// The range is clamped to the object size. Blocks, with the object
    /// unlocked, while a page source supplies pages.
    pub fn commit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        let mut guard = self.inner.lock();

        let new_len = trim_range(offset, len, self.size()).ok_or(VmError::OutOfRange)?;
        if new_len == 0 {
            return Err(VmError::OutOfRange);
        }
        let (mut offset, mut end) = page_bounds(offset, new_len)?;

        // Without a page source everything can be allocated up front
        let mut page_list: PageList = Vec::new();
        if self.root_page_source().is_none() {
            let wanted = bytes_to_pages(end - offset) as usize;
            let count = wanted - guard.page_list.count_in_range(offset, end);
            if count == 0 {
                return Ok(());
            }
            page_list = self
                .ctx
                .allocator
                .alloc_pages(count, self.ctx.config.alloc_flags)?;
        }

        let request = PageRequest::new(self.ctx.config.batch_pager_requests);
        let mut retry = false;
        let status: VmResult<()> = 'commit: loop {
            if retry {
                drop(guard);
                let waited = request.wait();
                guard = self.inner.lock();
                if let Err(e) = waited {
                    break 'commit Err(e);
                }
                retry = false;

                // The object may have shrunk while unlocked
                match trim_range(offset, end - offset, self.size()) {
                    Some(len) if len > 0 => end = offset + len,
                    _ => break 'commit Ok(()),
                }
            }

            let mut cur = offset;
            let mut new_offset = offset;
            while cur < end {
                if guard.page_list.get_page(cur).is_none() {
                    match self.get_page_locked(
                        &mut guard,
                        cur,
                        FaultFlags::SW_FAULT | FaultFlags::WRITE,
                        Some(&mut page_list),
                        Some(&request),
                    ) {
                        Ok(_) => {}
                        // Keep walking so the request grows
                        Err(VmError::Batched) => retry = true,
                        Err(VmError::ShouldWait) => {
                            retry = true;
                            break;
                        }
                        Err(e) => break 'commit Err(e),
                    }
                }
                cur += PG;
                if !retry {
                    new_offset = cur;
                }
            }

            if retry && cur == end {
                if let Some(source) = self.root_page_source() {
                    match source.finalize_request(&request) {
                        Ok(()) | Err(VmError::ShouldWait) => {}
                        Err(e) => break 'commit Err(e),
                    }
                }
            }

            offset = new_offset;
            if !retry {
                break Ok(());
            }
        };

        // A request abandoned mid-batch is resolved here; nothing else will
        if let Err(e) = status {
            request.fail(e);
        }

        drop(guard);
        if !page_list.is_empty() {
            self.ctx.allocator.free(page_list);
        }
        if status.is_ok() {
            stats().incr_commits();
        }
        status
    }

    /// Free the pages of `[offset, offset + len)`, clamped to the size
    ///
    /// Reads of the range see zeros (or the parent) again afterwards.
    pub fn decommit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        if self.is_contiguous() {
            return Err(VmError::NotSupported);
        }

        let mut inner = self.inner.lock();
        let new_len = trim_range(offset, len, self.size()).ok_or(VmError::OutOfRange)?;
        if new_len == 0 {
            return Ok(());
        }
        let (start, end) = page_bounds(offset, new_len)?;

        if self.any_pages_pinned_locked(&inner, start, end - start) {
            return Err(VmError::BadState);
        }

        // Mappings drop their translations before the frames go
        self.range_change_update(start, end - start);
        let freed = inner.page_list.remove_pages(start, end);
        debug!(
            "vm_object {}: decommit [{:#x}, {:#x}) freed {} pages",
            self.id().0,
            start,
            end,
            freed.len()
        );
        self.free_pages(freed);
        stats().incr_decommits();
        Ok(())
    }

    // ========================================================================
    // Pinning
    // ========================================================================

    /// Pin every page of `[offset, offset + len)`
    ///
    /// Every page must already be committed. On failure no pin counts are
    /// left changed.
    pub fn pin(&self, offset: u64, len: u64) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }

        let inner = self.inner.lock();
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }
        let (start, end) = page_bounds(offset, len)?;

        let max_pin_count = self.ctx.config.max_pin_count;
        let mut expected = start;
        let status = inner
            .page_list
            .for_every_page_in_range(
                |page, page_offset| {
                    if page_offset != expected {
                        return Err(VmError::NotFound);
                    }
                    if page.pin_count() >= max_pin_count {
                        warn!("page {:#x} at pin limit", page.phys_addr());
                        return Err(VmError::Unavailable);
                    }
                    page.pin();
                    expected += PG;
                    Ok(IterAction::Next)
                },
                start,
                end,
            )
            .and_then(|()| {
                if expected == end {
                    Ok(())
                } else {
                    Err(VmError::NotFound)
                }
            });

        if let Err(e) = status {
            if expected > start {
                self.unpin_locked(&inner, start, expected - start);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Undo a [`pin`](Self::pin) of `[offset, offset + len)`
    ///
    /// # Panics
    ///
    /// If the range is outside the object, or any page in it is missing
    /// or not pinned.
    pub fn unpin(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let inner = self.inner.lock();
        assert!(
            in_range(offset, len, self.size()),
            "unpin [{:#x}, +{:#x}) out of range",
            offset,
            len
        );
        let start = trunc_page(offset);
        let end = round_page(offset + len).unwrap_or(u64::MAX);
        self.unpin_locked(&inner, start, end - start);
    }

    fn unpin_locked(&self, inner: &VmObjectInner, offset: u64, len: u64) {
        let end = offset + len;
        let mut expected = offset;
        let _ = inner.page_list.for_every_page_in_range(
            |page, page_offset| {
                assert_eq!(page_offset, expected, "unpin of uncommitted page {:#x}", expected);
                page.unpin();
                expected += PG;
                Ok(IterAction::Next)
            },
            offset,
            end,
        );
        assert_eq!(expected, end, "unpin of uncommitted page {:#x}", expected);
    }

    // ========================================================================
    // Kernel Read / Write
    // ========================================================================

    /// Copy `buf.len()` bytes out of the object starting at `offset`
    pub fn read(&self, buf: &mut [u8], offset: u64) -> VmResult<()> {
        let len = buf.len();
        self.read_write_internal(offset, len, false, |page, page_offset, buf_offset, count| {
            read_frame(page, page_offset, &mut buf[buf_offset..buf_offset + count]);
        })
    }

    /// Copy `buf` into the object starting at `offset`
    pub fn write(&self, buf: &[u8], offset: u64) -> VmResult<()> {
        self.read_write_internal(offset, buf.len(), true, |page, page_offset, buf_offset, count| {
            write_frame(page, page_offset, &buf[buf_offset..buf_offset + count]);
        })
    }

    fn read_write_internal<F>(&self, offset: u64, len: usize, write: bool, mut copy: F) -> VmResult<()>
    where
        F: FnMut(&PageRef, usize, usize, usize),
    {
        let mut inner = self.inner.lock();

        if inner.cache_policy != CachePolicy::Cached {
            return Err(VmError::BadState);
        }
        // Pager backed contents may only be reached through faults
        if self.root_page_source().is_some() {
            return Err(VmError::BadState);
        }

        let end = offset.checked_add(len as u64).ok_or(VmError::OutOfRange)?;
        if end > self.size() {
            return Err(VmError::OutOfRange);
        }

        let flags = if write {
            FaultFlags::SW_FAULT | FaultFlags::WRITE
        } else {
            FaultFlags::SW_FAULT
        };

        let mut src_offset = offset;
        let mut done = 0;
        while done < len {
            let page_offset = (src_offset % PG) as usize;
            let count = (PAGE_SIZE - page_offset).min(len - done);
            let page = self.get_page_locked(
                &mut inner,
                trunc_page(src_offset),
                flags,
                None,
                None,
            )?;
            copy(&page, page_offset, done, count);
            src_offset += count as u64;
            done += count;
        }
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Report the physical address of every page of `[offset, offset + len)`
    ///
    /// Missing pages are read-faulted, so holes report the zero page or the
    /// parent's page. The callback gets the page offset, its index from the
    /// start of the range and the physical address.
    pub fn lookup<F>(&self, offset: u64, len: u64, mut f: F) -> VmResult<()>
    where
        F: FnMut(u64, usize, u64) -> VmResult<LookupAction>,
    {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }
        let (start, end) = page_bounds(offset, len)?;

        let mut cur = start;
        while cur < end {
            let resident = inner.page_list.get_page(cur).map(|page| page.phys_addr());
            let pa = match resident {
                Some(pa) => pa,
                None => self
                    .get_page_locked(&mut inner, cur, FaultFlags::SW_FAULT, None, None)?
                    .phys_addr(),
            };
            let index = bytes_to_pages(cur - start) as usize;
            if f(cur, index, pa)? == LookupAction::Stop {
                break;
            }
            cur += PG;
        }
        Ok(())
    }

    // ========================================================================
    // Cache Maintenance
    // ========================================================================

    /// Apply `op` to the resident bytes of `[offset, offset + len)`
    ///
    /// Pages that are not resident are skipped; nothing is faulted in.
    pub fn cache_op(&self, offset: u64, len: u64, op: CacheOpType) -> VmResult<()> {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }

        let end = offset + len;
        let mut op_start = offset;
        while op_start != end {
            let page_end = trunc_page(op_start) + PG;
            let op_end = page_end.min(end);
            let op_len = op_end - op_start;
            let page_offset = (op_start % PG) as usize;

            if let Ok(page) = self.get_page_locked(
                &mut inner,
                trunc_page(op_start),
                FaultFlags::empty(),
                None,
                None,
            ) {
                let vaddr = paddr_to_kvaddr(page.phys_addr()) + page_offset;
                trace!("cache {:?} {:#x}+{:#x}", op, vaddr, op_len);
                self.ctx.cache.apply(op, vaddr, op_len as usize);
            }
            op_start += op_len;
        }
        Ok(())
    }

    pub fn invalidate_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::Invalidate)
    }

    pub fn clean_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::Clean)
    }

    pub fn clean_invalidate_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::CleanInvalidate)
    }

    pub fn sync_cache(&self, offset: u64, len: u64) -> VmResult<()> {
        self.cache_op(offset, len, CacheOpType::Sync)
    }
}
