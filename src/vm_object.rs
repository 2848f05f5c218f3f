//! VM Object - Paged Memory Object
//!
//! Based on Mach4 vm/vm_object.h/c
//! A VM object is a resizable run of pages addressed by byte offset. It
//! can be:
//! - Anonymous (pages zero-filled on demand)
//! - Physically contiguous (pages allocated and pinned up front)
//! - Wired (wrapping frames that never came from the allocator)
//! - Pager backed (pages supplied by a [`PageSource`])
//! - A copy-on-write clone of another object (its parent)
//!
//! ## Locking
//!
//! Each object has one page lock (`inner`). A fault may take the parent's
//! page lock while holding the child's, never the other way round. The
//! child and mapping lists are leaf locks used for downward notification.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, error, info};
use spin::Mutex;

use crate::cache::CachePolicy;
use crate::config::VmContext;
use crate::error::{VmError, VmResult};
use crate::page_source::PageSource;
use crate::range_change::{MappingId, MappingList, RangeChangeListener};
use crate::vm_page::{
    bytes_to_pages, is_page_aligned, round_page, trunc_page, zero_page_frame, PageList, PageRef,
    PageState, VmPage, PAGE_SHIFT, PAGE_SIZE,
};
use crate::vm_page_list::{IterAction, VmPageList, MAX_SIZE};

/// Longest object name, in bytes
pub const MAX_NAME_LEN: usize = 31;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        VmObjectId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

bitflags! {
    /// Options fixed when an object is created
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateOptions: u32 {
        /// Object may be resized
        const RESIZABLE = 1 << 0;
        /// Pages are physically contiguous, pinned, allocated at creation
        const CONTIGUOUS = 1 << 1;
        /// Pages come from a page source
        const HAS_PAGER = 1 << 2;
    }
}

/// State guarded by the object's page lock
pub(crate) struct VmObjectInner {
    pub(crate) page_list: VmPageList,
    pub(crate) cache_policy: CachePolicy,
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// A paged VM object
pub struct VmObject {
    /// Object ID
    id: VmObjectId,

    options: CreateOptions,

    /// Allocator, cache hooks and tunables
    pub(crate) ctx: Arc<VmContext>,

    /// Size in bytes; written only under the page lock
    size: AtomicU64,

    /// Copy-on-write source
    parent: Option<Arc<VmObject>>,

    /// Offset of this object's origin in the parent
    parent_offset: u64,

    /// Length of the parent chain above this object
    depth: u32,

    /// Pager backing this object, only ever on a chain root
    pub(crate) page_source: Option<Arc<dyn PageSource>>,

    pub(crate) inner: Mutex<VmObjectInner>,

    /// Clones of this object; back-references only
    pub(crate) children: Mutex<BTreeMap<VmObjectId, Weak<VmObject>>>,

    /// Mappings of this object
    pub(crate) mappings: Mutex<MappingList>,

    name: Mutex<heapless::String<32>>,
}

fn round_size(size: u64) -> VmResult<u64> {
    match round_page(size) {
        Some(s) if s <= MAX_SIZE => Ok(s),
        _ => Err(VmError::OutOfRange),
    }
}

impl VmObject {
    fn new(
        ctx: &Arc<VmContext>,
        options: CreateOptions,
        size: u64,
        parent: Option<(Arc<VmObject>, u64)>,
        page_source: Option<Arc<dyn PageSource>>,
    ) -> Self {
        debug_assert!(parent.is_none() || page_source.is_none());
        let depth = parent.as_ref().map_or(0, |(p, _)| p.depth + 1);
        let (parent, parent_offset) = match parent {
            Some((p, offset)) => (Some(p), offset),
            None => (None, 0),
        };
        Self {
            id: VmObjectId::next(),
            options,
            ctx: Arc::clone(ctx),
            size: AtomicU64::new(size),
            parent,
            parent_offset,
            depth,
            page_source,
            inner: Mutex::new(VmObjectInner {
                page_list: VmPageList::new(),
                cache_policy: CachePolicy::Cached,
            }),
            children: Mutex::new(BTreeMap::new()),
            mappings: Mutex::new(MappingList::default()),
            name: Mutex::new(heapless::String::new()),
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create an anonymous object; pages are zero-filled on demand
    pub fn create(ctx: &Arc<VmContext>, options: CreateOptions, size: u64) -> VmResult<Arc<Self>> {
        if options.intersects(CreateOptions::CONTIGUOUS | CreateOptions::HAS_PAGER) {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        let vmo = Arc::new(Self::new(ctx, options, size, None, None));
        debug!("vm_object {}: created, size {:#x}", vmo.id.0, size);
        Ok(vmo)
    }

    /// Create a physically contiguous object with every page committed
    /// and pinned; the base is aligned to `1 << align_log2` bytes
    pub fn create_contiguous(ctx: &Arc<VmContext>, size: u64, align_log2: u8) -> VmResult<Arc<Self>> {
        if size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        let count = usize::try_from(bytes_to_pages(size)).map_err(|_| VmError::OutOfRange)?;
        let align_log2 = align_log2.max(PAGE_SHIFT as u8);

        let (base, pages) =
            ctx.allocator
                .alloc_contiguous(count, ctx.config.alloc_flags, align_log2)?;

        let vmo = Self::new(ctx, CreateOptions::CONTIGUOUS, size, None, None);
        {
            let mut inner = vmo.inner.lock();
            for (i, page) in pages.into_iter().enumerate() {
                zero_page_frame(&page);
                page.pin();
                vmo.add_page_locked(&mut inner, page, (i as u64) << PAGE_SHIFT)?;
            }
        }
        debug!(
            "vm_object {}: contiguous, size {:#x} at {:#x}",
            vmo.id.0, size, base
        );
        Ok(Arc::new(vmo))
    }

    /// Wrap `size` bytes of already resident frames starting at `base_pa`
    ///
    /// The frames never came from the allocator and are never returned to
    /// it; they stay pinned for the life of the object.
    pub fn create_from_wired_pages(ctx: &Arc<VmContext>, base_pa: u64, size: u64) -> VmResult<Arc<Self>> {
        if size == 0 || !is_page_aligned(base_pa) || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        if size > MAX_SIZE || base_pa.checked_add(size).is_none() {
            return Err(VmError::OutOfRange);
        }

        let vmo = Self::new(ctx, CreateOptions::empty(), size, None, None);
        {
            let mut inner = vmo.inner.lock();
            let mut offset = 0;
            while offset < size {
                let page = Arc::new(VmPage::new(base_pa + offset, PageState::Wired));
                page.pin();
                vmo.add_page_locked(&mut inner, page, offset)?;
                offset += PAGE_SIZE as u64;
            }
        }
        debug!("vm_object {}: wired, size {:#x} at {:#x}", vmo.id.0, size, base_pa);
        Ok(Arc::new(vmo))
    }

    /// Create an object whose pages are supplied by `source`
    pub fn create_external(
        ctx: &Arc<VmContext>,
        source: Arc<dyn PageSource>,
        options: CreateOptions,
        size: u64,
    ) -> VmResult<Arc<Self>> {
        if options.contains(CreateOptions::CONTIGUOUS) {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        let options = options | CreateOptions::HAS_PAGER;
        let vmo = Arc::new(Self::new(ctx, options, size, None, Some(source)));
        debug!("vm_object {}: pager backed, size {:#x}", vmo.id.0, size);
        Ok(vmo)
    }

    /// Create a copy-on-write clone of `[offset, offset + size)`
    ///
    /// The clone starts with no pages of its own; reads see this object's
    /// pages until either side writes.
    pub fn clone_cow(
        self: &Arc<Self>,
        offset: u64,
        size: u64,
        copy_name: bool,
        resizable: bool,
    ) -> VmResult<Arc<VmObject>> {
        let size = round_size(size)?;
        if !is_page_aligned(offset) {
            return Err(VmError::InvalidArgs);
        }
        if offset.checked_add(size).is_none() {
            return Err(VmError::OutOfRange);
        }
        if self.depth + 1 > self.ctx.config.max_clone_depth {
            return Err(VmError::BadState);
        }

        let inner = self.inner.lock();
        if inner.cache_policy != CachePolicy::Cached {
            return Err(VmError::BadState);
        }

        let options = if resizable {
            CreateOptions::RESIZABLE
        } else {
            CreateOptions::empty()
        };
        let child = Arc::new(Self::new(
            &self.ctx,
            options,
            size,
            Some((Arc::clone(self), offset)),
            None,
        ));

        // Linked before anything else can see the child; its Drop unlinks it
        self.children.lock().insert(child.id, Arc::downgrade(&child));

        if copy_name {
            *child.name.lock() = self.name.lock().clone();
        }
        drop(inner);

        debug!(
            "vm_object {}: cloned from {} at {:#x}, size {:#x}",
            child.id.0, self.id.0, offset, size
        );
        Ok(child)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    /// Get object size
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn options(&self) -> CreateOptions {
        self.options
    }

    pub fn is_resizable(&self) -> bool {
        self.options.contains(CreateOptions::RESIZABLE)
    }

    pub fn is_contiguous(&self) -> bool {
        self.options.contains(CreateOptions::CONTIGUOUS)
    }

    pub fn has_page_source(&self) -> bool {
        self.page_source.is_some()
    }

    pub fn parent(&self) -> Option<&Arc<VmObject>> {
        self.parent.as_ref()
    }

    pub fn parent_offset(&self) -> u64 {
        self.parent_offset
    }

    /// Number of ancestors
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Page source at the root of this object's chain, if any
    pub(crate) fn root_page_source(&self) -> Option<&Arc<dyn PageSource>> {
        let mut obj = self;
        loop {
            if let Some(source) = &obj.page_source {
                return Some(source);
            }
            match &obj.parent {
                Some(parent) => obj = parent,
                None => return None,
            }
        }
    }

    pub fn name(&self) -> heapless::String<32> {
        self.name.lock().clone()
    }

    /// Set the object name, truncated to [`MAX_NAME_LEN`] bytes
    pub fn set_name(&self, name: &str) {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut stored = heapless::String::new();
        // Cannot fail: `end` is within capacity
        let _ = stored.push_str(&name[..end]);
        *self.name.lock() = stored;
    }

    // ========================================================================
    // Cache Policy
    // ========================================================================

    pub fn cache_policy(&self) -> CachePolicy {
        self.inner.lock().cache_policy
    }

    /// Change the cache policy; only allowed on an empty, unmapped,
    /// unrelated object
    pub fn set_cache_policy(&self, policy: CachePolicy) -> VmResult<()> {
        let mut inner = self.inner.lock();
        if !inner.page_list.is_empty()
            || self.mappings.lock().len() != 0
            || !self.children.lock().is_empty()
            || self.parent.is_some()
        {
            return Err(VmError::BadState);
        }
        inner.cache_policy = policy;
        Ok(())
    }

    // ========================================================================
    // Mappings and Children
    // ========================================================================

    /// Register a mapping to be told about range changes
    pub fn add_mapping(&self, listener: Arc<dyn RangeChangeListener>) -> MappingId {
        let _inner = self.inner.lock();
        self.mappings.lock().add(listener)
    }

    pub fn remove_mapping(&self, id: MappingId) -> VmResult<()> {
        let _inner = self.inner.lock();
        if self.mappings.lock().remove(id) {
            Ok(())
        } else {
            Err(VmError::NotFound)
        }
    }

    pub fn num_mappings(&self) -> usize {
        self.mappings.lock().len()
    }

    pub fn num_children(&self) -> usize {
        self.children.lock().len()
    }

    /// Children still alive, collected without holding the child list
    pub(crate) fn live_children(&self) -> Vec<Arc<VmObject>> {
        self.children
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn remove_child(&self, id: VmObjectId) {
        let removed = self.children.lock().remove(&id);
        debug_assert!(removed.is_some(), "child {} not linked", id.0);
    }

    // ========================================================================
    // Resize
    // ========================================================================

    /// Change the object size, rounded up to a page
    ///
    /// Shrinking frees the pages past the new end and fails if any of them
    /// is pinned. Mappings are told before the size changes.
    pub fn resize(&self, new_size: u64) -> VmResult<()> {
        if !self.is_resizable() {
            return Err(VmError::Unavailable);
        }
        let new_size = round_size(new_size)?;

        let mut inner = self.inner.lock();
        let size = self.size();
        if new_size == size {
            return Ok(());
        }

        if new_size < size {
            if self.any_pages_pinned_locked(&inner, new_size, size - new_size) {
                return Err(VmError::BadState);
            }
            self.range_change_update(new_size, size - new_size);
            let freed = inner.page_list.remove_pages(new_size, size);
            self.free_pages(freed);
        } else {
            // Drop stale "not present" translations over the new tail
            self.range_change_update(size, new_size - size);
        }

        self.size.store(new_size, Ordering::Release);
        debug!("vm_object {}: resized {:#x} -> {:#x}", self.id.0, size, new_size);
        Ok(())
    }

    // ========================================================================
    // Page Accounting
    // ========================================================================

    /// Pages owned by this object in `[offset, offset + len)`
    pub fn allocated_pages_in_range(&self, offset: u64, len: u64) -> usize {
        let inner = self.inner.lock();
        let Some(new_len) = trim_range(offset, len, self.size()) else {
            return 0;
        };
        let start = trunc_page(offset);
        let end = round_page(offset + new_len).unwrap_or(MAX_SIZE);
        inner.page_list.count_in_range(start, end)
    }

    /// Pages owned by this object
    pub fn allocated_pages(&self) -> usize {
        self.inner.lock().page_list.len()
    }

    /// Log a summary of the object
    pub fn dump(&self) {
        let inner = self.inner.lock();
        info!(
            "vm_object {} '{}': size {:#x} options {:?} pages {} cache {:?} parent {:?}@{:#x} children {} mappings {} pager {}",
            self.id.0,
            self.name.lock().as_str(),
            self.size(),
            self.options,
            inner.page_list.len(),
            inner.cache_policy,
            self.parent.as_ref().map(|p| p.id.0),
            self.parent_offset,
            self.children.lock().len(),
            self.mappings.lock().len(),
            self.page_source.is_some(),
        );
    }

    // ========================================================================
    // Internal Helpers
    // ========================================================================

    /// Insert a page this object now owns
    pub(crate) fn add_page_locked(
        &self,
        inner: &mut VmObjectInner,
        page: PageRef,
        offset: u64,
    ) -> VmResult<()> {
        debug_assert!(offset < self.size());
        if !page.is_wired() {
            page.set_state(PageState::Object);
        }
        inner.page_list.add_page(page, offset)
    }

    pub(crate) fn any_pages_pinned_locked(&self, inner: &VmObjectInner, offset: u64, len: u64) -> bool {
        let start = trunc_page(offset);
        let end = round_page(offset.saturating_add(len)).unwrap_or(MAX_SIZE);
        let mut pinned = false;
        let _ = inner.page_list.for_every_page_in_range(
            |page, _| {
                pinned = page.is_pinned();
                Ok(if pinned { IterAction::Stop } else { IterAction::Next })
            },
            start,
            end,
        );
        pinned
    }

    /// Hand pages back to the allocator; wired frames are simply dropped
    pub(crate) fn free_pages(&self, pages: PageList) {
        let pages: PageList = pages.into_iter().filter(|p| !p.is_wired()).collect();
        if !pages.is_empty() {
            self.ctx.allocator.free(pages);
        }
    }
}

/// Clamp `[offset, offset + len)` to `size`; `None` if `offset` is past it
pub(crate) fn trim_range(offset: u64, len: u64, size: u64) -> Option<u64> {
    if offset > size {
        return None;
    }
    Some(len.min(size - offset))
}

/// Whether `[offset, offset + len)` lies inside `size`
pub(crate) fn in_range(offset: u64, len: u64, size: u64) -> bool {
    offset.checked_add(len).is_some_and(|end| end <= size)
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id.0)
            .field("size", &self.size())
            .field("options", &self.options)
            .field("parent", &self.parent.as_ref().map(|p| p.id.0))
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            parent.remove_child(self.id);
        }

        let contiguous = self.is_contiguous();
        let pages = self.inner.get_mut().page_list.remove_all_pages();
        let mut to_free = Vec::with_capacity(pages.len());
        for page in pages {
            if page.is_wired() {
                while page.is_pinned() {
                    page.unpin();
                }
                continue;
            }
            if contiguous {
                page.unpin();
            }
            if page.is_pinned() {
                error!(
                    "vm_object {}: destroyed with pinned page {:#x}, leaking it",
                    self.id.0,
                    page.phys_addr()
                );
                continue;
            }
            to_free.push(page);
        }
        if !to_free.is_empty() {
            self.ctx.allocator.free(to_free);
        }

        if let Some(source) = &self.page_source {
            source.close();
        }
        debug!("vm_object {}: destroyed", self.id.0);
    }
}
