//! Mach_VMO - paged virtual memory objects
//!
//! A VM object is a resizable, byte addressable collection of physical
//! pages. This crate implements the paged variant:
//!
//! - `vm_page`: page descriptors, physmap helpers and the shared zero page
//! - `vm_page_list`: the sparse per-object page table and splice lists
//! - `pmm`: the physical page allocator interface and an arena allocator
//! - `page_source`: external pagers, page requests and the pager queue
//! - `vm_object`: object lifecycle, clones, resize and cache policy
//! - `vm_fault`: fault resolution through the copy-on-write chain
//! - `vm_range`: commit, decommit, pin, read/write, lookup and cache ops
//! - `vm_splice`: handing page runs to and from a pager
//! - `range_change`: invalidating mappings and children on range changes

#![no_std]

extern crate alloc;

pub mod cache;
pub mod config;
pub mod error;
pub mod page_source;
pub mod pmm;
pub mod range_change;
pub mod vm_fault;
pub mod vm_object;
pub mod vm_page;
pub mod vm_page_list;
pub mod vm_range;
pub mod vm_splice;

#[cfg(test)]
pub(crate) mod test_util;

pub use cache::{CacheMaintenance, CacheOpType, CachePolicy, CoherentCache};
pub use config::{VmConfig, VmContext};
pub use error::{VmError, VmResult};
pub use page_source::{PageRequest, PageSource, PagerQueue, RequestState};
pub use pmm::{AllocFlags, PageAllocator, PageArena};
pub use range_change::{MappingId, RangeChangeListener};
pub use vm_fault::{stats, FaultFlags, FaultStats, VmStatsSnapshot};
pub use vm_object::{CreateOptions, VmObject, VmObjectId, MAX_NAME_LEN};
pub use vm_page::{zero_page, PageList, PageRef, PageState, VmPage, PAGE_SHIFT, PAGE_SIZE};
pub use vm_page_list::{IterAction, SpliceList, VmPageList, MAX_SIZE};
pub use vm_range::LookupAction;
