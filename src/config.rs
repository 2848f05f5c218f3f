//! VM Configuration
//!
//! Tunables and the collaborators shared by every object created from
//! one [`VmContext`].

use alloc::sync::Arc;

use crate::cache::{CacheMaintenance, CoherentCache};
use crate::pmm::{AllocFlags, PageAllocator};

/// Largest pin count a page descriptor can hold (5-bit field)
pub const VM_PAGE_MAX_PIN_COUNT: u32 = 31;

/// Default bound on copy-on-write chain length
pub const DEFAULT_MAX_CLONE_DEPTH: u32 = 64;

/// VM tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Pins beyond this count fail with `Unavailable`
    pub max_pin_count: u32,
    /// Clones deeper than this fail with `BadState`
    pub max_clone_depth: u32,
    /// Let page sources coalesce contiguous requests during a commit
    pub batch_pager_requests: bool,
    /// Allocation hint passed to the allocator for every object
    pub alloc_flags: AllocFlags,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_pin_count: VM_PAGE_MAX_PIN_COUNT,
            max_clone_depth: DEFAULT_MAX_CLONE_DEPTH,
            batch_pager_requests: false,
            alloc_flags: AllocFlags::ANY,
        }
    }
}

/// Collaborators shared by a family of VM objects
pub struct VmContext {
    pub(crate) allocator: Arc<dyn PageAllocator>,
    pub(crate) cache: Arc<dyn CacheMaintenance>,
    pub(crate) config: VmConfig,
}

impl VmContext {
    /// Context with coherent caches and default tunables
    pub fn new(allocator: Arc<dyn PageAllocator>) -> Arc<Self> {
        Self::with_config(allocator, Arc::new(CoherentCache), VmConfig::default())
    }

    pub fn with_config(
        allocator: Arc<dyn PageAllocator>,
        cache: Arc<dyn CacheMaintenance>,
        config: VmConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            cache,
            config,
        })
    }

    pub fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }
}
