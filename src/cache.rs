//! Cache Policy and Maintenance
//!
//! The instruction sequences live outside this crate; objects reach them
//! through [`CacheMaintenance`], called with kernel virtual addresses
//! from the physmap.

/// Mapping cache policy of a VM object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    Cached,
    Uncached,
    WriteCombining,
}

/// Cache maintenance operation over a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOpType {
    Invalidate,
    Clean,
    CleanInvalidate,
    /// Make instruction fetches coherent with data writes
    Sync,
}

/// Architecture cache maintenance hooks
pub trait CacheMaintenance: Send + Sync {
    fn clean(&self, vaddr: usize, len: usize);
    fn invalidate(&self, vaddr: usize, len: usize);
    fn clean_invalidate(&self, vaddr: usize, len: usize);
    fn sync(&self, vaddr: usize, len: usize);

    /// Whether data caches are coherent with device accesses
    fn coherent(&self) -> bool {
        true
    }

    /// Dispatch one operation
    fn apply(&self, op: CacheOpType, vaddr: usize, len: usize) {
        match op {
            CacheOpType::Invalidate => self.invalidate(vaddr, len),
            CacheOpType::Clean => self.clean(vaddr, len),
            CacheOpType::CleanInvalidate => self.clean_invalidate(vaddr, len),
            CacheOpType::Sync => self.sync(vaddr, len),
        }
    }
}

/// Maintenance for fully coherent machines: every operation is a no-op
#[derive(Debug, Default, Clone, Copy)]
pub struct CoherentCache;

impl CacheMaintenance for CoherentCache {
    fn clean(&self, _vaddr: usize, _len: usize) {}
    fn invalidate(&self, _vaddr: usize, _len: usize) {}
    fn clean_invalidate(&self, _vaddr: usize, _len: usize) {}
    fn sync(&self, _vaddr: usize, _len: usize) {}
}
