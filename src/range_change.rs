//! Range Change Propagation
//!
//! Whenever the backing of a byte range changes (a page is installed,
//! replaced or freed, or the size moves), every mapping of the object and
//! every copy-on-write child must drop translations covering that range.
//! Mappings are told through [`RangeChangeListener`]; children are walked
//! through their parent's back-references, translated into their own
//! offset space.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::vm_object::VmObject;
use crate::vm_page::{round_page, trunc_page};

/// Mapping layer hook for one mapping of a VM object
///
/// Called with the object's lock held; implementations must not call back
/// into the object.
pub trait RangeChangeListener: Send + Sync {
    /// Invalidate translations of `[offset, offset + len)`, page aligned
    fn range_change_update(&self, offset: u64, len: u64);
}

/// Handle for a registered mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(pub u64);

impl MappingId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        MappingId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Mappings registered on one object
#[derive(Default)]
pub(crate) struct MappingList {
    entries: Vec<(MappingId, Arc<dyn RangeChangeListener>)>,
}

impl MappingList {
    pub(crate) fn add(&mut self, listener: Arc<dyn RangeChangeListener>) -> MappingId {
        let id = MappingId::next();
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: MappingId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(mid, _)| *mid != id);
        self.entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn notify(&self, offset: u64, len: u64) {
        for (_, listener) in &self.entries {
            listener.range_change_update(offset, len);
        }
    }
}

/// Intersect `[offset, offset + len)` with `[start, start + size)`
fn intersect(start: u64, size: u64, offset: u64, len: u64) -> Option<(u64, u64)> {
    let lo = offset.max(start);
    let hi = offset.saturating_add(len).min(start.saturating_add(size));
    (lo < hi).then(|| (lo, hi - lo))
}

impl VmObject {
    /// Tell mappings and children that `[offset, offset + len)` changed
    ///
    /// Takes only leaf locks (mapping and child lists) of this object and
    /// its descendants, so it is safe to call with page locks held.
    pub(crate) fn range_change_update(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let aligned_offset = trunc_page(offset);
        let aligned_end = round_page(offset.saturating_add(len)).unwrap_or(u64::MAX);
        self.mappings
            .lock()
            .notify(aligned_offset, aligned_end - aligned_offset);

        for child in self.live_children() {
            child.range_change_update_from_parent(offset, len);
        }
    }

    fn range_change_update_from_parent(&self, offset: u64, len: u64) {
        let Some((offset_new, len_new)) =
            intersect(self.parent_offset(), self.size(), offset, len)
        else {
            return;
        };
        debug_assert!(offset_new >= self.parent_offset());
        self.range_change_update(offset_new - self.parent_offset(), len_new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect() {
        assert_eq!(intersect(0x1000, 0x2000, 0, 0x1800), Some((0x1000, 0x800)));
        assert_eq!(intersect(0x1000, 0x2000, 0x2000, 0x4000), Some((0x2000, 0x1000)));
        assert_eq!(intersect(0x1000, 0x2000, 0x3000, 0x1000), None);
        assert_eq!(intersect(0x1000, 0x2000, 0, 0x1000), None);
        assert_eq!(intersect(0, u64::MAX, u64::MAX - 1, 10), Some((u64::MAX - 1, 1)));
    }

    struct Nop;
    impl RangeChangeListener for Nop {
        fn range_change_update(&self, _offset: u64, _len: u64) {}
    }

    #[test]
    fn test_mapping_list() {
        let mut list = MappingList::default();
        let a = list.add(Arc::new(Nop));
        let b = list.add(Arc::new(Nop));
        assert_ne!(a, b);
        assert_eq!(list.len(), 2);
        assert!(list.remove(a));
        assert!(!list.remove(a));
        assert_eq!(list.len(), 1);
    }
}
