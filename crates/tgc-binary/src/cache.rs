//! Identity-keyed descriptor cache.
//!
//! Keys are the graph's stable handles, never descriptor content.
//! Consequences the tests pin down: a shared [`LayoutId`] yields one
//! pooled descriptor however many tensors carry it, and two interned
//! layouts with equal content yield two descriptors. Tensor
//! descriptors are keyed per value, so distinct values of identical
//! type each get their own record.

use rustc_hash::FxHashMap;
use tgc_graph::{LayoutId, ValueId};

/// What a pooled descriptor describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The memory-buffer record of a layout.
    Memory(LayoutId),
    /// The layout record itself.
    Layout(LayoutId),
    /// A tensor value's type record.
    Tensor(ValueId),
}

/// Map from identity key to pool offset of the written descriptor.
#[derive(Debug, Default)]
pub struct ObjectCache {
    offsets: FxHashMap<CacheKey, u32>,
}

impl ObjectCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool offset of an already-written descriptor, if any.
    #[must_use]
    pub fn get(&self, key: CacheKey) -> Option<u32> {
        self.offsets.get(&key).copied()
    }

    /// Record a freshly written descriptor's offset.
    pub fn insert(&mut self, key: CacheKey, offset: u32) {
        let prior = self.offsets.insert(key, offset);
        debug_assert!(prior.is_none(), "descriptor written twice for one key");
    }

    /// Number of distinct descriptors written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_identity_not_kind() {
        let mut cache = ObjectCache::new();
        let lid = LayoutId(0);

        cache.insert(CacheKey::Memory(lid), 1);
        cache.insert(CacheKey::Layout(lid), 40);

        // Same handle, different descriptor kinds: distinct entries.
        assert_eq!(cache.get(CacheKey::Memory(lid)), Some(1));
        assert_eq!(cache.get(CacheKey::Layout(lid)), Some(40));
        assert_eq!(cache.get(CacheKey::Memory(LayoutId(1))), None);
        assert_eq!(cache.len(), 2);
    }
}
