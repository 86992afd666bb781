//! Bounded cache of loaded class objects.
//!
//! Class descriptors and their index handles are loaded on first reference
//! and kept under a concurrent table. When the table grows past its target
//! size, entries no longer referenced outside the cache are evicted in
//! least-recently-used order. Eviction reclaims memory only; persistent
//! state is never touched, and a later reference simply reloads the class
//! from the catalog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::class::{ClassDescriptor, ClassId};
use crate::index::ClassIndex;

/// Default target size of the class object cache.
pub const DEFAULT_CLASS_CACHE_SIZE: usize = 1024;

/// A loaded class: its descriptor plus, for indexed classes, the handle to
/// its persistent membership index.
pub struct ClassEntry {
    /// Compiled descriptor.
    pub descriptor: Arc<ClassDescriptor>,
    /// Index handle; None for escape-list classes.
    pub index: Option<Arc<ClassIndex>>,
}

struct CacheSlot {
    entry: Arc<ClassEntry>,
    last_used: AtomicU64,
}

/// Bounded, reference-counted class object cache.
pub struct ClassObjectCache {
    table: DashMap<ClassId, CacheSlot>,
    capacity: usize,
    clock: AtomicU64,
}

impl ClassObjectCache {
    /// Create a cache with the given target size.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: DashMap::new(),
            capacity,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a loaded class, marking it recently used.
    pub fn get(&self, class: ClassId) -> Option<Arc<ClassEntry>> {
        let slot = self.table.get(&class)?;
        slot.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&slot.entry))
    }

    /// Publish a loaded class, evicting cold unreferenced entries if the
    /// cache is over its target size.
    pub fn insert(&self, class: ClassId, entry: Arc<ClassEntry>) {
        self.table.insert(
            class,
            CacheSlot {
                entry,
                last_used: AtomicU64::new(self.tick()),
            },
        );
        self.evict_over_capacity();
    }

    /// Drop a class from the cache (its persistent state is unaffected).
    pub fn remove(&self, class: ClassId) -> Option<Arc<ClassEntry>> {
        self.table.remove(&class).map(|(_, slot)| slot.entry)
    }

    /// Whether the class is currently loaded.
    pub fn contains(&self, class: ClassId) -> bool {
        self.table.contains_key(&class)
    }

    /// Number of loaded classes.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Remove every entry (used by rebuild).
    pub fn clear(&self) {
        self.table.clear();
    }

    /// Evict least-recently-used entries whose only reference is the cache
    /// itself, until the table is back at its target size or nothing else is
    /// evictable.
    fn evict_over_capacity(&self) {
        while self.table.len() > self.capacity {
            let mut victim: Option<(ClassId, u64)> = None;
            for slot in self.table.iter() {
                if Arc::strong_count(&slot.entry) > 1 {
                    continue; // still referenced by a reader or the trie
                }
                let used = slot.last_used.load(Ordering::Relaxed);
                if victim.map_or(true, |(_, best)| used < best) {
                    victim = Some((*slot.key(), used));
                }
            }
            let Some((class, _)) = victim else {
                break; // everything pinned; stay over target
            };
            self.table.remove(&class);
            debug!(class, "evicted class object from cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassDef, ClassState, Condition};
    use taxodb_proto::{PredicateExpr, Value};

    fn entry(id: ClassId) -> Arc<ClassEntry> {
        let def = ClassDef::new(
            id,
            format!("c{id}"),
            Condition::Single(PredicateExpr::Gt {
                prop: 1,
                value: Value::Int32(0),
            }),
        );
        Arc::new(ClassEntry {
            descriptor: Arc::new(ClassDescriptor::from_def(def, ClassState::Active)),
            index: None,
        })
    }

    #[test]
    fn test_get_and_remove() {
        let cache = ClassObjectCache::new(4);
        cache.insert(1, entry(1));
        assert!(cache.contains(1));
        assert_eq!(cache.get(1).unwrap().descriptor.id(), 1);
        assert!(cache.get(2).is_none());

        cache.remove(1);
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_eviction_over_capacity() {
        let cache = ClassObjectCache::new(2);
        cache.insert(1, entry(1));
        cache.insert(2, entry(2));
        // Touch 1 so 2 is the cold entry.
        cache.get(1);
        cache.insert(3, entry(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_referenced_entries_are_pinned() {
        let cache = ClassObjectCache::new(1);
        let pinned = entry(1);
        cache.insert(1, Arc::clone(&pinned));
        cache.insert(2, entry(2));

        // Entry 1 is older but held outside the cache; 2 must go instead.
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        drop(pinned);

        // Once the outside reference is gone, the next insert can evict it.
        cache.insert(3, entry(3));
        assert!(!cache.contains(1));
        assert!(cache.contains(3));
    }
}
