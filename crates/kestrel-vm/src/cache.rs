//! Polymorphic inline caches for `INVOKE` call sites
//!
//! Each call site remembers up to [`CACHE_WAYS`] (class id, method) pairs.
//! Slots are filled first-empty and never evicted; once a site has seen more
//! receiver classes than it has ways, lookups for the extra classes go
//! straight to method resolution.
//!
//! Method tables may change at runtime, so every cache records the global
//! method epoch it was filled under. Any method definition or superclass change
//! bumps the epoch, and a cache that observes a newer epoch empties itself
//! before it is consulted.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::object::Class;
use crate::symbol_registry::Symbol;
use crate::value::Value;

/// Number of entries per call site
pub const CACHE_WAYS: usize = 4;

static METHOD_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Current method epoch
#[inline]
pub fn method_epoch() -> u64 {
    METHOD_EPOCH.load(Ordering::Acquire)
}

/// Invalidate every inline cache
pub fn bump_method_epoch() {
    let epoch = METHOD_EPOCH.fetch_add(1, Ordering::AcqRel) + 1;
    tracing::trace!(epoch, "method epoch bumped");
}

#[derive(Default)]
struct CacheState {
    epoch: u64,
    entries: [Option<(u64, Value)>; CACHE_WAYS],
}

/// Hit/miss counters of one call site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that needed method resolution
    pub misses: u64,
    /// Occupied ways
    pub filled: usize,
}

/// Inline cache of one call site
#[derive(Default)]
pub struct InlineCache {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InlineCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name` on `class`, consulting and filling the cache
    pub fn lookup(&self, class: &Class, name: Symbol) -> Option<Value> {
        let epoch = method_epoch();
        {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                if state.entries.iter().any(Option::is_some) {
                    tracing::debug!(method = %name, "inline cache invalidated");
                }
                state.entries = Default::default();
                state.epoch = epoch;
            }
            let hit = state
                .entries
                .iter()
                .flatten()
                .find(|(id, _)| *id == class.id)
                .map(|(_, method)| method.clone());
            if hit.is_some() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return hit;
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let method = class.find_method(name)?;

        let mut state = self.state.lock();
        // Filled under an older epoch would be stale on the next probe anyway
        if state.epoch == epoch {
            if let Some(slot) = state.entries.iter_mut().find(|e| e.is_none()) {
                *slot = Some((class.id, method.clone()));
            }
        }
        Some(method)
    }

    /// Counters for this site
    pub fn stats(&self) -> CacheStats {
        let filled = self.state.lock().entries.iter().flatten().count();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            filled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Other tests define methods concurrently and bump the shared epoch, so
    // counters are checked with slack rather than exact values.
    #[test]
    fn test_hits_after_first_miss() {
        let class = Class::new("Point");
        let name = Symbol::intern("norm");
        class.define_method(name, Value::Int(1));

        let cache = InlineCache::new();
        for _ in 0..100 {
            assert_eq!(cache.lookup(&class, name), Some(Value::Int(1)));
        }

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 100);
        assert!(stats.misses >= 1);
        assert!(stats.hits > 50);
    }

    #[test]
    fn test_saturated_cache_never_evicts() {
        let name = Symbol::intern("area");
        let classes: Vec<_> = (0..6)
            .map(|i| {
                let c = Class::new(format!("Shape{i}"));
                c.define_method(name, Value::Int(i));
                c
            })
            .collect();

        let cache = InlineCache::new();
        for _ in 0..3 {
            for (i, class) in classes.iter().enumerate() {
                assert_eq!(cache.lookup(class, name), Some(Value::Int(i as i64)));
            }
        }
        assert!(cache.stats().filled <= CACHE_WAYS);
        // Shape4 and Shape5 never fit, so every one of their lookups misses
        assert!(cache.stats().misses >= 6);
    }

    #[test]
    fn test_redefinition_invalidates() {
        let class = Class::new("Counter");
        let name = Symbol::intern("step");
        class.define_method(name, Value::Int(1));

        let cache = InlineCache::new();
        assert_eq!(cache.lookup(&class, name), Some(Value::Int(1)));
        class.define_method(name, Value::Int(2));
        assert_eq!(cache.lookup(&class, name), Some(Value::Int(2)));
    }
}
