//! Hashed indexes used by the engine and the walker.
//!
//! `synchronize` and `patch` index a snapshot by path and by digest once per
//! call. Those keys are short strings, so the `gxhash` feature swaps in its
//! AES-based hasher; without the feature (CPUs lacking AES-NI, docs.rs) the
//! std `RandomState` is used. Either way the types are plain std maps.

use std::collections::{HashMap, HashSet};

#[cfg(feature = "gxhash")]
type IndexHasher = gxhash::GxBuildHasher;

#[cfg(not(feature = "gxhash"))]
type IndexHasher = std::collections::hash_map::RandomState;

/// Map keyed by path or digest
pub type FastMap<K, V> = HashMap<K, V, IndexHasher>;

/// Set of paths
pub type FastSet<T> = HashSet<T, IndexHasher>;

/// Empty [`FastMap`] sized for `capacity` keys
pub fn map_with_capacity<K, V>(capacity: usize) -> FastMap<K, V> {
    FastMap::with_capacity_and_hasher(capacity, IndexHasher::default())
}

/// Empty [`FastSet`] sized for `capacity` items
pub fn set_with_capacity<T>(capacity: usize) -> FastSet<T> {
    FastSet::with_capacity_and_hasher(capacity, IndexHasher::default())
}
