/// The result of iteration of this map is not ordered.
///
/// Please do not rely on any specific order.
pub type FastMap<K, V> = ::std::collections::HashMap<K, V, ahash::RandomState>;

/// The result of iteration of this set is not ordered.
///
/// Please do not rely on any specific order.
pub type FastSet<K> = ::std::collections::HashSet<K, ahash::RandomState>;

/// Iteration order is deterministic and sorted by key.
pub type StableMap<K, V> = ::std::collections::BTreeMap<K, V>;

/// Iteration order is deterministic and sorted by key.
pub type StableSet<K> = ::std::collections::BTreeSet<K>;
