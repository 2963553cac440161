//! Prepared-statement caching.
//!
//! The cursor engine prepares parameterized queries through
//! `sp_cursorprepexec` and reuses the server-assigned handle through
//! `sp_cursorexecute`. This module maps `(query text, parameter type
//! fingerprint)` to that handle with a selectable replacement policy.
//!
//! Handles become invalid when the server reports one of the invalidation
//! errors (586, 8144, 8178, 8179); the engine then removes the entry and
//! re-prepares once.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::binding::Binding;
use crate::config::StatementCacheSpec;

/// Sentinel handle meaning "not prepared".
///
/// Passed as the handle parameter of `sp_cursorprepexec` to request a fresh
/// preparation.
pub const UNPREPARED: i32 = 0;

/// Cache key: query text plus the ordered formal parameter type declarations.
/// Parameter values are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    sql: String,
    fingerprint: String,
}

impl CacheKey {
    fn new(sql: &str, binding: &Binding) -> Self {
        Self {
            sql: sql.to_string(),
            fingerprint: binding.type_fingerprint(),
        }
    }
}

#[derive(Debug)]
enum CachePolicy {
    Unbounded(HashMap<CacheKey, i32>),
    Lru(LruCache<CacheKey, i32>),
    Disabled,
}

/// Prepared-statement cache with a selectable replacement policy.
#[derive(Debug)]
pub struct PreparedStatementCache {
    policy: CachePolicy,
}

impl PreparedStatementCache {
    /// Create a cache from a configuration selector.
    #[must_use]
    pub fn from_spec(spec: StatementCacheSpec) -> Self {
        match spec {
            StatementCacheSpec::Disabled => Self::disabled(),
            StatementCacheSpec::Unbounded => Self::unbounded(),
            StatementCacheSpec::Lru(capacity) => Self::lru(capacity.max(1)),
        }
    }

    /// Create a cache that grows without eviction.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            policy: CachePolicy::Unbounded(HashMap::new()),
        }
    }

    /// Create a bounded cache evicting the least recently used entry.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn lru(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("LRU capacity must be non-zero");
        Self {
            policy: CachePolicy::Lru(LruCache::new(capacity)),
        }
    }

    /// Create a cache that never stores anything; every lookup answers
    /// [`UNPREPARED`].
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            policy: CachePolicy::Disabled,
        }
    }

    /// Look up the prepared handle for a query and binding.
    ///
    /// Returns [`UNPREPARED`] when no handle is cached. Updates the LRU order
    /// on the bounded variant.
    pub fn get_handle(&mut self, sql: &str, binding: &Binding) -> i32 {
        let key = CacheKey::new(sql, binding);
        let handle = match &mut self.policy {
            CachePolicy::Unbounded(map) => map.get(&key).copied(),
            CachePolicy::Lru(cache) => cache.get(&key).copied(),
            CachePolicy::Disabled => None,
        };

        match handle {
            Some(handle) => {
                tracing::trace!(sql, handle, "prepared statement cache hit");
                handle
            }
            None => {
                tracing::trace!(sql, "prepared statement cache miss");
                UNPREPARED
            }
        }
    }

    /// Store a freshly prepared handle.
    pub fn put_handle(&mut self, handle: i32, sql: &str, binding: &Binding) {
        let key = CacheKey::new(sql, binding);
        match &mut self.policy {
            CachePolicy::Unbounded(map) => {
                tracing::debug!(sql, handle, "caching prepared statement handle");
                map.insert(key, handle);
            }
            CachePolicy::Lru(cache) => {
                tracing::debug!(sql, handle, "caching prepared statement handle");
                cache.put(key, handle);
            }
            CachePolicy::Disabled => {}
        }
    }

    /// Remove an invalidated handle.
    pub fn invalidate(&mut self, sql: &str, binding: &Binding) {
        let key = CacheKey::new(sql, binding);
        let removed = match &mut self.policy {
            CachePolicy::Unbounded(map) => map.remove(&key),
            CachePolicy::Lru(cache) => cache.pop(&key),
            CachePolicy::Disabled => None,
        };

        if let Some(handle) = removed {
            tracing::debug!(sql, handle, "invalidated prepared statement handle");
        }
    }

    /// Number of cached handles.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.policy {
            CachePolicy::Unbounded(map) => map.len(),
            CachePolicy::Lru(cache) => cache.len(),
            CachePolicy::Disabled => 0,
        }
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
