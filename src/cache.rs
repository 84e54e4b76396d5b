//! Metadata cache adapter
//!
//! Optional read-through cache in front of the directory client, used only
//! for capability statements and other metadata responses. History and
//! search pages are never cached. An external backend (the `host`/`port`
//! cache options) plugs in behind the same trait; this crate ships the
//! in-memory implementation.

use crate::config::CacheConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache key: directory, operation, and a hash of the request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub directory_id: String,
    pub operation: String,
    pub param_hash: u64,
}

impl CacheKey {
    pub fn new(directory_id: &str, operation: &str, params: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        params.hash(&mut hasher);
        Self {
            directory_id: directory_id.to_string(),
            operation: operation.to_string(),
            param_hash: hasher.finish(),
        }
    }
}

/// Read-through cache for metadata responses.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<Value>;
    async fn put(&self, key: CacheKey, value: Value);
    /// Drops every entry belonging to a directory. Called when a pass fails
    /// with a transport error so a recovering directory is re-probed.
    async fn invalidate_directory(&self, directory_id: &str);
}

struct CachedEntry {
    inserted: Instant,
    value: Value,
}

/// In-memory TTL cache keyed per namespace.
pub struct InMemoryMetadataCache {
    namespace: String,
    ttl: Duration,
    entries: DashMap<String, CachedEntry>,
}

impl InMemoryMetadataCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            namespace: config.default_cache_namespace.clone(),
            ttl: Duration::from_secs(config.object_ttl),
            entries: DashMap::new(),
        }
    }

    fn storage_key(&self, key: &CacheKey) -> String {
        format!(
            "{}:{}:{}:{:x}",
            self.namespace, key.directory_id, key.operation, key.param_hash
        )
    }

    fn directory_prefix(&self, directory_id: &str) -> String {
        format!("{}:{}:", self.namespace, directory_id)
    }
}

#[async_trait]
impl MetadataCache for InMemoryMetadataCache {
    async fn get(&self, key: &CacheKey) -> Option<Value> {
        let storage_key = self.storage_key(key);
        let expired = match self.entries.get(&storage_key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(&storage_key);
        }
        None
    }

    async fn put(&self, key: CacheKey, value: Value) {
        self.entries.insert(
            self.storage_key(&key),
            CachedEntry {
                inserted: Instant::now(),
                value,
            },
        );
    }

    async fn invalidate_directory(&self, directory_id: &str) {
        let prefix = self.directory_prefix(directory_id);
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }
}

/// Builds the cache configured for this deployment. External backends are a
/// deployment concern behind [`MetadataCache`]; unless one is wired in, the
/// in-memory cache is used (the `host`/`port` options then only document
/// intent).
pub fn build_cache(config: &CacheConfig) -> Arc<dyn MetadataCache> {
    Arc::new(InMemoryMetadataCache::new(config))
}
