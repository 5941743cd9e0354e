//! Versioned cache storage: named sub-caches inside a deployment
//! generation, with bounded size and lazy expiry.
//!
//! Cache names follow `<prefix>-<subcache>-<version>`. The version tag
//! isolates generations from each other; activation deletes every cache
//! whose tag is not the current one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

use seawall_common::{millis_since, now_millis};
use seawall_fetch::FetchResponse;

use crate::config::{CacheTuning, CacheTunings};
use crate::routes::SubCache;

/// Errors from the cache backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// A stored response, in a form durable backends can serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub url: Url,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub opaque: bool,
    /// Manifest revision, for entries stored by the installer. Precached
    /// entries are pinned: they never expire or get evicted, they turn
    /// over with the generation.
    pub revision: Option<String>,
    /// Unix-epoch milliseconds at store time.
    pub cached_at: u64,
    /// Insertion sequence; orders entries stored in the same millisecond.
    pub seq: u64,
}

impl StoredResponse {
    pub fn from_response(response: &FetchResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            url: response.url.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            opaque: response.opaque,
            revision: None,
            cached_at: now_millis(),
            seq: 0,
        }
    }

    /// Rebuild the response, marked as cache-served.
    pub fn to_response(&self) -> FetchResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }
        FetchResponse {
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            url: self.url.clone(),
            headers,
            body: Bytes::from(self.body.clone()),
            from_cache: true,
            opaque: self.opaque,
        }
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(millis_since(self.cached_at))
    }
}

/// Entry metadata, enough for listing and eviction decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub cached_at: u64,
    pub seq: u64,
    pub pinned: bool,
}

/// Storage backend for named caches.
///
/// Implementations only store and enumerate. Naming, versioning, expiry,
/// and eviction live in [`CacheStorage`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, cache: &str, key: &str) -> Result<Option<StoredResponse>, StoreError>;
    async fn put(&self, cache: &str, key: &str, entry: StoredResponse) -> Result<(), StoreError>;
    async fn delete(&self, cache: &str, key: &str) -> Result<bool, StoreError>;
    async fn entries(&self, cache: &str) -> Result<Vec<EntryMeta>, StoreError>;
    async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError>;
    async fn list_caches(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory backend, the default.
#[derive(Default)]
pub struct MemoryBackend {
    caches: RwLock<HashMap<String, HashMap<String, StoredResponse>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, cache: &str, key: &str) -> Result<Option<StoredResponse>, StoreError> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, cache: &str, key: &str, entry: StoredResponse) -> Result<(), StoreError> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default()
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, cache: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(cache)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn entries(&self, cache: &str) -> Result<Vec<EntryMeta>, StoreError> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, entry)| EntryMeta {
                        key: key.clone(),
                        cached_at: entry.cached_at,
                        seq: entry.seq,
                        pinned: entry.revision.is_some(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError> {
        Ok(self.caches.write().await.remove(cache).is_some())
    }

    async fn list_caches(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Cacheability filter applied to every write.
///
/// Only plain 200 responses are stored. Redirects are refused no matter
/// the strategy: caching one pins a stale `Location` and can trap a page
/// in a login loop. Opaque responses are admitted only where the tuning
/// allows them.
pub fn is_cacheable(response: &FetchResponse, tuning: &CacheTuning) -> bool {
    if response.opaque {
        return tuning.allow_opaque;
    }
    response.status == StatusCode::OK
}

/// Versioned view over a backend for one generation.
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    version: String,
    tuning: CacheTunings,
    seq: AtomicU64,
}

impl CacheStorage {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        prefix: impl Into<String>,
        version: impl Into<String>,
        tuning: CacheTunings,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            version: version.into(),
            tuning,
            seq: AtomicU64::new(1),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tuning_for(&self, sub: SubCache) -> &CacheTuning {
        self.tuning.for_cache(sub)
    }

    /// Full cache name for a sub-cache in this generation.
    pub fn cache_name(&self, sub: SubCache) -> String {
        format!("{}-{}-{}", self.prefix, sub.as_str(), self.version)
    }

    /// Look up a fresh entry.
    ///
    /// Entries past their max age count as absent; they are removed on a
    /// later write, not here. Read failures degrade to a miss.
    pub async fn lookup(&self, sub: SubCache, key: &str) -> Option<FetchResponse> {
        let cache = self.cache_name(sub);
        match self.backend.get(&cache, key).await {
            Ok(Some(entry)) => {
                if entry.revision.is_none() && entry.age() > self.tuning_for(sub).max_age() {
                    trace!(cache = %cache, key, "Entry expired, treating as miss");
                    return None;
                }
                trace!(cache = %cache, key, "Cache hit");
                Some(entry.to_response())
            }
            Ok(None) => None,
            Err(e) => {
                warn!(cache = %cache, key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Store a response.
    ///
    /// Refuses anything the cacheability filter rejects, regardless of
    /// what the caller already checked.
    pub async fn store(
        &self,
        sub: SubCache,
        key: &str,
        response: &FetchResponse,
    ) -> Result<(), StoreError> {
        self.store_inner(sub, key, response, None).await
    }

    /// Revision recorded for a precached entry, or None when the key is
    /// absent or was stored by a runtime strategy.
    pub async fn precached_revision(&self, sub: SubCache, key: &str) -> Option<String> {
        match self.backend.get(&self.cache_name(sub), key).await {
            Ok(Some(entry)) => entry.revision,
            _ => None,
        }
    }

    /// Store a precached asset pinned with its manifest revision.
    pub async fn store_precached(
        &self,
        sub: SubCache,
        key: &str,
        response: &FetchResponse,
        revision: &str,
    ) -> Result<(), StoreError> {
        self.store_inner(sub, key, response, Some(revision)).await
    }

    async fn store_inner(
        &self,
        sub: SubCache,
        key: &str,
        response: &FetchResponse,
        revision: Option<&str>,
    ) -> Result<(), StoreError> {
        let tuning = *self.tuning_for(sub);
        if !is_cacheable(response, &tuning) {
            debug!(
                key,
                status = %response.status,
                opaque = response.opaque,
                "Refusing to store non-cacheable response"
            );
            return Ok(());
        }
        let cache = self.cache_name(sub);
        let mut entry = StoredResponse::from_response(response);
        entry.revision = revision.map(str::to_string);
        entry.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.backend.put(&cache, key, entry).await?;
        self.enforce_limits(&cache, &tuning).await
    }

    /// Remove expired entries, then evict oldest-first past the entry
    /// cap. Pinned (precached) entries are never removed here.
    async fn enforce_limits(&self, cache: &str, tuning: &CacheTuning) -> Result<(), StoreError> {
        let mut metas = self.backend.entries(cache).await?;

        let max_age_ms = tuning.max_age().as_millis() as u64;
        let expired: Vec<String> = metas
            .iter()
            .filter(|m| !m.pinned && millis_since(m.cached_at) > max_age_ms)
            .map(|m| m.key.clone())
            .collect();
        for key in &expired {
            trace!(cache, key = %key, "Removing expired entry");
            self.backend.delete(cache, key).await?;
        }
        metas.retain(|m| !expired.contains(&m.key));

        if metas.len() > tuning.max_entries {
            let excess = metas.len() - tuning.max_entries;
            let mut candidates: Vec<&EntryMeta> = metas.iter().filter(|m| !m.pinned).collect();
            candidates.sort_by_key(|m| (m.cached_at, m.seq));
            for meta in candidates.into_iter().take(excess) {
                debug!(cache, key = %meta.key, "Evicting oldest entry");
                self.backend.delete(cache, &meta.key).await?;
            }
        }
        Ok(())
    }

    /// Delete every cache belonging to another generation. Idempotent;
    /// returns the deleted names.
    pub async fn purge_stale_generations(&self) -> Result<Vec<String>, StoreError> {
        let mut purged = Vec::new();
        for name in self.backend.list_caches().await? {
            if let Some((_, version)) = parse_cache_name(&self.prefix, &name) {
                if version != self.version {
                    self.backend.delete_cache(&name).await?;
                    purged.push(name);
                }
            }
        }
        if !purged.is_empty() {
            info!(
                count = purged.len(),
                version = %self.version,
                "Purged stale cache generations"
            );
        }
        Ok(purged)
    }

    /// Distinct generation tags present in the backend for this prefix.
    pub async fn list_generations(&self) -> Result<Vec<String>, StoreError> {
        let mut tags: Vec<String> = self
            .backend
            .list_caches()
            .await?
            .iter()
            .filter_map(|name| parse_cache_name(&self.prefix, name))
            .map(|(_, version)| version.to_string())
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    pub async fn entry_count(&self, sub: SubCache) -> Result<usize, StoreError> {
        Ok(self.backend.entries(&self.cache_name(sub)).await?.len())
    }

    pub async fn keys(&self, sub: SubCache) -> Result<Vec<String>, StoreError> {
        Ok(self
            .backend
            .entries(&self.cache_name(sub))
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect())
    }
}

/// Split `<prefix>-<subcache>-<version>`; the version may itself
/// contain dashes.
fn parse_cache_name<'a>(prefix: &str, name: &'a str) -> Option<(SubCache, &'a str)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let (sub_name, version) = rest.split_once('-')?;
    let sub = SubCache::ALL.iter().copied().find(|s| s.as_str() == sub_name)?;
    if version.is_empty() {
        return None;
    }
    Some((sub, version))
}
