//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::routes::SubCache;

/// A precached asset: a URL relative to the scope and a content revision.
///
/// Changing the revision forces a re-fetch at install time even when the
/// URL is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheEntry {
    pub url: String,
    pub revision: String,
}

impl PrecacheEntry {
    pub fn new(url: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            revision: revision.into(),
        }
    }
}

/// Limits for one sub-cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTuning {
    /// Entry cap; the oldest entries are evicted past it.
    pub max_entries: usize,
    /// Entry lifetime in seconds. Older entries count as absent.
    pub max_age_secs: u64,
    /// Accept opaque responses. Only safe for resources whose bytes are
    /// never inspected, such as images and fonts.
    pub allow_opaque: bool,
}

impl CacheTuning {
    pub fn new(max_entries: usize, max_age_secs: u64) -> Self {
        Self {
            max_entries,
            max_age_secs,
            allow_opaque: false,
        }
    }

    pub fn allow_opaque(mut self) -> Self {
        self.allow_opaque = true;
        self
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

const DAY_SECS: u64 = 24 * 60 * 60;

/// Limits for every sub-cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTunings {
    pub pages: CacheTuning,
    pub static_assets: CacheTuning,
    pub icons: CacheTuning,
    pub images: CacheTuning,
    pub fonts: CacheTuning,
    pub runtime: CacheTuning,
}

impl Default for CacheTunings {
    fn default() -> Self {
        Self {
            pages: CacheTuning::new(40, 7 * DAY_SECS),
            static_assets: CacheTuning::new(60, 30 * DAY_SECS),
            icons: CacheTuning::new(30, DAY_SECS),
            images: CacheTuning::new(100, 90 * DAY_SECS).allow_opaque(),
            fonts: CacheTuning::new(20, 365 * DAY_SECS).allow_opaque(),
            runtime: CacheTuning::new(50, 7 * DAY_SECS),
        }
    }
}

impl CacheTunings {
    /// Limits for the given sub-cache.
    pub fn for_cache(&self, sub: SubCache) -> &CacheTuning {
        match sub {
            SubCache::Pages => &self.pages,
            SubCache::Static => &self.static_assets,
            SubCache::Icons => &self.icons,
            SubCache::Images => &self.images,
            SubCache::Fonts => &self.fonts,
            SubCache::Runtime => &self.runtime,
        }
    }
}

/// Deferred mutation queue limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Longest a mutation may wait for replay, in seconds.
    pub max_retention_secs: u64,
    /// Queue capacity; the oldest entry is dropped on overflow.
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retention_secs: DAY_SECS,
            max_entries: 128,
        }
    }
}

impl QueueConfig {
    pub fn max_retention(&self) -> Duration {
        Duration::from_secs(self.max_retention_secs)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Origin the engine fronts. Requests to any other origin pass
    /// through untouched.
    pub scope: Url,
    /// Cache name prefix shared by every generation.
    pub cache_prefix: String,
    /// Deployment version tag. Changing it starts a new generation; it
    /// must change whenever the precache manifest or route behavior does.
    pub version: String,
    /// Upper bound on any single origin fetch, in seconds.
    pub network_timeout_secs: u64,
    /// Navigation path served when offline with nothing cached.
    pub offline_url: String,
    /// Assets fetched and stored at install time.
    pub precache: Vec<PrecacheEntry>,
    /// Seize existing clients at activation instead of waiting for
    /// their next navigation.
    pub take_control_immediately: bool,
    /// Per-sub-cache limits.
    pub tuning: CacheTunings,
    /// Mutation queue limits.
    pub queue: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scope: Url::parse("http://localhost:8000/").expect("default scope URL"),
            cache_prefix: "seawall".to_string(),
            version: "v1".to_string(),
            network_timeout_secs: 10,
            offline_url: "/offline/".to_string(),
            precache: Vec::new(),
            take_control_immediately: false,
            tuning: CacheTunings::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    /// The offline page resolved against the scope.
    pub fn offline_location(&self) -> Option<Url> {
        self.scope.join(&self.offline_url).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_prefix, "seawall");
        assert_eq!(config.network_timeout(), Duration::from_secs(10));
        assert!(!config.take_control_immediately);
        assert_eq!(config.queue.max_entries, 128);
        assert_eq!(
            config.offline_location().unwrap().as_str(),
            "http://localhost:8000/offline/"
        );
    }

    #[test]
    fn test_opaque_allowed_only_for_images_and_fonts() {
        let tuning = CacheTunings::default();
        assert!(tuning.images.allow_opaque);
        assert!(tuning.fonts.allow_opaque);
        assert!(!tuning.pages.allow_opaque);
        assert!(!tuning.static_assets.allow_opaque);
        assert!(!tuning.icons.allow_opaque);
    }

    #[test]
    fn test_partial_config_merges_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"version": "2024-06", "cache_prefix": "club"}"#).unwrap();
        assert_eq!(config.version, "2024-06");
        assert_eq!(config.cache_prefix, "club");
        assert_eq!(config.network_timeout_secs, 10);
        assert_eq!(config.tuning.pages.max_entries, 40);
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = EngineConfig::default();
        config.precache.push(PrecacheEntry::new("/offline/", "abc123"));
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
