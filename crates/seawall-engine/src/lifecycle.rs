//! Install and activation: precaching the manifest, turning over cache
//! generations, and the state machine that keeps the two in order.
//!
//! A new engine version precaches into its own generation while the old
//! one keeps serving. Activation purges every other generation, so the
//! stale-purge must never run before install has finished writing.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use seawall_common::{retry_with_backoff, with_timeout, RetryConfig};
use seawall_fetch::{FetchError, FetchRequest, Origin, ResourceKind};

use crate::clients::ClientRegistry;
use crate::config::{EngineConfig, PrecacheEntry};
use crate::routes::{is_icon_asset, SubCache};
use crate::store::CacheStorage;
use crate::SwError;

/// Revision recorded when activation fetches the offline page itself
/// because the manifest never listed it.
const WARMED_REVISION: &str = "warmed";

/// Where the engine is in its install/activate progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Configured but nothing fetched yet.
    Parsed,
    /// Precache in progress.
    Installing,
    /// Precache done, waiting to take over.
    Installed,
    /// Purging stale generations.
    Activating,
    /// Serving traffic.
    Active,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Parsed => "parsed",
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
        }
    }
}

/// What install did with the manifest.
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Entries fetched and stored this run.
    pub precached: usize,
    /// Entries whose stored revision already matched.
    pub unchanged: usize,
    /// Manifest URLs that could not be fetched.
    pub failed: Vec<String>,
}

/// Drives the engine through install and activation.
pub struct LifecycleController {
    config: Arc<EngineConfig>,
    storage: Arc<CacheStorage>,
    origin: Arc<dyn Origin>,
    clients: Arc<ClientRegistry>,
    state: RwLock<LifecycleState>,
    pub(crate) retry: RetryConfig,
}

impl LifecycleController {
    pub(crate) fn new(
        config: Arc<EngineConfig>,
        storage: Arc<CacheStorage>,
        origin: Arc<dyn Origin>,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            config,
            storage,
            origin,
            clients,
            state: RwLock::new(LifecycleState::Parsed),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: std::time::Duration::from_millis(200),
                max_delay: std::time::Duration::from_secs(5),
                ..RetryConfig::default()
            },
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    async fn advance(&self, from: LifecycleState, to: LifecycleState) -> Result<(), SwError> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(SwError::State(format!(
                "cannot move to {} while {}",
                to.as_str(),
                state.as_str()
            )));
        }
        debug!(from = from.as_str(), to = to.as_str(), "Lifecycle transition");
        *state = to;
        Ok(())
    }

    /// Fetch and store the precache manifest for this generation.
    ///
    /// A failed entry is reported and skipped rather than failing the
    /// whole install; the offline page still works if most of the
    /// manifest landed.
    pub async fn install(&self) -> Result<InstallReport, SwError> {
        self.advance(LifecycleState::Parsed, LifecycleState::Installing)
            .await?;

        let mut report = InstallReport::default();
        for entry in &self.config.precache {
            match self.precache_one(entry).await {
                Ok(true) => report.precached += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    warn!(url = %entry.url, error = %e, "Precache entry failed");
                    report.failed.push(entry.url.clone());
                }
            }
        }

        self.advance(LifecycleState::Installing, LifecycleState::Installed)
            .await?;
        info!(
            version = self.storage.version(),
            precached = report.precached,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "Install complete"
        );
        Ok(report)
    }

    /// Fetch one manifest entry into its sub-cache, skipping the fetch
    /// when the stored revision already matches.
    async fn precache_one(&self, entry: &PrecacheEntry) -> Result<bool, SwError> {
        let url = self
            .config
            .scope
            .join(&entry.url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {e}", entry.url)))?;
        let sub = precache_destination(&url);
        let request = FetchRequest::get(url.clone(), precache_kind(sub));
        let key = request.cache_key();

        if self.storage.precached_revision(sub, &key).await.as_deref()
            == Some(entry.revision.as_str())
        {
            debug!(url = %url, revision = %entry.revision, "Revision unchanged, keeping stored copy");
            return Ok(false);
        }

        let timeout = self.config.network_timeout();
        let response = retry_with_backoff(&self.retry, || async {
            let fetched = with_timeout(timeout, || self.origin.fetch(&request))
                .await
                .map_err(FetchError::from)
                .and_then(|r| r)?;
            if fetched.ok() || fetched.opaque {
                Ok(fetched)
            } else {
                Err(FetchError::RequestFailed(format!(
                    "precache fetch returned {}",
                    fetched.status
                )))
            }
        })
        .await?;

        self.storage
            .store_precached(sub, &key, &response, &entry.revision)
            .await?;
        debug!(url = %url, cache = sub.as_str(), "Precached");
        Ok(true)
    }

    /// Take over: purge every other generation, then seize or notify
    /// clients per configuration.
    pub async fn activate(&self) -> Result<Vec<String>, SwError> {
        self.advance(LifecycleState::Installed, LifecycleState::Activating)
            .await?;

        match self.storage.purge_stale_generations().await {
            Ok(purged) => {
                self.warm_offline_document().await;
                self.advance(LifecycleState::Activating, LifecycleState::Active)
                    .await?;
                if self.config.take_control_immediately {
                    self.clients.adopt_all().await;
                }
                self.clients.notify_activated(self.storage.version()).await;
                info!(
                    version = self.storage.version(),
                    purged = purged.len(),
                    "Activation complete"
                );
                Ok(purged)
            }
            Err(e) => {
                // Roll back so a later activate can retry the purge.
                *self.state.write().await = LifecycleState::Installed;
                Err(e.into())
            }
        }
    }

    /// Fetch the offline page into this generation when the manifest
    /// did not precache it, so navigation fallback has a real page from
    /// the first activation. Best effort: on failure the built-in page
    /// still answers.
    async fn warm_offline_document(&self) {
        let Some(url) = self.config.offline_location() else {
            return;
        };
        let request = FetchRequest::navigation(url.clone());
        let key = request.cache_key();
        if self
            .storage
            .precached_revision(SubCache::Pages, &key)
            .await
            .is_some()
        {
            return;
        }

        let fetched = with_timeout(self.config.network_timeout(), || self.origin.fetch(&request))
            .await
            .map_err(FetchError::from)
            .and_then(|r| r);
        match fetched {
            Ok(response) if response.ok() => {
                match self
                    .storage
                    .store_precached(SubCache::Pages, &key, &response, WARMED_REVISION)
                    .await
                {
                    Ok(()) => debug!(url = %url, "Warmed offline page"),
                    Err(e) => warn!(url = %url, error = %e, "Could not store offline page"),
                }
            }
            Ok(response) => {
                debug!(url = %url, status = %response.status, "Offline page warm skipped")
            }
            Err(e) => debug!(url = %url, error = %e, "Offline page warm failed"),
        }
    }

    /// Activate a waiting installation immediately. A no-op when
    /// already active.
    pub async fn skip_waiting(&self) -> Result<(), SwError> {
        match self.state().await {
            LifecycleState::Installed => self.activate().await.map(|_| ()),
            LifecycleState::Active => Ok(()),
            other => Err(SwError::State(format!(
                "cannot skip waiting while {}",
                other.as_str()
            ))),
        }
    }
}

/// Sub-cache a manifest URL belongs in, judged by its path.
fn precache_destination(url: &Url) -> SubCache {
    let path = url.path();
    if is_icon_asset(path) {
        SubCache::Icons
    } else if [".css", ".js", ".mjs", ".map"].iter().any(|e| path.ends_with(e)) {
        SubCache::Static
    } else if [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".avif"]
        .iter()
        .any(|e| path.ends_with(e))
    {
        SubCache::Images
    } else if [".woff2", ".woff", ".ttf", ".otf"].iter().any(|e| path.ends_with(e)) {
        SubCache::Fonts
    } else {
        SubCache::Pages
    }
}

fn precache_kind(sub: SubCache) -> ResourceKind {
    match sub {
        SubCache::Pages => ResourceKind::Navigation,
        SubCache::Images | SubCache::Icons => ResourceKind::Image,
        SubCache::Fonts => ResourceKind::Font,
        _ => ResourceKind::Other,
    }
}
