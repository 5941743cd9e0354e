//! Deferred mutation queue: failed writes wait here for connectivity.
//!
//! Replay is strictly FIFO. A failed replay puts the mutation back at
//! the front and stops the pass, so a later mutation can never land
//! before an earlier one. Session-scoped requests (auth endpoints, CSRF
//! tokens) are refused a slot; replaying one against a new session can
//! only produce confusing 403s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use seawall_common::millis_since;
use seawall_common::now_millis;
use seawall_common::with_timeout;
use seawall_fetch::{FetchError, FetchRequest, Origin, RequestId, ResourceKind};

use crate::config::QueueConfig;
use crate::routes::{strip_locale_prefix, AUTH_PATHS};
use crate::store::StoreError;

/// Why a mutation was refused a queue slot.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Mutation not replayable: {0}")]
    Excluded(String),
}

/// A queued mutation, in a form durable stores can serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Unix-epoch milliseconds at enqueue time.
    pub enqueued_at: u64,
}

impl QueuedMutation {
    fn from_request(request: &FetchRequest) -> Self {
        let headers = request
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
            method: request.method.to_string(),
            url: request.url.clone(),
            headers,
            body: request.body.as_ref().map(|b| b.to_vec()),
            enqueued_at: now_millis(),
        }
    }

    /// Rebuild the request for replay.
    fn to_request(&self) -> FetchRequest {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }
        FetchRequest {
            id: RequestId::new(),
            url: self.url.clone(),
            method: Method::from_bytes(self.method.as_bytes()).unwrap_or(Method::POST),
            headers,
            body: self.body.clone().map(Bytes::from),
            kind: ResourceKind::Api,
            client: None,
        }
    }

    fn expired(&self, config: &QueueConfig) -> bool {
        millis_since(self.enqueued_at) > config.max_retention().as_millis() as u64
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Mutations delivered to the origin.
    pub replayed: usize,
    /// Mutations dropped for exceeding retention.
    pub expired: usize,
    /// Mutations still waiting after the pass.
    pub remaining: usize,
}

/// Persistence seam for the queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> Result<Vec<QueuedMutation>, StoreError>;
    async fn save(&self, items: &[QueuedMutation]) -> Result<(), StoreError>;
}

/// In-memory store, the default.
#[derive(Default)]
pub struct MemoryQueueStore {
    items: RwLock<Vec<QueuedMutation>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<QueuedMutation>, StoreError> {
        Ok(self.items.read().await.clone())
    }

    async fn save(&self, items: &[QueuedMutation]) -> Result<(), StoreError> {
        *self.items.write().await = items.to_vec();
        Ok(())
    }
}

/// FIFO queue of failed mutations, written through to its store.
///
/// The pass mutex serializes drains: only one replay is in flight at a
/// time. The deque mutex is never held across a network call, so
/// enqueues land even while a replay is waiting on the origin.
pub struct MutationQueue {
    inner: Mutex<VecDeque<QueuedMutation>>,
    pass: Mutex<()>,
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    network_timeout: Duration,
}

impl MutationQueue {
    pub fn new(
        config: QueueConfig,
        network_timeout: Duration,
        store: Arc<dyn QueueStore>,
    ) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            pass: Mutex::new(()),
            store,
            config,
            network_timeout,
        }
    }

    /// Reload persisted mutations. Called once at activation.
    pub async fn restore(&self) {
        match self.store.load().await {
            Ok(items) if !items.is_empty() => {
                info!(count = items.len(), "Restored queued mutations");
                *self.inner.lock().await = items.into();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not restore mutation queue"),
        }
    }

    /// Queue a failed mutation for replay.
    pub async fn enqueue(&self, request: &FetchRequest) -> Result<(), QueueError> {
        if let Some(reason) = exclusion_reason(request) {
            debug!(url = %request.url, reason = %reason, "Mutation refused a queue slot");
            return Err(QueueError::Excluded(reason));
        }
        let mut inner = self.inner.lock().await;
        while inner.len() >= self.config.max_entries {
            // An empty deque can still be at capacity when max_entries
            // is zero; the newest mutation is accepted regardless.
            let Some(dropped) = inner.pop_front() else { break };
            warn!(url = %dropped.url, "Queue full, dropping oldest mutation");
        }
        inner.push_back(QueuedMutation::from_request(request));
        info!(url = %request.url, depth = inner.len(), "Mutation queued for replay");
        self.persist(&inner).await;
        Ok(())
    }

    /// Replay queued mutations in order.
    ///
    /// Stops at the first delivery failure and puts that mutation back
    /// at the front. Any answer from the origin counts as delivered,
    /// even an error status: the origin saw the mutation, and replaying
    /// it again could apply it twice. Each replay fetch is bounded by
    /// the same network timeout as a foreground request.
    pub async fn drain_once(&self, origin: &dyn Origin) -> DrainOutcome {
        let _pass = self.pass.lock().await;
        let mut outcome = DrainOutcome::default();

        loop {
            let Some(mutation) = self.inner.lock().await.pop_front() else {
                break;
            };
            if mutation.expired(&self.config) {
                warn!(url = %mutation.url, "Dropping mutation past retention");
                outcome.expired += 1;
                continue;
            }
            let request = mutation.to_request();
            let delivered = with_timeout(self.network_timeout, || origin.fetch(&request))
                .await
                .map_err(FetchError::from)
                .and_then(|r| r);
            match delivered {
                Ok(response) => {
                    debug!(url = %mutation.url, status = %response.status, "Replayed mutation");
                    outcome.replayed += 1;
                }
                Err(e) => {
                    debug!(url = %mutation.url, error = %e, "Replay failed, keeping mutation");
                    self.inner.lock().await.push_front(mutation);
                    break;
                }
            }
        }

        let inner = self.inner.lock().await;
        outcome.remaining = inner.len();
        self.persist(&inner).await;
        if outcome.replayed > 0 || outcome.expired > 0 {
            info!(
                replayed = outcome.replayed,
                expired = outcome.expired,
                remaining = outcome.remaining,
                "Drained mutation queue"
            );
        }
        outcome
    }

    async fn persist(&self, inner: &VecDeque<QueuedMutation>) {
        let items: Vec<QueuedMutation> = inner.iter().cloned().collect();
        if let Err(e) = self.store.save(&items).await {
            warn!(error = %e, "Could not persist mutation queue");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Why a mutation may never be queued, if it may not.
fn exclusion_reason(request: &FetchRequest) -> Option<String> {
    let path = strip_locale_prefix(request.url.path());
    if AUTH_PATHS.iter().any(|prefix| path.starts_with(prefix)) {
        return Some("auth endpoint".to_string());
    }
    if path.starts_with("/admin/") {
        return Some("admin endpoint".to_string());
    }
    if request.headers.contains_key("x-csrftoken") {
        return Some("carries a CSRF token header".to_string());
    }
    if request.body_contains(b"csrfmiddlewaretoken") {
        return Some("form body carries a CSRF token".to_string());
    }
    None
}
