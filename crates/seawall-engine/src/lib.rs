//! # Seawall Engine
//!
//! Request interception and offline caching engine for club sites.
//!
//! The engine sits between a page and its origin the way a service
//! worker does: it classifies every request against an ordered rule
//! table, serves it by the matched caching strategy, and falls back to
//! precached content when the origin is unreachable. Failed mutations
//! are queued and replayed once connectivity returns.
//!
//! ## Design Goals
//!
//! 1. **Strategy-per-route**: Auth stays live, pages prefer the network,
//!    assets prefer the cache
//! 2. **Generation turnover**: A new deployment precaches into its own
//!    cache generation and purges the old one at activation
//! 3. **Offline resilience**: Navigations degrade to a precached offline
//!    page, images to a placeholder
//! 4. **Deferred mutations**: Failed POSTs queue in FIFO order and replay
//!    on reconnect, never auth or CSRF-bearing forms
//!
//! ## Architecture
//!
//! ```text
//! FetchRequest ──► SwEngine::handle_fetch
//!     │
//!     ├── RouteTable (first matching rule → Policy)
//!     │
//!     ├── Strategies ──► CacheStorage ◄──► CacheBackend
//!     │       │
//!     │       └── Origin (bounded fetch, background refresh)
//!     │
//!     ├── MutationQueue (failed mutations, FIFO replay)
//!     │
//!     └── FallbackResolver (offline page, image placeholder)
//! ```

use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

pub mod clients;
pub mod config;
pub mod fallback;
pub mod lifecycle;
pub mod queue;
pub mod routes;
pub mod store;
pub mod strategy;

pub use clients::{ClientMessage, ClientRegistry, ControlMessage};
pub use config::{CacheTuning, CacheTunings, EngineConfig, PrecacheEntry, QueueConfig};
pub use fallback::FallbackResolver;
pub use lifecycle::{InstallReport, LifecycleController, LifecycleState};
pub use queue::{
    DrainOutcome, MemoryQueueStore, MutationQueue, QueueError, QueueStore, QueuedMutation,
};
pub use routes::{default_rules, Matcher, Policy, RouteTable, Rule, SubCache};
pub use store::{CacheBackend, CacheStorage, EntryMeta, MemoryBackend, StoreError, StoredResponse};
pub use strategy::Strategies;

// Re-exported so embedders only need this crate.
pub use seawall_fetch::{
    ClientId, FetchError, FetchRequest, FetchResponse, Origin, RequestId, ResourceKind,
};

use crate::strategy::{supervise_refreshes, RefreshReport, RefreshSupervisor};

/// Errors that can occur in engine operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(#[from] FetchError),

    #[error("Cache error: {0}")]
    Store(#[from] StoreError),

    #[error("State error: {0}")]
    State(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// What the engine did with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The engine answered, from cache, origin, or fallback.
    Response(FetchResponse),
    /// Not engine traffic. The embedder performs the request itself.
    PassThrough,
}

impl FetchOutcome {
    pub fn response(self) -> Option<FetchResponse> {
        match self {
            FetchOutcome::Response(response) => Some(response),
            FetchOutcome::PassThrough => None,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, FetchOutcome::PassThrough)
    }
}

/// The engine: one instance per scope, shared behind an `Arc`.
pub struct SwEngine {
    config: Arc<EngineConfig>,
    routes: RouteTable,
    storage: Arc<CacheStorage>,
    strategies: Strategies,
    fallback: FallbackResolver,
    queue: Arc<MutationQueue>,
    clients: Arc<ClientRegistry>,
    lifecycle: LifecycleController,
    origin: Arc<dyn Origin>,
    /// Taken by the first activation to start the refresh supervisor.
    refresh_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<RefreshReport>>>,
}

impl SwEngine {
    /// Engine with an in-memory mutation queue.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn CacheBackend>,
        origin: Arc<dyn Origin>,
    ) -> Self {
        Self::with_queue_store(config, backend, origin, Arc::new(MemoryQueueStore::new()))
    }

    /// Engine with a caller-provided durable queue store.
    pub fn with_queue_store(
        config: EngineConfig,
        backend: Arc<dyn CacheBackend>,
        origin: Arc<dyn Origin>,
        queue_store: Arc<dyn QueueStore>,
    ) -> Self {
        let config = Arc::new(config);
        let storage = Arc::new(CacheStorage::new(
            backend,
            config.cache_prefix.as_str(),
            config.version.as_str(),
            config.tuning.clone(),
        ));
        let clients = Arc::new(ClientRegistry::new(config.take_control_immediately));
        let (supervisor, refresh_rx) = RefreshSupervisor::new();
        let strategies = Strategies::new(
            Arc::clone(&storage),
            Arc::clone(&origin),
            Arc::clone(&clients),
            supervisor,
            config.network_timeout(),
        );
        let offline_key = config.offline_location().map(|u| u.to_string());
        let fallback = FallbackResolver::new(Arc::clone(&storage), offline_key);
        let queue = Arc::new(MutationQueue::new(
            config.queue.clone(),
            config.network_timeout(),
            queue_store,
        ));
        let lifecycle = LifecycleController::new(
            Arc::clone(&config),
            Arc::clone(&storage),
            Arc::clone(&origin),
            Arc::clone(&clients),
        );
        let routes = RouteTable::new(config.scope.clone());

        Self {
            config,
            routes,
            storage,
            strategies,
            fallback,
            queue,
            clients,
            lifecycle,
            origin,
            refresh_rx: Mutex::new(Some(refresh_rx)),
        }
    }

    /// Replace the built-in rule table. Rules match in the order given.
    pub fn set_routes(&mut self, routes: RouteTable) {
        self.routes = routes;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.state().await
    }

    /// Precache the manifest for this generation.
    pub async fn install(&self) -> Result<InstallReport, SwError> {
        self.lifecycle.install().await
    }

    /// Take over from the previous generation. Purges stale caches,
    /// restores the mutation queue, and starts the refresh supervisor.
    pub async fn activate(&self) -> Result<Vec<String>, SwError> {
        let purged = self.lifecycle.activate().await?;
        self.start_background_work().await;
        Ok(purged)
    }

    async fn start_background_work(&self) {
        self.queue.restore().await;
        if let Some(rx) = self.refresh_rx.lock().await.take() {
            tokio::spawn(supervise_refreshes(rx));
        }
    }

    /// Register a page with the engine. The returned receiver carries
    /// engine-to-client messages for that page.
    pub async fn register_client(
        &self,
        url: url::Url,
    ) -> (ClientId, tokio::sync::mpsc::UnboundedReceiver<ClientMessage>) {
        self.clients.register(url).await
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Serve one intercepted request.
    ///
    /// Routing happens before anything else: a request classified as a
    /// bypass never touches a cache or the queue, no matter what state
    /// the caches are in.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, SwError> {
        if self.lifecycle.state().await != LifecycleState::Active {
            trace!(url = %request.url, "Engine not active, passing through");
            return Ok(FetchOutcome::PassThrough);
        }

        if let Some(client) = request.client {
            if !self.clients.is_controlled(client).await {
                if request.kind == ResourceKind::Navigation {
                    // A fresh navigation is how an existing page adopts
                    // the current generation.
                    self.clients.adopt(client).await;
                } else {
                    trace!(url = %request.url, "Uncontrolled client, passing through");
                    return Ok(FetchOutcome::PassThrough);
                }
            }
        }

        let rule = self.routes.classify(request);
        if rule.policy == Policy::Bypass {
            return Ok(FetchOutcome::PassThrough);
        }

        match self.strategies.execute(rule.policy, request).await {
            Ok(response) => Ok(FetchOutcome::Response(response)),
            Err(failure) => {
                if rule.queue_on_failure && request.is_mutation() {
                    match self.queue.enqueue(request).await {
                        Ok(()) => {
                            return Ok(FetchOutcome::Response(queued_receipt(request)));
                        }
                        Err(QueueError::Excluded(reason)) => {
                            debug!(url = %request.url, reason = %reason, "Mutation not queued");
                        }
                    }
                }
                self.fallback
                    .resolve(request, failure)
                    .await
                    .map(FetchOutcome::Response)
            }
        }
    }

    /// Replay queued mutations after connectivity returns.
    pub async fn connectivity_restored(&self) -> DrainOutcome {
        self.queue.drain_once(self.origin.as_ref()).await
    }

    /// Handle a control message from a client page.
    pub async fn handle_control(&self, message: ControlMessage) -> Result<(), SwError> {
        match message {
            ControlMessage::SkipWaiting => {
                self.lifecycle.skip_waiting().await?;
                self.start_background_work().await;
                Ok(())
            }
        }
    }
}

/// Receipt for a mutation parked in the queue. 202 tells the page the
/// write was accepted but has not reached the origin yet.
fn queued_receipt(request: &FetchRequest) -> FetchResponse {
    FetchResponse::new(StatusCode::ACCEPTED, request.url.clone())
        .with_body(r#"{"queued":true}"#, mime::APPLICATION_JSON.as_ref())
}
