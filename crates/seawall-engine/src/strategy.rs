//! Serving strategies: the four disciplines for answering a classified
//! request from cache, origin, or both.
//!
//! All origin traffic goes through one bounded fetch path, so a hung
//! origin costs at most the configured timeout, and every foreground
//! failure raises exactly one unreachable notice on the bridge.

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use seawall_common::with_timeout;
use seawall_fetch::{FetchError, FetchRequest, FetchResponse, Origin};

use crate::clients::ClientRegistry;
use crate::routes::{Policy, SubCache};
use crate::store::{is_cacheable, CacheStorage};
use crate::SwError;

/// Outcome of one background refresh, reported to the supervisor.
#[derive(Debug)]
pub(crate) struct RefreshReport {
    pub url: Url,
    pub result: Result<(), String>,
}

/// Hands background refresh outcomes to the supervisor task so detached
/// work is never silently lost.
#[derive(Clone)]
pub(crate) struct RefreshSupervisor {
    tx: mpsc::UnboundedSender<RefreshReport>,
}

impl RefreshSupervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RefreshReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn report(&self, report: RefreshReport) {
        // A closed receiver means shutdown; nothing left to supervise.
        let _ = self.tx.send(report);
    }
}

/// Drain refresh reports, logging failures. Spawned at activation.
pub(crate) async fn supervise_refreshes(mut rx: mpsc::UnboundedReceiver<RefreshReport>) {
    while let Some(report) = rx.recv().await {
        match report.result {
            Ok(()) => debug!(url = %report.url, "Background refresh stored"),
            Err(e) => warn!(url = %report.url, error = %e, "Background refresh failed"),
        }
    }
}

/// Executes serving policies against cache and origin.
pub struct Strategies {
    storage: Arc<CacheStorage>,
    origin: Arc<dyn Origin>,
    clients: Arc<ClientRegistry>,
    supervisor: RefreshSupervisor,
    network_timeout: Duration,
}

impl Strategies {
    pub(crate) fn new(
        storage: Arc<CacheStorage>,
        origin: Arc<dyn Origin>,
        clients: Arc<ClientRegistry>,
        supervisor: RefreshSupervisor,
        network_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            origin,
            clients,
            supervisor,
            network_timeout,
        }
    }

    /// Serve a request under the given policy.
    pub async fn execute(
        &self,
        policy: Policy,
        request: &FetchRequest,
    ) -> Result<FetchResponse, SwError> {
        trace!(url = %request.url, policy = policy.as_str(), "Executing strategy");
        match policy {
            // The router hands bypasses back before strategies run;
            // treat a stray one as plain network traffic.
            Policy::Bypass | Policy::NetworkOnly => self.network_only(request).await,
            Policy::NetworkFirst(sub) => self.network_first(sub, request).await,
            Policy::CacheFirst(sub) => self.cache_first(sub, request).await,
            Policy::StaleWhileRevalidate(sub) => self.stale_while_revalidate(sub, request).await,
        }
    }

    /// Origin fetch under the engine's time bound. A failure here is the
    /// one place "the server stopped answering" is detected, so the
    /// bridge notice goes out before the error propagates.
    async fn fetch_fresh(&self, request: &FetchRequest) -> Result<FetchResponse, SwError> {
        let result = with_timeout(self.network_timeout, || self.origin.fetch(request))
            .await
            .map_err(FetchError::from)
            .and_then(|r| r);
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                self.clients.notify_unreachable(&request.url).await;
                Err(SwError::Network(e))
            }
        }
    }

    async fn network_only(&self, request: &FetchRequest) -> Result<FetchResponse, SwError> {
        self.fetch_fresh(request).await
    }

    async fn network_first(
        &self,
        sub: SubCache,
        request: &FetchRequest,
    ) -> Result<FetchResponse, SwError> {
        match self.fetch_fresh(request).await {
            Ok(response) => {
                self.maybe_store(sub, request, &response).await;
                Ok(response)
            }
            Err(failure) => {
                if let Some(cached) = self.lookup(sub, request).await {
                    debug!(url = %request.url, "Origin down, serving cached copy");
                    return Ok(cached);
                }
                Err(failure)
            }
        }
    }

    async fn cache_first(
        &self,
        sub: SubCache,
        request: &FetchRequest,
    ) -> Result<FetchResponse, SwError> {
        if let Some(cached) = self.lookup(sub, request).await {
            return Ok(cached);
        }
        let response = self.fetch_fresh(request).await?;
        self.maybe_store(sub, request, &response).await;
        Ok(response)
    }

    /// Cached answer immediately with a detached refresh; on a cold
    /// cache, one foreground fetch fills it.
    async fn stale_while_revalidate(
        &self,
        sub: SubCache,
        request: &FetchRequest,
    ) -> Result<FetchResponse, SwError> {
        if let Some(cached) = self.lookup(sub, request).await {
            self.spawn_refresh(sub, request.clone());
            return Ok(cached);
        }
        let response = self.fetch_fresh(request).await?;
        self.maybe_store(sub, request, &response).await;
        Ok(response)
    }

    /// Cache reads and writes only apply to GET; nothing else is keyed
    /// by URL alone.
    async fn lookup(&self, sub: SubCache, request: &FetchRequest) -> Option<FetchResponse> {
        if request.method != Method::GET {
            return None;
        }
        self.storage.lookup(sub, &request.cache_key()).await
    }

    /// Store when the response passes the cacheability filter. A failed
    /// write never fails the request.
    async fn maybe_store(&self, sub: SubCache, request: &FetchRequest, response: &FetchResponse) {
        if request.method != Method::GET {
            return;
        }
        if !is_cacheable(response, self.storage.tuning_for(sub)) {
            trace!(
                url = %request.url,
                status = %response.status,
                "Response not cacheable, skipping store"
            );
            return;
        }
        if let Err(e) = self.storage.store(sub, &request.cache_key(), response).await {
            warn!(url = %request.url, error = %e, "Cache write failed");
        }
    }

    /// Detached refresh for stale-while-revalidate. The page's response
    /// never waits on this; the outcome goes to the supervisor.
    fn spawn_refresh(&self, sub: SubCache, request: FetchRequest) {
        let origin = Arc::clone(&self.origin);
        let storage = Arc::clone(&self.storage);
        let supervisor = self.supervisor.clone();
        let timeout = self.network_timeout;
        tokio::spawn(async move {
            let url = request.url.clone();
            trace!(url = %url, "Background refresh started");
            let fetched = with_timeout(timeout, || origin.fetch(&request))
                .await
                .map_err(FetchError::from)
                .and_then(|r| r);
            let result = match fetched {
                Ok(response) => {
                    if is_cacheable(&response, storage.tuning_for(sub)) {
                        storage
                            .store(sub, &request.cache_key(), &response)
                            .await
                            .map_err(|e| e.to_string())
                    } else {
                        // A refresh that came back non-cacheable leaves
                        // the stored copy alone.
                        Ok(())
                    }
                }
                Err(e) => Err(e.to_string()),
            };
            supervisor.report(RefreshReport { url, result });
        });
    }
}
