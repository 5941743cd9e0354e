//! Seawall Smoke Harness
//!
//! Drives one full engine lifecycle against a scripted origin: install
//! and activate, an online browsing mix, an offline window with queued
//! mutations, then a reconnect replay. The mutation queue persists to a
//! JSON file so repeated runs exercise the restore path too. Prints a
//! single JSON result line for CI to parse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use seawall_common::{init_logging, LogConfig};
use seawall_engine::{
    ClientMessage, EngineConfig, FetchError, FetchRequest, FetchResponse, MemoryBackend, Origin,
    PrecacheEntry, QueueStore, QueuedMutation, ResourceKind, StoreError, SwEngine,
};

/// Parse command line arguments
struct Args {
    queue_file: PathBuf,
    summary_output: Option<PathBuf>,
    verbose: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut queue_file = std::env::temp_dir().join("seawall-smoke-queue.json");
        let mut summary_output = None;
        let mut verbose = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--queue-file" => {
                    if let Some(val) = args.next() {
                        queue_file = PathBuf::from(val);
                    }
                }
                "--summary-output" => {
                    summary_output = args.next().map(PathBuf::from);
                }
                "--verbose" => {
                    verbose = true;
                }
                _ => {}
            }
        }

        Self {
            queue_file,
            summary_output,
            verbose,
        }
    }
}

/// Origin double: numbered bodies while up, refused connections while
/// down. The harness flips it to script the offline window.
struct FlakyOrigin {
    up: AtomicBool,
    hits: StdMutex<HashMap<String, usize>>,
}

impl FlakyOrigin {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(true),
            hits: StdMutex::new(HashMap::new()),
        })
    }

    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Origin for FlakyOrigin {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(FetchError::RequestFailed("origin offline".to_string()));
        }
        let path = request.url.path().to_string();
        let n = {
            let mut hits = self.hits.lock().unwrap();
            let count = hits.entry(path.clone()).or_insert(0);
            *count += 1;
            *count
        };
        Ok(
            FetchResponse::new(StatusCode::OK, request.url.clone())
                .with_body(format!("origin:{path}:{n}"), "text/html"),
        )
    }
}

/// Mutation queue store backed by a JSON file.
struct FileQueueStore {
    path: PathBuf,
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self) -> Result<Vec<QueuedMutation>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Backend(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn save(&self, items: &[QueuedMutation]) -> Result<(), StoreError> {
        let raw =
            serde_json::to_string_pretty(items).map_err(|e| StoreError::Backend(e.to_string()))?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_config = if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config);

    let started = Instant::now();
    info!(
        queue_file = %args.queue_file.display(),
        "Starting Seawall smoke harness"
    );

    let scope = Url::parse("https://club.example.org/")?;
    let config = EngineConfig {
        scope: scope.clone(),
        version: "v1".to_string(),
        precache: vec![
            PrecacheEntry::new("/offline/", "rev-1"),
            PrecacheEntry::new("/static/css/site.css", "rev-1"),
            PrecacheEntry::new("/static/icons/icon-192.png", "rev-1"),
        ],
        ..EngineConfig::default()
    };

    let origin = FlakyOrigin::new();
    let queue_store = Arc::new(FileQueueStore {
        path: args.queue_file.clone(),
    });
    let engine = SwEngine::with_queue_store(
        config,
        Arc::new(MemoryBackend::new()),
        origin.clone(),
        queue_store,
    );

    let mut failures: Vec<String> = Vec::new();

    // Phase 1: install and activate.
    let report = engine.install().await.context("install failed")?;
    info!(
        precached = report.precached,
        unchanged = report.unchanged,
        failed = report.failed.len(),
        "Installed"
    );
    if !report.failed.is_empty() {
        failures.push(format!("precache failures: {:?}", report.failed));
    }

    let (client, mut notices) = engine.register_client(scope.join("/events/")?).await;
    let purged = engine.activate().await.context("activate failed")?;
    info!(purged = purged.len(), "Activated");

    // Phase 2: online browsing mix. The first navigation adopts the
    // registered page; repeats and precached assets come from cache.
    let mix = vec![
        FetchRequest::navigation(scope.join("/events/")?).client(client),
        FetchRequest::get(scope.join("/static/css/site.css")?, ResourceKind::Style).client(client),
        FetchRequest::get(scope.join("/media/team.jpg")?, ResourceKind::Image).client(client),
        FetchRequest::get(scope.join("/media/team.jpg")?, ResourceKind::Image).client(client),
        FetchRequest::get(scope.join("/static/icons/icon-192.png")?, ResourceKind::Image)
            .client(client),
    ];

    let mut served = 0usize;
    let mut cache_hits = 0usize;
    for request in &mix {
        match engine.handle_fetch(request).await {
            Ok(outcome) => {
                if let Some(response) = outcome.response() {
                    served += 1;
                    if response.from_cache {
                        cache_hits += 1;
                    }
                }
            }
            Err(e) => failures.push(format!("online fetch {} failed: {e}", request.url)),
        }
    }
    info!(served, cache_hits, "Online mix complete");

    // Phase 3: offline window.
    origin.set_up(false);
    warn!("Origin going down for the offline window");

    let mut fallback_pages = 0usize;
    let mut placeholders = 0usize;

    match engine
        .handle_fetch(&FetchRequest::navigation(scope.join("/schedule/")?).client(client))
        .await
    {
        Ok(outcome) => match outcome.response() {
            Some(response) if response.text().contains("origin:/offline/") => fallback_pages += 1,
            Some(_) => failures.push("offline navigation did not serve the precached page".into()),
            None => failures.push("offline navigation passed through".into()),
        },
        Err(e) => failures.push(format!("offline navigation failed: {e}")),
    }

    match engine
        .handle_fetch(
            &FetchRequest::get(scope.join("/media/away-game.jpg")?, ResourceKind::Image)
                .client(client),
        )
        .await
    {
        Ok(outcome) => match outcome.response() {
            Some(response) if response.text().contains("<svg") => placeholders += 1,
            _ => failures.push("offline image did not get a placeholder".into()),
        },
        Err(e) => failures.push(format!("offline image failed: {e}")),
    }

    let rsvp = FetchRequest::post(
        scope.join("/events/7/rsvp/")?,
        Bytes::from_static(b"rsvp=yes"),
    )
    .client(client);
    match engine.handle_fetch(&rsvp).await {
        Ok(outcome) => match outcome.response() {
            Some(response) if response.status == StatusCode::ACCEPTED => {}
            _ => failures.push("offline mutation was not queued".into()),
        },
        Err(e) => failures.push(format!("offline mutation failed outright: {e}")),
    }

    let csrf_form = FetchRequest::post(
        scope.join("/contact/")?,
        Bytes::from_static(b"csrfmiddlewaretoken=abc&msg=hi"),
    )
    .client(client);
    let csrf_rejected = engine.handle_fetch(&csrf_form).await.is_err();
    if !csrf_rejected {
        failures.push("CSRF-bearing form was accepted into the queue".into());
    }

    let queued = engine.queue_len().await;
    info!(queued, "Offline window complete");

    // Phase 4: reconnect and replay.
    origin.set_up(true);
    let drained = engine.connectivity_restored().await;
    info!(
        replayed = drained.replayed,
        expired = drained.expired,
        remaining = drained.remaining,
        "Replay complete"
    );
    if drained.replayed != queued {
        failures.push(format!(
            "expected {queued} replays, got {}",
            drained.replayed
        ));
    }

    // Client notices observed along the way.
    let mut activated_notices = 0usize;
    let mut unreachable_notices = 0usize;
    while let Ok(notice) = notices.try_recv() {
        match notice {
            ClientMessage::CacheVersionActivated { .. } => activated_notices += 1,
            ClientMessage::ServerUnreachable { .. } => unreachable_notices += 1,
        }
    }
    if activated_notices == 0 {
        failures.push("no activation notice reached the client".into());
    }
    if unreachable_notices == 0 {
        failures.push("no unreachable notice reached the client".into());
    }

    let status = if failures.is_empty() { "pass" } else { "fail" };
    let result = json!({
        "status": status,
        "elapsed_ms": started.elapsed().as_millis(),
        "install": {
            "precached": report.precached,
            "unchanged": report.unchanged,
            "failed": report.failed.len(),
        },
        "purged_generations": purged.len(),
        "online": { "served": served, "cache_hits": cache_hits },
        "offline": {
            "fallback_pages": fallback_pages,
            "placeholders": placeholders,
            "queued": queued,
            "csrf_rejected": csrf_rejected,
        },
        "replay": {
            "replayed": drained.replayed,
            "expired": drained.expired,
            "remaining": drained.remaining,
        },
        "notices": {
            "activated": activated_notices,
            "unreachable": unreachable_notices,
        },
        "failures": failures,
    });
    println!("{result}");

    if let Some(path) = &args.summary_output {
        std::fs::write(path, result.to_string())
            .with_context(|| format!("writing summary to {}", path.display()))?;
    }

    if status != "pass" {
        std::process::exit(1);
    }
    Ok(())
}
