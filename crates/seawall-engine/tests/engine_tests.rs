//! End-to-end engine tests: routing, strategies, lifecycle, queue, and
//! the client bridge working together against a scripted origin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use serde_json::json;
use url::Url;

use seawall_engine::{
    CacheBackend, CacheTuning, ClientMessage, ControlMessage, EngineConfig, EntryMeta, FetchError,
    FetchRequest, FetchResponse, LifecycleState, MemoryBackend, Origin, PrecacheEntry,
    ResourceKind, StoreError, StoredResponse, SubCache, SwEngine, SwError,
};

const SCOPE: &str = "https://club.example.org/";

#[derive(Debug, Clone, Copy)]
enum Mode {
    Up,
    Down,
    Hanging,
}

/// Origin double that can go down, hang, fail N times, or answer with
/// per-path statuses. Bodies carry a per-path hit counter so tests can
/// tell which fetch produced them.
struct ScriptedOrigin {
    mode: StdMutex<Mode>,
    log: StdMutex<Vec<String>>,
    hits: StdMutex<HashMap<String, usize>>,
    statuses: StdMutex<HashMap<String, u16>>,
    fail_next: AtomicUsize,
}

impl ScriptedOrigin {
    fn up() -> Arc<Self> {
        Arc::new(Self {
            mode: StdMutex::new(Mode::Up),
            log: StdMutex::new(Vec::new()),
            hits: StdMutex::new(HashMap::new()),
            statuses: StdMutex::new(HashMap::new()),
            fail_next: AtomicUsize::new(0),
        })
    }

    fn down() -> Arc<Self> {
        let origin = Self::up();
        origin.go_down();
        origin
    }

    fn go_up(&self) {
        *self.mode.lock().unwrap() = Mode::Up;
    }

    fn go_down(&self) {
        *self.mode.lock().unwrap() = Mode::Down;
    }

    fn hang(&self) {
        *self.mode.lock().unwrap() = Mode::Hanging;
    }

    fn fail_times(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn set_status(&self, path: &str, status: u16) {
        self.statuses.lock().unwrap().insert(path.to_string(), status);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Origin for ScriptedOrigin {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let path = request.url.path().to_string();
        {
            let mut log = self.log.lock().unwrap();
            match &request.body {
                Some(body) => log.push(format!(
                    "{} {} {}",
                    request.method,
                    path,
                    String::from_utf8_lossy(body)
                )),
                None => log.push(format!("{} {}", request.method, path)),
            }
        }

        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FetchError::RequestFailed("scripted failure".to_string()));
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Down => Err(FetchError::RequestFailed("origin down".to_string())),
            Mode::Hanging => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(FetchError::RequestFailed("hung".to_string()))
            }
            Mode::Up => {
                let n = {
                    let mut hits = self.hits.lock().unwrap();
                    let count = hits.entry(path.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let status = self
                    .statuses
                    .lock()
                    .unwrap()
                    .get(&path)
                    .copied()
                    .unwrap_or(200);
                Ok(
                    FetchResponse::new(StatusCode::from_u16(status).unwrap(), request.url.clone())
                        .with_body(format!("origin:{path}:{n}"), "text/html"),
                )
            }
        }
    }
}

/// Backend wrapper counting raw writes.
struct CountingBackend {
    inner: MemoryBackend,
    puts: AtomicUsize,
}

impl CountingBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::new(),
            puts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CacheBackend for CountingBackend {
    async fn get(&self, cache: &str, key: &str) -> Result<Option<StoredResponse>, StoreError> {
        self.inner.get(cache, key).await
    }

    async fn put(&self, cache: &str, key: &str, entry: StoredResponse) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(cache, key, entry).await
    }

    async fn delete(&self, cache: &str, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(cache, key).await
    }

    async fn entries(&self, cache: &str) -> Result<Vec<EntryMeta>, StoreError> {
        self.inner.entries(cache).await
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError> {
        self.inner.delete_cache(cache).await
    }

    async fn list_caches(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_caches().await
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        scope: Url::parse(SCOPE).unwrap(),
        version: "v1".to_string(),
        ..EngineConfig::default()
    }
}

async fn active_engine(config: EngineConfig, origin: Arc<ScriptedOrigin>) -> SwEngine {
    let engine = SwEngine::new(config, Arc::new(MemoryBackend::new()), origin);
    engine.install().await.unwrap();
    engine.activate().await.unwrap();
    engine
}

fn page_url(path: &str) -> Url {
    Url::parse(SCOPE).unwrap().join(path).unwrap()
}

fn nav(path: &str) -> FetchRequest {
    FetchRequest::navigation(page_url(path))
}

fn asset(path: &str, kind: ResourceKind) -> FetchRequest {
    FetchRequest::get(page_url(path), kind)
}

fn form_post(path: &str, body: &'static [u8]) -> FetchRequest {
    FetchRequest::post(page_url(path), Bytes::from_static(body))
}

#[tokio::test]
async fn test_auth_requests_always_hit_the_origin() {
    let origin = ScriptedOrigin::up();
    let engine = active_engine(test_config(), origin.clone()).await;

    // A stale cached copy of the login page must never be consulted.
    let stale = FetchResponse::new(StatusCode::OK, page_url("/accounts/login/"))
        .with_body("stale login page", "text/html");
    engine
        .storage()
        .store(SubCache::Pages, page_url("/accounts/login/").as_str(), &stale)
        .await
        .unwrap();

    let response = engine
        .handle_fetch(&nav("/accounts/login/"))
        .await
        .unwrap()
        .response()
        .unwrap();
    assert_eq!(response.text(), "origin:/accounts/login/:1");
    assert!(!response.from_cache);

    // The locale prefix does not change the classification; the origin
    // still sees the original path.
    let localized = engine
        .handle_fetch(&nav("/en/accounts/login/"))
        .await
        .unwrap()
        .response()
        .unwrap();
    assert_eq!(localized.text(), "origin:/en/accounts/login/:1");
    assert!(origin.log().contains(&"GET /en/accounts/login/".to_string()));
}

#[tokio::test]
async fn test_offline_auth_gets_offline_page_not_stale_cache() {
    let origin = ScriptedOrigin::up();
    let engine = active_engine(test_config(), origin.clone()).await;

    let stale = FetchResponse::new(StatusCode::OK, page_url("/accounts/login/"))
        .with_body("stale login page", "text/html");
    engine
        .storage()
        .store(SubCache::Pages, page_url("/accounts/login/").as_str(), &stale)
        .await
        .unwrap();

    origin.go_down();
    let response = engine
        .handle_fetch(&nav("/accounts/login/"))
        .await
        .unwrap()
        .response()
        .unwrap();
    // Activation warmed /offline/, so that page answers here. The
    // stale login copy must not.
    assert_eq!(response.text(), "origin:/offline/:1");
    assert!(!response.text().contains("stale login page"));
}

#[tokio::test]
async fn test_redirects_are_never_written_to_cache() {
    let origin = ScriptedOrigin::up();
    origin.set_status("/events/", 302);
    origin.set_status("/static/css/site.css", 302);
    origin.set_status("/media/team.jpg", 302);

    let backend = CountingBackend::new();
    let engine = SwEngine::new(test_config(), backend.clone(), origin);
    engine.install().await.unwrap();
    engine.activate().await.unwrap();
    // Activation warming writes the offline page; only the redirect
    // fetches below are under test.
    let baseline = backend.puts.load(Ordering::SeqCst);

    let requests = [
        nav("/events/"),
        asset("/static/css/site.css", ResourceKind::Style),
        asset("/media/team.jpg", ResourceKind::Image),
    ];
    for request in &requests {
        let response = engine
            .handle_fetch(request)
            .await
            .unwrap()
            .response()
            .unwrap();
        assert!(response.is_redirect());
    }

    assert_eq!(backend.puts.load(Ordering::SeqCst), baseline);
}

#[tokio::test]
async fn test_new_generation_purges_old_caches() {
    let backend = Arc::new(MemoryBackend::new());
    let origin = ScriptedOrigin::up();

    let v1 = SwEngine::new(test_config(), backend.clone(), origin.clone());
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    v1.handle_fetch(&nav("/events/")).await.unwrap();
    assert!(backend
        .list_caches()
        .await
        .unwrap()
        .contains(&"seawall-pages-v1".to_string()));

    let mut config = test_config();
    config.version = "v2".to_string();
    let v2 = SwEngine::new(config, backend.clone(), origin);
    v2.install().await.unwrap();
    let purged = v2.activate().await.unwrap();
    assert!(purged.contains(&"seawall-pages-v1".to_string()));

    let remaining = backend.list_caches().await.unwrap();
    assert!(remaining.iter().all(|name| !name.contains("-v1")));
}

#[tokio::test]
async fn test_swr_answers_from_cache_without_waiting() {
    let origin = ScriptedOrigin::up();
    let engine = active_engine(test_config(), origin.clone()).await;
    let request = asset("/static/css/site.css", ResourceKind::Style);

    // Cold fetch fills the cache.
    engine.handle_fetch(&request).await.unwrap();

    origin.hang();
    let started = Instant::now();
    let response = engine
        .handle_fetch(&request)
        .await
        .unwrap()
        .response()
        .unwrap();
    assert!(response.from_cache);
    assert_eq!(response.text(), "origin:/static/css/site.css:1");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "stale answer must not wait on the hung refresh"
    );
}

#[tokio::test]
async fn test_swr_refreshes_stored_copy_in_background() {
    let origin = ScriptedOrigin::up();
    let engine = active_engine(test_config(), origin).await;
    let request = asset("/static/css/site.css", ResourceKind::Style);
    let key = request.cache_key();

    engine.handle_fetch(&request).await.unwrap();
    let cached = engine
        .handle_fetch(&request)
        .await
        .unwrap()
        .response()
        .unwrap();
    assert_eq!(cached.text(), "origin:/static/css/site.css:1");

    // The detached refresh lands shortly after the cached answer.
    let mut refreshed = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(entry) = engine.storage().lookup(SubCache::Static, &key).await {
            if entry.text() == "origin:/static/css/site.css:2" {
                refreshed = Some(entry);
                break;
            }
        }
    }
    assert!(refreshed.is_some(), "background refresh never stored");
}

#[tokio::test]
async fn test_failed_mutations_replay_in_fifo_order() {
    let origin = ScriptedOrigin::up();
    let engine = active_engine(test_config(), origin.clone()).await;
    origin.go_down();

    for (path, body) in [
        ("/events/1/rsvp/", "rsvp=a"),
        ("/events/2/rsvp/", "rsvp=b"),
        ("/events/3/rsvp/", "rsvp=c"),
    ] {
        let outcome = engine
            .handle_fetch(&form_post(path, body.as_bytes()))
            .await
            .unwrap();
        let receipt = outcome.response().unwrap();
        assert_eq!(receipt.status, StatusCode::ACCEPTED);
        assert_eq!(receipt.text(), r#"{"queued":true}"#);
    }
    assert_eq!(engine.queue_len().await, 3);

    // First replay attempt fails: the mutation goes back to the front.
    origin.go_up();
    origin.fail_times(1);
    let first = engine.connectivity_restored().await;
    assert_eq!(first.replayed, 0);
    assert_eq!(first.remaining, 3);

    let second = engine.connectivity_restored().await;
    assert_eq!(second.replayed, 3);
    assert_eq!(second.remaining, 0);
    assert_eq!(engine.queue_len().await, 0);

    let replays: Vec<String> = origin
        .log()
        .iter()
        .filter(|line| line.contains("rsvp"))
        .skip(3) // the three foreground attempts while down
        .cloned()
        .collect();
    assert_eq!(
        replays,
        vec![
            "POST /events/1/rsvp/ rsvp=a".to_string(),
            "POST /events/1/rsvp/ rsvp=a".to_string(),
            "POST /events/2/rsvp/ rsvp=b".to_string(),
            "POST /events/3/rsvp/ rsvp=c".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_auth_and_csrf_mutations_are_never_queued() {
    let origin = ScriptedOrigin::down();
    let engine = active_engine_offline_install(test_config(), origin).await;

    let login = engine
        .handle_fetch(&form_post("/accounts/login/", b"user=a&pass=b"))
        .await;
    assert!(matches!(login, Err(SwError::Network(_))));

    let csrf_header = form_post("/events/1/rsvp/", b"rsvp=a").header(
        HeaderName::from_static("x-csrftoken"),
        HeaderValue::from_static("token123"),
    );
    assert!(engine.handle_fetch(&csrf_header).await.is_err());

    let csrf_body = form_post("/contact/", b"csrfmiddlewaretoken=abc&msg=hi");
    assert!(engine.handle_fetch(&csrf_body).await.is_err());

    assert_eq!(engine.queue_len().await, 0);

    // A plain form post does queue.
    let plain = engine
        .handle_fetch(&form_post("/events/1/rsvp/", b"rsvp=a"))
        .await
        .unwrap();
    assert_eq!(plain.response().unwrap().status, StatusCode::ACCEPTED);
    assert_eq!(engine.queue_len().await, 1);
}

#[tokio::test]
async fn test_image_cache_evicts_oldest_beyond_cap() {
    let origin = ScriptedOrigin::up();
    let mut config = test_config();
    config.tuning.images = CacheTuning::new(5, 90 * 24 * 60 * 60).allow_opaque();
    let engine = active_engine(config, origin).await;

    for i in 1..=7 {
        engine
            .handle_fetch(&asset(&format!("/media/img{i}.jpg"), ResourceKind::Image))
            .await
            .unwrap();
    }

    assert_eq!(engine.storage().entry_count(SubCache::Images).await.unwrap(), 5);
    let keys = engine.storage().keys(SubCache::Images).await.unwrap();
    for i in 3..=7 {
        let key = page_url(&format!("/media/img{i}.jpg")).to_string();
        assert!(keys.contains(&key), "expected {key} to survive eviction");
    }
}

#[tokio::test]
async fn test_precached_offline_page_serves_navigations() {
    let origin = ScriptedOrigin::up();
    let mut config = test_config();
    config.precache = vec![PrecacheEntry::new("/offline/", "rev-1")];
    let engine = active_engine(config, origin.clone()).await;
    assert!(origin.log().contains(&"GET /offline/".to_string()));

    origin.go_down();
    let response = engine
        .handle_fetch(&nav("/schedule/"))
        .await
        .unwrap()
        .response()
        .unwrap();
    assert_eq!(response.text(), "origin:/offline/:1");
    assert_eq!(response.url, page_url("/schedule/"));
    assert!(response.from_cache);
}

#[tokio::test]
async fn test_offline_image_gets_placeholder() {
    let origin = ScriptedOrigin::down();
    let engine = active_engine_offline_install(test_config(), origin).await;

    let response = engine
        .handle_fetch(&asset("/media/team.jpg", ResourceKind::Image))
        .await
        .unwrap()
        .response()
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.text().contains("<svg"));
}

#[tokio::test]
async fn test_offline_script_failure_propagates() {
    let origin = ScriptedOrigin::down();
    let engine = active_engine_offline_install(test_config(), origin).await;

    let result = engine
        .handle_fetch(&asset("/static/js/app.js", ResourceKind::Script))
        .await;
    assert!(matches!(result, Err(SwError::Network(_))));
}

#[tokio::test]
async fn test_unreachable_notice_reaches_controlled_clients() {
    let origin = ScriptedOrigin::up();
    let mut config = test_config();
    config.take_control_immediately = true;
    let engine = SwEngine::new(config, Arc::new(MemoryBackend::new()), origin.clone());

    let (id, mut rx) = engine.register_client(page_url("/")).await;
    engine.install().await.unwrap();
    engine.activate().await.unwrap();

    match rx.try_recv().unwrap() {
        ClientMessage::CacheVersionActivated { version, .. } => assert_eq!(version, "v1"),
        other => panic!("expected activation notice, got {other:?}"),
    }

    origin.go_down();
    engine
        .handle_fetch(&nav("/events/").client(id))
        .await
        .unwrap();

    let notice = rx.try_recv().unwrap();
    match &notice {
        ClientMessage::ServerUnreachable { url, .. } => {
            assert_eq!(url, page_url("/events/").as_str());
        }
        other => panic!("expected unreachable notice, got {other:?}"),
    }

    // Wire shape page scripts rely on.
    let wire = serde_json::to_value(&notice).unwrap();
    assert_eq!(wire["type"], "SERVER_UNREACHABLE");
    assert!(wire["timestamp"].as_u64().is_some());
}

#[tokio::test]
async fn test_skip_waiting_control_message_activates() {
    let origin = ScriptedOrigin::up();
    let engine = SwEngine::new(test_config(), Arc::new(MemoryBackend::new()), origin);
    engine.install().await.unwrap();
    assert_eq!(engine.state().await, LifecycleState::Installed);

    let control: ControlMessage = serde_json::from_value(json!({"type": "SKIP_WAITING"})).unwrap();
    engine.handle_control(control).await.unwrap();
    assert_eq!(engine.state().await, LifecycleState::Active);
}

#[tokio::test]
async fn test_uncontrolled_client_adopts_on_navigation() {
    let origin = ScriptedOrigin::up();
    let engine = active_engine(test_config(), origin).await;
    let (id, _rx) = engine.register_client(page_url("/")).await;
    assert!(!engine.clients().is_controlled(id).await);

    // Subresources from an uncontrolled page are not engine traffic.
    let style = engine
        .handle_fetch(&asset("/static/css/site.css", ResourceKind::Style).client(id))
        .await
        .unwrap();
    assert!(style.is_pass_through());

    // The next navigation brings the page under control.
    let page = engine.handle_fetch(&nav("/events/").client(id)).await.unwrap();
    assert!(page.response().is_some());
    assert!(engine.clients().is_controlled(id).await);

    let style = engine
        .handle_fetch(&asset("/static/css/site.css", ResourceKind::Style).client(id))
        .await
        .unwrap();
    assert!(style.response().is_some());
}

#[tokio::test]
async fn test_cross_origin_requests_pass_through() {
    let origin = ScriptedOrigin::up();
    let engine = active_engine(test_config(), origin.clone()).await;

    let request = FetchRequest::get(
        Url::parse("https://cdn.example.net/lib.js").unwrap(),
        ResourceKind::Script,
    );
    let outcome = engine.handle_fetch(&request).await.unwrap();
    assert!(outcome.is_pass_through());
    assert!(origin.log().iter().all(|line| !line.contains("lib.js")));
}

#[tokio::test]
async fn test_post_navigation_failure_shows_offline_page() {
    let origin = ScriptedOrigin::down();
    let engine = active_engine_offline_install(test_config(), origin).await;

    // A form submission that is itself a navigation, the Django way.
    let mut submit = form_post("/contact/", b"msg=hello");
    submit.kind = ResourceKind::Navigation;

    let response = engine
        .handle_fetch(&submit)
        .await
        .unwrap()
        .response()
        .unwrap();
    assert!(response.text().contains("You are offline"));
    assert_eq!(engine.queue_len().await, 0);
}

/// Install and activate against a dead origin. With an empty manifest
/// the install trivially succeeds, which is exactly the point: the
/// engine still comes up and serves fallbacks.
async fn active_engine_offline_install(
    config: EngineConfig,
    origin: Arc<ScriptedOrigin>,
) -> SwEngine {
    let engine = SwEngine::new(config, Arc::new(MemoryBackend::new()), origin);
    engine.install().await.unwrap();
    engine.activate().await.unwrap();
    engine
}
