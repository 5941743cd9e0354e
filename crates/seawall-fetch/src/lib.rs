//! # Seawall Fetch
//!
//! Request/response model and origin access for the Seawall offline caching engine.
//!
//! ## Design Goals
//!
//! 1. **Typed descriptors**: URL, method, and resource kind drive routing
//! 2. **Cache-ready responses**: bodies are buffered bytes, cheap to clone
//! 3. **Pluggable origin**: the backing server is a trait, swappable in tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use seawall_common::TimeoutError;

pub mod origin;

pub use origin::{HttpOrigin, HttpOriginConfig, Origin};

/// Errors that can occur while talking to the origin.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<TimeoutError> for FetchError {
    fn from(err: TimeoutError) -> Self {
        Self::Timeout(err.0)
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a controlled client (a page or tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// What kind of resource a request is for, as reported by the embedder.
///
/// This mirrors the destination the browser would attach to a fetch. Icons
/// are not a distinct kind; they arrive as `Image` requests and are told
/// apart by their URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Top-level document navigation.
    Navigation,
    /// Stylesheet.
    Style,
    /// Script.
    Script,
    /// Image or icon.
    Image,
    /// Web font.
    Font,
    /// Programmatic fetch (API call, form submission).
    Api,
    /// Anything else (media, manifest, beacon).
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Navigation => "navigation",
            ResourceKind::Style => "style",
            ResourceKind::Script => "script",
            ResourceKind::Image => "image",
            ResourceKind::Font => "font",
            ResourceKind::Api => "api",
            ResourceKind::Other => "other",
        }
    }
}

/// An intercepted request, as seen by the engine.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub kind: ResourceKind,
    /// The client the request came from, when the embedder knows it.
    pub client: Option<ClientId>,
}

impl FetchRequest {
    /// Create a GET request for a resource of the given kind.
    pub fn get(url: Url, kind: ResourceKind) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            kind,
            client: None,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigation(url: Url) -> Self {
        Self::get(url, ResourceKind::Navigation)
    }

    /// Create a POST request (API call or form submission).
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            body: Some(body),
            kind: ResourceKind::Api,
            client: None,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach the originating client.
    pub fn client(mut self, client: ClientId) -> Self {
        self.client = Some(client);
        self
    }

    /// Whether the request mutates server state.
    pub fn is_mutation(&self) -> bool {
        !(self.method == Method::GET
            || self.method == Method::HEAD
            || self.method == Method::OPTIONS
            || self.method == Method::TRACE)
    }

    /// Cache identity for this request: the URL with the fragment
    /// stripped. The query string is kept, it distinguishes pages.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.to_string()
    }

    /// Whether the body contains the given byte sequence.
    pub fn body_contains(&self, needle: &[u8]) -> bool {
        match &self.body {
            Some(body) if needle.len() <= body.len() => {
                body.windows(needle.len()).any(|w| w == needle)
            }
            _ => false,
        }
    }
}

/// A response, either from the origin or synthesized from cache.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// True when this response was served from a cache rather than the
    /// origin.
    pub from_cache: bool,
    /// True for responses whose contents the embedder may not inspect
    /// (cross-origin no-CORS fetches). The status of an opaque response
    /// is not meaningful.
    pub opaque: bool,
}

impl FetchResponse {
    /// Create an empty response with the given status.
    pub fn new(status: StatusCode, url: Url) -> Self {
        Self {
            status,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            from_cache: false,
            opaque: false,
        }
    }

    /// Create an opaque response.
    pub fn opaque(url: Url) -> Self {
        Self {
            status: StatusCode::OK,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            from_cache: false,
            opaque: true,
        }
    }

    /// Set the body and content type.
    pub fn with_body(mut self, body: impl Into<Bytes>, content_type: &str) -> Self {
        self.body = body.into();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if the response was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response is a redirect (3xx).
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }

    /// Parse the Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// The body as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_request_ids_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_request() {
        let req = FetchRequest::get(url("https://example.com/static/app.css"), ResourceKind::Style);
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.kind, ResourceKind::Style);
        assert!(req.body.is_none());
        assert!(!req.is_mutation());
    }

    #[test]
    fn test_post_is_mutation() {
        let req = FetchRequest::post(url("https://example.com/api/x/"), Bytes::from_static(b"{}"));
        assert!(req.is_mutation());

        let mut del = FetchRequest::get(url("https://example.com/api/x/"), ResourceKind::Api);
        del.method = Method::DELETE;
        assert!(del.is_mutation());

        let head = FetchRequest {
            method: Method::HEAD,
            ..FetchRequest::get(url("https://example.com/"), ResourceKind::Other)
        };
        assert!(!head.is_mutation());
    }

    #[test]
    fn test_cache_key_strips_fragment_keeps_query() {
        let req = FetchRequest::navigation(url("https://example.com/events/?page=2#section"));
        assert_eq!(req.cache_key(), "https://example.com/events/?page=2");
    }

    #[test]
    fn test_body_contains() {
        let req = FetchRequest::post(
            url("https://example.com/events/register/"),
            Bytes::from_static(b"csrfmiddlewaretoken=abc&name=x"),
        );
        assert!(req.body_contains(b"csrfmiddlewaretoken"));
        assert!(!req.body_contains(b"password"));

        let empty = FetchRequest::navigation(url("https://example.com/"));
        assert!(!empty.body_contains(b"csrfmiddlewaretoken"));
    }

    #[test]
    fn test_response_with_body() {
        let resp = FetchResponse::new(StatusCode::OK, url("https://example.com/"))
            .with_body("<html></html>", "text/html; charset=utf-8");
        assert!(resp.ok());
        assert!(!resp.is_redirect());
        assert_eq!(resp.content_type(), Some(mime::TEXT_HTML_UTF_8));
        assert_eq!(resp.text(), "<html></html>");
    }

    #[test]
    fn test_redirect_response() {
        let resp = FetchResponse::new(StatusCode::FOUND, url("https://example.com/old/"));
        assert!(resp.is_redirect());
        assert!(!resp.ok());
    }

    #[test]
    fn test_opaque_response() {
        let resp = FetchResponse::opaque(url("https://cdn.example.net/font.woff2"));
        assert!(resp.opaque);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_resource_kind_names() {
        assert_eq!(ResourceKind::Navigation.as_str(), "navigation");
        assert_eq!(ResourceKind::Api.as_str(), "api");
    }
}
