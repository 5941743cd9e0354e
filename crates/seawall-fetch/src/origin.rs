//! Origin access: the engine's view of the backing server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{FetchError, FetchRequest, FetchResponse};

/// Something that can answer a fetch against the backing server.
///
/// The production implementation is [`HttpOrigin`]; tests substitute
/// scripted origins to simulate outages and slow links.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// HTTP origin configuration.
#[derive(Debug, Clone)]
pub struct HttpOriginConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Per-request ceiling; the engine applies its own tighter bound.
    pub timeout: Duration,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for HttpOriginConfig {
    fn default() -> Self {
        Self {
            user_agent: "Seawall/0.1".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            timeout: Duration::from_secs(30),
            cookies_enabled: true,
        }
    }
}

/// Origin backed by a real HTTP client.
pub struct HttpOrigin {
    client: Client,
    config: HttpOriginConfig,
}

impl HttpOrigin {
    /// Create a new HTTP origin.
    ///
    /// Redirects are never followed here. A 3xx answer must stay visible
    /// so callers can refuse to cache it.
    pub fn new(config: HttpOriginConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        info!("HttpOrigin initialized");

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        debug!(url = %request.url, method = %request.method, "Fetching from origin");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        // Forward headers
        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        // Add Accept-Language
        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        // Add body
        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        // Execute request
        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.config.timeout)
            } else {
                FetchError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Origin response"
        );

        Ok(FetchResponse {
            status,
            url,
            headers,
            body,
            from_cache: false,
            opaque: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceKind;
    use bytes::Bytes;
    use url::Url;
    use wiremock::matchers::{body_string_contains, headers, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(server: &MockServer, p: &str) -> FetchRequest {
        let url = Url::parse(&format!("{}{}", server.uri(), p)).unwrap();
        FetchRequest::get(url, ResourceKind::Other)
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let server = MockServer::start().await;
        // wiremock splits received header values on commas, so the
        // forwarded Accept-Language matches as a value list.
        Mock::given(method("GET"))
            .and(path("/hello/"))
            .and(headers("Accept-Language", vec!["en-US", "en;q=0.9"]))
            .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(HttpOriginConfig::default()).unwrap();
        let resp = origin.fetch(&request(&server, "/hello/")).await.unwrap();

        assert!(resp.ok());
        assert!(!resp.from_cache);
        assert_eq!(resp.text(), "hi");
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old/"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(HttpOriginConfig::default()).unwrap();
        let resp = origin.fetch(&request(&server, "/old/")).await.unwrap();

        assert!(resp.is_redirect());
        assert_eq!(resp.headers.get("location").unwrap(), "/new/");
    }

    #[tokio::test]
    async fn test_post_body_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit/"))
            .and(body_string_contains("name=ada"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let origin = HttpOrigin::new(HttpOriginConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/submit/", server.uri())).unwrap();
        let req = FetchRequest::post(url, Bytes::from_static(b"name=ada"));
        let resp = origin.fetch(&req).await.unwrap();

        assert_eq!(resp.status, 201);
    }

    #[tokio::test]
    async fn test_slow_origin_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow/"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let config = HttpOriginConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let origin = HttpOrigin::new(config).unwrap();
        let err = origin.fetch(&request(&server, "/slow/")).await.unwrap_err();

        assert!(matches!(err, FetchError::Timeout(_)));
    }
}
