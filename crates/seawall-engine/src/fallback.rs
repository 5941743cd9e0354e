//! Offline fallbacks: what the engine answers when both origin and
//! cache come up empty.
//!
//! Navigations get the precached offline page, or a built-in minimal
//! one if precaching never ran. Images and icon assets get an inline
//! SVG placeholder so layouts keep their shape. Everything else
//! propagates the failure and lets the page handle it.

use http::StatusCode;
use tracing::debug;

use seawall_fetch::{FetchRequest, FetchResponse, ResourceKind};

use crate::store::CacheStorage;
use crate::routes::{is_icon_asset, SubCache};
use crate::SwError;

/// Served when the offline page was never precached. Kept deliberately
/// small so it renders from a string literal without assets.
const OFFLINE_PAGE_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline</title>
<style>
body { font-family: system-ui, sans-serif; text-align: center; padding: 4rem 1rem; color: #333; }
h1 { font-size: 1.5rem; }
</style>
</head>
<body>
<h1>You are offline</h1>
<p>This page is not available right now. Reconnect and try again.</p>
</body>
</html>
"#;

/// Grey 1x1 placeholder for images that cannot be fetched or found.
const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1"><rect width="1" height="1" fill="#e0e0e0"/></svg>"##;

/// Synthesizes last-resort responses once a strategy has failed.
pub struct FallbackResolver {
    storage: std::sync::Arc<CacheStorage>,
    offline_key: Option<String>,
}

impl FallbackResolver {
    pub(crate) fn new(storage: std::sync::Arc<CacheStorage>, offline_key: Option<String>) -> Self {
        Self {
            storage,
            offline_key,
        }
    }

    /// Turn a strategy failure into a fallback response where one
    /// exists for the resource kind.
    pub async fn resolve(
        &self,
        request: &FetchRequest,
        failure: SwError,
    ) -> Result<FetchResponse, SwError> {
        match request.kind {
            ResourceKind::Navigation => {
                debug!(url = %request.url, "Serving offline page");
                Ok(self.offline_page(request).await)
            }
            // Icon requests carry whatever kind the page tagged them
            // with, so match them by path as the router does.
            ResourceKind::Image => {
                debug!(url = %request.url, "Serving image placeholder");
                Ok(self.placeholder_image(request))
            }
            _ if is_icon_asset(request.url.path()) => {
                debug!(url = %request.url, "Serving icon placeholder");
                Ok(self.placeholder_image(request))
            }
            _ => Err(failure),
        }
    }

    /// The precached offline page, re-addressed to the failed URL so
    /// the client sees a response for what it asked.
    async fn offline_page(&self, request: &FetchRequest) -> FetchResponse {
        if let Some(key) = &self.offline_key {
            if let Some(cached) = self.storage.lookup(SubCache::Pages, key).await {
                return FetchResponse {
                    url: request.url.clone(),
                    ..cached
                };
            }
        }
        FetchResponse::new(StatusCode::OK, request.url.clone())
            .with_body(OFFLINE_PAGE_HTML, mime::TEXT_HTML_UTF_8.as_ref())
    }

    fn placeholder_image(&self, request: &FetchRequest) -> FetchResponse {
        FetchResponse::new(StatusCode::OK, request.url.clone())
            .with_body(PLACEHOLDER_SVG, mime::IMAGE_SVG.as_ref())
    }
}
