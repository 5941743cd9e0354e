//! Route classification: the ordered rule table deciding how each
//! intercepted request is served.
//!
//! Rules are evaluated top to bottom and the first match wins, so the
//! hard bypasses sit above everything else. Paths are compared after
//! stripping a leading locale segment; `/en/accounts/login/` and
//! `/accounts/login/` classify identically.

use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

use seawall_fetch::{FetchRequest, ResourceKind};

/// Named sub-caches within a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubCache {
    /// Navigated documents.
    Pages,
    /// Stylesheets and scripts.
    Static,
    /// Favicons and app icons.
    Icons,
    /// Content images.
    Images,
    /// Web fonts.
    Fonts,
    /// Everything routed by custom rules.
    Runtime,
}

impl SubCache {
    pub const ALL: [SubCache; 6] = [
        SubCache::Pages,
        SubCache::Static,
        SubCache::Icons,
        SubCache::Images,
        SubCache::Fonts,
        SubCache::Runtime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubCache::Pages => "pages",
            SubCache::Static => "static",
            SubCache::Icons => "icons",
            SubCache::Images => "images",
            SubCache::Fonts => "fonts",
            SubCache::Runtime => "runtime",
        }
    }
}

/// How a classified request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Hand the request back to the embedder untouched.
    Bypass,
    /// Always ask the origin; never read or write a cache.
    NetworkOnly,
    /// Origin first; the cache answers only after the origin fails.
    NetworkFirst(SubCache),
    /// Cache first; the origin answers only on a miss.
    CacheFirst(SubCache),
    /// Cached answer immediately, refreshed in the background.
    StaleWhileRevalidate(SubCache),
}

impl Policy {
    /// The sub-cache this policy reads and writes, if any.
    pub fn cache(&self) -> Option<SubCache> {
        match self {
            Policy::Bypass | Policy::NetworkOnly => None,
            Policy::NetworkFirst(sub)
            | Policy::CacheFirst(sub)
            | Policy::StaleWhileRevalidate(sub) => Some(*sub),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Bypass => "bypass",
            Policy::NetworkOnly => "network-only",
            Policy::NetworkFirst(_) => "network-first",
            Policy::CacheFirst(_) => "cache-first",
            Policy::StaleWhileRevalidate(_) => "stale-while-revalidate",
        }
    }
}

/// Matching predicate for a rule.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// URL origin differs from the engine scope.
    CrossOrigin,
    /// Locale-stripped path starts with any of the given prefixes.
    PathPrefix(&'static [&'static str]),
    /// Request kind is one of the given kinds.
    Kind(&'static [ResourceKind]),
    /// Top-level navigation.
    Navigation,
    /// Icon asset, by URL shape.
    IconAsset,
    /// State-changing method.
    Mutation,
    /// Always matches.
    Any,
}

impl Matcher {
    fn matches(&self, request: &FetchRequest, scope: &Url) -> bool {
        match self {
            Matcher::CrossOrigin => request.url.origin() != scope.origin(),
            Matcher::PathPrefix(prefixes) => {
                let path = strip_locale_prefix(request.url.path());
                prefixes.iter().any(|prefix| path.starts_with(prefix))
            }
            Matcher::Kind(kinds) => kinds.contains(&request.kind),
            Matcher::Navigation => request.kind == ResourceKind::Navigation,
            Matcher::IconAsset => is_icon_asset(request.url.path()),
            Matcher::Mutation => request.is_mutation(),
            Matcher::Any => true,
        }
    }
}

/// One classification rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub label: &'static str,
    pub matcher: Matcher,
    pub policy: Policy,
    /// Enqueue for replay when a mutation under this rule fails.
    pub queue_on_failure: bool,
}

impl Rule {
    pub fn new(label: &'static str, matcher: Matcher, policy: Policy) -> Self {
        Self {
            label,
            matcher,
            policy,
            queue_on_failure: false,
        }
    }

    pub fn queue_on_failure(mut self) -> Self {
        self.queue_on_failure = true;
        self
    }
}

/// Session and auth endpoints. These must always see the live origin;
/// a cached or replayed response here can wedge a login flow.
pub const AUTH_PATHS: &[&str] = &[
    "/accounts/login/",
    "/accounts/logout/",
    "/accounts/oauth/",
    "/accounts/auth-status/",
];

/// Freshness-critical system endpoints.
pub const SYSTEM_PATHS: &[&str] = &["/healthz/", "/api/"];

/// Per-user pages that must never be served stale.
pub const USER_PATHS: &[&str] = &["/admin/", "/dashboard/", "/profile/edit/", "/coach/"];

/// The built-in rule table, in match order.
pub fn default_rules() -> Vec<Rule> {
    use Policy::*;
    vec![
        Rule::new("cross-origin", Matcher::CrossOrigin, Bypass),
        Rule::new("auth", Matcher::PathPrefix(AUTH_PATHS), NetworkOnly),
        Rule::new("system", Matcher::PathPrefix(SYSTEM_PATHS), NetworkOnly),
        Rule::new("user-specific", Matcher::PathPrefix(USER_PATHS), NetworkOnly),
        Rule::new("navigation", Matcher::Navigation, NetworkFirst(SubCache::Pages)),
        Rule::new(
            "assets",
            Matcher::Kind(&[ResourceKind::Style, ResourceKind::Script]),
            StaleWhileRevalidate(SubCache::Static),
        ),
        Rule::new("icons", Matcher::IconAsset, StaleWhileRevalidate(SubCache::Icons)),
        Rule::new(
            "images",
            Matcher::Kind(&[ResourceKind::Image]),
            CacheFirst(SubCache::Images),
        ),
        Rule::new(
            "fonts",
            Matcher::Kind(&[ResourceKind::Font]),
            StaleWhileRevalidate(SubCache::Fonts),
        ),
        Rule::new("mutations", Matcher::Mutation, NetworkOnly).queue_on_failure(),
        Rule::new("default", Matcher::Any, Bypass),
    ]
}

// Served when a custom rule list has no catch-all.
static CATCH_ALL: Rule = Rule {
    label: "default",
    matcher: Matcher::Any,
    policy: Policy::Bypass,
    queue_on_failure: false,
};

/// Ordered rule table bound to an origin scope.
pub struct RouteTable {
    scope: Url,
    rules: Vec<Rule>,
}

impl RouteTable {
    /// Table with the built-in rules.
    pub fn new(scope: Url) -> Self {
        Self::with_rules(scope, default_rules())
    }

    /// Table with custom rules, matched in the order given.
    pub fn with_rules(scope: Url, rules: Vec<Rule>) -> Self {
        Self { scope, rules }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Classify a request. Total: an unmatched request falls through to
    /// a bypass.
    pub fn classify(&self, request: &FetchRequest) -> &Rule {
        for rule in &self.rules {
            if rule.matcher.matches(request, &self.scope) {
                trace!(
                    url = %request.url,
                    rule = rule.label,
                    policy = rule.policy.as_str(),
                    "Classified request"
                );
                return rule;
            }
        }
        &CATCH_ALL
    }
}

/// Strip a leading `/xx/` or `/xx-yy/` locale segment.
///
/// `/en/accounts/login/` becomes `/accounts/login/`; paths without a
/// locale prefix are returned unchanged.
pub fn strip_locale_prefix(path: &str) -> &str {
    let Some(rest) = path.strip_prefix('/') else {
        return path;
    };
    let seg_end = rest.find('/').unwrap_or(rest.len());
    let seg = &rest[..seg_end];
    let is_locale = match seg.len() {
        2 => seg.bytes().all(|b| b.is_ascii_lowercase()),
        5 => {
            let b = seg.as_bytes();
            b[2] == b'-'
                && b[..2].iter().all(|c| c.is_ascii_lowercase())
                && b[3..].iter().all(|c| c.is_ascii_alphabetic())
        }
        _ => false,
    };
    if !is_locale {
        return path;
    }
    let remainder = &path[1 + seg_end..];
    if remainder.is_empty() {
        "/"
    } else {
        remainder
    }
}

/// Whether a URL path names an icon asset.
pub(crate) fn is_icon_asset(path: &str) -> bool {
    let path = strip_locale_prefix(path);
    path.starts_with("/static/icons/") || path.ends_with(".ico")
}
