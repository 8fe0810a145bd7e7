//! Request classification.
//!
//! Purely syntactic: only the URL and request mode are inspected.

use swkit_net::Request;
use tracing::trace;
use url::{Origin, Url};

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Prefix of the full URL.
    Prefix,
    /// Substring anywhere in the full URL.
    Contains,
}

impl UrlPattern {
    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            pattern_type: PatternType::Prefix,
            pattern: prefix.to_string(),
        }
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern_type: PatternType::Contains,
            pattern: substring.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let url_str = url.as_str();
        match self.pattern_type {
            PatternType::Prefix => url_str.starts_with(&self.pattern),
            PatternType::Contains => url_str.contains(&self.pattern),
        }
    }
}

/// How the worker treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Cross-origin and not allowlisted: the worker stays out of it.
    Passthrough,
    /// External/API endpoint: network-first.
    Api,
    /// Same-origin top-level document load: network with offline fallback.
    Navigation,
    /// Anything else on our origin: cache-first.
    StaticAsset,
}

/// Routes each intercepted request to a strategy.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
    api_patterns: Vec<UrlPattern>,
}

impl Classifier {
    /// Create a classifier for an application served from `origin`.
    pub fn new(origin: &Url, api_patterns: Vec<UrlPattern>) -> Self {
        Self {
            origin: origin.origin(),
            api_patterns,
        }
    }

    /// Build from configured substrings.
    pub fn from_substrings<S: AsRef<str>>(origin: &Url, patterns: &[S]) -> Self {
        Self::new(
            origin,
            patterns
                .iter()
                .map(|p| UrlPattern::contains(p.as_ref()))
                .collect(),
        )
    }

    /// Whether the URL matches an API allowlist pattern.
    pub fn is_api(&self, url: &Url) -> bool {
        self.api_patterns.iter().any(|p| p.matches(url))
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> RequestClass {
        let same_origin = request.url.origin() == self.origin;
        let api = self.is_api(&request.url);

        let class = if !same_origin && !api {
            RequestClass::Passthrough
        } else if api {
            RequestClass::Api
        } else if request.is_navigation() {
            RequestClass::Navigation
        } else {
            RequestClass::StaticAsset
        };

        trace!(url = %request.url, ?class, "Request classified");
        class
    }
}
