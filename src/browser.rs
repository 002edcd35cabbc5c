//! The browser session contract.
//!
//! A [`BrowserSession`] is a JS-capable renderer that can load a URL, wait
//! for readiness, report an HTTP-like status signal, yield rendered HTML,
//! and enumerate clickable navigation affordances for SPA discovery. The
//! crawler core only sees these operations; `webdriver.rs` ships the real
//! implementation and the integration tests drive a scripted one.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Coarse classification of a navigation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok2xx,
    Redirect3xx,
    Client4xx,
    RateLimited429,
    Server5xx,
    Timeout,
    NavigationError,
}

/// What `navigate` produced: redirects already followed, HTML already
/// rendered.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub status: StatusClass,
    pub final_url: String,
    pub html: String,
    pub load_time: Duration,
}

/// A stable handle (XPath) to a DOM node that looks like a navigation
/// affordance, plus its visible text for slug synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Clickable {
    pub handle: String,
    pub text: String,
}

/// Result of activating a clickable: either the location changed, or the
/// body content hash changed, or nothing happened.
#[derive(Debug, Clone)]
pub struct Activation {
    pub new_url: Option<String>,
    pub content_changed: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session fault: {0}")]
    Fault(String),
    #[error("webdriver protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A JS-capable headless browser. Sessions are exclusively owned by one
/// worker and never shared.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load a URL, wait for readiness, and return the rendered page.
    /// Navigation-level failures are reported in the snapshot's status, not
    /// as errors; `Err` means the session itself is faulted.
    async fn navigate(&mut self, url: &str) -> Result<PageSnapshot, SessionError>;

    /// Enumerate DOM nodes that look like SPA navigation affordances.
    async fn enumerate_clickables(&mut self) -> Result<Vec<Clickable>, SessionError>;

    /// Activate a clickable and wait for quiescence, reporting whether the
    /// location or the body content hash changed.
    async fn activate(&mut self, clickable: &Clickable) -> Result<Activation, SessionError>;

    /// Release browser resources.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Creates sessions; a worker replaces a faulted session through this within
/// its restart budget.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}

/// Readiness timing shared by session implementations.
pub mod readiness {
    use std::time::Duration;

    /// No outstanding requests for this long means network-idle.
    pub const NETWORK_IDLE: Duration = Duration::from_millis(500);
    /// Overall cap for a regular navigation wait.
    pub const NAVIGATION_CAP: Duration = Duration::from_secs(15);
    /// Overall cap for the extended SPA wait.
    pub const SPA_CAP: Duration = Duration::from_secs(20);
    /// DOM must be mutation-free for this long after an activation.
    pub const MUTATION_FREE: Duration = Duration::from_millis(300);
    /// Overall cap for one activation.
    pub const ACTIVATION_CAP: Duration = Duration::from_secs(10);

    /// Loader elements that must disappear before an SPA page counts as
    /// ready.
    pub const LOADER_SELECTORS: &[&str] = &[
        ".loading",
        "#loading",
        ".spinner",
        ".loader",
        "[role='progressbar']",
        ".progress-bar",
        ".loading-overlay",
        ".loading-spinner",
    ];
}

/// CSS selectors for elements that plausibly trigger SPA navigation.
pub const CLICKABLE_SELECTORS: &[&str] = &[
    "nav li",
    ".nav-item",
    ".menu-item",
    "[role='menuitem']",
    "button:not([type='submit'])",
    "[role='button']",
    "[onclick]",
    "[data-toggle]",
    ".nav-link:not(a)",
    "[role='tab']",
];

/// Clickable exploration per page is capped at this many candidates.
pub const MAX_CLICKABLES_PER_PAGE: usize = 20;

/// Phrases that mark a small 2xx body as a disguised rate-limit response.
const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate limited",
    "too many requests",
    "throttled",
    "quota exceeded",
    "usage limit",
    "limit exceeded",
    "too frequent",
];

/// Bodies larger than this are never treated as rate-limit interstitials.
const RATE_LIMIT_BODY_CAP: usize = 4096;

/// Content heuristic for rate limiting hidden behind a 200: a small body
/// containing one of the usual phrases.
pub fn body_looks_rate_limited(html: &str) -> bool {
    if html.len() > RATE_LIMIT_BODY_CAP {
        return false;
    }
    let lower = html.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
}

/// Hash of the whitespace-normalized content, used to detect SPA navigation
/// that mutates the DOM without changing the location.
pub fn content_hash(html: &str) -> String {
    let mut normalized = String::with_capacity(html.len());
    let mut last_ws = false;
    for c in html.chars() {
        if c.is_whitespace() {
            if !last_ws {
                normalized.push(' ');
            }
            last_ws = true;
        } else {
            normalized.push(c);
            last_ws = false;
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_rate_limit_heuristic() {
        assert!(body_looks_rate_limited("<html>Too Many Requests</html>"));
        assert!(body_looks_rate_limited("<p>you have been throttled</p>"));
        assert!(!body_looks_rate_limited("<html>regular page about limits of calculus</html>"));
        // A big page mentioning rate limits is content, not an interstitial.
        let big = format!("<html>rate limit{}</html>", "x".repeat(8192));
        assert!(!body_looks_rate_limited(&big));
    }

    #[test]
    fn test_content_hash_ignores_whitespace() {
        let a = content_hash("<div>  hello\n  world </div>");
        let b = content_hash("<div> hello world </div>");
        assert_eq!(a, b);
        assert_ne!(a, content_hash("<div>hello world</div>"));
        assert_ne!(a, content_hash("<div> goodbye world </div>"));
    }
}
