//! W3C WebDriver implementation of the browser session contract.
//!
//! Talks the JSON wire protocol directly over HTTP: create a session with
//! headless capabilities, navigate, run synchronous scripts for readiness
//! probing and DOM inspection, delete the session on close. Any chromedriver
//! or geckodriver endpoint works.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::browser::{
    content_hash, readiness, Activation, BrowserSession, Clickable, PageSnapshot, SessionError,
    SessionFactory, StatusClass, CLICKABLE_SELECTORS,
};

const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Installs a counter the readiness probes read. Idempotent per document.
const MUTATION_OBSERVER_SCRIPT: &str = r#"
    if (!window.__whMutations) {
        window.__whMutations = 0;
        try {
            new MutationObserver(function (records) {
                window.__whMutations += records.length;
            }).observe(document.documentElement, {
                childList: true, subtree: true, characterData: true, attributes: true
            });
        } catch (e) {}
    }
    return true;
"#;

/// One probe for everything the readiness loop needs.
const READINESS_PROBE_SCRIPT: &str = r#"
    var loaders = 0;
    var selectors = arguments[0];
    for (var i = 0; i < selectors.length; i++) {
        var found = document.querySelectorAll(selectors[i]);
        for (var j = 0; j < found.length; j++) {
            var el = found[j];
            if (el.offsetParent !== null) { loaders++; }
        }
    }
    return {
        ready: document.readyState === 'complete',
        resources: performance.getEntriesByType('resource').length,
        mutations: window.__whMutations || 0,
        loaders: loaders
    };
"#;

/// Response status from the Navigation Timing API where the browser exposes
/// it; null otherwise.
const STATUS_PROBE_SCRIPT: &str = r#"
    try {
        var entries = performance.getEntriesByType('navigation');
        if (entries && entries.length > 0 && entries[0].responseStatus) {
            return entries[0].responseStatus;
        }
    } catch (e) {}
    return null;
"#;

const SNAPSHOT_SCRIPT: &str = r#"
    return {
        url: window.location.href || "",
        title: document.title || "",
        html: document.documentElement ? document.documentElement.outerHTML : "",
        body: document.body ? document.body.innerText.slice(0, 4096) : ""
    };
"#;

const BODY_HTML_SCRIPT: &str = "return document.body ? document.body.innerHTML : '';";

/// Enumerate navigation affordances with stable XPath handles. The XPath
/// builder mirrors the DOM position so a handle survives until the page
/// mutates underneath it.
const CLICKABLES_SCRIPT: &str = r#"
    function pathTo(element) {
        if (element.id) return '//*[@id="' + element.id + '"]';
        if (element === document.body) return '/html/body';
        if (!element.parentNode) return '';
        var index = 0;
        var siblings = element.parentNode.childNodes;
        for (var i = 0; i < siblings.length; i++) {
            var sibling = siblings[i];
            if (sibling === element) {
                return pathTo(element.parentNode) + '/' +
                    element.tagName.toLowerCase() + '[' + (index + 1) + ']';
            }
            if (sibling.nodeType === 1 && sibling.tagName === element.tagName) index++;
        }
        return '';
    }
    var out = [];
    var seen = [];
    var nodes = document.querySelectorAll(arguments[0]);
    for (var i = 0; i < nodes.length; i++) {
        var el = nodes[i];
        if (el.tagName === 'A' && el.getAttribute('href')) continue;
        if (el.offsetParent === null) continue;
        if (el.disabled) continue;
        if (seen.indexOf(el) !== -1) continue;
        seen.push(el);
        var xpath = pathTo(el);
        if (!xpath) continue;
        out.push({ xpath: xpath, text: (el.innerText || '').trim().slice(0, 80) });
    }
    return out;
"#;

const CLICK_SCRIPT: &str = r#"
    var result = document.evaluate(arguments[0], document, null,
        XPathResult.FIRST_ORDERED_NODE_TYPE, null);
    var el = result.singleNodeValue;
    if (!el) return false;
    el.scrollIntoView({ block: 'center' });
    el.click();
    return true;
"#;

/// Which browser the endpoint drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserKind {
    Chrome,
    Firefox,
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Base endpoint, e.g. `http://127.0.0.1:9515`.
    pub endpoint: String,
    pub browser: BrowserKind,
    pub headless: bool,
    /// Enables the extended SPA readiness wait on every navigation.
    pub spa: bool,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9515".to_string(),
            browser: BrowserKind::Chrome,
            headless: true,
            spa: false,
        }
    }
}

fn capabilities(browser: BrowserKind, headless: bool) -> Value {
    match browser {
        BrowserKind::Firefox => {
            let mut args: Vec<String> = Vec::new();
            if headless {
                args.push("-headless".into());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": { "args": args }
                    }
                }
            })
        }
        BrowserKind::Chrome => {
            let mut args: Vec<String> = vec![
                "--disable-gpu".into(),
                "--disable-dev-shm-usage".into(),
                "--no-first-run".into(),
                "--disable-cache".into(),
                "--disk-cache-size=0".into(),
                "--window-size=1400,1200".into(),
            ];
            if headless {
                args.push("--headless=new".into());
            }
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".into());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

/// Pull the webdriver error name out of a response value, if any.
fn wire_error(value: &Value) -> Option<(String, String)> {
    let name = value.pointer("/value/error")?.as_str()?.to_string();
    let message = value
        .pointer("/value/message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown webdriver error")
        .to_string();
    Some((name, message))
}

/// Factory that opens one driver session per worker.
pub struct WebDriverFactory {
    cfg: WebDriverConfig,
    client: reqwest::Client,
}

impl WebDriverFactory {
    pub fn new(cfg: WebDriverConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(40))
            .build()?;
        Ok(Self { cfg, client })
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn create(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let base = self.cfg.endpoint.trim_end_matches('/').to_string();
        let caps = capabilities(self.cfg.browser, self.cfg.headless);
        let res = self
            .client
            .post(format!("{base}/session"))
            .json(&caps)
            .send()
            .await
            .map_err(|e| SessionError::Fault(format!("session create failed: {e}")))?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(SessionError::Protocol(format!(
                "session create HTTP {}: {}",
                status.as_u16(),
                truncate_for_log(&body, 260)
            )));
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| SessionError::Protocol(format!("session create parse failed: {e}")))?;
        if let Some((name, message)) = wire_error(&value) {
            return Err(SessionError::Protocol(format!("{name}: {message}")));
        }
        let session_id = value
            .pointer("/value/sessionId")
            .and_then(|v| v.as_str())
            .or_else(|| value.pointer("/sessionId").and_then(|v| v.as_str()))
            .ok_or_else(|| {
                SessionError::Protocol(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&body, 220)
                ))
            })?
            .to_string();

        debug!(session = %session_id, "webdriver session created");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base,
            session_id,
            spa: self.cfg.spa,
        }))
    }
}

pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    session_id: String,
    spa: bool,
}

impl WebDriverSession {
    async fn execute(&self, script: &str, args: Value) -> Result<Value, SessionError> {
        let endpoint = format!("{}/session/{}/execute/sync", self.base, self.session_id);
        let res = self
            .client
            .post(endpoint)
            .json(&json!({ "script": script, "args": args }))
            .send()
            .await
            .map_err(|e| SessionError::Fault(format!("execute request failed: {e}")))?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(SessionError::Protocol(format!(
                "execute HTTP {}: {}",
                status.as_u16(),
                truncate_for_log(&body, 240)
            )));
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| SessionError::Protocol(format!("execute parse failed: {e}")))?;
        if let Some((name, message)) = wire_error(&value) {
            if name.contains("invalid session") || name.contains("no such window") {
                return Err(SessionError::Fault(format!("{name}: {message}")));
            }
            return Err(SessionError::Protocol(format!("{name}: {message}")));
        }
        Ok(value.pointer("/value").cloned().unwrap_or(Value::Null))
    }

    /// Poll until the document is ready and the network has gone idle; in
    /// SPA mode additionally wait for loaders to vanish and for at least one
    /// DOM mutation, all bounded by the relevant cap.
    async fn wait_ready(&self) -> Result<(), SessionError> {
        let cap = if self.spa {
            readiness::SPA_CAP
        } else {
            readiness::NAVIGATION_CAP
        };
        let deadline = Instant::now() + cap;
        let selectors = json!([readiness::LOADER_SELECTORS]);

        let mut last_resources = -1i64;
        let mut idle_since = Instant::now();
        loop {
            let probe = self.execute(READINESS_PROBE_SCRIPT, selectors.clone()).await?;
            let ready = probe.pointer("/ready").and_then(|v| v.as_bool()).unwrap_or(false);
            let resources = probe.pointer("/resources").and_then(|v| v.as_i64()).unwrap_or(0);
            let mutations = probe.pointer("/mutations").and_then(|v| v.as_i64()).unwrap_or(0);
            let loaders = probe.pointer("/loaders").and_then(|v| v.as_i64()).unwrap_or(0);

            if resources != last_resources {
                last_resources = resources;
                idle_since = Instant::now();
            }
            let network_idle = idle_since.elapsed() >= readiness::NETWORK_IDLE;
            let spa_ready = !self.spa || (loaders == 0 && mutations > 0);

            if ready && network_idle && spa_ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                trace!(ready, resources, mutations, loaders, "readiness wait capped");
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait after an activation: request-quiescent and mutation-free per the
    /// activation policy, capped at ten seconds.
    async fn wait_quiescent(&self) -> Result<(), SessionError> {
        let deadline = Instant::now() + readiness::ACTIVATION_CAP;
        let selectors = json!([readiness::LOADER_SELECTORS]);
        let mut last_resources = -1i64;
        let mut last_mutations = -1i64;
        let mut idle_since = Instant::now();
        let mut still_since = Instant::now();
        loop {
            let probe = self.execute(READINESS_PROBE_SCRIPT, selectors.clone()).await?;
            let resources = probe.pointer("/resources").and_then(|v| v.as_i64()).unwrap_or(0);
            let mutations = probe.pointer("/mutations").and_then(|v| v.as_i64()).unwrap_or(0);
            if resources != last_resources {
                last_resources = resources;
                idle_since = Instant::now();
            }
            if mutations != last_mutations {
                last_mutations = mutations;
                still_since = Instant::now();
            }
            if idle_since.elapsed() >= readiness::NETWORK_IDLE
                && still_since.elapsed() >= readiness::MUTATION_FREE
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Classify the landed page. Prefers the Navigation Timing response
    /// status; falls back to error-page heuristics on the title and body.
    async fn detect_status(&self, title: &str, body_text: &str) -> Result<StatusClass, SessionError> {
        if let Ok(value) = self.execute(STATUS_PROBE_SCRIPT, json!([])).await {
            if let Some(code) = value.as_i64() {
                return Ok(classify_code(code as u16));
            }
        }

        let title = title.to_lowercase();
        let body = body_text.to_lowercase();
        let status = if body.contains("429") || body.contains("too many requests") || body.contains("rate limit")
        {
            StatusClass::RateLimited429
        } else if title.contains("404") || title.contains("not found")
            || (body.contains("404") && body.contains("not found"))
        {
            StatusClass::Client4xx
        } else if title.contains("403")
            || title.contains("forbidden")
            || body.contains("access denied")
        {
            StatusClass::Client4xx
        } else if title.contains("500")
            || title.contains("server error")
            || body.contains("internal server error")
        {
            StatusClass::Server5xx
        } else {
            StatusClass::Ok2xx
        };
        Ok(status)
    }
}

pub fn classify_code(code: u16) -> StatusClass {
    match code {
        200..=299 => StatusClass::Ok2xx,
        300..=399 => StatusClass::Redirect3xx,
        429 => StatusClass::RateLimited429,
        408 => StatusClass::Timeout,
        400..=499 => StatusClass::Client4xx,
        500..=599 => StatusClass::Server5xx,
        _ => StatusClass::NavigationError,
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<PageSnapshot, SessionError> {
        let started = Instant::now();
        let endpoint = format!("{}/session/{}/url", self.base, self.session_id);
        let res = self
            .client
            .post(endpoint)
            .json(&json!({ "url": url }))
            .send()
            .await
            .map_err(|e| SessionError::Fault(format!("navigate request failed: {e}")))?;
        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            return Err(SessionError::Protocol(format!(
                "navigate HTTP {}: {}",
                status.as_u16(),
                truncate_for_log(&body, 240)
            )));
        }
        let value: Value = serde_json::from_str(&body).unwrap_or_default();
        if let Some((name, message)) = wire_error(&value) {
            let status = if name.contains("timeout") {
                StatusClass::Timeout
            } else if name.contains("invalid session") {
                return Err(SessionError::Fault(format!("{name}: {message}")));
            } else {
                warn!(url, error = %name, "navigation error");
                StatusClass::NavigationError
            };
            return Ok(PageSnapshot {
                status,
                final_url: url.to_string(),
                html: String::new(),
                load_time: started.elapsed(),
            });
        }

        self.execute(MUTATION_OBSERVER_SCRIPT, json!([])).await?;
        self.wait_ready().await?;

        let snap = self.execute(SNAPSHOT_SCRIPT, json!([])).await?;
        let final_url = snap
            .pointer("/url")
            .and_then(|v| v.as_str())
            .unwrap_or(url)
            .to_string();
        let title = snap.pointer("/title").and_then(|v| v.as_str()).unwrap_or("");
        let body_text = snap.pointer("/body").and_then(|v| v.as_str()).unwrap_or("");
        let html = snap
            .pointer("/html")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let status = self.detect_status(title, body_text).await?;
        Ok(PageSnapshot {
            status,
            final_url,
            html,
            load_time: started.elapsed(),
        })
    }

    async fn enumerate_clickables(&mut self) -> Result<Vec<Clickable>, SessionError> {
        let selector = CLICKABLE_SELECTORS.join(", ");
        let value = self.execute(CLICKABLES_SCRIPT, json!([selector])).await?;
        let mut out = Vec::new();
        if let Some(items) = value.as_array() {
            for item in items {
                let handle = item.pointer("/xpath").and_then(|v| v.as_str()).unwrap_or("");
                if handle.is_empty() {
                    continue;
                }
                out.push(Clickable {
                    handle: handle.to_string(),
                    text: item
                        .pointer("/text")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                });
            }
        }
        Ok(out)
    }

    async fn activate(&mut self, clickable: &Clickable) -> Result<Activation, SessionError> {
        let before_url = self
            .execute("return window.location.href;", json!([]))
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let before_body = self
            .execute(BODY_HTML_SCRIPT, json!([]))
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let before_hash = content_hash(&before_body);

        let clicked = self
            .execute(CLICK_SCRIPT, json!([clickable.handle]))
            .await?
            .as_bool()
            .unwrap_or(false);
        if !clicked {
            return Ok(Activation {
                new_url: None,
                content_changed: false,
            });
        }

        self.wait_quiescent().await?;

        let after_url = self
            .execute("return window.location.href;", json!([]))
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let after_body = self
            .execute(BODY_HTML_SCRIPT, json!([]))
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(Activation {
            new_url: (after_url != before_url && !after_url.is_empty()).then_some(after_url),
            content_changed: content_hash(&after_body) != before_hash,
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let endpoint = format!("{}/session/{}", self.base, self.session_id);
        self.client
            .delete(endpoint)
            .send()
            .await
            .map_err(|e| SessionError::Fault(format!("delete session failed: {e}")))?;
        debug!(session = %self.session_id, "webdriver session closed");
        Ok(())
    }
}
