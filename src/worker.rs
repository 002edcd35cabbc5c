//! Crawl worker: owns one browser session and runs the
//! claim → fetch → report → emit → enqueue → complete → sleep loop.
//!
//! Workers never talk to each other. They interact only through the shared
//! store, the rate controller's outcome stream, and the result channel.
//! Errors become outcomes and URL-state transitions; a faulted session is
//! replaced within the restart budget.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{
    body_looks_rate_limited, BrowserSession, PageSnapshot, SessionFactory, StatusClass,
    MAX_CLICKABLES_PER_PAGE,
};
use crate::content::{page_category, page_meta, search_keywords, ContentFilter};
use crate::extract::{
    extract_links, extract_links_lenient, extract_script_routes, slugify,
    LENIENT_FALLBACK_THRESHOLD,
};
use crate::rate_controller::{Outcome, RateController, Setpoint};
use crate::results::PageResult;
use crate::store::{CrawlStore, Disposition, EnqueueOutcome, FrontierEntry};
use crate::url_utils::{canonicalize, CanonicalUrl, ScopePolicy};

/// How often an idle worker re-checks the frontier while peers are still
/// in flight.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Why a worker's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Frontier empty and nothing in flight.
    Drained,
    /// Cooperative cancellation.
    Cancelled,
    /// The restart budget ran out; the manager decides whether to replace.
    SessionBudgetExhausted,
}

/// Everything a worker shares with the rest of the engine. Cheap to clone;
/// one clone per spawned worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<CrawlStore>,
    pub controller: Arc<RateController>,
    pub setpoint: watch::Receiver<Setpoint>,
    pub factory: Arc<dyn SessionFactory>,
    pub policy: Arc<ScopePolicy>,
    pub filter: Arc<ContentFilter>,
    pub results: mpsc::UnboundedSender<PageResult>,
    pub keywords: Arc<Vec<String>>,
    pub tracking_params: Arc<Vec<String>>,
    pub markdown_mode: bool,
    pub spa: bool,
    pub max_restarts: u32,
}

pub struct Worker {
    id: u32,
    ctx: WorkerContext,
    cancel: CancellationToken,
    session: Option<Box<dyn BrowserSession>>,
    restarts: u32,
}

impl Worker {
    pub fn new(id: u32, ctx: WorkerContext, cancel: CancellationToken) -> Self {
        Self {
            id,
            ctx,
            cancel,
            session: None,
            restarts: 0,
        }
    }

    pub async fn run(mut self) -> WorkerExit {
        debug!(worker = self.id, "worker started");
        let exit = self.main_loop().await;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(worker = self.id, error = %e, "session close failed");
            }
        }
        debug!(worker = self.id, ?exit, "worker stopped");
        exit
    }

    async fn main_loop(&mut self) -> WorkerExit {
        loop {
            if self.cancel.is_cancelled() {
                return WorkerExit::Cancelled;
            }

            let Some(entry) = self.ctx.store.claim() else {
                if self.ctx.store.is_drained() {
                    return WorkerExit::Drained;
                }
                // Peers are still fetching; their discoveries may refill the
                // frontier.
                tokio::select! {
                    _ = self.cancel.cancelled() => return WorkerExit::Cancelled,
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                }
            };

            // Advisory delay, read once before the fetch.
            let delay = self.ctx.setpoint.borrow().current_delay;

            if self.session.is_none() && !self.create_session().await {
                self.ctx.store.release(&entry.url);
                return WorkerExit::SessionBudgetExhausted;
            }

            match self.process(&entry).await {
                Ok(disposition) => {
                    self.ctx.store.complete(&entry.url, disposition);
                }
                Err(()) => {
                    // Session budget exhausted mid-URL.
                    self.ctx.store.complete(&entry.url, Disposition::Retry);
                    return WorkerExit::SessionBudgetExhausted;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return WorkerExit::Cancelled,
                _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
            }
        }
    }

    async fn create_session(&mut self) -> bool {
        while self.restarts <= self.ctx.max_restarts {
            match self.ctx.factory.create().await {
                Ok(session) => {
                    self.session = Some(session);
                    return true;
                }
                Err(e) => {
                    self.restarts += 1;
                    warn!(
                        worker = self.id,
                        restarts = self.restarts,
                        error = %e,
                        "session creation failed"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        false
    }

    /// Discard the current session and build a replacement, counting against
    /// the restart budget.
    async fn restart_session(&mut self) -> bool {
        if let Some(mut session) = self.session.take() {
            let _ = session.close().await;
        }
        self.restarts += 1;
        if self.restarts > self.ctx.max_restarts {
            warn!(worker = self.id, "restart budget exhausted");
            return false;
        }
        self.create_session().await
    }

    /// Fetch one URL, report outcomes, emit results, and enqueue
    /// discoveries. `Err(())` means the session budget is gone.
    async fn process(&mut self, entry: &FrontierEntry) -> Result<Disposition, ()> {
        let url = entry.url.clone();
        debug!(worker = self.id, url = %url, attempts = entry.attempts, "fetching");

        let snapshot = match self.navigate_with_retry(&url).await? {
            Some(snapshot) => snapshot,
            None => {
                // Session fault persisted across the in-URL retry.
                self.ctx.controller.record(Outcome::Timeout);
                return Ok(Disposition::Retry);
            }
        };

        let status = if snapshot.status == StatusClass::Ok2xx
            && body_looks_rate_limited(&snapshot.html)
        {
            StatusClass::RateLimited429
        } else {
            snapshot.status
        };

        let (outcome, disposition) = match status {
            StatusClass::Ok2xx | StatusClass::Redirect3xx => (Outcome::Success, None),
            StatusClass::RateLimited429 => (Outcome::RateLimited, Some(Disposition::Retry)),
            StatusClass::Client4xx => (Outcome::ClientError, Some(Disposition::Terminal)),
            StatusClass::Server5xx => (Outcome::ServerError, Some(Disposition::Retry)),
            StatusClass::Timeout | StatusClass::NavigationError => {
                (Outcome::Timeout, Some(Disposition::Retry))
            }
        };
        self.ctx.controller.record(outcome);

        if let Some(disposition) = disposition {
            info!(
                worker = self.id,
                url = %url,
                ?status,
                attempts = entry.attempts,
                "page failed"
            );
            return Ok(disposition);
        }

        // Redirects are followed by the session; the landing URL must still
        // be admissible under the policy.
        let final_url = match self.canonical(&snapshot.final_url, None) {
            Ok(final_url) if self.ctx.policy.admit(&final_url).is_ok() => final_url,
            _ => {
                info!(worker = self.id, url = %url, final_url = %snapshot.final_url,
                    "admission revoked after redirect");
                return Ok(Disposition::Terminal);
            }
        };

        self.emit_results(&final_url, &snapshot);
        let discovered = self.discover(&final_url, &snapshot).await?;
        debug!(worker = self.id, url = %url, discovered, "page processed");
        Ok(Disposition::Success)
    }

    /// Navigate, retrying once across a session restart. `Ok(None)` means
    /// the fault persisted; `Err(())` means no session can be built at all.
    async fn navigate_with_retry(
        &mut self,
        url: &CanonicalUrl,
    ) -> Result<Option<PageSnapshot>, ()> {
        for attempt in 0..2 {
            let session = self.session.as_mut().ok_or(())?;
            match session.navigate(url.as_str()).await {
                Ok(snapshot) if snapshot.status == StatusClass::NavigationError => {
                    if attempt == 0 {
                        // One in-place retry before declaring a session fault.
                        self.ctx.controller.record(Outcome::Timeout);
                        continue;
                    }
                    // Repeated navigation errors on one URL count as a
                    // session fault: replace the session, let the caller
                    // classify the failure.
                    if !self.restart_session().await {
                        return Err(());
                    }
                    return Ok(Some(snapshot));
                }
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    warn!(worker = self.id, url = %url.as_str(), error = %e, "session fault");
                    if !self.restart_session().await {
                        return Err(());
                    }
                }
            }
        }
        Ok(None)
    }

    fn canonical(&self, raw: &str, base: Option<&Url>) -> Result<CanonicalUrl, crate::url_utils::AdmissionError> {
        canonicalize(raw, base, &self.ctx.tracking_params)
    }

    /// Run link discovery and feed admitted URLs to the frontier. Returns
    /// how many new URLs were enqueued.
    async fn discover(
        &mut self,
        final_url: &CanonicalUrl,
        snapshot: &PageSnapshot,
    ) -> Result<usize, ()> {
        let base = final_url.parsed();
        let mut raw_links = extract_links(&snapshot.html, &base);
        if raw_links.len() < LENIENT_FALLBACK_THRESHOLD {
            raw_links.extend(extract_links_lenient(&snapshot.html, &base));
        }
        raw_links.extend(extract_script_routes(&snapshot.html, &base));

        let mut enqueued = 0usize;
        for raw in raw_links {
            enqueued += self.try_enqueue_raw(&raw, &base) as usize;
        }

        if self.ctx.spa {
            enqueued += self.explore_clickables(final_url).await?;
        }
        Ok(enqueued)
    }

    fn try_enqueue_raw(&self, raw: &str, base: &Url) -> bool {
        let Ok(url) = self.canonical(raw, Some(base)) else {
            return false;
        };
        if self.ctx.policy.admit(&url).is_err() {
            return false;
        }
        self.ctx.store.try_enqueue(url) == EnqueueOutcome::Enqueued
    }

    /// Activate navigation affordances to surface SPA routes. Location
    /// changes enqueue the new URL and navigate back; content-only changes
    /// synthesize a fragment URL from the clickable's text.
    async fn explore_clickables(&mut self, origin: &CanonicalUrl) -> Result<usize, ()> {
        let session = self.session.as_mut().ok_or(())?;
        let clickables = match session.enumerate_clickables().await {
            Ok(clickables) => clickables,
            Err(e) => {
                debug!(worker = self.id, error = %e, "clickable enumeration failed");
                return Ok(0);
            }
        };

        let mut activated: HashSet<String> = HashSet::new();
        let mut enqueued = 0usize;
        for (index, clickable) in clickables.into_iter().take(MAX_CLICKABLES_PER_PAGE).enumerate()
        {
            if !activated.insert(clickable.handle.clone()) {
                continue;
            }
            let session = self.session.as_mut().ok_or(())?;
            let activation = match session.activate(&clickable).await {
                Ok(activation) => activation,
                Err(e) => {
                    debug!(worker = self.id, error = %e, "activation failed");
                    break;
                }
            };

            if let Some(new_url) = activation.new_url {
                if let Ok(url) = self.canonical(&new_url, Some(&origin.parsed())) {
                    if self.ctx.policy.admit(&url).is_ok()
                        && self.ctx.store.try_enqueue(url) == EnqueueOutcome::Enqueued
                    {
                        enqueued += 1;
                    }
                }
                // Restore the page before touching the next clickable.
                let session = self.session.as_mut().ok_or(())?;
                if session.navigate(origin.as_str()).await.is_err() {
                    break;
                }
            } else if activation.content_changed {
                let slug = {
                    let s = slugify(&clickable.text);
                    if s.is_empty() {
                        index.to_string()
                    } else {
                        s
                    }
                };
                let synthetic = crate::url_utils::with_fragment(
                    origin,
                    &format!("section-{slug}"),
                );
                if self.ctx.store.try_enqueue(synthetic) == EnqueueOutcome::Enqueued {
                    enqueued += 1;
                }
            }
        }
        Ok(enqueued)
    }

    fn emit_results(&self, url: &CanonicalUrl, snapshot: &PageSnapshot) {
        if self.ctx.markdown_mode {
            let filtered = self.ctx.filter.filtered_html(&snapshot.html);
            let markdown = html2md::parse_html(&filtered);
            let result = PageResult::MarkdownDoc {
                url: url.clone(),
                category: page_category(&url.parsed()),
                markdown,
                meta: page_meta(&snapshot.html),
            };
            let _ = self.ctx.results.send(result);
        } else if !self.ctx.keywords.is_empty() {
            let text = self.ctx.filter.filtered_text(&snapshot.html);
            for found in search_keywords(&text, &self.ctx.keywords) {
                let _ = self.ctx.results.send(PageResult::KeywordHit {
                    url: url.clone(),
                    keyword: found.keyword,
                    sentence: found.sentence,
                    context: found.context,
                });
            }
        }
    }
}
