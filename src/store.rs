//! Shared crawl state: the frontier of pending URLs, the visited set, and
//! the in-flight set.
//!
//! All three sets live behind one mutex so the claim/enqueue/complete
//! transitions are atomic. Invariant: outside a transition, a URL is in at
//! most one of frontier / in-flight / visited. The lock is never held across
//! an await point; checkpointing takes a [`StoreSnapshot`] under the lock
//! and serializes it after releasing it.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::url_utils::CanonicalUrl;

/// One scheduled URL with its retry history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub url: CanonicalUrl,
    pub attempts: u32,
    pub enqueued_at: i64,
}

impl FrontierEntry {
    pub fn new(url: CanonicalUrl) -> Self {
        Self {
            url,
            attempts: 0,
            enqueued_at: Utc::now().timestamp(),
        }
    }
}

/// Result of offering a URL to the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Already queued, in flight, or visited.
    Duplicate,
}

/// How a claimed URL finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fetched and processed; counts toward pages visited.
    Success,
    /// Retryable failure; re-enqueued until attempts are exhausted.
    Retry,
    /// Terminal failure; marked visited so it is never retried.
    Terminal,
}

/// Consistent copy of the store for checkpointing. In-flight URLs are
/// folded back into `pending` with their attempt counts, so an interrupted
/// run retries them on resume.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub visited: Vec<CanonicalUrl>,
    pub pending: Vec<FrontierEntry>,
    pub pages_visited: u64,
    pub failed_terminal: u64,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<FrontierEntry>,
    queued: HashSet<CanonicalUrl>,
    in_flight: HashMap<CanonicalUrl, FrontierEntry>,
    visited: HashSet<CanonicalUrl>,
    pages_visited: u64,
    failed_terminal: u64,
}

/// The frontier / visited / in-flight store. FIFO; ties between workers are
/// resolved by arrival order at the claim lock.
pub struct CrawlStore {
    inner: Mutex<Inner>,
    max_attempts: u32,
}

impl CrawlStore {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_attempts,
        }
    }

    /// Insert `url` iff it is not visited, not in flight, and not already
    /// queued. Admission is the caller's job; the store only deduplicates.
    pub fn try_enqueue(&self, url: CanonicalUrl) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        if inner.visited.contains(&url)
            || inner.in_flight.contains_key(&url)
            || inner.queued.contains(&url)
        {
            return EnqueueOutcome::Duplicate;
        }
        inner.queued.insert(url.clone());
        inner.queue.push_back(FrontierEntry::new(url));
        EnqueueOutcome::Enqueued
    }

    /// Re-insert an entry carrying prior attempts, used on checkpoint resume.
    pub fn reinstate(&self, entry: FrontierEntry) {
        let mut inner = self.inner.lock();
        if inner.visited.contains(&entry.url)
            || inner.in_flight.contains_key(&entry.url)
            || inner.queued.contains(&entry.url)
        {
            return;
        }
        inner.queued.insert(entry.url.clone());
        inner.queue.push_back(entry);
    }

    /// Mark a URL visited without fetching it, used on checkpoint resume.
    pub fn mark_visited(&self, url: CanonicalUrl) {
        let mut inner = self.inner.lock();
        inner.queued.remove(&url);
        inner.queue.retain(|e| e.url != url);
        inner.visited.insert(url);
    }

    pub fn set_pages_visited(&self, pages: u64) {
        self.inner.lock().pages_visited = pages;
    }

    /// Atomically move the oldest frontier entry into the in-flight set.
    pub fn claim(&self) -> Option<FrontierEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.queue.pop_front()?;
        inner.queued.remove(&entry.url);
        inner.in_flight.insert(entry.url.clone(), entry.clone());
        Some(entry)
    }

    /// Finish a claimed URL. Success and terminal failures move it to the
    /// visited set; retryable failures re-enqueue it with `attempts + 1`
    /// until `max_attempts` is exhausted, after which it is marked visited
    /// so it is not retried.
    pub fn complete(&self, url: &CanonicalUrl, disposition: Disposition) {
        let mut inner = self.inner.lock();
        let Some(mut entry) = inner.in_flight.remove(url) else {
            return;
        };
        match disposition {
            Disposition::Success => {
                inner.visited.insert(entry.url);
                inner.pages_visited += 1;
            }
            Disposition::Terminal => {
                inner.visited.insert(entry.url);
                inner.failed_terminal += 1;
            }
            Disposition::Retry => {
                entry.attempts += 1;
                if entry.attempts > self.max_attempts {
                    inner.visited.insert(entry.url);
                    inner.failed_terminal += 1;
                } else {
                    inner.queued.insert(entry.url.clone());
                    inner.queue.push_back(entry);
                }
            }
        }
    }

    /// Return a claimed URL to the frontier unchanged, used on cooperative
    /// cancellation. Does not count as an attempt.
    pub fn release(&self, url: &CanonicalUrl) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.in_flight.remove(url) {
            inner.queued.insert(entry.url.clone());
            inner.queue.push_front(entry);
        }
    }

    pub fn frontier_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn visited_len(&self) -> usize {
        self.inner.lock().visited.len()
    }

    pub fn pages_visited(&self) -> u64 {
        self.inner.lock().pages_visited
    }

    pub fn failed_terminal(&self) -> u64 {
        self.inner.lock().failed_terminal
    }

    /// True when nothing is queued and nothing is being fetched.
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.queue.is_empty() && inner.in_flight.is_empty()
    }

    pub fn visited_contains(&self, url: &CanonicalUrl) -> bool {
        self.inner.lock().visited.contains(url)
    }

    /// Consistent snapshot for the checkpointer.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock();
        let mut pending: Vec<FrontierEntry> = inner.queue.iter().cloned().collect();
        pending.extend(inner.in_flight.values().cloned());
        StoreSnapshot {
            visited: inner.visited.iter().cloned().collect(),
            pending,
            pages_visited: inner.pages_visited,
            failed_terminal: inner.failed_terminal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_utils::canonicalize;

    fn url(path: &str) -> CanonicalUrl {
        canonicalize(&format!("http://test.local{}", path), None, &[]).unwrap()
    }

    #[test]
    fn test_enqueue_dedup() {
        let store = CrawlStore::new(3);
        assert_eq!(store.try_enqueue(url("/a")), EnqueueOutcome::Enqueued);
        assert_eq!(store.try_enqueue(url("/a")), EnqueueOutcome::Duplicate);
        assert_eq!(store.frontier_len(), 1);
    }

    #[test]
    fn test_claim_moves_to_in_flight() {
        let store = CrawlStore::new(3);
        store.try_enqueue(url("/a"));
        let entry = store.claim().unwrap();
        assert_eq!(entry.url, url("/a"));
        assert_eq!(store.frontier_len(), 0);
        assert_eq!(store.in_flight_len(), 1);
        // A claimed URL cannot be re-enqueued.
        assert_eq!(store.try_enqueue(url("/a")), EnqueueOutcome::Duplicate);
    }

    #[test]
    fn test_fifo_order() {
        let store = CrawlStore::new(3);
        store.try_enqueue(url("/a"));
        store.try_enqueue(url("/b"));
        store.try_enqueue(url("/c"));
        assert_eq!(store.claim().unwrap().url, url("/a"));
        assert_eq!(store.claim().unwrap().url, url("/b"));
        assert_eq!(store.claim().unwrap().url, url("/c"));
        assert!(store.claim().is_none());
    }

    #[test]
    fn test_complete_success() {
        let store = CrawlStore::new(3);
        store.try_enqueue(url("/a"));
        let entry = store.claim().unwrap();
        store.complete(&entry.url, Disposition::Success);
        assert_eq!(store.in_flight_len(), 0);
        assert_eq!(store.visited_len(), 1);
        assert_eq!(store.pages_visited(), 1);
        assert_eq!(store.try_enqueue(url("/a")), EnqueueOutcome::Duplicate);
    }

    #[test]
    fn test_complete_retry_then_exhaust() {
        let store = CrawlStore::new(2);
        store.try_enqueue(url("/a"));

        for expected_attempts in 1..=2u32 {
            let entry = store.claim().unwrap();
            store.complete(&entry.url, Disposition::Retry);
            let requeued = store.claim().unwrap();
            assert_eq!(requeued.attempts, expected_attempts);
            store.release(&requeued.url);
        }

        // Third retry exhausts the budget and lands in visited.
        let entry = store.claim().unwrap();
        store.complete(&entry.url, Disposition::Retry);
        assert_eq!(store.frontier_len(), 0);
        assert!(store.visited_contains(&url("/a")));
        assert_eq!(store.pages_visited(), 0);
        assert_eq!(store.failed_terminal(), 1);
    }

    #[test]
    fn test_complete_terminal() {
        let store = CrawlStore::new(3);
        store.try_enqueue(url("/gone"));
        let entry = store.claim().unwrap();
        store.complete(&entry.url, Disposition::Terminal);
        assert!(store.visited_contains(&url("/gone")));
        assert_eq!(store.pages_visited(), 0);
        assert_eq!(store.failed_terminal(), 1);
    }

    #[test]
    fn test_release_preserves_attempts() {
        let store = CrawlStore::new(3);
        store.try_enqueue(url("/a"));
        store.try_enqueue(url("/b"));
        let entry = store.claim().unwrap();
        store.release(&entry.url);
        // Released entries go back to the front, attempts unchanged.
        let again = store.claim().unwrap();
        assert_eq!(again.url, url("/a"));
        assert_eq!(again.attempts, 0);
    }

    #[test]
    fn test_snapshot_includes_in_flight() {
        let store = CrawlStore::new(3);
        store.try_enqueue(url("/a"));
        store.try_enqueue(url("/b"));
        let claimed = store.claim().unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.pending.len(), 2);
        assert!(snap.pending.iter().any(|e| e.url == claimed.url));
    }

    #[test]
    fn test_exclusive_membership() {
        let store = CrawlStore::new(3);
        store.try_enqueue(url("/a"));
        let entry = store.claim().unwrap();
        // While in flight: not in frontier, not visited.
        assert_eq!(store.frontier_len(), 0);
        assert!(!store.visited_contains(&entry.url));
        store.complete(&entry.url, Disposition::Success);
        // After complete: only in visited.
        assert_eq!(store.in_flight_len(), 0);
        assert!(store.visited_contains(&entry.url));
    }
}
