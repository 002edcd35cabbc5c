//! Worker pool management and crawl lifecycle.
//!
//! The manager reconciles the set of live workers against the controller's
//! published target each tick, replaces unexpected exits, runs the
//! checkpoint cadence, and decides when the crawl is over: frontier drained,
//! page budget reached, or a termination signal. Every exit path writes a
//! final checkpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, CrawlConfig};
use crate::content::ContentFilter;
use crate::orchestration::checkpoint::{
    build_checkpoint, Checkpoint, CheckpointError, CheckpointManager,
};
use crate::rate_controller::{ControllerStats, RateController, Setpoint};
use crate::results::{PageResult, ResultSink};
use crate::browser::SessionFactory;
use crate::store::CrawlStore;
use crate::url_utils::{canonicalize, AdmissionError, ScopePolicy};
use crate::worker::{Worker, WorkerContext, WorkerExit};

/// Pool reconciliation cadence.
const TICK: Duration = Duration::from_millis(500);
/// Cooperative drain window before workers are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("no browser session could be created: {0}")]
    SessionUnavailable(String),
}

/// Why the crawl stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    FrontierExhausted,
    PageBudgetReached,
    Signalled,
}

/// End-of-run report.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub stop_reason: StopReason,
    pub pages_visited: u64,
    pub failed_terminal: u64,
    pub results_emitted: u64,
    pub final_setpoint: Setpoint,
    pub controller_stats: ControllerStats,
}

struct WorkerSlot {
    handle: JoinHandle<WorkerExit>,
    cancel: CancellationToken,
    draining: bool,
}

/// Owns the shared state and coordinates workers, controller, checkpoints,
/// and the result sink for one crawl run.
pub struct CrawlManager {
    config: CrawlConfig,
    store: Arc<CrawlStore>,
    controller: Arc<RateController>,
    setpoint_rx: watch::Receiver<Setpoint>,
    factory: Arc<dyn SessionFactory>,
    policy: Arc<ScopePolicy>,
    filter: Arc<ContentFilter>,
    checkpoints: Arc<CheckpointManager>,
    fingerprint: String,
    cancel: CancellationToken,
}

impl CrawlManager {
    pub fn new(
        config: CrawlConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        let seed = canonicalize(&config.start_url, None, &config.tracking_params)?;
        let policy = Arc::new(ScopePolicy::from_seed(
            &seed,
            config.allow_subdomains,
            config.path_prefix.clone(),
            &config.allowed_extensions,
        ));
        let filter = Arc::new(ContentFilter::new(
            config.include_headers,
            config.include_menus,
            config.include_footers,
            config.include_sidebars,
            &config.exclude_selectors,
        ));
        let (controller, setpoint_rx) = RateController::new(config.controller_config());
        let checkpoints = Arc::new(CheckpointManager::new(
            config.checkpoint_path(),
            Duration::from_secs(config.checkpoint_interval_secs),
            config.keep_checkpoint_backup,
        ));
        let fingerprint = config.fingerprint();
        let store = Arc::new(CrawlStore::new(config.max_attempts));

        Ok(Self {
            config,
            store,
            controller,
            setpoint_rx,
            factory,
            policy,
            filter,
            checkpoints,
            fingerprint,
            cancel: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> Arc<CrawlStore> {
        Arc::clone(&self.store)
    }

    pub fn controller(&self) -> Arc<RateController> {
        Arc::clone(&self.controller)
    }

    pub fn checkpoints(&self) -> Arc<CheckpointManager> {
        Arc::clone(&self.checkpoints)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    /// Restore state from the newest valid checkpoint. Returns false when
    /// there is nothing to resume from.
    pub fn resume(&self) -> Result<bool, CrawlError> {
        let checkpoint = match self.checkpoints.load() {
            Ok(checkpoint) => checkpoint,
            Err(CheckpointError::NotFound(_)) => {
                info!("no checkpoint found, starting fresh");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if checkpoint.config_fingerprint != self.fingerprint {
            warn!(
                "checkpoint was written under a different scope configuration; \
                 resuming anyway"
            );
        }

        let visited_count = checkpoint.visited.len();
        for url in checkpoint.visited {
            self.store.mark_visited(url);
        }
        // The load invariant: nothing pending may already be visited.
        let mut pending_count = 0usize;
        for entry in checkpoint.pending {
            if !self.store.visited_contains(&entry.url) {
                self.store.reinstate(entry);
                pending_count += 1;
            }
        }
        self.store.set_pages_visited(checkpoint.pages_visited);
        self.controller.restore(&checkpoint.controller);

        info!(
            visited = visited_count,
            pending = pending_count,
            pages = checkpoint.pages_visited,
            "resumed from checkpoint"
        );
        Ok(true)
    }

    fn worker_context(&self, results: mpsc::UnboundedSender<PageResult>) -> WorkerContext {
        WorkerContext {
            store: Arc::clone(&self.store),
            controller: Arc::clone(&self.controller),
            setpoint: self.setpoint_rx.clone(),
            factory: Arc::clone(&self.factory),
            policy: Arc::clone(&self.policy),
            filter: Arc::clone(&self.filter),
            results,
            keywords: Arc::new(self.config.keywords.clone()),
            tracking_params: Arc::new(self.config.tracking_params.clone()),
            markdown_mode: self.config.markdown_mode,
            spa: self.config.spa,
            max_restarts: self.config.max_restarts,
        }
    }

    fn build_checkpoint(&self) -> Checkpoint {
        let snapshot = self.store.snapshot();
        build_checkpoint(
            snapshot.visited,
            snapshot.pending,
            self.controller.snapshot(),
            snapshot.pages_visited,
            self.fingerprint.clone(),
        )
    }

    fn save_checkpoint_if_due(&self) {
        if !self.checkpoints.should_save(self.store.pages_visited()) {
            return;
        }
        // I/O failures are logged and retried at the next cadence.
        if let Err(e) = self.checkpoints.save(&self.build_checkpoint()) {
            warn!(error = %e, "checkpoint save failed");
        }
    }

    /// Run the crawl to completion. Consumes the sink and returns it inside
    /// the summary counters.
    pub async fn run(&mut self, mut sink: Box<dyn ResultSink>) -> Result<CrawlSummary, CrawlError> {
        let seed = canonicalize(&self.config.start_url, None, &self.config.tracking_params)?;
        self.store.try_enqueue(seed);

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<PageResult>();
        let sink_task: JoinHandle<Box<dyn ResultSink>> = tokio::spawn(async move {
            while let Some(result) = result_rx.recv().await {
                if let Err(e) = sink.emit(result) {
                    warn!(error = %e, "result sink error");
                }
            }
            let _ = sink.flush();
            sink
        });

        let mut workers: HashMap<u32, WorkerSlot> = HashMap::new();
        let mut next_worker_id = 0u32;
        let mut session_failures = 0u32;
        let mut last_pages = 0u64;
        let mut interval = tokio::time::interval(TICK);
        let mut exhausted_without_progress = false;

        let stop_reason = loop {
            interval.tick().await;

            if self.cancel.is_cancelled() {
                break StopReason::Signalled;
            }

            // Reap finished workers.
            let finished: Vec<u32> = workers
                .iter()
                .filter(|(_, slot)| slot.handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                let slot = workers.remove(&id).expect("finished worker present");
                match slot.handle.await {
                    Ok(WorkerExit::SessionBudgetExhausted) => {
                        session_failures += 1;
                        warn!(worker = id, session_failures, "worker exhausted its session budget");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(worker = id, error = %e, "worker panicked"),
                }
            }

            let pages = self.store.pages_visited();
            if pages > last_pages {
                last_pages = pages;
                session_failures = 0;
            }

            if let Some(max_pages) = self.config.max_pages {
                if pages >= max_pages {
                    info!(pages, max_pages, "page budget reached");
                    break StopReason::PageBudgetReached;
                }
            }

            if self.store.is_drained() && workers.is_empty() {
                break StopReason::FrontierExhausted;
            }

            // Browser infrastructure is down: every replacement burned its
            // whole restart budget and no page ever completed.
            if session_failures > self.config.max_workers && pages == 0 {
                exhausted_without_progress = true;
                break StopReason::Signalled;
            }

            self.reconcile(&mut workers, &mut next_worker_id, &result_tx);
            self.controller.tick();
            self.save_checkpoint_if_due();
        };

        self.drain_workers(workers).await;

        // Final checkpoint on every exit path.
        if let Err(e) = self.checkpoints.save(&self.build_checkpoint()) {
            warn!(error = %e, "final checkpoint save failed");
        }
        if stop_reason == StopReason::FrontierExhausted {
            // A completed crawl has no use for stale tmp/emergency files.
            self.checkpoints.cleanup(false);
        }

        drop(result_tx);
        let sink = sink_task.await.unwrap_or_else(|e| {
            error!(error = %e, "sink task failed");
            Box::new(crate::results::NullSink::default())
        });

        if exhausted_without_progress {
            return Err(CrawlError::SessionUnavailable(
                "all workers exhausted their restart budgets before any page was fetched".into(),
            ));
        }

        let summary = CrawlSummary {
            stop_reason,
            pages_visited: self.store.pages_visited(),
            failed_terminal: self.store.failed_terminal(),
            results_emitted: sink.emitted(),
            final_setpoint: self.controller.setpoint(),
            controller_stats: self.controller.stats(),
        };
        info!(
            pages = summary.pages_visited,
            failed = summary.failed_terminal,
            results = summary.results_emitted,
            workers = summary.final_setpoint.target_workers,
            delay_secs = summary.final_setpoint.current_delay,
            "crawl finished"
        );
        Ok(summary)
    }

    /// Match the live worker set to the published target: spawn the deficit,
    /// cooperatively drain the surplus (newest first, never killed mid-URL).
    fn reconcile(
        &self,
        workers: &mut HashMap<u32, WorkerSlot>,
        next_worker_id: &mut u32,
        result_tx: &mpsc::UnboundedSender<PageResult>,
    ) {
        let target = self.setpoint_rx.borrow().target_workers as usize;
        let active = workers.values().filter(|slot| !slot.draining).count();

        if active < target && !self.store.is_drained() {
            for _ in 0..(target - active) {
                let id = *next_worker_id;
                *next_worker_id += 1;
                let cancel = self.cancel.child_token();
                let worker = Worker::new(id, self.worker_context(result_tx.clone()), cancel.clone());
                let handle = tokio::spawn(worker.run());
                workers.insert(
                    id,
                    WorkerSlot {
                        handle,
                        cancel,
                        draining: false,
                    },
                );
                info!(worker = id, target, "worker spawned");
            }
        } else if active > target {
            let surplus = active - target;
            let mut ids: Vec<u32> = workers
                .iter()
                .filter(|(_, slot)| !slot.draining)
                .map(|(id, _)| *id)
                .collect();
            // Newest workers drain first.
            ids.sort_unstable_by(|a, b| b.cmp(a));
            for id in ids.into_iter().take(surplus) {
                if let Some(slot) = workers.get_mut(&id) {
                    slot.cancel.cancel();
                    slot.draining = true;
                    info!(worker = id, target, "worker draining");
                }
            }
        }
    }

    /// Signal every worker, wait out the grace period, then abort stragglers.
    async fn drain_workers(&self, workers: HashMap<u32, WorkerSlot>) {
        if workers.is_empty() {
            return;
        }
        for slot in workers.values() {
            slot.cancel.cancel();
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for (id, slot) in workers {
            let abort = slot.handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, slot.handle).await.is_err() {
                warn!(worker = id, "worker did not drain in time, aborting");
                abort.abort();
            }
        }
    }
}
