//! Graceful shutdown handling.
//!
//! First Ctrl+C writes an emergency checkpoint and starts the cooperative
//! drain. Second Ctrl+C exits immediately.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::orchestration::checkpoint::{build_checkpoint, CheckpointManager};
use crate::rate_controller::RateController;
use crate::store::CrawlStore;

/// Install the Ctrl+C handler. The emergency file is written before the
/// drain starts so even a hung shutdown leaves a resumable state on disk;
/// the manager still writes a proper atomic checkpoint when the drain
/// completes.
pub fn install_signal_handler(
    cancel: CancellationToken,
    store: Arc<CrawlStore>,
    controller: Arc<RateController>,
    checkpoints: Arc<CheckpointManager>,
    config_fingerprint: String,
) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("received Ctrl+C, writing emergency checkpoint and draining workers");
        info!("press Ctrl+C again to force quit");

        let snapshot = store.snapshot();
        let checkpoint = build_checkpoint(
            snapshot.visited,
            snapshot.pending,
            controller.snapshot(),
            snapshot.pages_visited,
            config_fingerprint,
        );
        if let Err(e) = checkpoints.emergency_save(&checkpoint) {
            error!(error = %e, "emergency checkpoint failed");
        }

        cancel.cancel();

        // Second Ctrl+C skips the grace period.
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                error!("force quit requested, exiting immediately");
                std::process::exit(1);
            }
        });
    });
}
