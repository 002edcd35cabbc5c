//! Durable crawl checkpoints.
//!
//! Saves are atomic: write `<path>.tmp`, fsync, rename over the main file,
//! optionally keeping the previous file as `<path>.backup`. Fatal signals
//! get a best-effort `<path>.emergency` write with none of that ceremony.
//! On load a newer emergency file wins over the main checkpoint.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::rate_controller::ControllerSnapshot;
use crate::store::FrontierEntry;
use crate::url_utils::CanonicalUrl;

pub const CHECKPOINT_VERSION: &str = "1.0";

/// The serialized crawl state. Readers tolerate unknown extra fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_version: String,
    pub checkpoint_time: i64,
    pub visited: Vec<CanonicalUrl>,
    pub pending: Vec<FrontierEntry>,
    pub controller: ControllerSnapshot,
    pub pages_visited: u64,
    #[serde(default)]
    pub config_fingerprint: String,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("no checkpoint found at {0}")]
    NotFound(PathBuf),
}

struct SaveState {
    last_save_time: Option<chrono::DateTime<Utc>>,
    last_save_pages: u64,
}

/// Owns the checkpoint file family: `<path>`, `.tmp`, `.backup`,
/// `.emergency`. Single writer; readers only at startup.
pub struct CheckpointManager {
    path: PathBuf,
    interval: Duration,
    keep_backup: bool,
    state: Mutex<SaveState>,
}

impl CheckpointManager {
    pub fn new(path: PathBuf, interval: Duration, keep_backup: bool) -> Self {
        Self {
            path,
            interval,
            keep_backup,
            state: Mutex::new(SaveState {
                last_save_time: None,
                last_save_pages: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, ".backup")
    }

    fn emergency_path(&self) -> PathBuf {
        with_suffix(&self.path, ".emergency")
    }

    /// A checkpoint is due when the interval elapsed (rate-limited under
    /// tiny increments) or when page progress jumped by 20% (at least 10).
    pub fn should_save(&self, pages_visited: u64) -> bool {
        let state = self.state.lock();
        let Some(last_time) = state.last_save_time else {
            return true;
        };
        let elapsed = Utc::now()
            .signed_duration_since(last_time)
            .to_std()
            .unwrap_or_default();
        let pages_since = pages_visited.saturating_sub(state.last_save_pages);

        let min_gap = Duration::from_millis((pages_since * 100).min(10_000));
        if elapsed >= self.interval && elapsed >= min_gap {
            return true;
        }

        let progress_threshold = (state.last_save_pages / 5).max(10);
        pages_since >= progress_threshold
    }

    /// Atomic save. Updates the cadence bookkeeping only on success.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string(checkpoint)?.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }
        if self.keep_backup && self.path.exists() {
            fs::copy(&self.path, self.backup_path())?;
        }
        fs::rename(&tmp, &self.path)?;

        let mut state = self.state.lock();
        state.last_save_time = Some(Utc::now());
        state.last_save_pages = checkpoint.pages_visited;
        info!(
            pages = checkpoint.pages_visited,
            pending = checkpoint.pending.len(),
            visited = checkpoint.visited.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Best-effort fast save for fatal signals: direct write, no rename, a
    /// partial file is acceptable.
    pub fn emergency_save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(self.emergency_path())?;
        file.write_all(serde_json::to_string(checkpoint)?.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Load the freshest valid checkpoint: the emergency file when it is
    /// newer than the main one, the main file otherwise.
    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let main = self.load_file(&self.path);
        let emergency = self.load_file(&self.emergency_path());

        match (main, emergency) {
            (Ok(main), Ok(emergency)) => {
                if emergency.checkpoint_time > main.checkpoint_time {
                    warn!("emergency checkpoint is newer than the main file, using it");
                    Ok(emergency)
                } else {
                    Ok(main)
                }
            }
            (Ok(main), Err(_)) => Ok(main),
            (Err(_), Ok(emergency)) => {
                warn!("main checkpoint unusable, recovering from emergency file");
                Ok(emergency)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn load_file(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        for field in ["checkpoint_time", "visited", "pending", "pages_visited"] {
            if value.get(field).is_none() {
                return Err(CheckpointError::MissingField(field));
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Remove companion files; the main checkpoint is kept.
    pub fn cleanup(&self, remove_backup: bool) {
        let _ = fs::remove_file(self.tmp_path());
        let _ = fs::remove_file(self.emergency_path());
        if remove_backup {
            let _ = fs::remove_file(self.backup_path());
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Assemble a checkpoint from live state. Pending entries that already
/// appear in the visited set are dropped so `pending ∩ visited = ∅` holds by
/// construction.
pub fn build_checkpoint(
    visited: Vec<CanonicalUrl>,
    pending: Vec<FrontierEntry>,
    controller: ControllerSnapshot,
    pages_visited: u64,
    config_fingerprint: String,
) -> Checkpoint {
    let visited_set: std::collections::HashSet<&CanonicalUrl> = visited.iter().collect();
    let pending = pending
        .into_iter()
        .filter(|entry| !visited_set.contains(&entry.url))
        .collect();
    Checkpoint {
        checkpoint_version: CHECKPOINT_VERSION.to_string(),
        checkpoint_time: Utc::now().timestamp(),
        visited,
        pending,
        controller,
        pages_visited,
        config_fingerprint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_utils::canonicalize;
    use tempfile::TempDir;

    fn url(path: &str) -> CanonicalUrl {
        canonicalize(&format!("http://test.local{}", path), None, &[]).unwrap()
    }

    fn sample(pages: u64) -> Checkpoint {
        build_checkpoint(
            vec![url("/a"), url("/b")],
            vec![FrontierEntry::new(url("/c"))],
            ControllerSnapshot {
                current_delay: 1.5,
                target_workers: 3,
            },
            pages,
            "fp".into(),
        )
    }

    fn manager(dir: &TempDir) -> CheckpointManager {
        CheckpointManager::new(
            dir.path().join("checkpoint.json"),
            Duration::from_secs(600),
            true,
        )
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let checkpoint = sample(2);
        mgr.save(&checkpoint).unwrap();

        let loaded = mgr.load().unwrap();
        assert_eq!(loaded.visited, checkpoint.visited);
        assert_eq!(loaded.pending, checkpoint.pending);
        assert_eq!(loaded.pages_visited, 2);
        assert_eq!(loaded.controller.target_workers, 3);
        assert!((loaded.controller.current_delay - 1.5).abs() < 1e-9);
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn test_backup_keeps_previous() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.save(&sample(1)).unwrap();
        mgr.save(&sample(5)).unwrap();

        let backup = dir.path().join("checkpoint.json.backup");
        assert!(backup.exists());
        let previous: Checkpoint =
            serde_json::from_str(&fs::read_to_string(backup).unwrap()).unwrap();
        assert_eq!(previous.pages_visited, 1);
    }

    #[test]
    fn test_emergency_preferred_when_newer() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let mut main = sample(3);
        main.checkpoint_time -= 60;
        mgr.save(&main).unwrap();

        let emergency = sample(7);
        mgr.emergency_save(&emergency).unwrap();

        let loaded = mgr.load().unwrap();
        assert_eq!(loaded.pages_visited, 7);
    }

    #[test]
    fn test_older_emergency_ignored() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let mut emergency = sample(1);
        emergency.checkpoint_time -= 120;
        mgr.emergency_save(&emergency).unwrap();
        mgr.save(&sample(9)).unwrap();

        assert_eq!(mgr.load().unwrap().pages_visited, 9);
    }

    #[test]
    fn test_load_rejects_missing_fields() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        fs::write(
            mgr.path(),
            r#"{"checkpoint_version": "1.0", "visited": []}"#,
        )
        .unwrap();
        assert!(matches!(
            mgr.load(),
            Err(CheckpointError::MissingField(_))
        ));
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        fs::write(mgr.path(), "{not json").unwrap();
        assert!(matches!(mgr.load(), Err(CheckpointError::Json(_))));
    }

    #[test]
    fn test_load_tolerates_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let mut value = serde_json::to_value(sample(1)).unwrap();
        value["future_field"] = serde_json::json!({"x": 1});
        fs::write(mgr.path(), value.to_string()).unwrap();
        assert!(mgr.load().is_ok());
    }

    #[test]
    fn test_build_checkpoint_disjoint_invariant() {
        let checkpoint = build_checkpoint(
            vec![url("/a")],
            vec![FrontierEntry::new(url("/a")), FrontierEntry::new(url("/b"))],
            ControllerSnapshot {
                current_delay: 1.0,
                target_workers: 1,
            },
            0,
            String::new(),
        );
        assert_eq!(checkpoint.pending.len(), 1);
        assert_eq!(checkpoint.pending[0].url, url("/b"));
    }

    #[test]
    fn test_should_save_cadence() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(
            dir.path().join("checkpoint.json"),
            Duration::from_secs(600),
            false,
        );
        // Never saved: due immediately.
        assert!(mgr.should_save(0));
        mgr.save(&sample(10)).unwrap();
        // Just saved, no progress: not due.
        assert!(!mgr.should_save(10));
        // Progress threshold: max(10, 20% of 10) = 10 more pages.
        assert!(!mgr.should_save(15));
        assert!(mgr.should_save(20));
    }

    #[test]
    fn test_cleanup() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.save(&sample(1)).unwrap();
        mgr.save(&sample(2)).unwrap();
        mgr.emergency_save(&sample(3)).unwrap();

        mgr.cleanup(true);
        assert!(mgr.path().exists());
        assert!(!dir.path().join("checkpoint.json.emergency").exists());
        assert!(!dir.path().join("checkpoint.json.backup").exists());
    }
}
