//! Crawl configuration, JSON config-file persistence, and the scope
//! fingerprint recorded in checkpoints.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::rate_controller::ControllerConfig;
use crate::url_utils::DEFAULT_TRACKING_PARAMS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a crawl run needs. Serializable so `--config`/`--save-config`
/// can round-trip it as JSON; unknown fields in a loaded file are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub start_url: String,
    pub keywords: Vec<String>,
    pub markdown_mode: bool,
    pub path_prefix: Option<String>,
    pub max_pages: Option<u64>,

    pub min_workers: u32,
    pub max_workers: u32,
    pub initial_workers: u32,
    pub min_delay: f64,
    pub max_delay: f64,
    pub initial_delay: f64,
    pub adaptive_control: bool,
    pub aggressive_throttling: bool,

    pub allow_subdomains: bool,
    pub allowed_extensions: Vec<String>,
    pub tracking_params: Vec<String>,
    pub spa: bool,

    pub max_attempts: u32,
    pub max_restarts: u32,
    pub checkpoint_interval_secs: u64,
    pub keep_checkpoint_backup: bool,

    pub output: PathBuf,
    pub webdriver_url: String,
    pub headless: bool,

    pub include_headers: bool,
    pub include_menus: bool,
    pub include_footers: bool,
    pub include_sidebars: bool,
    pub exclude_selectors: Vec<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            start_url: String::new(),
            keywords: Vec::new(),
            markdown_mode: false,
            path_prefix: None,
            max_pages: None,
            min_workers: 1,
            max_workers: 8,
            initial_workers: 4,
            min_delay: 0.5,
            max_delay: 30.0,
            initial_delay: 1.0,
            adaptive_control: true,
            aggressive_throttling: false,
            allow_subdomains: false,
            allowed_extensions: Vec::new(),
            tracking_params: DEFAULT_TRACKING_PARAMS.iter().map(|s| s.to_string()).collect(),
            spa: false,
            max_attempts: 3,
            max_restarts: 3,
            checkpoint_interval_secs: 600,
            keep_checkpoint_backup: true,
            output: PathBuf::from("./output"),
            webdriver_url: "http://127.0.0.1:9515".to_string(),
            headless: true,
            include_headers: true,
            include_menus: false,
            include_footers: false,
            include_sidebars: false,
            exclude_selectors: Vec::new(),
        }
    }
}

impl CrawlConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::Invalid("min_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(
                "min_workers must not exceed max_workers".into(),
            ));
        }
        if self.min_delay < 0.0 || self.min_delay > self.max_delay {
            return Err(ConfigError::Invalid(
                "delays must satisfy 0 <= min_delay <= max_delay".into(),
            ));
        }
        if self.checkpoint_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            initial_workers: self.initial_workers,
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            initial_delay: self.initial_delay,
            window_size: 20,
            aggressive: self.aggressive_throttling,
            adaptive: self.adaptive_control,
        }
    }

    /// Stable hash over the fields that decide which URLs are admitted and
    /// how they canonicalize. Stored in every checkpoint; a mismatch on
    /// resume is reported but does not block it.
    pub fn fingerprint(&self) -> String {
        let mut allowed = self.allowed_extensions.clone();
        allowed.sort();
        let mut tracking = self.tracking_params.clone();
        tracking.sort();
        let scope = serde_json::json!({
            "start_url": self.start_url,
            "path_prefix": self.path_prefix,
            "allow_subdomains": self.allow_subdomains,
            "allowed_extensions": allowed,
            "tracking_params": tracking,
        });
        let mut hasher = Sha256::new();
        hasher.update(scope.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output.join("crawl_checkpoint.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = CrawlConfig::default();
        config.start_url = "http://test.local/".into();
        config.keywords = vec!["alpha".into()];
        config.save(&path).unwrap();

        let loaded = CrawlConfig::load(&path).unwrap();
        assert_eq!(loaded.start_url, config.start_url);
        assert_eq!(loaded.keywords, config.keywords);
        assert_eq!(loaded.fingerprint(), config.fingerprint());
    }

    #[test]
    fn test_config_tolerates_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"start_url": "http://test.local/", "future_option": 42}"#,
        )
        .unwrap();
        let loaded = CrawlConfig::load(&path).unwrap();
        assert_eq!(loaded.start_url, "http://test.local/");
    }

    #[test]
    fn test_fingerprint_tracks_scope_fields() {
        let base = CrawlConfig {
            start_url: "http://test.local/".into(),
            ..Default::default()
        };
        let mut other = base.clone();
        other.allow_subdomains = true;
        assert_ne!(base.fingerprint(), other.fingerprint());

        // Non-scope fields do not move the fingerprint.
        let mut cosmetic = base.clone();
        cosmetic.max_workers = 2;
        cosmetic.markdown_mode = true;
        assert_eq!(base.fingerprint(), cosmetic.fingerprint());

        // Extension order is irrelevant.
        let mut a = base.clone();
        a.allowed_extensions = vec!["pdf".into(), "txt".into()];
        let mut b = base.clone();
        b.allowed_extensions = vec!["txt".into(), "pdf".into()];
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = CrawlConfig::default();
        config.min_workers = 5;
        config.max_workers = 2;
        assert!(config.validate().is_err());

        let mut config = CrawlConfig::default();
        config.min_delay = 10.0;
        config.max_delay = 1.0;
        assert!(config.validate().is_err());

        let mut config = CrawlConfig::default();
        config.min_workers = 0;
        assert!(config.validate().is_err());
    }
}
