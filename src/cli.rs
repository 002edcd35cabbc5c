//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{ConfigError, CrawlConfig};

/// webharvest cli
#[derive(Parser, Debug)]
#[command(name = "webharvest")]
#[command(about = "Adaptive browser-backed crawler for keyword harvesting and Markdown capture")]
#[command(version)]
pub struct Cli {
    /// The URL to start crawling from
    pub url: String,

    /// Comma-separated keywords to search for
    #[arg(long, default_value = "")]
    pub keywords: String,

    /// Save page content as Markdown instead of searching keywords
    #[arg(long)]
    pub markdown_mode: bool,

    /// Restrict crawling to paths starting with this prefix
    #[arg(long)]
    pub path_prefix: Option<String>,

    /// Stop after visiting this many pages
    #[arg(long)]
    pub max_pages: Option<u64>,

    /// Minimum number of workers to maintain
    #[arg(long, default_value = "1")]
    pub min_workers: u32,

    /// Maximum number of workers to allow
    #[arg(long, default_value = "8")]
    pub max_workers: u32,

    /// Number of workers to start with
    #[arg(long, default_value = "4")]
    pub initial_workers: u32,

    /// Minimum delay between requests in seconds
    #[arg(long, default_value = "0.5")]
    pub min_delay: f64,

    /// Maximum delay between requests in seconds
    #[arg(long, default_value = "30.0")]
    pub max_delay: f64,

    /// Starting delay between requests in seconds
    #[arg(long, default_value = "1.0")]
    pub initial_delay: f64,

    /// Freeze worker count and delay at their initial values
    #[arg(long)]
    pub disable_adaptive_control: bool,

    /// Back off harder when rate limiting is detected
    #[arg(long)]
    pub aggressive_throttling: bool,

    /// Follow links onto subdomains of the seed's registrable domain
    #[arg(long)]
    pub allow_subdomains: bool,

    /// Comma-separated extra file extensions to treat as webpages
    #[arg(long, default_value = "")]
    pub allowed_extensions: String,

    /// Enable single-page-application discovery (clickable exploration)
    #[arg(long)]
    pub spa: bool,

    /// Resume from the checkpoint in the output directory
    #[arg(long)]
    pub resume: bool,

    /// Seconds between automatic checkpoint saves
    #[arg(long, default_value = "600")]
    pub checkpoint_interval: u64,

    /// Browser session restarts allowed per worker
    #[arg(long, default_value = "3")]
    pub max_restarts: u32,

    /// Output directory for reports, Markdown trees, checkpoints, and logs
    #[arg(long, default_value = "./output")]
    pub output: PathBuf,

    /// WebDriver endpoint to connect to
    #[arg(long, default_value = "http://127.0.0.1:9515")]
    pub webdriver_url: String,

    /// Run the browser with a visible window
    #[arg(long)]
    pub visible: bool,

    /// Include header content in keyword search and Markdown output
    #[arg(long)]
    pub include_headers: bool,

    /// Include menu and navigation content
    #[arg(long)]
    pub include_menus: bool,

    /// Include footer content
    #[arg(long)]
    pub include_footers: bool,

    /// Include sidebar content
    #[arg(long)]
    pub include_sidebars: bool,

    /// Comma-separated extra CSS selectors to exclude from content
    #[arg(long, default_value = "")]
    pub exclude_selectors: String,

    /// Load the full configuration from a JSON file; only the positional
    /// URL overrides it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the effective configuration to a JSON file and exit
    #[arg(long)]
    pub save_config: Option<PathBuf>,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Build the effective crawl configuration. A `--config` file is
    /// authoritative (the positional URL still wins); otherwise the flags
    /// fill in a default configuration.
    pub fn into_config(self) -> Result<CrawlConfig, ConfigError> {
        if let Some(path) = &self.config {
            let mut config = CrawlConfig::load(path)?;
            config.start_url = self.url;
            config.validate()?;
            return Ok(config);
        }

        let mut config = CrawlConfig::default();
        config.start_url = self.url;
        config.keywords = split_csv(&self.keywords);
        config.markdown_mode = self.markdown_mode;
        config.path_prefix = self.path_prefix;
        config.max_pages = self.max_pages;
        config.min_workers = self.min_workers;
        config.max_workers = self.max_workers;
        config.initial_workers = self.initial_workers;
        config.min_delay = self.min_delay;
        config.max_delay = self.max_delay;
        config.initial_delay = self.initial_delay;
        config.adaptive_control = !self.disable_adaptive_control;
        config.aggressive_throttling = self.aggressive_throttling;
        config.allow_subdomains = self.allow_subdomains;
        config.allowed_extensions = split_csv(&self.allowed_extensions);
        config.spa = self.spa;
        config.checkpoint_interval_secs = self.checkpoint_interval;
        config.max_restarts = self.max_restarts;
        config.output = self.output;
        config.webdriver_url = self.webdriver_url;
        config.headless = !self.visible;
        config.include_headers = self.include_headers;
        config.include_menus = self.include_menus;
        config.include_footers = self.include_footers;
        config.include_sidebars = self.include_sidebars;
        config.exclude_selectors = split_csv(&self.exclude_selectors);

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let cli = Cli::parse_from(["webharvest", "http://test.local/"]);
        assert_eq!(cli.url, "http://test.local/");
        let config = cli.into_config().unwrap();
        assert_eq!(config.start_url, "http://test.local/");
        assert!(config.keywords.is_empty());
        assert!(config.adaptive_control);
        assert!(config.headless);
    }

    #[test]
    fn test_parse_keywords_csv() {
        let cli = Cli::parse_from([
            "webharvest",
            "http://test.local/",
            "--keywords",
            "alpha, beta ,gamma",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.keywords, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_parse_rate_options() {
        let cli = Cli::parse_from([
            "webharvest",
            "http://test.local/",
            "--min-workers",
            "2",
            "--max-workers",
            "6",
            "--initial-delay",
            "2.5",
            "--aggressive-throttling",
            "--disable-adaptive-control",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 6);
        assert!((config.initial_delay - 2.5).abs() < 1e-9);
        assert!(config.aggressive_throttling);
        assert!(!config.adaptive_control);
    }

    #[test]
    fn test_config_file_is_authoritative() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut file_config = CrawlConfig::default();
        file_config.start_url = "http://stale.local/".into();
        file_config.max_workers = 16;
        file_config.spa = true;
        file_config.save(&path).unwrap();

        let cli = Cli::parse_from([
            "webharvest",
            "http://fresh.local/",
            "--config",
            path.to_str().unwrap(),
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.start_url, "http://fresh.local/");
        assert_eq!(config.max_workers, 16);
        assert!(config.spa);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let cli = Cli::parse_from([
            "webharvest",
            "http://test.local/",
            "--min-workers",
            "9",
            "--max-workers",
            "2",
        ]);
        assert!(cli.into_config().is_err());
    }
}
