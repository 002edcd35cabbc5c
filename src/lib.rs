pub mod browser;
pub mod cli;
pub mod config;
pub mod content;
pub mod extract;
pub mod logging;
pub mod orchestration;
pub mod rate_controller;
pub mod results;
pub mod store;
pub mod url_utils;
pub mod webdriver;
pub mod worker;

// Re-export main types for library usage
pub use config::CrawlConfig;
pub use orchestration::checkpoint::{Checkpoint, CheckpointManager};
pub use orchestration::manager::{CrawlError, CrawlManager, CrawlSummary, StopReason};
pub use rate_controller::{ControllerConfig, Outcome, RateController, Setpoint};
pub use results::{CsvKeywordSink, MarkdownTreeSink, PageResult, ResultSink};
pub use store::{CrawlStore, Disposition, FrontierEntry};
pub use url_utils::{canonicalize, CanonicalUrl, ScopePolicy};
