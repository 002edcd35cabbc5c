//! Tracing setup: compact stdout output plus a daily-rotated file under the
//! output directory's `logs/` folder.
//!
//! `RUST_LOG` controls filtering (default "info"), e.g.
//! `RUST_LOG=webharvest=debug,reqwest=warn`.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the subscriber. Call once; a second call fails.
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let file_appender = tracing_appender::rolling::daily(log_path, "crawl.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_filter(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?);

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    // The guard must outlive the program or buffered lines are lost.
    Box::leak(Box::new(file_guard));

    tracing::debug!("logging initialized, file output in {}", log_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    #[test]
    fn test_log_dir_creation() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs");
        // init_logging can only run once per process, so only the directory
        // handling is exercised here.
        std::fs::create_dir_all(&log_path).unwrap();
        assert!(log_path.exists());
    }
}
