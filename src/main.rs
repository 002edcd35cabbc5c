use std::process::ExitCode;
use std::sync::Arc;

use tracing::error;

use webharvest::browser::SessionFactory;
use webharvest::cli::Cli;
use webharvest::logging::init_logging;
use webharvest::orchestration::manager::CrawlManager;
use webharvest::orchestration::shutdown::install_signal_handler;
use webharvest::results::{CsvKeywordSink, MarkdownTreeSink, ResultSink};
use webharvest::webdriver::{WebDriverConfig, WebDriverFactory};

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    let save_config = cli.save_config.clone();
    let resume = cli.resume;

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    if let Some(path) = save_config {
        return match config.save(&path) {
            Ok(()) => {
                println!("configuration written to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to write configuration: {e}");
                ExitCode::from(2)
            }
        };
    }

    if let Err(e) = init_logging(config.output.join("logs")) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, resume)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "crawl failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    config: webharvest::CrawlConfig,
    resume: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory: Arc<dyn SessionFactory> = Arc::new(WebDriverFactory::new(WebDriverConfig {
        endpoint: config.webdriver_url.clone(),
        headless: config.headless,
        spa: config.spa,
        ..Default::default()
    })?);

    let sink: Box<dyn ResultSink> = if config.markdown_mode {
        Box::new(MarkdownTreeSink::create(&config.output.join("markdown"))?)
    } else {
        Box::new(CsvKeywordSink::create(
            &config.output.join("keyword_report.csv"),
        )?)
    };

    let mut manager = CrawlManager::new(config, factory)?;

    if resume {
        manager.resume()?;
    }

    install_signal_handler(
        manager.cancel_token(),
        manager.store(),
        manager.controller(),
        manager.checkpoints(),
        manager.fingerprint(),
    );

    let summary = manager.run(sink).await?;

    println!("\nCrawl summary:");
    println!("- Pages visited: {}", summary.pages_visited);
    println!("- Terminal failures: {}", summary.failed_terminal);
    println!("- Results emitted: {}", summary.results_emitted);
    println!(
        "- Final setpoint: {} workers, {:.2}s delay",
        summary.final_setpoint.target_workers, summary.final_setpoint.current_delay
    );
    let stats = summary.controller_stats;
    if stats.total > 0 {
        println!(
            "- Requests: {} total, {} ok, {} rate-limited, {} server errors, {} timeouts",
            stats.total, stats.success, stats.rate_limited, stats.server_errors, stats.timeouts
        );
    }
    Ok(())
}
