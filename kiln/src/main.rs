// kiln/src/main.rs
use std::fs;
use std::path::Path;
use std::process;

use clap::Parser;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result as KilnResult};
use kiln_core::CancelSignal;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

mod cli;
use cli::CliArgs;

#[tokio::main]
async fn main() -> KilnResult<()> {
    let cli_args = CliArgs::parse();

    let mut config = Config::load().map_err(|e| {
        KilnError::Config(format!("Could not load configuration from the environment: {e}"))
    })?;
    if let Some(prefix) = &cli_args.prefix {
        config = rooted_at(config, prefix);
    }
    if let Some(jobs) = cli_args.jobs {
        config.make_jobs = jobs.max(1);
    }

    init_tracing(&config, cli_args.verbose);

    let cancel = CancelSignal::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping at the next phase boundary");
            eprintln!("{} stopping after the current step...", "Interrupted:".yellow().bold());
            ctrl_c.cancel();
        }
    });

    if let Err(e) = cli_args.command.run(config, cancel).await {
        error!("Command failed: {:#}", e);
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        process::exit(1);
    }

    debug!("Command completed successfully.");
    Ok(())
}

fn init_tracing(config: &Config, verbose: u8) {
    let level_filter = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let max_log_level = level_filter.into_level().unwrap_or(tracing::Level::INFO);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("KILN_LOG")
        .from_env_lossy();

    let log_dir = config.logs_dir();
    if verbose == 0 {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }

    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!(
            "{} Failed to create log directory {}: {}",
            "Error:".red().bold(),
            log_dir.display(),
            e
        );
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, "kiln.log");
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_writer = std::io::stderr.with_max_level(max_log_level);
    let file_writer = non_blocking_appender.with_max_level(max_log_level);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(stderr_writer.and(file_writer))
        .with_ansi(true)
        .without_time()
        .try_init();

    // The guard flushes the file writer on drop; keep it for the whole run.
    Box::leak(Box::new(guard));

    debug!(
        "Verbose logging enabled. Writing logs to: {}/kiln.log",
        log_dir.display()
    );
}

// Moves the configuration to another prefix. Formula directories follow the
// prefix unless KILN_FORMULA_PATH chose them explicitly.
fn rooted_at(config: Config, prefix: &Path) -> Config {
    let mut rooted = Config::with_root(prefix);
    if config.formula_paths != [config.kiln_root.join("Formula")] {
        rooted.formula_paths = config.formula_paths;
    }
    rooted.cache_root = config.cache_root;
    rooted.make_jobs = config.make_jobs;
    rooted.keep_build_dir = config.keep_build_dir;
    rooted.skip_test = config.skip_test;
    rooted
}
