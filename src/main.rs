use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cpuwatch::{agent, config};

/// Host CPU telemetry agent.
#[derive(Parser)]
#[command(name = "cpuwatch", about)]
struct Cli {
    /// Path to the YAML configuration file. Environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// `log_level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("cpuwatch {}", version::full());
        return Ok(());
    }

    // A missing .env file is fine; real environment variables still apply.
    let dotenv = dotenvy::dotenv();

    let loaded = config::Config::load(cli.config.as_deref());

    // Initialize tracing.
    let log_level = match &loaded {
        Ok(cfg) => cfg.log_filter(cli.log_level.as_deref()),
        Err(_) => cli.log_level.as_deref().unwrap_or("info"),
    };
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Ok(path) = &dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    let cfg = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            let reason = format!("{e:#}");
            tracing::error!(error = %reason, "invalid configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        host = %cfg.host,
        "starting cpuwatch",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("cpuwatch stopped");

    Ok(())
}
