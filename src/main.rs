use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use snoopd::config::Config;
use snoopd::sink::influx::InfluxWriter;

/// Kernel activity monitor shipping execve and readline probes to InfluxDB.
#[derive(Parser)]
#[command(name = "snoopd", about)]
struct Cli {
    /// Path to the YAML configuration file. Environment variables alone
    /// are enough when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
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
        println!("snoopd {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = Config::load(cli.config.as_deref()).context("loading configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        probe = %cfg.probe.kind,
        "starting snoopd",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let writer = InfluxWriter::new(cfg.sink.clone()).context("creating InfluxDB writer")?;

    // Writes are best-effort; an unreachable sink at startup is not fatal.
    match writer.ping().await {
        Ok(()) => tracing::info!(address = %cfg.sink.address, "InfluxDB reachable"),
        Err(e) => tracing::warn!(
            address = %cfg.sink.address,
            error = %e,
            "InfluxDB ping failed, continuing",
        ),
    }

    run_agent(cfg, writer).await
}

#[cfg(feature = "bpf")]
async fn run_agent(cfg: Config, writer: InfluxWriter) -> Result<()> {
    use snoopd::agent::Agent;
    use snoopd::tracer::bpf::BpfSource;

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;

    let source = BpfSource::new(cfg.probe.clone(), cfg.channel_capacity);
    let mut agent = Agent::new(cfg, source, writer)?;
    agent.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = agent.pump_finished() => {
            tracing::warn!("record source closed, shutting down");
        }
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("snoopd stopped");

    Ok(())
}

#[cfg(not(feature = "bpf"))]
async fn run_agent(_cfg: Config, _writer: InfluxWriter) -> Result<()> {
    anyhow::bail!("snoopd was built without the `bpf` feature; rebuild with --features bpf")
}
