use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use firehose_nozzle::auth::{NoopTokenFetcher, TokenFetcher, UaaTokenFetcher};
use firehose_nozzle::config::Config;
use firehose_nozzle::export::HealthMetrics;
use firehose_nozzle::firehose::WebsocketFirehose;
use firehose_nozzle::nozzle::{Nozzle, NozzleError};
use firehose_nozzle::sink;

/// Forwards Cloud Foundry firehose metrics to a metrics backend.
#[derive(Parser)]
#[command(name = "firehose-nozzle", about)]
struct Cli {
    /// Path to the JSON or YAML configuration file.
    #[arg(short, long, default_value = "config/firehose-nozzle.json")]
    config: PathBuf,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the configuration file.
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
        println!("firehose-nozzle {}", version::full());
        return Ok(());
    }

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        sink = cfg.sink.kind(),
        "starting firehose-nozzle",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health.start().await.context("starting health server")?;

    spawn_diagnostic_dump(Arc::clone(&health))?;

    let firehose =
        WebsocketFirehose::new(&cfg.traffic_controller_url, cfg.insecure_ssl_skip_verify);

    let result = if cfg.disable_access_control {
        run_nozzle(cfg, NoopTokenFetcher, firehose, Arc::clone(&health)).await
    } else {
        let fetcher = UaaTokenFetcher::new(
            &cfg.uaa_url,
            &cfg.username,
            &cfg.password,
            cfg.insecure_ssl_skip_verify,
        )?;
        run_nozzle(cfg, fetcher, firehose, Arc::clone(&health)).await
    };

    health.stop().await?;
    tracing::info!("firehose-nozzle stopped");

    result
}

async fn run_nozzle<T: TokenFetcher>(
    cfg: Config,
    fetcher: T,
    firehose: WebsocketFirehose,
    health: Arc<HealthMetrics>,
) -> Result<()> {
    let sink_cfg = cfg.sink.clone();
    let prefix = cfg.metric_prefix.clone();

    let mut nozzle = Nozzle::new(cfg, fetcher, firehose, move || {
        sink::from_config(&sink_cfg, &prefix)
    })
    .with_health(health);

    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    // A signal cancels the nozzle, which still drains and flushes its window.
    let shutdown = nozzle.shutdown_token();
    let run = nozzle.start();
    tokio::pin!(run);

    let result = tokio::select! {
        res = &mut run => res,
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
            shutdown.cancel();
            run.await
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            shutdown.cancel();
            run.await
        }
    };

    match result {
        Err(e) if e.is_clean_shutdown() => {
            tracing::info!(reason = %e, "firehose nozzle stopped cleanly");
            Ok(())
        }
        Err(e) => Err(exit_error(e)),
        Ok(()) => Ok(()),
    }
}

fn exit_error(err: NozzleError) -> anyhow::Error {
    anyhow::Error::new(err).context("firehose nozzle terminated")
}

/// Logs the self-observability registry on every SIGUSR1.
fn spawn_diagnostic_dump(health: Arc<HealthMetrics>) -> Result<()> {
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("registering SIGUSR1 handler")?;

    tokio::spawn(async move {
        while sigusr1.recv().await.is_some() {
            match health.render() {
                Ok(dump) => tracing::info!(metrics = %dump, "diagnostic dump"),
                Err(e) => tracing::warn!(error = %e, "rendering diagnostic dump"),
            }
        }
    });

    Ok(())
}
