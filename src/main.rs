use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::Error as DotenvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use waitmon::app::AppContext;
use waitmon::clock::{SharedClock, SystemClock};
use waitmon::config::{self, AppConfig};
use waitmon::db::PgConnector;
use waitmon::http;
use waitmon::journal::{JournalReader, JournalSink, JournalWriter, OsFs, SharedFs};
use waitmon::metrics::AppMetrics;
use waitmon::poller::{PollContext, PollerRegistry};
use waitmon::repository::Repository;

#[derive(Debug, Parser)]
#[command(author, version, about = "Per-instance wait statistics and blocking monitor")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env WAITMON_CONFIG or built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    let targets = config::resolve_instances(&config)?;
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let metrics = AppMetrics::new()?;
    let clock: SharedClock = Arc::new(SystemClock);
    let repository = Arc::new(open_repository(&config, clock.clone(), &metrics).await?);

    let root = CancellationToken::new();
    let poll_ctx = PollContext {
        repository: repository.clone(),
        mapping: Arc::new(config.waits.mapping()),
        connector: Arc::new(PgConnector::new(config.timeouts.clone())),
        clock,
        metrics: metrics.clone(),
        polling: config.polling.clone(),
    };
    let registry = Arc::new(PollerRegistry::new(poll_ctx, root.clone()));
    let registered = registry.spawn_all(&targets);
    info!(instances = registered, "polling sessions started");

    #[cfg(unix)]
    spawn_reload_on_hangup(cli.config.clone(), registry.clone(), root.clone());

    let ctx = AppContext::new(config, metrics, repository.clone(), registry.clone());
    let router = http::create_router(ctx);

    info!("waitmon listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    registry.shutdown().await;
    repository.close().await;
    repository.shutdown_journal().await;
    info!("waitmon stopped");

    Ok(())
}

/// Build the repository and, when the journal is enabled, rebuild its rings
/// from disk before any poller can write.
async fn open_repository(
    config: &AppConfig,
    clock: SharedClock,
    metrics: &AppMetrics,
) -> anyhow::Result<Repository> {
    if !config.journal.enabled {
        warn!("journal disabled: wait history will not survive restarts");
        return Ok(Repository::new(config.history.settings(), clock, None));
    }

    let settings = config.journal.settings();
    let fs: SharedFs = Arc::new(OsFs);
    fs.create_dir_all(&settings.dir)
        .with_context(|| format!("failed to create journal dir {}", settings.dir.display()))?;

    let reader = JournalReader::new(settings.clone(), fs.clone(), clock.clone())
        .context("failed to open journal for replay")?;
    let sink = JournalSink::spawn(JournalWriter::new(settings, fs, clock.clone()));
    let repository = Repository::new(config.history.settings(), clock, Some(sink));

    let stats = repository.read_history(reader).await;
    metrics.record_replay(&stats);
    Ok(repository)
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("waitmon=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// On SIGHUP, re-read the instance list and reconcile the running sessions.
/// Other settings need a restart.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    path: Option<PathBuf>,
    registry: Arc<PollerRegistry>,
    shutdown: CancellationToken,
) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(err) => {
                warn!(error = ?err, "failed to install SIGHUP handler; reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
            }
            load_env();
            let targets = config::load_config(path.as_deref())
                .and_then(|config| config::resolve_instances(&config));
            match targets {
                Ok(targets) => {
                    let report = registry.reconcile(&targets).await;
                    info!(?report, "configuration reloaded");
                }
                Err(err) => error!(error = ?err, "configuration reload failed; keeping current instances"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
