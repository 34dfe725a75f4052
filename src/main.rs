use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use palisade::clock::{Clock, SystemClock};
use palisade::config::StoreBackend;
use palisade::mesh::Cluster;
use palisade::store::{CounterStore, MemoryCounterStore, MeshCounterStore};
use palisade::{Engine, PalisadeConfig, RequestDescriptor};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Evaluate JSON-lines request descriptors from stdin and print one JSON
/// decision per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "palisade", version, about)]
struct Args {
    /// YAML configuration file; PALISADE__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Palisade mitigation engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PalisadeConfig::load(args.config.as_deref())?;
    info!(store = ?config.store.backend, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (store, cluster): (Arc<dyn CounterStore>, Option<Arc<Cluster>>) = match config.store.backend {
        StoreBackend::Memory => (Arc::new(MemoryCounterStore::new(clock.clone())), None),
        StoreBackend::Mesh => {
            let cluster = Arc::new(Cluster::start(&config.store.mesh).await?);
            (
                Arc::new(MeshCounterStore::new(cluster.clone(), clock.clone())),
                Some(cluster),
            )
        }
    };

    let engine = Engine::builder(config).clock(clock).store(store).build()?;

    tokio::select! {
        result = serve_stdin(&engine) => result?,
        _ = shutdown_signal() => {}
    }

    engine.shutdown().await;
    drop(engine);

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still referenced; skipping graceful leave"),
        }
    }

    info!("Palisade mitigation engine stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Read descriptors until stdin closes.
async fn serve_stdin(engine: &Engine) -> anyhow::Result<()> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: RequestDescriptor = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request descriptor");
                continue;
            }
        };

        let decision = engine.evaluate(&request).await;
        let mut output = serde_json::to_vec(&decision)?;
        output.push(b'\n');
        stdout.write_all(&output).await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
