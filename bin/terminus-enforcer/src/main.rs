//! Entry point for the per-node quota enforcement agent.
//!
//! Wires the runtime event adapter, storage quota hook, metadata store,
//! reporter and metrics exporter behind one cancellable supervisor, in the
//! same shape as the original agent's `errgroup`-based root command:
//! every worker shares a cancellation signal, the first non-cancellation
//! error from any of them tears down the rest.

use clap::Parser;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    QuotaBackend(#[from] quota_backend::Error),
    #[error(transparent)]
    ControlPlane(#[from] control_plane::Error),
    #[error(transparent)]
    Adapter(#[from] runtime_event_adapter::Error),
    #[error(transparent)]
    MetricsExporter(#[from] metrics_exporter::Error),
    #[error("worker task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Parser)]
#[command(name = "terminus-enforcer", version, about = "Per-node container disk-quota enforcement agent")]
struct Cli {
    /// Name of the Kubernetes node this process is running on.
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Root path of the containerd managed filesystem to quota.
    #[arg(long, env = "CONTAINERD_PATH", default_value = "/var/lib/containerd")]
    containerd_path: PathBuf,

    /// Unix socket the runtime event adapter registers on.
    #[arg(long, env = "NRI_SOCKET_PATH", default_value = "/var/run/nri/nri.sock")]
    socket_path: PathBuf,

    /// Address the Prometheus metrics server listens on.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9201")]
    metrics_addr: SocketAddr,

    /// How often the physical-capacity reporter ticks.
    #[arg(long, env = "REPORT_INTERVAL_SECS", default_value_t = 30)]
    report_interval_secs: u64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.node_name.is_empty() {
        error!("NODE_NAME must not be empty");
        return std::process::ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("waiting for prjquota on {}", cli.containerd_path.display());
    let containerd_path = cli.containerd_path.clone();
    tokio::task::spawn_blocking(move || {
        quota_backend::wait_for_prjquota(&containerd_path, Duration::from_secs(5));
    })
    .await?;

    let backend: Arc<dyn quota_backend::QuotaBackend> = Arc::from(quota_backend::new_backend(&cli.containerd_path)?);
    let control: Arc<dyn control_plane::ControlPlaneClient> = Arc::new(control_plane::KubeControlPlaneClient::try_new().await?);

    let (store, worker) = metadata_store::channel(metadata_store::DEFAULT_CAPACITY);
    store.restore(control.as_ref(), &cli.node_name).await;

    let hook: Arc<dyn enforcement_hook::EnforcementHook> =
        Arc::new(enforcement_hook::StorageQuotaHook::new(backend.clone(), store.clone(), control.clone()));

    let cancel = tokio_util::sync::CancellationToken::new();

    let adapter = runtime_event_adapter::Adapter::new(
        runtime_event_adapter::AdapterConfig::default(),
        vec![hook],
        runtime_event_adapter::UnixSocketTransport::new(cli.socket_path.clone()),
    );

    let reporter = reporter::Reporter::new(
        control.clone(),
        cli.node_name.clone(),
        cli.containerd_path.clone(),
        Duration::from_secs(cli.report_interval_secs),
    );

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await;
            Ok::<(), Error>(()) }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        async move { reporter.run(cancel).await;
            Ok::<(), Error>(()) }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        let backend = backend.clone();
        let store = store.clone();
        let addr = cli.metrics_addr;
        let mount_point = cli.containerd_path.to_string_lossy().to_string();
        async move { metrics_exporter::serve(addr, backend, store, mount_point, cancel).await.map_err(Into::into) }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        async move { adapter.run(cancel).await.map_err(Into::into) }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown_signal().await;
            cancel.cancel();
            Ok(())
        }
    });

    let mut first_error = None;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("worker exited with error, shutting down: {e}");
                cancel.cancel();
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                warn!("worker task panicked: {join_err}");
                cancel.cancel();
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
