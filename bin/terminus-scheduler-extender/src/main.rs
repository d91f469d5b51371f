//! Entry point for the kube-scheduler HTTP extender. Much smaller than the
//! enforcement agent: two watch loops feed the node cache, an optional
//! leader-gated AI scorer runs alongside, and the extender's Filter/Score
//! webhook is served until signalled.

use clap::Parser;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
enum Error {
    #[error("failed to build kube client: {0}")]
    KubeClient(#[source] kube::Error),
    #[error(transparent)]
    Control(#[from] control_plane::Error),
    #[error("invalid extender configuration: {0}")]
    Config(#[from] scheduler_plugin::config::Error),
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Parser)]
#[command(name = "terminus-scheduler-extender", version, about = "kube-scheduler extender for container disk-quota admission")]
struct Cli {
    /// Address the extender's Filter/Score webhook listens on.
    #[arg(long, env = "EXTENDER_ADDR", default_value = "0.0.0.0:8888")]
    addr: SocketAddr,

    /// Namespace the leader-election Lease for the AI scorer lives in.
    #[arg(long, env = "LEASE_NAMESPACE", default_value = "")]
    lease_namespace: String,

    /// Name of the leader-election Lease for the AI scorer.
    #[arg(long, env = "LEASE_NAME", default_value = "terminus-scheduler-extender")]
    lease_name: String,

    #[arg(long, env = "OVERSUBSCRIPTION_RATIO", default_value_t = 0.0)]
    oversubscription_ratio: f64,

    #[arg(long, env = "USE_AI", default_value_t = false)]
    use_ai: bool,

    #[arg(long, env = "AI_WEIGHT_RATIO", default_value_t = 0)]
    ai_weight_ratio: u8,

    #[arg(long, env = "AI_MODEL_TYPE", default_value = "")]
    model_type: String,

    #[arg(long, env = "AI_MODEL_NAME", default_value = "")]
    model_name: String,

    #[arg(long, env = "OPENAI_API_KEY", default_value = "")]
    openai_api_key: String,

    #[arg(long, env = "OPENAI_API_URL", default_value = "")]
    openai_api_url: String,

    #[arg(long, env = "AI_SCORE_INTERVAL_SECS", default_value_t = 60)]
    ai_score_interval_secs: u64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = scheduler_plugin::ExtenderConfig {
        namespace: cli.lease_namespace.clone(),
        oversubscription_ratio: cli.oversubscription_ratio,
        use_ai: cli.use_ai,
        ai_weight_ratio: cli.ai_weight_ratio,
        model_type: cli.model_type.clone(),
        model_name: cli.model_name.clone(),
        openai_api_key: cli.openai_api_key.clone(),
        openai_api_url: cli.openai_api_url.clone(),
    }
    .with_defaults()?;
    let config = Arc::new(config);

    let client = kube::Client::try_default().await.map_err(Error::KubeClient)?;
    let control: Arc<dyn control_plane::ControlPlaneClient> =
        Arc::new(control_plane::KubeControlPlaneClient::from_client(client.clone()));

    let cache = Arc::new(scheduler_plugin::NodeCache::new());
    let cancel = tokio_util::sync::CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let client = client.clone();
        let cache = cache.clone();
        let cancel = cancel.clone();
        async move {
            scheduler_plugin::watch::run_node_watch(client, cache, cancel).await;
        }
    });

    tasks.spawn({
        let client = client.clone();
        let cache = cache.clone();
        let cancel = cancel.clone();
        async move {
            scheduler_plugin::watch::run_pod_watch(client, cache, cancel).await;
        }
    });

    let ai_scores = if config.ai_fully_configured() {
        let model: Arc<dyn ai_risk_scorer::LanguageModelClient> = Arc::new(ai_risk_scorer::OpenAiClient::new(
            config.openai_api_url.clone(),
            config.openai_api_key.clone(),
            config.model_name.clone(),
        ));
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "terminus-scheduler-extender".to_string());
        let scorer = ai_risk_scorer::AiRiskScorer::new(
            model,
            control.clone(),
            cache.clone(),
            cli.lease_namespace.clone(),
            cli.lease_name.clone(),
            hostname,
            Duration::from_secs(cli.ai_score_interval_secs),
        );
        let handle = scorer.scores_handle();
        tasks.spawn({
            let cancel = cancel.clone();
            async move {
                scorer.run(cancel).await;
            }
        });
        Some(handle)
    } else {
        info!("AI risk scoring not fully configured, skipping");
        None
    };

    let state = scheduler_plugin::ExtenderState { config: config.clone(), cache: cache.clone(), ai_scores };
    let app = scheduler_plugin::router(state);
    let listener = tokio::net::TcpListener::bind(cli.addr).await.map_err(Error::Serve)?;
    info!("scheduler extender listening on {}", cli.addr);

    let serve_cancel = cancel.clone();
    tasks.spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await
        {
            error!("extender server error: {e}");
        }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown_signal().await;
            cancel.cancel();
        }
    });

    while tasks.join_next().await.is_some() {}

    Ok(())
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
