use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use wameter::{
    actors::{HealthActor, LivenessActor, StorageActor},
    api::{self, ApiState, middleware::Authenticator},
    config::{Config, read_config_file},
    health::HealthChecker,
    ingest::IngestPipeline,
    lifecycle::Lifecycle,
    logging,
    notify::{NotificationManager, NotifyHandle, TemplateLoader},
    registry::AgentRegistry,
    storage,
    util::get_config_path,
};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Parser)]
#[command(version, about = "wameter network telemetry server")]
struct Args {
    /// Config file (JSON, or TOML by extension); defaults to $WAMETER_CONFIG
    #[arg(short, long)]
    config: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

/// Everything `main` needs after a successful startup
struct Server {
    config: Config,
    lifecycle: Lifecycle,
    storage: Arc<dyn storage::StorageBackend>,
    registry: Arc<AgentRegistry>,
    ingest: Arc<IngestPipeline>,
    app: axum::Router,
}

#[instrument(skip_all)]
async fn start(config: Config) -> anyhow::Result<Server> {
    let storage = storage::connect(&config.storage)
        .await
        .context("failed to open storage")?;
    info!(driver = storage.driver(), "storage ready");

    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&storage),
        config.agents.offline_threshold,
    ));
    let hydrated = registry.hydrate().await.context("failed to load agents")?;
    debug!("loaded {hydrated} agents from storage");

    let templates = Arc::new(TemplateLoader::new());
    if let Some(dir) = &config.notify.templates_dir {
        let count = templates
            .load_dir(dir)
            .with_context(|| format!("failed to load templates from {}", dir.display()))?;
        info!("loaded {count} custom templates");
    }

    let lifecycle = Lifecycle::new(config.server.shutdown_timeout);

    let (notify, sinks) = if config.notify.enabled {
        let (manager, handle) = NotificationManager::from_config(&config.notify, templates, &lifecycle.token())
            .context("invalid notification configuration")?;
        let sinks = manager.sinks().to_vec();
        lifecycle.spawn("notification-dispatcher", manager.run(lifecycle.token()));
        (handle, sinks)
    } else {
        info!("notifications disabled");
        (NotifyHandle::disabled(), Vec::new())
    };

    let ingest = Arc::new(
        IngestPipeline::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            notify.clone(),
            config.notify.thresholds.clone(),
        )
        .with_max_future_skew(config.ingest.max_future_skew),
    );

    let checker = HealthChecker::new(Arc::clone(&storage), Arc::clone(&registry), sinks);

    let liveness = LivenessActor::new(
        Arc::clone(&registry),
        notify.clone(),
        config.agents.check_interval,
    );
    lifecycle.spawn_supervised("liveness", move |cancel| liveness.clone().run(cancel));

    let storage_actor = StorageActor::new(Arc::clone(&storage), &config.storage);
    lifecycle.spawn_supervised("storage", move |cancel| storage_actor.clone().run(cancel));

    let health_actor = HealthActor::new(checker.clone(), HEALTH_CHECK_INTERVAL);
    lifecycle.spawn_supervised("health", move |cancel| health_actor.clone().run(cancel));

    let auth = Authenticator::from_config(&config.api.auth).context("invalid auth configuration")?;
    let state = ApiState::new(Arc::clone(&storage), Arc::clone(&ingest), notify, checker, auth);
    let request_timeout = config.server.read_timeout + config.server.write_timeout;
    let app = api::router(state, &config.api, request_timeout);

    Ok(Server {
        config,
        lifecycle,
        storage,
        registry,
        ingest,
        app,
    })
}

/// Cancel `token` on ctrl-c or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("failed to listen for SIGTERM: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = terminate => info!("received SIGTERM"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let path = args.config.clone().unwrap_or_else(get_config_path);

    let config = match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wameter: {e}");
            return ExitCode::from(1);
        }
    };
    if args.check {
        println!("configuration {path} is valid");
        return ExitCode::SUCCESS;
    }
    if let Err(e) = logging::init(&config.log) {
        eprintln!("wameter: {e}");
        return ExitCode::from(1);
    }
    info!(version = env!("CARGO_PKG_VERSION"), config = %path, "starting wameter");

    let server = match start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {e:#}");
            return ExitCode::from(1);
        }
    };

    let token = server.lifecycle.token();
    spawn_signal_handler(token.clone());

    let mut code = ExitCode::SUCCESS;
    if let Err(e) = api::serve(server.app, &server.config.server, token.clone()).await {
        error!("API server failed: {e}");
        code = ExitCode::from(2);
        token.cancel();
    }

    server.ingest.flush().await;
    if let Err(e) = server.registry.persist_all().await {
        warn!("failed to persist agent registry: {e}");
    }
    if let Err(e) = server.lifecycle.shutdown(server.storage.as_ref()).await {
        error!("shutdown incomplete: {e}");
        code = ExitCode::from(2);
    }
    code
}
