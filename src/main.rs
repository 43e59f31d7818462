//! Parley - multi-user chat orchestration service
//!
//! Routes each user message through plain chat, tool-augmented chat,
//! retrieval or a bounded agent loop, and streams turn events to clients.

mod api;
mod auth;
mod config;
mod coordinator;
mod error;
mod events;
mod llm;
mod retrieval;
mod runtime;
mod session;
mod state_machine;
mod storage;
mod system_prompt;
mod tools;

use api::{create_router, AppState};
use auth::{StaticGroupDirectory, ToolAuthorizer};
use config::Config;
use coordinator::{CoordinatorConfig, ToolCoordinator};
use llm::ModelRegistry;
use retrieval::{HttpRetrievalClient, RetrievalIntegrator, RetrievalService};
use runtime::{ModelClient, RegistryModelClient, RouterSettings, TurnRouter};
use session::SessionStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage::{DirFileStore, FileStore, InMemoryFileStore};
use tokio_util::sync::CancellationToken;
use tools::{HttpToolServer, ToolCatalog};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env()?;

    // Models
    let registry = Arc::new(ModelRegistry::new(&config.llm));
    if registry.available_models().is_empty() {
        tracing::warn!("No LLM API keys configured. Set ANTHROPIC_API_KEY or LLM_GATEWAY.");
    } else {
        tracing::info!(
            models = ?registry.available_models(),
            default = %registry.default_model_id(),
            "LLM registry initialized"
        );
    }
    let models: Arc<dyn ModelClient> = Arc::new(RegistryModelClient::new(registry));

    // Tool servers
    let mut catalog = ToolCatalog::builtin();
    for server in &config.tool_servers {
        catalog.register(Arc::new(HttpToolServer::from_config(server)?));
        tracing::info!(server = %server.name, url = %server.url, "Registered tool server");
    }
    let catalog = Arc::new(catalog);

    let directory = Arc::new(StaticGroupDirectory::new(config.user_groups.clone()));
    let authorizer = Arc::new(ToolAuthorizer::new(catalog.clone(), directory));

    let files: Arc<dyn FileStore> = match &config.files_dir {
        Some(dir) => {
            tracing::info!(path = %dir.display(), "Storing files on disk");
            Arc::new(DirFileStore::open(dir.clone()).await?)
        }
        None => Arc::new(InMemoryFileStore::new()),
    };

    let coordinator = ToolCoordinator::new(
        catalog.clone(),
        authorizer.clone(),
        files.clone(),
        CoordinatorConfig {
            call_timeout: config.tool_timeout,
            max_concurrency: config.max_concurrent_tools,
        },
    );

    let retrieval_service: Option<Arc<dyn RetrievalService>> = match &config.retrieval_url {
        Some(url) => Some(Arc::new(HttpRetrievalClient::new(url)?)),
        None => {
            tracing::info!("No retrieval service configured");
            None
        }
    };
    let retrieval = Arc::new(RetrievalIntegrator::new(retrieval_service));

    let router = Arc::new(TurnRouter::new(
        models,
        catalog,
        coordinator,
        retrieval,
        RouterSettings::default(),
    ));

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionStore::new(config.agent_max_steps, config.session_idle));
    let sweeper = sessions.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone());

    let state = AppState {
        router,
        sessions,
        authorizer,
        files,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Session sweeper did not stop cleanly");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM, and stops background tasks
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT - shutting down"),
        () = terminate => tracing::info!("Received SIGTERM - shutting down"),
    }
    shutdown.cancel();
}
