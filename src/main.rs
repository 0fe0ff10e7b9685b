//! Chat relay server binary.
//!
//! Loads configuration from the environment, picks a chat store and serves
//! the WebSocket endpoint until Ctrl-C or SIGTERM.

use std::error::Error;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chat_relay::adapters::websocket::{
    websocket_router, ChatCommandProcessor, ChatMessageProcessor, ConnectionRegistry,
    FrameSender, RelayContext, WebSocketSender, WebSocketState,
};
use chat_relay::adapters::{InMemoryChatRepository, PostgresChatRepository};
use chat_relay::config::{AppConfig, DatabaseConfig, RelayConfig, ServerConfig};
use chat_relay::ports::ChatRepository;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::load()?;
    init_tracing(&config.server);
    config.validate()?;

    let repository = build_repository(&config.database, &config.relay).await?;

    let registry = Arc::new(ConnectionRegistry::new());
    let sender: Arc<dyn FrameSender> = Arc::new(WebSocketSender::new(Arc::clone(&registry)));
    let messages = Arc::new(ChatMessageProcessor::new(
        Arc::clone(&repository),
        Arc::clone(&registry),
        Arc::clone(&sender),
    ));
    let processor = Arc::new(
        ChatCommandProcessor::new(repository, Arc::clone(&registry), Arc::clone(&sender), messages)
            .with_guest_user(config.relay.guest_user()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = WebSocketState::new(
        RelayContext {
            registry: Arc::clone(&registry),
            processor,
            sender,
        },
        shutdown_rx,
        config.relay.outbound_buffer,
    );
    let app = build_app(state, &config.server);

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, environment = ?config.server.environment, "Chat relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    info!(open_connections = registry.len(), "Chat relay stopped");
    Ok(())
}

fn init_tracing(server: &ServerConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&server.log_level));

    if server.is_production() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .ok();
    }
}

/// Postgres when a URL is configured, otherwise the in-memory store.
async fn build_repository(
    database: &DatabaseConfig,
    relay: &RelayConfig,
) -> Result<Arc<dyn ChatRepository>, Box<dyn Error>> {
    let Some(url) = database.url() else {
        warn!("No database URL configured, using in-memory chat store");
        let repository = if relay.seed_demo_data {
            InMemoryChatRepository::seeded()
        } else {
            InMemoryChatRepository::new()
        };
        return Ok(Arc::new(repository));
    };

    let pool = PgPoolOptions::new()
        .min_connections(database.min_connections)
        .max_connections(database.max_connections)
        .acquire_timeout(database.acquire_timeout())
        .idle_timeout(database.idle_timeout())
        .connect(url)
        .await?;

    if database.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations applied");
    }

    info!(max_connections = database.max_connections, "Connected to PostgreSQL chat store");
    Ok(Arc::new(PostgresChatRepository::new(pool)))
}

fn build_app(state: WebSocketState, server: &ServerConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    websocket_router()
        .with_state(state)
        .layer(build_cors_layer(server))
        .layer(trace_layer)
}

fn build_cors_layer(server: &ServerConfig) -> CorsLayer {
    let configured = server.cors_origins_list();
    if configured.is_empty() {
        if server.is_production() {
            warn!("CORS: No origins configured in production mode, denying all cross-origin requests");
            return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
        }
        return CorsLayer::new().allow_origin(Any).allow_methods([Method::GET]);
    }

    let origins: Vec<HeaderValue> = configured
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();
    info!("CORS: Allowing {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
}

/// Resolves on Ctrl-C or SIGTERM after telling every session to close.
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to install Ctrl+C handler");
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, closing sessions");
    shutdown.send_replace(true);
}
