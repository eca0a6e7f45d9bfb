use crate::config::Config;
use crate::discord::DiscordClient;
use crate::error::Error;
use crate::handlers::{
    current_user, get_guild, get_guild_channels, get_settings, health_check, list_guilds,
    metrics, put_settings, readiness_check, refresh_guilds, AppState, SharedState,
};
use crate::health::HealthChecker;
use crate::middleware::logging_middleware;
use crate::settings::{MemorySettingsRepository, SettingsRepository};
use crate::store::{CacheBackend, CacheStore, MemoryBackend, RedisBackend};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the one store instance shared by every handler.
pub fn build_store(config: &Config) -> Result<CacheStore, Error> {
    let backend: Arc<dyn CacheBackend> = if config.uses_redis() {
        Arc::new(
            RedisBackend::new(&config.redis_url)?
                .with_connect_timeout(config.redis_connect_timeout()),
        )
    } else {
        tracing::warn!("REDIS_URL not set, caching and rate-limit flags are process-local");
        Arc::new(MemoryBackend::new())
    };
    Ok(CacheStore::new(backend))
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/api/users/@me", get(current_user))
        .route("/api/guilds", get(list_guilds))
        .route("/api/guilds/refresh", post(refresh_guilds))
        .route("/api/guilds/:guild_id", get(get_guild))
        .route("/api/guilds/:guild_id/channels", get(get_guild_channels))
        .route(
            "/api/guilds/:guild_id/settings",
            get(get_settings).put(put_settings),
        )
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, Error> {
        let store = build_store(&config)?;
        let discord = DiscordClient::from_config(&config, store.clone())?;
        let settings: Arc<dyn SettingsRepository> = Arc::new(MemorySettingsRepository::new());

        let state = Arc::new(AppState {
            discord,
            settings,
            health: HealthChecker::new(store),
        });

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("discord-gate listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
