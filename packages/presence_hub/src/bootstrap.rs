//! Wiring for one hub instance: stores, backplane bridge, coordinator and
//! the HTTP router. `main` feeds it a config; tests feed it in-memory parts.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post, put},
};
use presence_auth::HmacTokenIssuer;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backplane::{Backplane, BackplaneBridge};
use crate::broadcast::LocalBroadcaster;
use crate::config::{AuthConfig, HubConfig, StoreConfig, StoreKind, WebSocketConfig};
use crate::coordinator::PresenceCoordinator;
use crate::db::Database;
use crate::handlers;
use crate::identity::InstanceIdentity;
use crate::metrics::ServerMetrics;
use crate::registry::ConnectionRegistry;
use crate::repository::Repository;
use crate::store::{AccountStore, MemoryStore, RecordStore};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub identity: Arc<InstanceIdentity>,
    pub coordinator: Arc<PresenceCoordinator>,
    pub bridge: Arc<BackplaneBridge>,
    pub records: Arc<dyn RecordStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub tokens: Arc<HmacTokenIssuer>,
    pub ws_config: Arc<WebSocketConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

/// Record and account storage. One backend usually serves both.
#[derive(Clone)]
pub struct Stores {
    pub records: Arc<dyn RecordStore>,
    pub accounts: Arc<dyn AccountStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            records: store.clone(),
            accounts: store,
        }
    }

    pub fn sqlite(db: &Database) -> Self {
        let repo = Arc::new(Repository::new(db.pool.clone()));
        Self {
            records: repo.clone(),
            accounts: repo,
        }
    }

    pub async fn open(config: &StoreConfig) -> Result<Self> {
        match config.kind {
            StoreKind::Memory => {
                info!("Using in-memory store; records are lost on exit");
                Ok(Self::memory())
            }
            StoreKind::Sqlite => {
                let db = Database::new(config).await?;
                Ok(Self::sqlite(&db))
            }
        }
    }
}

/// A running hub: bridge tasks started, router ready to serve.
pub struct Instance {
    state: AppState,
}

impl Instance {
    /// Start the bridge and wait up to the configured startup timeout for
    /// the backplane. If it is not up by then the instance serves anyway
    /// with local-only fanout and keeps reconnecting in the background.
    pub async fn start(
        config: &HubConfig,
        backplane: Arc<dyn Backplane>,
        stores: Stores,
    ) -> Result<Self> {
        let identity = Arc::new(InstanceIdentity::new(config.instance_name.clone()));
        let metrics = Arc::new(ServerMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(
            LocalBroadcaster::new(registry, metrics.clone())
                .with_send_timeout(config.websocket.send_timeout),
        );

        info!(
            instance = %identity.name,
            instance_id = %identity.id,
            channel = %config.backplane.bridge.channel,
            "Starting presence hub instance"
        );

        let bridge = BackplaneBridge::start(
            backplane,
            identity.clone(),
            broadcaster.clone(),
            metrics.clone(),
            config.backplane.bridge.clone(),
        );

        if bridge.wait_ready(config.backplane.startup_timeout).await {
            info!("Backplane connected");
        } else {
            warn!(
                timeout = ?config.backplane.startup_timeout,
                "Backplane not reachable; serving local-only until it recovers"
            );
        }

        let coordinator = Arc::new(PresenceCoordinator::new(
            identity.clone(),
            broadcaster,
            bridge.clone(),
            stores.records.clone(),
            metrics.clone(),
        ));

        let tokens = Arc::new(token_issuer(&config.auth));

        Ok(Self {
            state: AppState {
                identity,
                coordinator,
                bridge,
                records: stores.records,
                accounts: stores.accounts,
                tokens,
                ws_config: Arc::new(config.websocket.clone()),
                metrics,
            },
        })
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.state.identity
    }

    pub(crate) fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Stop the bridge and close every local connection. Each socket task
    /// sees its close token fire, sends a close frame and unregisters.
    pub async fn shutdown(&self) {
        self.state.bridge.shutdown();
        let dropped = self.state.coordinator.registry().clear().await;
        info!(connections = dropped, "Instance shut down");
    }
}

fn token_issuer(auth: &AuthConfig) -> HmacTokenIssuer {
    match &auth.jwt_secret {
        Some(secret) => HmacTokenIssuer::new(secret, auth.token_ttl),
        None => {
            warn!(
                "No jwt_secret configured; using a random per-process secret. \
                 Tokens will not be accepted by other instances."
            );
            let secret = [Uuid::new_v4().into_bytes(), Uuid::new_v4().into_bytes()].concat();
            HmacTokenIssuer::new(secret, auth.token_ttl)
        }
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        // Presence socket
        .route("/ws", get(handlers::websocket_handler))
        // Account routes
        .route("/signup", post(handlers::signup_handler))
        .route("/login", post(handlers::login_handler))
        // Record routes
        .route(
            "/data",
            post(handlers::create_record_handler).get(handlers::list_records_handler),
        )
        .route("/updatestatus", put(handlers::update_status_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
