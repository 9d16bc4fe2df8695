use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::get;
use chat_bus::{BusClient, InMemoryBusClient, connect_degraded};
use chat_gateway::auth::{rate_limit, request_deadline, with_request_id};
use chat_gateway::state::AppState;
use chat_gateway::{http, ws};
use chat_identity::{Config, JwtVerifier, VerifyToken};
use chat_store::{InMemoryStore, PostgresStore, Store};
use chat_telemetry::{TelemetryConfig, init_telemetry};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_telemetry(TelemetryConfig::from_env("chat-gateway"))?;

    let store: Arc<dyn Store> = if config.store_dsn.starts_with("postgres://") || config.store_dsn.starts_with("postgresql://") {
        Arc::new(PostgresStore::connect(&config.store_dsn).await?)
    } else {
        info!("STORE_DSN is not a postgres DSN, using the in-memory store");
        Arc::new(InMemoryStore::new())
    };
    store.seed_default_rules_if_empty().await?;

    let bus: Arc<dyn BusClient> = match connect_degraded(&config.bus_dsn).await {
        Some(client) => Arc::new(client),
        None => {
            info!("bus unreachable at startup, falling back to single-node in-memory bus");
            Arc::new(InMemoryBusClient::new())
        }
    };

    let verifier: Arc<dyn VerifyToken> = Arc::new(JwtVerifier::new(&config.identity_verifier_secret));

    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let cors = match &config.cors_origins {
        chat_identity::CorsOrigins::Any => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
        chat_identity::CorsOrigins::List(origins) => {
            let origins: Vec<_> = origins
                .iter()
                .filter_map(|o| o.parse::<axum::http::HeaderValue>().ok())
                .collect();
            CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
        }
    };

    let state = AppState::new(store.clone(), bus.clone(), verifier.clone(), config);

    let app = Router::new()
        .merge(http::router())
        .route("/ws", get(ws::ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(with_request_id))
                .layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit))
                .layer(axum::middleware::from_fn_with_state(state.clone(), request_deadline))
                .layer(cors),
        )
        .with_state(state);

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "chat-gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Reverse dependency order (§9, §2): store pool first, then bus, then
    // the identity verifier.
    drop(store);
    drop(bus);
    drop(verifier);
    info!("chat-gateway shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
