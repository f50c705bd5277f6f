//! turnsync server
//!
//! Wires the engine to its substrate and serves the request surface:
//! redis-backed session store plus update bus, postgres-backed audit
//! pipeline, websocket push gateway, REST transitions, and the
//! operational probes.
//!
//! ## Usage
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379 \
//! DATABASE_URL=postgresql://localhost:5432/turnsync \
//!   cargo run --bin turnsync_server
//!
//! curl -X POST http://localhost:3000/api/v1/sessions \
//!   -H "Content-Type: application/json" \
//!   -d '{"session_id":"0b0f7e0e-2a54-4a3c-9d1e-0c7a3f1b2a10","sync_mode":"per_participant","total_time_ms":600000,"participants":[{"participant_id":"7e6f3c1a-91f2-4f5e-8f25-6a1d2b3c4d5e","participant_index":0,"total_time_ms":300000}]}'
//!
//! curl http://localhost:3000/api/v1/time
//! curl http://localhost:3000/health
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use turnsync::api::{create_router, AppState};
use turnsync::audit::{AuditPipeline, AuditQueue, AuditRepository, AuditSink};
use turnsync::clock::ServerClock;
use turnsync::config::Config;
use turnsync::engine::SyncEngine;
use turnsync::metrics::Metrics;
use turnsync::store::{spawn_update_listener, RedisRateLimiter, RedisSessionStore, SessionStore};
use turnsync::ws::PushGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!(port = config.listen_port, "starting turnsync server");

    let clock = Arc::new(ServerClock::new(config.drift_tolerance_ms));
    let metrics = Arc::new(Metrics::new());

    // Hot store: one managed connection for the store itself, one shared
    // manager for limiter + queue, one dedicated pub/sub connection inside
    // the bus listener
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let shared_conn = ConnectionManager::new(redis_client.clone()).await?;
    let store: Arc<dyn SessionStore> = Arc::new(RedisSessionStore::connect(config.clone()).await?);
    tracing::info!(url = %config.redis_url, "hot store connected");

    // Durable store
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    tracing::info!("durable store connected");

    let repository = Arc::new(AuditRepository::new(pool.clone()));
    let queue = Arc::new(AuditQueue::new(shared_conn.clone(), &config));
    let pipeline = AuditPipeline::start(
        queue.clone(),
        repository.clone(),
        metrics.clone(),
        config.audit_worker_count,
        config.audit_retry_attempts,
        config.audit_backoff_base_ms,
    );

    let gateway = Arc::new(PushGateway::new(
        config.ws_outbound_buffer,
        clock.clone(),
        metrics.clone(),
    ));

    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        clock.clone(),
        metrics.clone(),
        Some(queue.clone() as Arc<dyn AuditSink>),
        config.version_conflict_retry_max,
    ));

    let limiter = Arc::new(RedisRateLimiter::new(shared_conn, &config));

    // Cross-instance fan-out bridge
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus_listener =
        spawn_update_listener(redis_client, config.clone(), gateway.clone(), shutdown_rx);

    let state = AppState {
        engine,
        store,
        clock,
        gateway: gateway.clone(),
        limiter,
        metrics,
        config: config.clone(),
        audit_repository: Some(repository),
    };

    let app = create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    // The server drains when the oneshot fires; the signal handler below
    // decides when that is
    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = drain_rx.await;
            })
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        joined = &mut server => {
            // Serve failed before any signal arrived
            joined??;
            return Ok(());
        }
    }

    // Teardown order: push gateway, pub/sub listener, audit pipeline,
    // durable pool. New connections stop first; closing the gateway ends
    // the long-lived sockets so the drain below can complete, and the
    // drain itself is bounded by the grace period.
    tracing::info!("shutting down");
    let _ = drain_tx.send(());
    gateway.close_all();
    match tokio::time::timeout(
        Duration::from_millis(config.shutdown_grace_ms),
        &mut server,
    )
    .await
    {
        Ok(joined) => joined??,
        Err(_) => {
            tracing::warn!("request drain exceeded the grace period, aborting server");
            server.abort();
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), bus_listener).await;
    if tokio::time::timeout(
        Duration::from_millis(config.shutdown_grace_ms),
        pipeline.close(false),
    )
    .await
    .is_err()
    {
        tracing::warn!("audit drain exceeded the grace period");
    }
    pool.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
