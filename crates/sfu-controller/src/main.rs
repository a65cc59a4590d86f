//! SFU Controller
//!
//! Control plane of a selective forwarding unit: WebSocket signaling, rooms
//! and media worker orchestration.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:4443, route `/ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Start the media worker pool
//! 4. Initialize the actor system (`RoomRegistryHandle`)
//! 5. Start health and signaling servers
//! 6. Mark ready, then wait for a shutdown signal or a worker failure
//!
//! A dead media worker is fatal: the process marks itself failed and exits
//! with a non-zero status.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::config::{LogFormat, ObservabilityConfig};
use sfu_controller::actors::{ActorMetrics, RegistrySettings, RoomRegistryHandle};
use sfu_controller::config::Config;
use sfu_controller::media::{RouterAllocator, WorkerPool};
use sfu_controller::observability::metrics::{init_metrics_recorder, set_workers_alive};
use sfu_controller::observability::{health_router, HealthState};
use sfu_controller::signaling::{signaling_router, SignalingState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for rooms to close during shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let vars: HashMap<String, String> = std::env::vars().collect();
    let observability =
        ObservabilityConfig::from_vars(&vars, "sfu_controller=debug,tower_http=debug");
    let json = observability.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| observability.default_filter.clone().into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting SFU Controller");

    // Load configuration
    let config = Config::from_vars(&vars).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sfu_id = %config.sfu_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        num_workers = config.num_workers,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        max_rooms = config.max_rooms,
        max_peers_per_room = config.max_peers_per_room,
        negotiation_timeout_seconds = config.negotiation_timeout_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    // Start media workers
    info!(num_workers = config.num_workers, "Starting media workers...");
    let pool = Arc::new(
        WorkerPool::spawn_local(config.num_workers, &config.worker_settings()).map_err(|e| {
            error!(error = %e, "Failed to start media workers");
            e
        })?,
    );
    set_workers_alive(pool.alive_count());
    info!(workers = pool.worker_count(), "Media workers started");

    // Initialize actor system
    let actor_metrics = ActorMetrics::new();
    let allocator = RouterAllocator::new(Arc::clone(&pool), config.media_codecs.clone());
    let registry = RoomRegistryHandle::new(
        allocator,
        RegistrySettings::from_config(&config),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Servers stop with the registry
    let shutdown_token = registry.child_token();

    // Start health HTTP server (liveness, readiness, metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    spawn_server("Health", health_listener, health_app, shutdown_token.child_token());
    info!(addr = %health_addr, "Health server started");

    // Start signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_state = Arc::new(SignalingState {
        registry: registry.clone(),
        metrics: Arc::clone(&actor_metrics),
        max_message_size: config.max_message_size,
        join_timeout: config.join_timeout(),
        cancel_token: shutdown_token.child_token(),
    });

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    spawn_server(
        "Signaling",
        signaling_listener,
        signaling_router(signaling_state),
        shutdown_token.child_token(),
    );
    info!(addr = %signaling_addr, "Signaling server started");

    health_state.set_ready();
    info!("SFU Controller running - press Ctrl+C to shutdown");

    // Wait for shutdown signal or a dead worker
    let fatal = tokio::select! {
        () = shutdown_signal() => None,
        failure = pool.fatal_failure() => Some(failure),
    };

    if let Some(failure) = fatal {
        error!(error = %failure, "Media worker failed, exiting");
        health_state.set_failed();
        set_workers_alive(pool.alive_count());
        registry.cancel();
        shutdown_token.cancel();
        return Err(failure.into());
    }

    // Mark as not ready immediately so no new clients are routed here
    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_draining();

    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }
    shutdown_token.cancel();

    pool.shutdown().await;
    set_workers_alive(0);

    info!("SFU Controller shutdown complete");
    Ok(())
}

/// Serve `app` on `listener` until `cancel_token` is cancelled.
fn spawn_server(
    name: &'static str,
    listener: tokio::net::TcpListener,
    app: Router,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        info!(server = name, "Server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!(server = name, "Server shutting down");
        });
        if let Err(e) = server.await {
            error!(server = name, error = %e, "Server failed");
        }
    });
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// If a handler cannot be installed, that source is ignored and the other
/// still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
