//! # Classroom Relay - Main Application Entry Point
//!
//! Live classroom transcription and translation relay. A host streams speech or text
//! into a room over a WebSocket; the relay has it transcribed and translated, and fans
//! the results out to every student in the room.
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **rooms**: room registry, rejected-code cache and the durable room store
//! - **hub**: shared connection hub; **lifecycle**, **heartbeat** and **router** extend it
//!   with the join handshake, liveness checks and message delivery
//! - **services**: transcription/translation collaborators
//! - **websocket**: one actor per client connection
//! - **handlers**, **health**, **middleware**: the HTTP surface
//! - **tasks**: detached work and cancellable background timers
//!
//! ## Shutdown:
//! SIGINT/SIGTERM stop the HTTP server gracefully, then the heartbeat and the
//! rejected-code sweeper are cancelled and awaited.

mod config;
mod error;
mod handlers;
mod health;
mod heartbeat;
mod hub;
mod lifecycle;
mod middleware;
mod protocol;
mod rooms;
mod router;
mod services;
mod state;
mod tasks;
mod websocket;

use crate::config::{AppConfig, StoreBackend, StoreConfig};
use crate::rooms::{DurableRooms, MemoryRoomStore, RedisRoomStore};
use crate::services::{ChunkedStreaming, OpenAiClient};
use crate::state::AppState;
use crate::tasks::BackgroundTasks;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Connects the durable store** (or runs without one)
/// 4. **Creates shared application state** and starts the background timers
/// 5. **Runs the HTTP server** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let durable = connect_durable_store(&config.store).await;

    let openai = Arc::new(OpenAiClient::new(&config.services)?);
    let streaming = Arc::new(ChunkedStreaming::new(openai.clone(), config.services.stream_chunk_bytes));

    let app_state = web::Data::new(AppState::new(
        config.clone(),
        durable,
        openai.clone(),
        openai,
        streaming,
    ));

    let mut background = BackgroundTasks::new(CancellationToken::new());
    background.track(tokio::spawn(heartbeat::run_heartbeat(
        app_state.hub.clone(),
        config.heartbeat.interval(),
        background.token(),
    )));
    background.track(tokio::spawn(tasks::run_rejected_code_sweeper(
        app_state.hub.clone(),
        Duration::from_secs(config.rejected_codes.sweep_interval_secs),
        background.token(),
    )));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            // Middleware executes in reverse order of registration for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/rooms", web::post().to(handlers::create_room))
                    .route("/rooms/{code}", web::get().to(handlers::check_room)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::ws_index))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    background.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: e.g. `debug`, or `classroom_relay=trace,actix_web=info`
/// - If not set, defaults to `classroom_relay=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classroom_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Build the durable store facade for the configured backend.
///
/// An unreachable Redis at startup is not fatal: the relay runs without durability.
async fn connect_durable_store(config: &StoreConfig) -> DurableRooms {
    match config.backend {
        StoreBackend::None => {
            info!("No durable room store configured, rooms live in memory only");
            DurableRooms::disabled()
        }
        StoreBackend::Memory => {
            info!("Using in-process durable room store");
            DurableRooms::new(Arc::new(MemoryRoomStore::new()), config.ttl())
        }
        StoreBackend::Redis => {
            let retry_after = Duration::from_secs(config.retry_after_secs);
            match RedisRoomStore::connect(&config.redis_url, &config.key_prefix, retry_after).await {
                Ok(store) => DurableRooms::new(Arc::new(store), config.ttl()),
                Err(e) => {
                    warn!(error = %e, "Durable room store unavailable, continuing without it");
                    DurableRooms::disabled()
                }
            }
        }
    }
}

/// Resolve when SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives.
///
/// If a handler cannot be installed the error is logged and that signal is ignored;
/// the other one still works.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
