//! # SoundBite Backend - Main Application Entry Point
//!
//! HTTP service that takes an uploaded audio file plus a playback speed and
//! returns the file re-timed and re-encoded as MP3.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state, codec and metrics
//! - **health**: Liveness, health and metrics endpoints
//! - **middleware**: Per-endpoint request metrics
//! - **handlers**: HTTP route table and the `/process` upload handler
//! - **pipeline**: Validation, staging, decode, speed transform and encode for one upload
//! - **audio**: Decoding, resampling, encoding and temp file staging
//! - **error**: Error types and their JSON HTTP responses

mod audio;       // Decode / speed / encode building blocks (audio/ directory)
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod pipeline;    // Per-request processing pipeline (pipeline.rs)
mod state;       // Application state management (state.rs)

use actix_cors::Cors;
use actix_web::{http::header, web, App, HttpServer};
use anyhow::Result;
use crate::config::{AppConfig, CorsConfig};
use crate::handlers::JOB_ID_HEADER;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting soundbite-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        allowed_origin = %config.cors.allowed_origin,
        staging_dir = %config.staging_dir().display(),
        max_upload_bytes = config.upload.max_upload_bytes,
        timeout_secs = config.processing.timeout_secs,
        "Processing limits"
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = build_cors(&app_state.config().cors);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured console logging.
///
/// `RUST_LOG` overrides the default of `soundbite_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soundbite_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Browser access is limited to the one configured frontend origin.
///
/// `"*"` opens the API to any origin, which is only meant for local development.
fn build_cors(cors: &CorsConfig) -> Cors {
    let policy = if cors.allowed_origin == "*" {
        Cors::default().allow_any_origin()
    } else {
        Cors::default().allowed_origin(&cors.allowed_origin)
    };

    policy
        .allowed_methods(vec!["GET", "POST"])
        .allow_any_header()
        .expose_headers(vec![
            header::CONTENT_DISPOSITION,
            header::HeaderName::from_static(JOB_ID_HEADER),
        ])
        .max_age(3600)
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers, graceful shutdown disabled: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
