//! # Interview Relay - Main Application Entry Point
//!
//! Sets up the Actix-web server hosting the interview websocket and the
//! operational endpoints.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the whole server runs on the actix (tokio) runtime
//! - **Result<T, E>**: startup failures bubble up through `anyhow::Result`
//! - **tokio::select!**: races the server task against the shutdown signal
//!
//! ## Shutdown Sequence:
//! 1. SIGINT or SIGTERM arrives
//! 2. Every session relay is asked to drain; stragglers are aborted after
//!    `relay.shutdown_grace_ms`
//! 3. The HTTP server stops gracefully

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use interview_relay::config::AppConfig;
use interview_relay::state::AppState;
use interview_relay::{health, middleware, websocket};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting interview-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config.clone())?;
    info!(
        transcription = app_state.transcription.name(),
        suggestion = app_state.suggestion.name(),
        max_sessions = config.relay.max_concurrent_sessions,
        "Backends ready"
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let data = web::Data::new(app_state.clone());
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            // Middleware runs in reverse order of registration for requests
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .route("/ws/interview", web::get().to(websocket::interview_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/sessions", web::get().to(health::list_sessions))
                    .route("/sessions/{id}", web::get().to(health::get_session)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_requested(wait_for_shutdown()) => {
            info!("Shutdown signal received, draining sessions...");

            let grace = Duration::from_millis(config.relay.shutdown_grace_ms);
            let report = app_state.registry.shutdown_all(grace).await;
            info!(drained = report.drained, forced = report.forced, "Sessions stopped");

            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "interview_relay=trace")
/// - If not set, defaults to "interview_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve once `signal` reports a shutdown request.
///
/// If the signal handlers cannot be installed the server keeps running and this
/// never resolves; it can still be stopped by killing the process.
async fn shutdown_requested<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("Failed to listen for shutdown signals: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Resolve when SIGINT (Ctrl+C) or SIGTERM arrives.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
