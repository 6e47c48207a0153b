mod cli;
mod config;
mod handlers;
mod orchestrator;
mod payments;
mod protocol;
mod queue;
mod registry;
mod timers;
mod voice;
mod websocket;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{create_checkout, health_check, payments_webhook, AppContext},
    orchestrator::Orchestrator,
    payments::PaymentsClient,
    voice::VoiceClient,
    websocket::websocket_handler,
};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    // Check if running as probe client
    let cli = Cli::parse();
    if let Some(Commands::Probe { url, command }) = cli.command {
        if let Err(err) = cli::run_probe(url, command).await {
            error!("Probe client error: {}", err);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as server
    let config = Config::from_env();
    info!("Starting snack-counter session server on port {}", config.port);
    info!(
        "Session budget: {} ms, warning lead: {} ms, grace: {} ms, paying grace: {} ms",
        config.session_max_ms,
        config.warning_before_ms,
        config.disconnect_grace_ms,
        config.paying_grace_ms
    );

    let voice = match (&config.daily_room_url, &config.daily_api_key) {
        (Some(room_url), Some(api_key)) => {
            Some(VoiceClient::new(room_url.clone(), api_key.clone()))
        }
        _ => {
            warn!("DAILY_ROOM_URL / DAILY_API_KEY missing: voice sessions will start degraded");
            None
        }
    };

    let payments = config.stripe_secret_key.as_ref().map(|key| {
        PaymentsClient::new(
            key.clone(),
            config.stripe_webhook_secret.clone(),
            config.tip_currency.clone(),
        )
    });
    if payments.is_none() {
        warn!("STRIPE_SECRET_KEY missing: tipping disabled");
    }

    let cors = cors_layer(&config);
    let orchestrator = Orchestrator::new(config.clone(), voice);
    let ctx = AppContext {
        orchestrator,
        payments,
        config: Arc::new(config.clone()),
    };

    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/tips/checkout", post(create_checkout))
        .route("/api/tips/webhook", post(payments_webhook))
        .with_state(ctx.clone());

    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(ctx);

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("snack-counter listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");
}

/// Allow-listed CORS: the configured frontend origin plus local dev
/// origins, with credentials.
fn cors_layer(config: &Config) -> CorsLayer {
    let mut allowed: Vec<String> = vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ];
    if let Some(origin) = &config.frontend_origin {
        allowed.push(origin.clone());
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _request_parts| {
                origin
                    .to_str()
                    .map(|origin| allowed.iter().any(|candidate| candidate == origin))
                    .unwrap_or(false)
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
