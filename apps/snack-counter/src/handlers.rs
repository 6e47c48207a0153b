use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::payments::PaymentsClient;

/// Shared state for HTTP and WebSocket routes.
#[derive(Clone)]
pub struct AppContext {
    pub orchestrator: Arc<Orchestrator>,
    pub payments: Option<PaymentsClient>,
    pub config: Arc<Config>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    tipping_enabled: bool,
    ts: i64,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(ctx): State<AppContext>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        tipping_enabled: ctx.payments.is_some(),
        ts: Utc::now().timestamp_millis(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub amount: u64,
    #[serde(default)]
    pub room_tag: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

/// POST /api/tips/checkout - Create a checkout session for a tip
pub async fn create_checkout(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, StatusCode> {
    let Some(payments) = &ctx.payments else {
        warn!("checkout requested but tipping is disabled");
        return Err(StatusCode::BAD_REQUEST);
    };
    if payload.amount == 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Redirect back to the caller's origin, falling back to the configured
    // frontend.
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| ctx.config.frontend_origin.clone())
        .unwrap_or_else(|| "http://localhost:5173".to_string());

    let room_tag = payload.room_tag.unwrap_or_default();
    let handle = payload.handle.unwrap_or_default();
    debug!(amount = payload.amount, %room_tag, "creating checkout session");

    match payments
        .create_checkout(payload.amount, &room_tag, &handle, &origin)
        .await
    {
        Ok(url) => Ok(Json(CheckoutResponse { url })),
        Err(err) => {
            error!(error = %err, "checkout session creation failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// POST /api/tips/webhook - Payment-completed webhook. The body stays raw
/// so the signature is verified over the exact delivered bytes.
pub async fn payments_webhook(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, StatusCode> {
    let Some(payments) = &ctx.payments else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;

    let event = match payments.verify_webhook(&body, signature) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "webhook rejected");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    if event.kind == "checkout.session.completed" {
        let object = event.data.object;
        let amount = object.amount_total.unwrap_or_default();
        let handle = object
            .metadata
            .get("handle")
            .map(String::as_str)
            .filter(|value| !value.is_empty());
        let room_tag = object
            .metadata
            .get("room_tag")
            .map(String::as_str)
            .filter(|value| !value.is_empty());
        ctx.orchestrator
            .payment_confirmed(handle, room_tag, amount, &object.id)
            .await;
    } else {
        debug!(kind = %event.kind, "ignoring webhook event");
    }

    Ok(Json(WebhookAck { received: true }))
}
