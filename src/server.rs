use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bot::commands::handle_message;
use crate::bot::telegram::{TelegramApi, Update};
use crate::subscription::{SubscriberId, SubscriptionSummary};
use crate::watch::WatchScheduler;

pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
struct ApiState {
    scheduler: WatchScheduler,
    api: TelegramApi,
    webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    ok: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiErrorBody {
            ok: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    subscriptions: usize,
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    handled: bool,
}

/// Builds the webhook router. `webhook_secret` is compared against the
/// secret-token header Telegram attaches to every delivery; an empty secret
/// disables the check on `/webhook` and turns `/v1/subscriptions` off.
pub fn router(scheduler: WatchScheduler, api: TelegramApi, webhook_secret: &str) -> Router {
    let state = ApiState {
        scheduler,
        api,
        webhook_secret: Some(webhook_secret.to_string()).filter(|s| !s.is_empty()),
    };

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/v1/subscriptions", get(subscriptions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    bind: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed binding webhook server to {bind}"))?;
    info!("webhook server listening on http://{bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health(State(state): State<ApiState>) -> Json<ApiResponse<HealthResponse>> {
    ok(HealthResponse {
        status: "ok",
        subscriptions: state.scheduler.store().len(),
    })
}

async fn subscriptions(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Vec<SubscriptionSummary>> {
    let Some(expected) = state.webhook_secret.as_deref() else {
        return Err(ApiError::forbidden(
            "subscription listing requires telegram.webhook_secret",
        ));
    };
    check_secret(&headers, expected)?;
    Ok(ok(state.scheduler.store().summaries()))
}

async fn webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    if let Some(expected) = state.webhook_secret.as_deref() {
        check_secret(&headers, expected)?;
    }
    let update: Update = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid update: {err}")))?;

    let Some((chat_id, text)) = update.text_message() else {
        return Ok(ok(WebhookAck { handled: false }));
    };
    let reply = handle_message(&state.scheduler, SubscriberId(chat_id), text);

    // Telegram retries deliveries that are not acknowledged quickly.
    let api = state.api.clone();
    tokio::spawn(async move {
        if let Err(err) = api.send_message(chat_id, &reply).await {
            warn!(chat = chat_id, "failed sending reply: {err}");
        }
    });
    Ok(ok(WebhookAck { handled: true }))
}

fn check_secret(headers: &HeaderMap, expected: &str) -> std::result::Result<(), ApiError> {
    let presented = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        warn!("request with a missing or bad secret token");
        Err(ApiError::unauthorized("invalid secret token"))
    }
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse { ok: true, data })
}
