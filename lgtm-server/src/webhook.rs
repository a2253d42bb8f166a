use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::dispatcher::Delivery;
use crate::payload::NoteEvent;
use crate::AppState;

/// Default route GitLab is configured to call.
pub const DEFAULT_HOOK_PATH: &str = "/gitlab/hook";

/// Header GitLab uses to identify a delivery.
pub const EVENT_UUID_HEADER: &str = "x-gitlab-event-uuid";

const RESPONSE_OK: &str = "OK";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid content type")]
    InvalidContentType,

    #[error("invalid request body")]
    InvalidRequest,

    #[error("invalid JSON payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        error!("Rejecting webhook request: {}", self);
        (StatusCode::BAD_REQUEST, format!("error occurs: {}", self)).into_response()
    }
}

/// Validate and decode a webhook request.
///
/// Checks run in order: content type, method, non-empty body, JSON decode.
pub fn decode_request(
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<NoteEvent, WebhookError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if content_type != Some("application/json") {
        return Err(WebhookError::InvalidContentType);
    }

    if *method != Method::POST {
        return Err(WebhookError::InvalidRequest);
    }

    if body.is_empty() {
        return Err(WebhookError::InvalidRequest);
    }

    Ok(serde_json::from_slice(body)?)
}

pub async fn gitlab_webhook_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, WebhookError> {
    let event = decode_request(&method, &headers, &body)?;

    let id = headers
        .get(EVENT_UUID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        delivery = %id,
        kind = %event.object_kind,
        user = event.username(),
        "Received webhook"
    );

    // The sender only learns that the payload was well-formed. Whatever
    // happens to the event afterwards is logged, never reported back.
    if let Err(e) = state.dispatcher.submit(Delivery { id: id.clone(), event }) {
        error!(delivery = %id, "Failed to queue webhook event: {}", e);
    }

    Ok(RESPONSE_OK)
}

/// Router for the webhook endpoint.
///
/// Registered for every method so that non-POST requests get the same 400
/// response as other malformed requests.
pub fn webhook_router(path: &str) -> Router<Arc<AppState>> {
    Router::new().route(path, any(gitlab_webhook_handler))
}
