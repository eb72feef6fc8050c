//! HTTP entry point: axum router and the chat-completions proxy handler
//!
//! The upstream URL rides in the request path
//! (`POST /https://api.example.com/v1/chat/completions`) and the bearer key
//! comes from the `Authorization` header or an `api_key` query parameter.
//! Dispatch: non-streaming requests get a JSON response, streaming requests
//! get either the fake-stream emulator or the passthrough relay depending on
//! configuration.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::emulator;
use crate::message::ChatRequest;
use crate::prepare::MessagePreparer;
use crate::relay;
use crate::upstream::{UpstreamClient, UpstreamError};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub preparer: Arc<MessagePreparer>,
    pub upstream: UpstreamClient,
}

/// Error response from the proxy itself (not the upstream body passthrough)
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "type": "proxy_error",
                "code": self.status.as_u16(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/{*target}", post(chat_completions))
        .with_state(state)
}

async fn index() -> Json<Value> {
    Json(json!({
        "name": "promptgate",
        "usage": "POST /<upstream-url> with an OpenAI chat completion body, e.g. POST /https://api.openai.com/v1/chat/completions",
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn chat_completions(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<Response, ApiError> {
    debug!(target, "chat_completions: called");

    let target = validate_target(&target)?;
    let api_key = extract_api_key(&headers, &params)?;

    let request: ChatRequest = serde_json::from_value(raw)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?;

    let ignored = request.ignored_params();
    if !ignored.is_empty() {
        info!(params = ?ignored, "ignoring client-supplied parameters, using configured generation values");
    }

    let prepared = state.preparer.prepare(&request);

    if !request.stream {
        debug!("chat_completions: non-streaming dispatch");
        let response = state
            .upstream
            .fetch_completion(target, &api_key, &prepared, &prepared.regex_rules)
            .await?;
        return Ok(Json(response).into_response());
    }

    if state.config.proxy.fake_streaming.enabled {
        debug!("chat_completions: emulated streaming dispatch");
        let upstream = state.upstream.clone();
        let fetch_target = target.to_string();
        let fetch_prepared = prepared.clone();
        let fetch_key = api_key.clone();
        // Rules are applied during decomposition, not inside the fetch;
        // passing them twice would process the content twice.
        let fetch = async move {
            upstream
                .fetch_completion(&fetch_target, &fetch_key, &fetch_prepared, &[])
                .await
        };
        let stream = emulator::emulate(
            fetch,
            request.model.clone(),
            prepared.regex_rules,
            Duration::from_secs(state.config.proxy.fake_streaming.heartbeat_interval_secs),
        );
        return Ok(sse_response(stream));
    }

    debug!("chat_completions: passthrough streaming dispatch");
    let builder = state.upstream.stream_request(target, &api_key, &prepared);
    Ok(sse_response(relay::relay(builder, prepared.regex_rules)))
}

/// The wildcard segment must be a full upstream URL
fn validate_target(target: &str) -> Result<&str, ApiError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        Ok(target)
    } else {
        warn!(target, "rejecting request without an upstream URL in the path");
        Err(ApiError::bad_request(
            "request path must embed the upstream URL, e.g. /https://api.openai.com/v1/chat/completions",
        ))
    }
}

/// Bearer credential: `Authorization` header wins over the `api_key` query
/// parameter
fn extract_api_key(headers: &HeaderMap, params: &HashMap<String, String>) -> Result<String, ApiError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| ApiError::bad_request("Authorization header is not valid UTF-8"))?;
        let key = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    if let Some(key) = params.get("api_key").filter(|key| !key.is_empty()) {
        return Ok(key.clone());
    }
    warn!("request without credentials");
    Err(ApiError::unauthorized(
        "missing API key: send an Authorization: Bearer header or an api_key query parameter",
    ))
}

/// Wrap a frame stream as a chunked `text/event-stream` response
fn sse_response(stream: impl Stream<Item = String> + Send + 'static) -> Response {
    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}
