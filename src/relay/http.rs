//! axum surface: OpenAI and Anthropic dialects in, same dialect out.

use std::any::Any;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;

use super::context::Caller;
use super::dispatch::{ChatReply, Relay};
use super::observability::ObservabilitySnapshot;
use crate::protocol::claude::{MessagesRequest, MessagesResponse};
use crate::protocol::openai::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingsRequest, EmbeddingsResponse,
};
use crate::protocol::unix_now;
use crate::stream::{ClientBody, OutputFormat, panic_message};
use crate::{RelayError, Result};

#[derive(Clone)]
pub struct RelayHttpState {
    relay: Arc<Relay>,
    admin_token: Option<String>,
}

impl std::fmt::Debug for RelayHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHttpState")
            .field("relay", &self.relay)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RelayHttpState {
    /// Takes the admin token from the relay's configuration.
    pub fn new(relay: Arc<Relay>) -> Self {
        let admin_token = relay.config().admin_token.clone();
        Self { relay, admin_token }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ClaudeErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ClaudeErrorResponse {
    #[serde(rename = "type")]
    kind: &'static str,
    error: ClaudeErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: u64,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelEntry>,
}

pub fn router(state: RelayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(handle_models))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/embeddings", post(handle_embeddings))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// Anything that still unwinds out of a handler becomes a generic 500.
fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let err = RelayError::InternalPanic(panic_message(payload.as_ref()));
    tracing::error!(error = %err, "request handler panicked");
    error_response(OutputFormat::OpenAi, &err)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<RelayHttpState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = ensure_admin(&state, &headers) {
        return rejection;
    }
    Json::<ObservabilitySnapshot>(state.relay.observability()).into_response()
}

fn ensure_admin(
    state: &RelayHttpState,
    headers: &HeaderMap,
) -> std::result::Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(admin_error(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };
    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }
    Err(admin_error(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

fn admin_error(status: StatusCode, code: &'static str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: message.to_string(),
                kind: "authentication_error",
                code,
            },
        }),
    )
        .into_response()
}

async fn handle_models(State(state): State<RelayHttpState>, headers: HeaderMap) -> Response {
    let result = async {
        let caller = authenticate(&state, &headers).await?;
        let models = state.relay.models(&caller).await?;
        Ok::<_, RelayError>(ModelList {
            object: "list",
            data: models
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model",
                    created: 0,
                    owned_by: "llm-relay",
                })
                .collect(),
        })
    }
    .await;
    match result {
        Ok(list) => Json(list).into_response(),
        Err(err) => error_response(OutputFormat::OpenAi, &err),
    }
}

async fn handle_chat_completions(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let format = OutputFormat::OpenAi;
    match chat(&state, &headers, &body, format).await {
        Ok(response) => response,
        Err(err) => error_response(format, &err),
    }
}

async fn handle_messages(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let format = OutputFormat::Claude;
    match chat(&state, &headers, &body, format).await {
        Ok(response) => response,
        Err(err) => error_response(format, &err),
    }
}

async fn chat(
    state: &RelayHttpState,
    headers: &HeaderMap,
    body: &[u8],
    format: OutputFormat,
) -> Result<Response> {
    let caller = authenticate(state, headers).await?;
    let request = match format {
        OutputFormat::OpenAi => parse_body::<ChatCompletionRequest>(body)?.into_canonical()?,
        OutputFormat::Claude => parse_body::<MessagesRequest>(body)?.into_canonical()?,
    };
    if request.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".to_string()));
    }

    match state.relay.relay_chat(&caller, format, request).await? {
        ChatReply::Complete(response) => Ok(match format {
            OutputFormat::OpenAi => {
                Json(ChatCompletionResponse::from_canonical(&response, unix_now()))
                    .into_response()
            }
            OutputFormat::Claude => Json(MessagesResponse::from_canonical(&response)).into_response(),
        }),
        ChatReply::Stream(body) => Ok(event_stream(body)),
    }
}

async fn handle_embeddings(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let caller = authenticate(&state, &headers).await?;
        let request = parse_body::<EmbeddingsRequest>(&body)?.into_canonical()?;
        let response = state.relay.relay_embeddings(&caller, request).await?;
        Ok::<_, RelayError>(EmbeddingsResponse::from_canonical(&response))
    }
    .await;
    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(OutputFormat::OpenAi, &err),
    }
}

fn event_stream(body: ClientBody) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn authenticate(state: &RelayHttpState, headers: &HeaderMap) -> Result<Caller> {
    let key = extract_api_key(headers)
        .ok_or_else(|| RelayError::Unauthorized("missing api key".to_string()))?;
    state.relay.authenticate(&key).await
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    extract_bearer(headers).or_else(|| extract_header(headers, "x-api-key"))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|err| RelayError::InvalidRequest(format!("invalid request body: {err}")))
}

fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RelayError::InsufficientQuota { .. } => StatusCode::FORBIDDEN,
        RelayError::ChannelNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::UpstreamStatus { status: 429, .. } => StatusCode::TOO_MANY_REQUESTS,
        RelayError::Config(_)
        | RelayError::UpstreamTransport(_)
        | RelayError::UpstreamProtocol(_)
        | RelayError::UpstreamStatus { .. }
        | RelayError::Json(_) => StatusCode::BAD_GATEWAY,
        RelayError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
        RelayError::InternalPanic(_) | RelayError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn openai_error_type(err: &RelayError) -> &'static str {
    match err {
        RelayError::InvalidRequest(_) => "invalid_request_error",
        RelayError::Unauthorized(_) => "authentication_error",
        RelayError::InsufficientQuota { .. } => "insufficient_quota",
        RelayError::InternalPanic(_) | RelayError::Storage(_) => "server_error",
        _ => "upstream_error",
    }
}

fn claude_error_type(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid_request_error",
        StatusCode::UNAUTHORIZED => "authentication_error",
        StatusCode::FORBIDDEN => "permission_error",
        StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
        StatusCode::SERVICE_UNAVAILABLE => "overloaded_error",
        _ => "api_error",
    }
}

fn error_response(format: OutputFormat, err: &RelayError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::warn!(error = %err, status = status.as_u16(), "request failed");
    } else {
        tracing::debug!(error = %err, status = status.as_u16(), "request rejected");
    }
    let message = err.public_message();
    match format {
        OutputFormat::OpenAi => (
            status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    message,
                    kind: openai_error_type(err),
                    code: err.code(),
                },
            }),
        )
            .into_response(),
        OutputFormat::Claude => (
            status,
            Json(ClaudeErrorResponse {
                kind: "error",
                error: ClaudeErrorDetail {
                    kind: claude_error_type(status),
                    message,
                },
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_comes_from_bearer_or_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-claude"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-claude"));

        headers.insert("authorization", HeaderValue::from_static("Bearer sk-openai"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-openai"));

        let mut empty = HeaderMap::new();
        empty.insert("authorization", HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_api_key(&empty), None);
    }

    #[tokio::test]
    async fn handler_panics_answer_with_a_server_error() {
        use tower::util::ServiceExt;

        let app: Router = Router::new()
            .route(
                "/boom",
                get(|| async {
                    if true {
                        panic!("handler bug");
                    }
                    "unreachable"
                }),
            )
            .layer(CatchPanicLayer::custom(panic_response));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/boom")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["error"]["type"], "server_error");
        assert_eq!(body["error"]["code"], "internal_error");
        assert_eq!(body["error"]["message"], "internal server error");
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(
            status_for(&RelayError::InsufficientQuota {
                needed: 10,
                remaining: 0
            }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&RelayError::ChannelNotFound {
                group: "default".to_string(),
                model: "x".to_string()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&RelayError::UpstreamStatus {
                status: 429,
                message: String::new(),
                error_type: None,
                code: None
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&RelayError::InternalPanic("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            claude_error_type(status_for(&RelayError::Unauthorized("no".to_string()))),
            "authentication_error"
        );
    }
}
