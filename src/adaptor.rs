//! Per-provider protocol adaptation.
//!
//! Every provider implements [`Adaptor`] (endpoint and auth) plus the capability traits for
//! what it can actually serve. Missing capabilities are visible in [`AdaptorSet`] instead of
//! surfacing as runtime "not implemented" errors.

#[cfg(feature = "provider-anthropic")]
mod anthropic;
#[cfg(feature = "provider-gemini")]
mod gemini;
#[cfg(feature = "provider-ollama")]
mod ollama;
#[cfg(feature = "provider-openai")]
mod openai;

#[cfg(feature = "provider-anthropic")]
pub use anthropic::{AnthropicAdaptor, ClaudeChunkMapper};
#[cfg(feature = "provider-gemini")]
pub use gemini::{GeminiAdaptor, GeminiChunkMapper};
#[cfg(feature = "provider-ollama")]
pub use ollama::{OllamaAdaptor, OllamaChunkMapper};
#[cfg(feature = "provider-openai")]
pub use openai::{OpenAiAdaptor, OpenAiChunkMapper};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::relay::channel::ChannelKind;
use crate::relay::context::RelayContext;
use crate::stream::{ChunkMapper, Framing};
use crate::types::{EmbeddingRequest, EmbeddingResponse, GenerateRequest, GenerateResponse};
use crate::{RelayError, Result};

const MAX_ERROR_MESSAGE_CHARS: usize = 512;

/// Endpoint and credential handling shared by every capability.
pub trait Adaptor: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Captures per-request variants (API version, sub-model flags) before any other step.
    fn init(&mut self, ctx: &RelayContext) -> Result<()>;

    fn request_url(&self, ctx: &RelayContext) -> Result<String>;

    fn setup_request_header(&self, headers: &mut HeaderMap, ctx: &RelayContext) -> Result<()>;
}

pub trait ChatAdaptor: Adaptor {
    fn convert_chat_request(&self, ctx: &RelayContext, request: &GenerateRequest) -> Result<Value>;

    fn parse_chat_response(&self, ctx: &RelayContext, body: &[u8]) -> Result<GenerateResponse>;
}

pub trait StreamingAdaptor: ChatAdaptor {
    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn chunk_mapper(&self, ctx: &RelayContext) -> Box<dyn ChunkMapper>;
}

pub trait EmbeddingAdaptor: Adaptor {
    fn convert_embedding_request(
        &self,
        ctx: &RelayContext,
        request: &EmbeddingRequest,
    ) -> Result<Value>;

    fn parse_embedding_response(
        &self,
        ctx: &RelayContext,
        body: &[u8],
    ) -> Result<EmbeddingResponse>;
}

/// The capabilities one provider offers, built fresh for each request.
pub struct AdaptorSet {
    pub chat: Box<dyn StreamingAdaptor>,
    pub embedding: Option<Box<dyn EmbeddingAdaptor>>,
}

impl std::fmt::Debug for AdaptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorSet")
            .field("kind", &self.chat.kind())
            .field("embedding", &self.embedding.is_some())
            .finish()
    }
}

pub fn adaptor_set(kind: ChannelKind) -> Result<AdaptorSet> {
    match kind {
        #[cfg(feature = "provider-openai")]
        ChannelKind::OpenAi | ChannelKind::OpenAiCompatible => Ok(AdaptorSet {
            chat: Box::new(OpenAiAdaptor::new(kind)),
            embedding: Some(Box::new(OpenAiAdaptor::new(kind))),
        }),
        #[cfg(feature = "provider-azure")]
        ChannelKind::Azure => Ok(AdaptorSet {
            chat: Box::new(OpenAiAdaptor::new(kind)),
            embedding: Some(Box::new(OpenAiAdaptor::new(kind))),
        }),
        #[cfg(feature = "provider-openai")]
        ChannelKind::DeepSeek => Ok(AdaptorSet {
            chat: Box::new(OpenAiAdaptor::new(kind)),
            embedding: None,
        }),
        #[cfg(feature = "provider-anthropic")]
        ChannelKind::Anthropic => Ok(AdaptorSet {
            chat: Box::new(AnthropicAdaptor::default()),
            embedding: None,
        }),
        #[cfg(feature = "provider-gemini")]
        ChannelKind::Gemini => Ok(AdaptorSet {
            chat: Box::new(GeminiAdaptor::default()),
            embedding: Some(Box::new(GeminiAdaptor::default())),
        }),
        #[cfg(feature = "provider-ollama")]
        ChannelKind::Ollama => Ok(AdaptorSet {
            chat: Box::new(OllamaAdaptor::default()),
            embedding: Some(Box::new(OllamaAdaptor::default())),
        }),
        #[allow(unreachable_patterns)]
        other => Err(RelayError::Config(format!(
            "llm-relay built without support for channel kind {other}"
        ))),
    }
}

/// Sends `body` to the adaptor's endpoint; non-2xx responses become [`RelayError::UpstreamStatus`].
pub async fn do_request<A>(
    client: &reqwest::Client,
    adaptor: &A,
    ctx: &RelayContext,
    body: &Value,
) -> Result<reqwest::Response>
where
    A: Adaptor + ?Sized,
{
    let url = adaptor.request_url(ctx)?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    adaptor.setup_request_header(&mut headers, ctx)?;

    tracing::debug!(
        channel_id = ctx.channel.id,
        kind = %adaptor.kind(),
        model = %ctx.upstream_model,
        stream = ctx.is_stream,
        "sending upstream request"
    );
    let response = client.post(url).headers(headers).json(body).send().await?;
    if !response.status().is_success() {
        return Err(upstream_status_error(response).await);
    }
    Ok(response)
}

/// Upstream body as a byte stream for the streaming translator.
pub fn upstream_body(
    response: reqwest::Response,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
}

pub async fn upstream_status_error(response: reqwest::Response) -> RelayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    parse_error_body(status, &body)
}

/// Reads the OpenAI, Anthropic, Gemini and Ollama error shapes.
pub fn parse_error_body(status: u16, body: &str) -> RelayError {
    let mut message = String::new();
    let mut error_type = None;
    let mut code = None;

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match value.get("error") {
            Some(Value::Object(error)) => {
                if let Some(text) = error.get("message").and_then(Value::as_str) {
                    message = text.to_string();
                }
                error_type = error
                    .get("type")
                    .or_else(|| error.get("status"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                code = match error.get("code") {
                    Some(Value::String(code)) => Some(code.clone()),
                    Some(Value::Number(code)) => Some(code.to_string()),
                    _ => None,
                };
            }
            Some(Value::String(text)) => message = text.clone(),
            _ => {
                if let Some(text) = value.get("message").and_then(Value::as_str) {
                    message = text.to_string();
                }
            }
        }
    }
    if message.is_empty() {
        message = body.trim().to_string();
    }
    if message.chars().count() > MAX_ERROR_MESSAGE_CHARS {
        message = message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
    }
    if message.is_empty() {
        message = format!("upstream returned status {status}");
    }

    RelayError::UpstreamStatus {
        status,
        message,
        error_type,
        code,
    }
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| RelayError::Config(format!("invalid value for header {name}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// The channel key, rejecting blank credentials before they reach the wire.
pub(crate) fn channel_key(ctx: &RelayContext) -> Result<&str> {
    let key = ctx.channel.key.trim();
    if key.is_empty() {
        return Err(RelayError::Config(format!(
            "channel {} has no api key",
            ctx.channel.id
        )));
    }
    Ok(key)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_error_shapes() {
        let openai = parse_error_body(
            401,
            r#"{"error":{"message":"Incorrect API key","type":"invalid_request_error","code":"invalid_api_key"}}"#,
        );
        assert!(matches!(
            openai,
            RelayError::UpstreamStatus { status: 401, ref code, .. } if code.as_deref() == Some("invalid_api_key")
        ));

        let claude = parse_error_body(
            529,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(matches!(
            claude,
            RelayError::UpstreamStatus { ref error_type, ref message, .. }
                if error_type.as_deref() == Some("overloaded_error") && message == "Overloaded"
        ));

        let gemini = parse_error_body(
            400,
            r#"{"error":{"code":400,"message":"API key not valid.","status":"INVALID_ARGUMENT"}}"#,
        );
        assert!(matches!(
            gemini,
            RelayError::UpstreamStatus { ref code, ref error_type, .. }
                if code.as_deref() == Some("400") && error_type.as_deref() == Some("INVALID_ARGUMENT")
        ));

        let ollama = parse_error_body(404, r#"{"error":"model 'llama9' not found"}"#);
        assert!(matches!(
            ollama,
            RelayError::UpstreamStatus { ref message, .. } if message.contains("llama9")
        ));

        let plain = parse_error_body(502, "");
        assert!(matches!(
            plain,
            RelayError::UpstreamStatus { ref message, .. } if message.contains("502")
        ));
    }

    #[test]
    fn factory_reflects_capabilities() {
        let anthropic = adaptor_set(ChannelKind::Anthropic).expect("anthropic");
        assert!(anthropic.embedding.is_none());
        assert_eq!(anthropic.chat.kind(), ChannelKind::Anthropic);

        let openai = adaptor_set(ChannelKind::OpenAi).expect("openai");
        assert!(openai.embedding.is_some());

        let ollama = adaptor_set(ChannelKind::Ollama).expect("ollama");
        assert_eq!(ollama.chat.framing(), Framing::JsonLines);
    }
}
