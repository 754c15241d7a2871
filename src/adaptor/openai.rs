use std::collections::HashMap;

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::{Adaptor, ChatAdaptor, EmbeddingAdaptor, StreamingAdaptor, channel_key, insert_header};
use crate::protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, EmbeddingsRequest,
    EmbeddingsResponse, StreamOptions, parse_finish_reason,
};
use crate::relay::channel::ChannelKind;
use crate::relay::context::{RelayContext, RelayMode};
use crate::stream::ChunkMapper;
use crate::types::{
    EmbeddingRequest, EmbeddingResponse, GenerateRequest, GenerateResponse, StreamChunk, Usage,
};
use crate::{RelayError, Result};

const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

/// OpenAI chat completions, also serving Azure OpenAI, DeepSeek and generic compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiAdaptor {
    kind: ChannelKind,
    api_version: String,
    reasoning_family: bool,
}

impl OpenAiAdaptor {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
            reasoning_family: false,
        }
    }

    fn endpoint(ctx: &RelayContext) -> &'static str {
        match ctx.mode {
            RelayMode::ChatCompletions => "chat/completions",
            RelayMode::Embeddings => "embeddings",
        }
    }
}

impl Adaptor for OpenAiAdaptor {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn init(&mut self, ctx: &RelayContext) -> Result<()> {
        if self.kind == ChannelKind::Azure {
            if let Some(version) = ctx
                .channel
                .other
                .as_deref()
                .map(str::trim)
                .filter(|version| !version.is_empty())
            {
                self.api_version = version.to_string();
            }
        }
        self.reasoning_family = crate::model::is_openai_reasoning_family(&ctx.upstream_model);
        Ok(())
    }

    fn request_url(&self, ctx: &RelayContext) -> Result<String> {
        let base = ctx.channel.base_url();
        if base.is_empty() {
            return Err(RelayError::Config(format!(
                "channel {} has no base url",
                ctx.channel.id
            )));
        }
        let endpoint = Self::endpoint(ctx);
        if self.kind == ChannelKind::Azure {
            // Deployment names cannot contain dots.
            let deployment = ctx.upstream_model.replace('.', "");
            return Ok(format!(
                "{base}/openai/deployments/{deployment}/{endpoint}?api-version={}",
                self.api_version
            ));
        }
        if base.ends_with("/v1") {
            Ok(format!("{base}/{endpoint}"))
        } else {
            Ok(format!("{base}/v1/{endpoint}"))
        }
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, ctx: &RelayContext) -> Result<()> {
        let key = channel_key(ctx)?;
        if self.kind == ChannelKind::Azure {
            insert_header(headers, "api-key", key)
        } else {
            insert_header(headers, "authorization", &format!("Bearer {key}"))
        }
    }
}

impl ChatAdaptor for OpenAiAdaptor {
    fn convert_chat_request(&self, ctx: &RelayContext, request: &GenerateRequest) -> Result<Value> {
        let mut body = ChatCompletionRequest::from_canonical(request, &ctx.upstream_model);
        body.stream = ctx.is_stream;
        if ctx.is_stream {
            body.stream_options = Some(StreamOptions {
                include_usage: true,
            });
        }
        if self.reasoning_family {
            body.max_completion_tokens = body.max_completion_tokens.or(body.max_tokens.take());
            body.temperature = None;
            body.top_p = None;
        }
        Ok(serde_json::to_value(body)?)
    }

    fn parse_chat_response(&self, _ctx: &RelayContext, body: &[u8]) -> Result<GenerateResponse> {
        let parsed: ChatCompletionResponse = serde_json::from_slice(body)?;
        if parsed.choices.is_empty() {
            return Err(RelayError::UpstreamProtocol(
                "chat completion response has no choices".to_string(),
            ));
        }
        Ok(parsed.into_canonical())
    }
}

impl StreamingAdaptor for OpenAiAdaptor {
    fn chunk_mapper(&self, _ctx: &RelayContext) -> Box<dyn ChunkMapper> {
        Box::new(OpenAiChunkMapper::default())
    }
}

impl EmbeddingAdaptor for OpenAiAdaptor {
    fn convert_embedding_request(
        &self,
        ctx: &RelayContext,
        request: &EmbeddingRequest,
    ) -> Result<Value> {
        Ok(serde_json::to_value(EmbeddingsRequest::from_canonical(
            request,
            &ctx.upstream_model,
        ))?)
    }

    fn parse_embedding_response(
        &self,
        _ctx: &RelayContext,
        body: &[u8],
    ) -> Result<EmbeddingResponse> {
        let parsed: EmbeddingsResponse = serde_json::from_slice(body)?;
        Ok(parsed.into_canonical())
    }
}

/// Maps `chat.completion.chunk` payloads, tracking tool-call ids by index.
#[derive(Debug, Default)]
pub struct OpenAiChunkMapper {
    response_id_sent: bool,
    tool_ids: HashMap<usize, String>,
}

impl ChunkMapper for OpenAiChunkMapper {
    fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
        let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(RelayError::UpstreamProtocol(message));
        }

        let mut out = Vec::new();
        if !self.response_id_sent && !chunk.id.is_empty() {
            self.response_id_sent = true;
            out.push(StreamChunk::ResponseId { id: chunk.id });
        }
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.filter(|text| !text.is_empty()) {
                out.push(StreamChunk::ReasoningDelta { text: reasoning });
            }
            if let Some(text) = delta.content.filter(|text| !text.is_empty()) {
                out.push(StreamChunk::TextDelta { text });
            }
            for call in delta.tool_calls {
                let function = call.function.unwrap_or_default();
                let id = match (call.id.filter(|id| !id.is_empty()), function.name) {
                    (Some(id), Some(name)) => {
                        self.tool_ids.insert(call.index, id.clone());
                        out.push(StreamChunk::ToolCallStart {
                            id: id.clone(),
                            name,
                        });
                        id
                    }
                    (Some(id), None) => {
                        self.tool_ids.insert(call.index, id.clone());
                        id
                    }
                    (None, _) => match self.tool_ids.get(&call.index) {
                        Some(id) => id.clone(),
                        None => continue,
                    },
                };
                if let Some(arguments) = function.arguments.filter(|args| !args.is_empty()) {
                    out.push(StreamChunk::ToolCallDelta {
                        id,
                        arguments_delta: arguments,
                    });
                }
            }
            if choice.finish_reason.is_some() {
                out.push(StreamChunk::FinishReason(parse_finish_reason(
                    choice.finish_reason.as_deref(),
                )));
            }
        }
        if let Some(usage) = chunk.usage {
            out.push(StreamChunk::Usage(Usage::from(usage)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::test_support::{context, context_with};
    use crate::relay::channel::Channel;
    use crate::types::{FinishReason, Message};

    #[test]
    fn builds_urls_per_variant() {
        let mut adaptor = OpenAiAdaptor::new(ChannelKind::OpenAi);
        let ctx = context(ChannelKind::OpenAi, "gpt-4o", false);
        adaptor.init(&ctx).expect("init");
        assert_eq!(
            adaptor.request_url(&ctx).expect("url"),
            "https://api.openai.com/v1/chat/completions"
        );

        let mut channel = Channel::new(2, ChannelKind::OpenAiCompatible, "k");
        channel.base_url = Some("http://localhost:8000/v1/".to_string());
        let ctx = context_with(channel, "qwen", false, RelayMode::Embeddings);
        assert_eq!(
            adaptor.request_url(&ctx).expect("url"),
            "http://localhost:8000/v1/embeddings"
        );

        let mut channel = Channel::new(3, ChannelKind::Azure, "azure-key");
        channel.base_url = Some("https://example.openai.azure.com".to_string());
        channel.other = Some("2024-10-21".to_string());
        let ctx = context_with(channel, "gpt-3.5-turbo", true, RelayMode::ChatCompletions);
        let mut azure = OpenAiAdaptor::new(ChannelKind::Azure);
        azure.init(&ctx).expect("init");
        assert_eq!(
            azure.request_url(&ctx).expect("url"),
            "https://example.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-10-21"
        );

        let mut headers = HeaderMap::new();
        azure.setup_request_header(&mut headers, &ctx).expect("headers");
        assert_eq!(headers["api-key"], "azure-key");
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn azure_without_base_url_is_a_config_error() {
        let ctx = context(ChannelKind::Azure, "gpt-4o", false);
        let err = OpenAiAdaptor::new(ChannelKind::Azure)
            .request_url(&ctx)
            .expect_err("no base url");
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn blank_keys_are_rejected() {
        let ctx = context_with(
            Channel::new(1, ChannelKind::OpenAi, "  "),
            "gpt-4o",
            false,
            RelayMode::ChatCompletions,
        );
        let mut headers = HeaderMap::new();
        let err = OpenAiAdaptor::new(ChannelKind::OpenAi)
            .setup_request_header(&mut headers, &ctx)
            .expect_err("blank key");
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn reasoning_models_use_max_completion_tokens() {
        let ctx = context(ChannelKind::OpenAi, "o3-mini", true);
        let mut adaptor = OpenAiAdaptor::new(ChannelKind::OpenAi);
        adaptor.init(&ctx).expect("init");
        let mut request = GenerateRequest::new("o3-mini", vec![Message::user("hi")]);
        request.max_tokens = Some(64);
        request.temperature = Some(0.2);

        let body = adaptor.convert_chat_request(&ctx, &request).expect("body");
        assert_eq!(body["max_completion_tokens"], 64);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn maps_stream_chunks_with_tool_calls() {
        let mut mapper = OpenAiChunkMapper::default();
        let first = mapper
            .map_chunk(r#"{"id":"chatcmpl-9","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"}}]}"#)
            .expect("first");
        assert_eq!(
            first,
            vec![
                StreamChunk::ResponseId {
                    id: "chatcmpl-9".to_string()
                },
                StreamChunk::TextDelta {
                    text: "Hi".to_string()
                },
            ]
        );

        let start = mapper
            .map_chunk(r#"{"id":"chatcmpl-9","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":""}}]}}]}"#)
            .expect("start");
        assert_eq!(
            start,
            vec![StreamChunk::ToolCallStart {
                id: "call_1".to_string(),
                name: "lookup".to_string()
            }]
        );
        let args = mapper
            .map_chunk(r#"{"id":"chatcmpl-9","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":1}"}}]},"finish_reason":"tool_calls"}]}"#)
            .expect("args");
        assert_eq!(
            args,
            vec![
                StreamChunk::ToolCallDelta {
                    id: "call_1".to_string(),
                    arguments_delta: "{\"q\":1}".to_string()
                },
                StreamChunk::FinishReason(FinishReason::ToolCalls),
            ]
        );

        let usage = mapper
            .map_chunk(r#"{"id":"chatcmpl-9","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#)
            .expect("usage");
        assert_eq!(usage, vec![StreamChunk::Usage(Usage::new(5, 7))]);
    }

    #[test]
    fn in_band_errors_end_the_stream() {
        let mut mapper = OpenAiChunkMapper::default();
        let err = mapper
            .map_chunk(r#"{"error":{"message":"overloaded"}}"#)
            .expect_err("error chunk");
        assert!(matches!(err, RelayError::UpstreamProtocol(ref message) if message == "overloaded"));
        assert!(matches!(
            mapper.map_chunk("{not json"),
            Err(RelayError::Json(_))
        ));
    }
}
