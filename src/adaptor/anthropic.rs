use std::collections::HashMap;

use reqwest::header::HeaderMap;
use serde_json::Value;

use super::{Adaptor, ChatAdaptor, StreamingAdaptor, channel_key, insert_header};
use crate::model::strip_thinking_suffix;
use crate::protocol::claude::{
    ClaudeBlock, ClaudeDelta, ClaudeStreamEvent, DEFAULT_MAX_TOKENS, MessagesRequest,
    MessagesResponse, parse_stop_reason,
};
use crate::relay::channel::ChannelKind;
use crate::relay::context::RelayContext;
use crate::stream::ChunkMapper;
use crate::types::{GenerateRequest, GenerateResponse, StreamChunk, Usage};
use crate::{RelayError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Default)]
pub struct AnthropicAdaptor {
    /// Upstream model with any `-thinking` marker removed.
    model: String,
    thinking: bool,
}

impl Adaptor for AnthropicAdaptor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Anthropic
    }

    fn init(&mut self, ctx: &RelayContext) -> Result<()> {
        let (model, thinking) = strip_thinking_suffix(&ctx.upstream_model);
        self.model = model.to_string();
        self.thinking = thinking;
        Ok(())
    }

    fn request_url(&self, ctx: &RelayContext) -> Result<String> {
        let base = ctx.channel.base_url();
        if base.ends_with("/v1") {
            Ok(format!("{base}/messages"))
        } else {
            Ok(format!("{base}/v1/messages"))
        }
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, ctx: &RelayContext) -> Result<()> {
        insert_header(headers, "x-api-key", channel_key(ctx)?)?;
        insert_header(headers, "anthropic-version", ANTHROPIC_VERSION)
    }
}

impl ChatAdaptor for AnthropicAdaptor {
    fn convert_chat_request(&self, ctx: &RelayContext, request: &GenerateRequest) -> Result<Value> {
        let model = if self.model.is_empty() {
            ctx.upstream_model.as_str()
        } else {
            self.model.as_str()
        };
        let mut request = request.clone();
        request.stream = ctx.is_stream;
        if self.thinking && request.thinking_budget.is_none() {
            let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
            request.thinking_budget = Some(max_tokens / 5 * 4);
        }
        Ok(serde_json::to_value(MessagesRequest::from_canonical(
            &request, model,
        ))?)
    }

    fn parse_chat_response(&self, _ctx: &RelayContext, body: &[u8]) -> Result<GenerateResponse> {
        let parsed: MessagesResponse = serde_json::from_slice(body)?;
        if parsed.kind == "error" {
            return Err(RelayError::UpstreamProtocol(
                "anthropic returned an error object with a success status".to_string(),
            ));
        }
        Ok(parsed.into_canonical())
    }
}

impl StreamingAdaptor for AnthropicAdaptor {
    fn chunk_mapper(&self, _ctx: &RelayContext) -> Box<dyn ChunkMapper> {
        Box::new(ClaudeChunkMapper::default())
    }
}

/// Maps Anthropic stream events. Input tokens arrive in `message_start` and output tokens in
/// `message_delta`, so the mapper carries the former forward.
#[derive(Debug, Default)]
pub struct ClaudeChunkMapper {
    tool_ids: HashMap<usize, String>,
    input: Usage,
}

impl ChunkMapper for ClaudeChunkMapper {
    fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
        let event: ClaudeStreamEvent = serde_json::from_str(data)?;
        let mut out = Vec::new();
        match event {
            ClaudeStreamEvent::MessageStart { message } => {
                self.input = Usage::from(message.usage);
                if !message.id.is_empty() {
                    out.push(StreamChunk::ResponseId { id: message.id });
                }
            }
            ClaudeStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ClaudeBlock::ToolUse { id, name, .. } => {
                    self.tool_ids.insert(index, id.clone());
                    out.push(StreamChunk::ToolCallStart { id, name });
                }
                ClaudeBlock::Text { text } if !text.is_empty() => {
                    out.push(StreamChunk::TextDelta { text });
                }
                ClaudeBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    out.push(StreamChunk::ReasoningDelta { text: thinking });
                }
                _ => {}
            },
            ClaudeStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ClaudeDelta::TextDelta { text } => out.push(StreamChunk::TextDelta { text }),
                ClaudeDelta::ThinkingDelta { thinking } => {
                    out.push(StreamChunk::ReasoningDelta { text: thinking })
                }
                ClaudeDelta::InputJsonDelta { partial_json } => {
                    if let Some(id) = self.tool_ids.get(&index) {
                        out.push(StreamChunk::ToolCallDelta {
                            id: id.clone(),
                            arguments_delta: partial_json,
                        });
                    }
                }
                ClaudeDelta::SignatureDelta { .. } => {}
            },
            ClaudeStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    out.push(StreamChunk::FinishReason(parse_stop_reason(
                        delta.stop_reason.as_deref(),
                    )));
                }
                if let Some(usage) = usage {
                    let output = Usage::from(usage);
                    let prompt = if output.prompt_tokens > 0 {
                        output.prompt_tokens
                    } else {
                        self.input.prompt_tokens
                    };
                    let mut merged = Usage::new(prompt, output.completion_tokens);
                    merged.cached_tokens = output.cached_tokens.max(self.input.cached_tokens);
                    out.push(StreamChunk::Usage(merged));
                }
            }
            ClaudeStreamEvent::Error { error } => {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(RelayError::UpstreamProtocol(message));
            }
            ClaudeStreamEvent::ContentBlockStop { .. }
            | ClaudeStreamEvent::MessageStop
            | ClaudeStreamEvent::Ping => {}
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::test_support::context;
    use crate::types::{FinishReason, Message};

    #[test]
    fn thinking_suffix_enables_extended_thinking() {
        let ctx = context(ChannelKind::Anthropic, "claude-3-7-sonnet-thinking", false);
        let mut adaptor = AnthropicAdaptor::default();
        adaptor.init(&ctx).expect("init");
        let mut request = GenerateRequest::new(
            "claude-3-7-sonnet-thinking",
            vec![Message::system("be brief"), Message::user("hi")],
        );
        request.max_tokens = Some(8000);
        request.temperature = Some(0.5);

        let body = adaptor.convert_chat_request(&ctx, &request).expect("body");
        assert_eq!(body["model"], "claude-3-7-sonnet");
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 6400);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["system"], "be brief");
        assert_eq!(
            adaptor.request_url(&ctx).expect("url"),
            "https://api.anthropic.com/v1/messages"
        );

        let mut headers = HeaderMap::new();
        adaptor.setup_request_header(&mut headers, &ctx).expect("headers");
        assert_eq!(headers["x-api-key"], "test-key");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
    }

    #[test]
    fn parses_non_stream_response() {
        let ctx = context(ChannelKind::Anthropic, "claude-3-5-haiku", false);
        let body = br#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-5-haiku","content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input_tokens":9,"output_tokens":2}}"#;
        let response = AnthropicAdaptor::default()
            .parse_chat_response(&ctx, body)
            .expect("response");
        assert_eq!(response.text(), "hello");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage, Some(Usage::new(9, 2)));
    }

    #[test]
    fn maps_stream_events_and_merges_usage() {
        let mut mapper = ClaudeChunkMapper::default();
        let events = [
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude","usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"weather","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":30}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let chunks: Vec<StreamChunk> = events
            .iter()
            .flat_map(|event| mapper.map_chunk(event).expect("event"))
            .collect();

        assert_eq!(
            chunks,
            vec![
                StreamChunk::ResponseId {
                    id: "msg_1".to_string()
                },
                StreamChunk::ReasoningDelta {
                    text: "hmm".to_string()
                },
                StreamChunk::ToolCallStart {
                    id: "toolu_1".to_string(),
                    name: "weather".to_string()
                },
                StreamChunk::ToolCallDelta {
                    id: "toolu_1".to_string(),
                    arguments_delta: "{\"city\":".to_string()
                },
                StreamChunk::FinishReason(FinishReason::ToolCalls),
                StreamChunk::Usage(Usage::new(12, 30)),
            ]
        );
    }

    #[test]
    fn error_events_end_the_stream() {
        let mut mapper = ClaudeChunkMapper::default();
        let err = mapper
            .map_chunk(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .expect_err("error event");
        assert!(matches!(err, RelayError::UpstreamProtocol(ref message) if message == "Overloaded"));
    }
}
