use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Adaptor, ChatAdaptor, EmbeddingAdaptor, StreamingAdaptor, insert_header};
use crate::protocol::{generate_id, parse_tool_arguments};
use crate::relay::channel::ChannelKind;
use crate::relay::context::{RelayContext, RelayMode};
use crate::stream::{ChunkMapper, Framing};
use crate::types::{
    ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason, GenerateRequest,
    GenerateResponse, ImageSource, Role, StreamChunk, Usage,
};
use crate::{RelayError, Result};

#[derive(Debug, Clone, Default)]
pub struct OllamaAdaptor;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Options>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
}

#[derive(Debug, Default, Serialize)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
    #[serde(default)]
    error: Option<String>,
}

impl ChatResponse {
    fn usage(&self) -> Usage {
        Usage::new(self.prompt_eval_count, self.eval_count)
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
}

fn parse_done_reason(reason: Option<&str>, saw_tool_call: bool) -> FinishReason {
    match reason {
        _ if saw_tool_call => FinishReason::ToolCalls,
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Unknown,
    }
}

fn convert_message(message: &crate::types::Message) -> OllamaMessage {
    let mut out = OllamaMessage {
        role: message.role.as_str().to_string(),
        ..OllamaMessage::default()
    };
    for part in &message.content {
        match part {
            ContentPart::Text { text } => out.content.push_str(text),
            ContentPart::Image {
                source: ImageSource::Base64 { data, .. },
            } => out.images.push(data.clone()),
            ContentPart::Image { .. } | ContentPart::Reasoning { .. } => {}
            ContentPart::ToolCall {
                name, arguments, ..
            } => out.tool_calls.push(OllamaToolCall {
                function: OllamaFunction {
                    name: name.clone(),
                    arguments: match arguments {
                        Value::String(raw) => parse_tool_arguments(raw),
                        other => other.clone(),
                    },
                },
            }),
            ContentPart::ToolResult { content, .. } => out.content.push_str(content),
        }
    }
    out
}

impl Adaptor for OllamaAdaptor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Ollama
    }

    fn init(&mut self, _ctx: &RelayContext) -> Result<()> {
        Ok(())
    }

    fn request_url(&self, ctx: &RelayContext) -> Result<String> {
        let base = ctx.channel.base_url();
        Ok(match ctx.mode {
            RelayMode::ChatCompletions => format!("{base}/api/chat"),
            RelayMode::Embeddings => format!("{base}/api/embed"),
        })
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, ctx: &RelayContext) -> Result<()> {
        // Local servers usually run without auth; proxies in front of them may not.
        let key = ctx.channel.key.trim();
        if key.is_empty() {
            return Ok(());
        }
        insert_header(headers, "authorization", &format!("Bearer {key}"))
    }
}

impl ChatAdaptor for OllamaAdaptor {
    fn convert_chat_request(&self, ctx: &RelayContext, request: &GenerateRequest) -> Result<Value> {
        let options = Options {
            temperature: request.temperature,
            top_p: request.top_p,
            num_predict: request.max_tokens,
            stop: request.stop_sequences.clone(),
        };
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        let body = ChatRequest {
            model: ctx.upstream_model.clone(),
            messages: request.messages.iter().map(convert_message).collect(),
            stream: ctx.is_stream,
            options: Some(options),
            tools,
            think: request.thinking_budget.map(|_| true),
        };
        Ok(serde_json::to_value(body)?)
    }

    fn parse_chat_response(&self, ctx: &RelayContext, body: &[u8]) -> Result<GenerateResponse> {
        let parsed: ChatResponse = serde_json::from_slice(body)?;
        if let Some(error) = parsed.error {
            return Err(RelayError::UpstreamProtocol(error));
        }
        let usage = parsed.usage();
        let mut content = Vec::new();
        if let Some(message) = parsed.message {
            if let Some(thinking) = message.thinking.filter(|text| !text.is_empty()) {
                content.push(ContentPart::Reasoning { text: thinking });
            }
            if !message.content.is_empty() {
                content.push(ContentPart::Text {
                    text: message.content,
                });
            }
            for call in message.tool_calls {
                content.push(ContentPart::ToolCall {
                    id: generate_id("call_"),
                    name: call.function.name,
                    arguments: call.function.arguments,
                });
            }
        }
        let saw_tool_call = content
            .iter()
            .any(|part| matches!(part, ContentPart::ToolCall { .. }));
        Ok(GenerateResponse {
            id: generate_id("chatcmpl-"),
            model: if parsed.model.is_empty() {
                ctx.upstream_model.clone()
            } else {
                parsed.model
            },
            content,
            finish_reason: parse_done_reason(parsed.done_reason.as_deref(), saw_tool_call),
            usage: Some(usage),
        })
    }
}

impl StreamingAdaptor for OllamaAdaptor {
    fn framing(&self) -> Framing {
        Framing::JsonLines
    }

    fn chunk_mapper(&self, _ctx: &RelayContext) -> Box<dyn ChunkMapper> {
        Box::new(OllamaChunkMapper::default())
    }
}

impl EmbeddingAdaptor for OllamaAdaptor {
    fn convert_embedding_request(
        &self,
        ctx: &RelayContext,
        request: &EmbeddingRequest,
    ) -> Result<Value> {
        Ok(serde_json::to_value(EmbedRequest {
            model: ctx.upstream_model.clone(),
            input: request.input.clone(),
        })?)
    }

    fn parse_embedding_response(
        &self,
        ctx: &RelayContext,
        body: &[u8],
    ) -> Result<EmbeddingResponse> {
        let parsed: EmbedResponse = serde_json::from_slice(body)?;
        Ok(EmbeddingResponse {
            model: if parsed.model.is_empty() {
                ctx.original_model.clone()
            } else {
                parsed.model
            },
            embeddings: parsed.embeddings,
            usage: parsed.prompt_eval_count.map(|tokens| Usage::new(tokens, 0)),
        })
    }
}

/// One JSON object per line; the final `done: true` line carries the token counts.
#[derive(Debug, Default)]
pub struct OllamaChunkMapper {
    saw_tool_call: bool,
}

impl ChunkMapper for OllamaChunkMapper {
    fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
        let parsed: ChatResponse = serde_json::from_str(data)?;
        if let Some(error) = parsed.error {
            return Err(RelayError::UpstreamProtocol(error));
        }
        let mut out = Vec::new();
        if let Some(message) = &parsed.message {
            if let Some(thinking) = message.thinking.as_ref().filter(|text| !text.is_empty()) {
                out.push(StreamChunk::ReasoningDelta {
                    text: thinking.clone(),
                });
            }
            if !message.content.is_empty() {
                out.push(StreamChunk::TextDelta {
                    text: message.content.clone(),
                });
            }
            for call in &message.tool_calls {
                self.saw_tool_call = true;
                let id = generate_id("call_");
                out.push(StreamChunk::ToolCallStart {
                    id: id.clone(),
                    name: call.function.name.clone(),
                });
                out.push(StreamChunk::ToolCallDelta {
                    id,
                    arguments_delta: call.function.arguments.to_string(),
                });
            }
        }
        if parsed.done {
            out.push(StreamChunk::FinishReason(parse_done_reason(
                parsed.done_reason.as_deref(),
                self.saw_tool_call,
            )));
            out.push(StreamChunk::Usage(parsed.usage()));
        }
        Ok(out)
    }
}
