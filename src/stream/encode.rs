use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{Value, json};

use super::OutputFormat;
use crate::protocol::claude::{ClaudeUsage, stop_reason_str};
use crate::protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkFunction, ChunkToolCall, OpenAiUsage,
    finish_reason_str,
};
use crate::types::{FinishReason, StreamChunk, Usage};
use crate::utils::sse::{sse_data, sse_done, sse_event};

/// Projects canonical deltas into one caller-facing wire format.
pub trait StreamEncoder: Send {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<Bytes>;
    /// Terminal frames after a clean end of stream.
    fn finish(&mut self, finish_reason: FinishReason, usage: &Usage) -> Vec<Bytes>;
    /// Terminal frames after an upstream failure; `message` is caller-safe.
    fn abort(&mut self, message: &str) -> Vec<Bytes>;
}

pub fn encoder_for(
    format: OutputFormat,
    response_id: &str,
    model: &str,
    prompt_tokens: u64,
    include_usage: bool,
) -> Box<dyn StreamEncoder> {
    match format {
        OutputFormat::OpenAi => Box::new(OpenAiStreamEncoder::new(
            response_id,
            model,
            crate::protocol::unix_now(),
            include_usage,
        )),
        OutputFormat::Claude => Box::new(ClaudeStreamEncoder::new(response_id, model, prompt_tokens)),
    }
}

#[derive(Debug)]
pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: u64,
    include_usage: bool,
    sent_role: bool,
    tool_indices: HashMap<String, usize>,
}

impl OpenAiStreamEncoder {
    pub fn new(id: &str, model: &str, created: u64, include_usage: bool) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            created,
            include_usage,
            sent_role: false,
            tool_indices: HashMap::new(),
        }
    }

    fn frame(&mut self, mut delta: ChunkDelta, finish_reason: Option<String>) -> Bytes {
        if !self.sent_role {
            delta.role = Some("assistant".to_string());
            self.sent_role = true;
        }
        let mut chunk = ChatCompletionChunk::new(&self.id, &self.model, self.created);
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        sse_data(&chunk)
    }

    fn tool_index(&mut self, id: &str) -> (usize, bool) {
        let next = self.tool_indices.len();
        let mut fresh = false;
        let index = *self.tool_indices.entry(id.to_string()).or_insert_with(|| {
            fresh = true;
            next
        });
        (index, fresh)
    }
}

impl StreamEncoder for OpenAiStreamEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<Bytes> {
        let delta = match chunk {
            StreamChunk::TextDelta { text } if !text.is_empty() => ChunkDelta {
                content: Some(text.clone()),
                ..ChunkDelta::default()
            },
            StreamChunk::ReasoningDelta { text } if !text.is_empty() => ChunkDelta {
                reasoning_content: Some(text.clone()),
                ..ChunkDelta::default()
            },
            StreamChunk::ToolCallStart { id, name } => {
                let (index, _) = self.tool_index(id);
                ChunkDelta {
                    tool_calls: vec![ChunkToolCall {
                        index,
                        id: Some(id.clone()),
                        kind: Some("function".to_string()),
                        function: Some(ChunkFunction {
                            name: Some(name.clone()),
                            arguments: Some(String::new()),
                        }),
                    }],
                    ..ChunkDelta::default()
                }
            }
            StreamChunk::ToolCallDelta {
                id,
                arguments_delta,
            } => {
                let (index, fresh) = self.tool_index(id);
                ChunkDelta {
                    tool_calls: vec![ChunkToolCall {
                        index,
                        id: fresh.then(|| id.clone()),
                        kind: fresh.then(|| "function".to_string()),
                        function: Some(ChunkFunction {
                            name: None,
                            arguments: Some(arguments_delta.clone()),
                        }),
                    }],
                    ..ChunkDelta::default()
                }
            }
            _ => return Vec::new(),
        };
        vec![self.frame(delta, None)]
    }

    fn finish(&mut self, finish_reason: FinishReason, usage: &Usage) -> Vec<Bytes> {
        let reason = if finish_reason == FinishReason::Unknown && !self.tool_indices.is_empty() {
            FinishReason::ToolCalls
        } else {
            finish_reason
        };
        let mut out = vec![self.frame(
            ChunkDelta::default(),
            Some(finish_reason_str(reason).to_string()),
        )];
        if self.include_usage {
            let mut chunk = ChatCompletionChunk::new(&self.id, &self.model, self.created);
            chunk.usage = Some(OpenAiUsage::from(usage));
            out.push(sse_data(&chunk));
        }
        out.push(sse_done());
        out
    }

    fn abort(&mut self, message: &str) -> Vec<Bytes> {
        vec![sse_data(&json!({
            "error": { "message": message, "type": "upstream_error" }
        }))]
    }
}

#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    Text,
    Thinking,
    Tool(String),
}

/// Claude typed-event projection: `message_start`, one block per content kind, `message_stop`.
#[derive(Debug)]
pub struct ClaudeStreamEncoder {
    message_id: String,
    model: String,
    input_tokens: u64,
    started: bool,
    current: Option<(usize, OpenBlock)>,
    next_index: usize,
    tool_blocks: HashMap<String, usize>,
}

impl ClaudeStreamEncoder {
    pub fn new(message_id: &str, model: &str, input_tokens: u64) -> Self {
        Self {
            message_id: message_id.to_string(),
            model: model.to_string(),
            input_tokens,
            started: false,
            current: None,
            next_index: 0,
            tool_blocks: HashMap::new(),
        }
    }

    fn ensure_message_start(&mut self, out: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 }
                }
            }),
        ));
    }

    fn close_block(&mut self, out: &mut Vec<Bytes>) {
        if let Some((index, _)) = self.current.take() {
            out.push(sse_event(
                "content_block_stop",
                &json!({ "type": "content_block_stop", "index": index }),
            ));
        }
    }

    /// Opens `block` unless it is already the open one; returns its index.
    fn switch_to(&mut self, block: OpenBlock, out: &mut Vec<Bytes>) -> usize {
        self.ensure_message_start(out);
        if let Some((index, open)) = &self.current {
            if *open == block {
                return *index;
            }
        }
        self.close_block(out);

        let index = self.next_index;
        self.next_index += 1;
        let content_block = match &block {
            OpenBlock::Text => json!({ "type": "text", "text": "" }),
            OpenBlock::Thinking => json!({ "type": "thinking", "thinking": "" }),
            OpenBlock::Tool(id) => json!({
                "type": "tool_use",
                "id": id,
                "name": Value::Null,
                "input": {}
            }),
        };
        out.push(sse_event(
            "content_block_start",
            &json!({ "type": "content_block_start", "index": index, "content_block": content_block }),
        ));
        self.current = Some((index, block));
        index
    }

    fn delta(index: usize, delta: Value) -> Bytes {
        sse_event(
            "content_block_delta",
            &json!({ "type": "content_block_delta", "index": index, "delta": delta }),
        )
    }
}

impl StreamEncoder for ClaudeStreamEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<Bytes> {
        let mut out = Vec::new();
        match chunk {
            StreamChunk::TextDelta { text } if !text.is_empty() => {
                let index = self.switch_to(OpenBlock::Text, &mut out);
                out.push(Self::delta(index, json!({ "type": "text_delta", "text": text })));
            }
            StreamChunk::ReasoningDelta { text } if !text.is_empty() => {
                let index = self.switch_to(OpenBlock::Thinking, &mut out);
                out.push(Self::delta(
                    index,
                    json!({ "type": "thinking_delta", "thinking": text }),
                ));
            }
            StreamChunk::ToolCallStart { id, name } => {
                self.ensure_message_start(&mut out);
                self.close_block(&mut out);
                let index = self.next_index;
                self.next_index += 1;
                out.push(sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} }
                    }),
                ));
                self.tool_blocks.insert(id.clone(), index);
                self.current = Some((index, OpenBlock::Tool(id.clone())));
            }
            StreamChunk::ToolCallDelta {
                id,
                arguments_delta,
            } => {
                if arguments_delta.is_empty() {
                    return out;
                }
                let index = match self.tool_blocks.get(id) {
                    Some(index) if matches!(&self.current, Some((open, _)) if open == index) => {
                        *index
                    }
                    // Claude blocks cannot be reopened once stopped.
                    Some(index) => {
                        tracing::debug!(
                            tool_call = %id,
                            index,
                            "dropping delta for a closed tool block"
                        );
                        return out;
                    }
                    None => {
                        let index = self.switch_to(OpenBlock::Tool(id.clone()), &mut out);
                        self.tool_blocks.insert(id.clone(), index);
                        index
                    }
                };
                out.push(Self::delta(
                    index,
                    json!({ "type": "input_json_delta", "partial_json": arguments_delta }),
                ));
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self, finish_reason: FinishReason, usage: &Usage) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_message_start(&mut out);
        self.close_block(&mut out);

        let reason = if finish_reason == FinishReason::Unknown && !self.tool_blocks.is_empty() {
            FinishReason::ToolCalls
        } else {
            finish_reason
        };
        let usage = ClaudeUsage::from(usage);
        out.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason_str(reason), "stop_sequence": Value::Null },
                "usage": {
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens,
                }
            }),
        ));
        out.push(sse_event("message_stop", &json!({ "type": "message_stop" })));
        out
    }

    fn abort(&mut self, message: &str) -> Vec<Bytes> {
        vec![sse_event(
            "error",
            &json!({
                "type": "error",
                "error": { "type": "api_error", "message": message }
            }),
        )]
    }
}
