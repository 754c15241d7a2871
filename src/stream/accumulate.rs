use std::collections::HashMap;

use crate::protocol::parse_tool_arguments;
use crate::types::{ContentPart, FinishReason, GenerateResponse, StreamChunk, Usage};

const MAX_TOTAL_BYTES: usize = 64 * 1024 * 1024;
const MAX_TOOL_CALLS: usize = 256;

#[derive(Debug)]
enum Part {
    Text(String),
    Reasoning(String),
    ToolCall { id: String },
}

#[derive(Debug, Default)]
struct ToolCallBuffer {
    name: String,
    arguments: String,
}

/// Collects the deltas of one stream so usage can be rebuilt when the upstream never reports it.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    response_id: Option<String>,
    finish_reason: FinishReason,
    usage: Option<Usage>,
    parts: Vec<Part>,
    tool_calls: HashMap<String, ToolCallBuffer>,
    total_bytes: usize,
    truncated: bool,
    chunks: u64,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_add_bytes(&mut self, bytes: usize) -> bool {
        if self.truncated {
            return false;
        }
        if self.total_bytes.saturating_add(bytes) > MAX_TOTAL_BYTES {
            self.truncated = true;
            tracing::warn!(max_bytes = MAX_TOTAL_BYTES, "stream accumulator truncated");
            return false;
        }
        self.total_bytes += bytes;
        true
    }

    fn push_text(&mut self, text: &str, reasoning: bool) {
        if text.is_empty() || !self.try_add_bytes(text.len()) {
            return;
        }
        let merged = match (self.parts.last_mut(), reasoning) {
            (Some(Part::Text(existing)), false) | (Some(Part::Reasoning(existing)), true) => {
                existing.push_str(text);
                true
            }
            _ => false,
        };
        if !merged {
            self.parts.push(if reasoning {
                Part::Reasoning(text.to_string())
            } else {
                Part::Text(text.to_string())
            });
        }
    }

    fn tool_slot(&mut self, id: &str) -> Option<&mut ToolCallBuffer> {
        if !self.tool_calls.contains_key(id) {
            if self.tool_calls.len() >= MAX_TOOL_CALLS {
                return None;
            }
            self.tool_calls
                .insert(id.to_string(), ToolCallBuffer::default());
            self.parts.push(Part::ToolCall { id: id.to_string() });
        }
        self.tool_calls.get_mut(id)
    }

    pub fn observe(&mut self, chunk: &StreamChunk) {
        self.chunks += 1;
        match chunk {
            StreamChunk::ResponseId { id } => {
                if self.response_id.is_none() && !id.trim().is_empty() {
                    self.response_id = Some(id.clone());
                }
            }
            StreamChunk::TextDelta { text } => self.push_text(text, false),
            StreamChunk::ReasoningDelta { text } => self.push_text(text, true),
            StreamChunk::ToolCallStart { id, name } => {
                if id.trim().is_empty() {
                    return;
                }
                if let Some(slot) = self.tool_slot(id) {
                    if slot.name.is_empty() {
                        slot.name = name.clone();
                    }
                }
            }
            StreamChunk::ToolCallDelta {
                id,
                arguments_delta,
            } => {
                if id.trim().is_empty() || !self.try_add_bytes(arguments_delta.len()) {
                    return;
                }
                if let Some(slot) = self.tool_slot(id) {
                    slot.arguments.push_str(arguments_delta);
                }
            }
            StreamChunk::FinishReason(reason) => self.finish_reason = *reason,
            StreamChunk::Usage(usage) => {
                let mut usage = *usage;
                usage.merge_total();
                self.usage = Some(usage);
            }
        }
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.finish_reason
    }

    /// Usage exactly as the upstream reported it, if it did.
    pub fn reported_usage(&self) -> Option<Usage> {
        self.usage.filter(|usage| !usage.is_empty())
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks
    }

    /// Everything the model generated, flattened for local token counting.
    pub fn completion_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) | Part::Reasoning(text) => out.push_str(text),
                Part::ToolCall { id } => {
                    if let Some(call) = self.tool_calls.get(id) {
                        out.push_str(&call.name);
                        out.push_str(&call.arguments);
                    }
                }
            }
        }
        out
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn into_response(mut self, model: &str) -> GenerateResponse {
        let mut content = Vec::with_capacity(self.parts.len());
        for part in std::mem::take(&mut self.parts) {
            match part {
                Part::Text(text) => content.push(ContentPart::Text { text }),
                Part::Reasoning(text) => content.push(ContentPart::Reasoning { text }),
                Part::ToolCall { id } => {
                    let Some(call) = self.tool_calls.remove(&id) else {
                        continue;
                    };
                    if call.name.trim().is_empty() {
                        continue;
                    }
                    content.push(ContentPart::ToolCall {
                        id,
                        name: call.name,
                        arguments: parse_tool_arguments(&call.arguments),
                    });
                }
            }
        }
        GenerateResponse {
            id: self.response_id.unwrap_or_default(),
            model: model.to_string(),
            content,
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_adjacent_deltas_and_tool_arguments() {
        let mut acc = StreamAccumulator::new();
        for chunk in [
            StreamChunk::ResponseId {
                id: "resp_1".to_string(),
            },
            StreamChunk::TextDelta {
                text: "he".to_string(),
            },
            StreamChunk::TextDelta {
                text: "llo".to_string(),
            },
            StreamChunk::ToolCallStart {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
            },
            StreamChunk::ToolCallDelta {
                id: "call_1".to_string(),
                arguments_delta: "{\"q\":".to_string(),
            },
            StreamChunk::ToolCallDelta {
                id: "call_1".to_string(),
                arguments_delta: "1}".to_string(),
            },
            StreamChunk::FinishReason(FinishReason::ToolCalls),
        ] {
            acc.observe(&chunk);
        }

        assert_eq!(acc.text(), "hello");
        assert_eq!(acc.completion_text(), "hellolookup{\"q\":1}");
        assert_eq!(acc.reported_usage(), None);

        let response = acc.into_response("gpt-4o");
        assert_eq!(response.id, "resp_1");
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(
            response.content[1],
            ContentPart::ToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: serde_json::json!({"q": 1}),
            }
        );
    }

    #[test]
    fn empty_usage_counts_as_unreported() {
        let mut acc = StreamAccumulator::new();
        acc.observe(&StreamChunk::Usage(Usage::default()));
        assert_eq!(acc.reported_usage(), None);
        acc.observe(&StreamChunk::Usage(Usage::new(3, 2)));
        assert_eq!(acc.reported_usage().map(|u| u.total_tokens), Some(5));
    }
}
