use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{is_false, null_default, parse_tool_arguments};
use crate::types::{
    ContentPart, FinishReason, GenerateRequest, GenerateResponse, ImageSource, Message, Role,
    Tool, ToolChoice, ToolParameters, Usage,
};
use crate::{RelayError, Result};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<ClaudeMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<ClaudeSystem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(
        default,
        deserialize_with = "null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub stop_sequences: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tools: Vec<ClaudeTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ClaudeToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ClaudeThinking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeSystem {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeBlock {
    Text {
        text: String,
    },
    Image {
        source: ClaudeImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

impl ToolResultContent {
    fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks_text(blocks),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: ToolParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeThinking {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

fn blocks_text(blocks: &[ClaudeBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ClaudeBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

impl MessagesRequest {
    pub fn into_canonical(self) -> Result<GenerateRequest> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidRequest("model is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(RelayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }

        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        match self.system {
            Some(ClaudeSystem::Text(text)) if !text.is_empty() => {
                messages.push(Message::system(text))
            }
            Some(ClaudeSystem::Blocks(blocks)) => {
                let text = blocks_text(&blocks);
                if !text.is_empty() {
                    messages.push(Message::system(text));
                }
            }
            _ => {}
        }

        for message in self.messages {
            let role = match message.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    return Err(RelayError::InvalidRequest(format!(
                        "unsupported message role: {other}"
                    )));
                }
            };
            match message.content {
                ClaudeContent::Text(text) => messages.push(Message {
                    role,
                    content: vec![ContentPart::Text { text }],
                }),
                ClaudeContent::Blocks(blocks) => split_blocks(role, blocks, &mut messages),
            }
        }

        let tools = self
            .tools
            .into_iter()
            .map(|tool| Tool {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            })
            .collect();

        let tool_choice = self.tool_choice.map(|choice| match choice {
            ClaudeToolChoice::Auto => ToolChoice::Auto,
            ClaudeToolChoice::Any => ToolChoice::Required,
            ClaudeToolChoice::None => ToolChoice::None,
            ClaudeToolChoice::Tool { name } => ToolChoice::Tool { name },
        });

        let thinking_budget = self
            .thinking
            .filter(|thinking| thinking.kind == "enabled")
            .and_then(|thinking| thinking.budget_tokens);

        Ok(GenerateRequest {
            model: self.model,
            messages,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stop_sequences: self.stop_sequences,
            tools,
            tool_choice,
            reasoning_effort: None,
            thinking_budget,
            stream: self.stream,
            include_usage: true,
            user: None,
        })
    }

    /// Upstream body for the Anthropic messages API.
    pub fn from_canonical(request: &GenerateRequest, model: &str) -> Self {
        let mut messages = Vec::<ClaudeMessage>::new();
        for message in &request.messages {
            let (role, blocks) = match message.role {
                Role::System => continue,
                Role::User => ("user", user_blocks(message)),
                Role::Tool => ("user", user_blocks(message)),
                Role::Assistant => ("assistant", assistant_blocks(message)),
            };
            if blocks.is_empty() {
                continue;
            }
            // Consecutive same-role turns are merged; the API rejects them otherwise.
            if let Some(last) = messages.last_mut() {
                if last.role == role {
                    if let ClaudeContent::Blocks(existing) = &mut last.content {
                        existing.extend(blocks);
                        continue;
                    }
                }
            }
            messages.push(ClaudeMessage {
                role: role.to_string(),
                content: ClaudeContent::Blocks(blocks),
            });
        }

        let tools = request
            .tools
            .iter()
            .map(|tool| ClaudeTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
            })
            .collect();

        let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => ClaudeToolChoice::Auto,
            ToolChoice::None => ClaudeToolChoice::None,
            ToolChoice::Required => ClaudeToolChoice::Any,
            ToolChoice::Tool { name } => ClaudeToolChoice::Tool { name: name.clone() },
        });

        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let thinking = request.thinking_budget.map(|budget| ClaudeThinking {
            kind: "enabled".to_string(),
            budget_tokens: Some(budget.min(max_tokens.saturating_sub(1)).max(1024)),
        });

        Self {
            model: model.to_string(),
            messages,
            system: request.system_prompt().map(ClaudeSystem::Text),
            max_tokens: Some(max_tokens),
            stream: request.stream,
            // Extended thinking rejects sampling overrides.
            temperature: if thinking.is_some() {
                None
            } else {
                request.temperature
            },
            top_p: if thinking.is_some() {
                None
            } else {
                request.top_p
            },
            stop_sequences: request.stop_sequences.clone(),
            tools,
            tool_choice,
            thinking,
            metadata: None,
        }
    }
}

fn split_blocks(role: Role, blocks: Vec<ClaudeBlock>, out: &mut Vec<Message>) {
    let mut content = Vec::<ContentPart>::new();
    let mut tool_results = Vec::<ContentPart>::new();
    for block in blocks {
        match block {
            ClaudeBlock::Text { text } => content.push(ContentPart::Text { text }),
            ClaudeBlock::Image { source } => content.push(ContentPart::Image {
                source: match source {
                    ClaudeImageSource::Base64 { media_type, data } => {
                        ImageSource::Base64 { media_type, data }
                    }
                    ClaudeImageSource::Url { url } => ImageSource::Url { url },
                },
            }),
            ClaudeBlock::ToolUse { id, name, input } => content.push(ContentPart::ToolCall {
                id,
                name,
                arguments: input,
            }),
            ClaudeBlock::ToolResult {
                tool_use_id,
                content: result,
                is_error,
            } => tool_results.push(ContentPart::ToolResult {
                tool_call_id: tool_use_id,
                content: result.as_ref().map(ToolResultContent::text).unwrap_or_default(),
                is_error,
            }),
            ClaudeBlock::Thinking { thinking, .. } => {
                content.push(ContentPart::Reasoning { text: thinking })
            }
            ClaudeBlock::RedactedThinking { .. } => {}
        }
    }
    if !tool_results.is_empty() {
        out.push(Message {
            role: Role::Tool,
            content: tool_results,
        });
    }
    if !content.is_empty() {
        out.push(Message { role, content });
    }
}

fn user_blocks(message: &Message) -> Vec<ClaudeBlock> {
    message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(ClaudeBlock::Text { text: text.clone() })
            }
            ContentPart::Image { source } => Some(ClaudeBlock::Image {
                source: match source {
                    ImageSource::Base64 { media_type, data } => ClaudeImageSource::Base64 {
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                    ImageSource::Url { url } => ClaudeImageSource::Url { url: url.clone() },
                },
            }),
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => Some(ClaudeBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: Some(ToolResultContent::Text(content.clone())),
                is_error: *is_error,
            }),
            _ => None,
        })
        .collect()
}

fn assistant_blocks(message: &Message) -> Vec<ClaudeBlock> {
    message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(ClaudeBlock::Text { text: text.clone() })
            }
            ContentPart::ToolCall {
                id,
                name,
                arguments,
            } => Some(ClaudeBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: match arguments {
                    Value::String(raw) => parse_tool_arguments(raw),
                    other => other.clone(),
                },
            }),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

impl From<ClaudeUsage> for Usage {
    fn from(raw: ClaudeUsage) -> Self {
        let cached = raw.cache_read_input_tokens.unwrap_or(0);
        let created = raw.cache_creation_input_tokens.unwrap_or(0);
        Usage::new(
            raw.input_tokens
                .saturating_add(cached)
                .saturating_add(created),
            raw.output_tokens,
        )
        .with_cached(cached)
    }
}

impl From<&Usage> for ClaudeUsage {
    fn from(usage: &Usage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens.saturating_sub(usage.cached_tokens),
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: (usage.cached_tokens > 0).then_some(usage.cached_tokens),
            cache_creation_input_tokens: None,
        }
    }
}

impl Usage {
    fn with_cached(mut self, cached: u64) -> Self {
        self.cached_tokens = cached;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "message_kind")]
    pub kind: String,
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, deserialize_with = "null_default")]
    pub content: Vec<ClaudeBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: ClaudeUsage,
}

fn message_kind() -> String {
    "message".to_string()
}

fn assistant_role() -> String {
    "assistant".to_string()
}

impl MessagesResponse {
    pub fn into_canonical(self) -> GenerateResponse {
        let mut content = Vec::<ContentPart>::new();
        for block in self.content {
            match block {
                ClaudeBlock::Text { text } => content.push(ContentPart::Text { text }),
                ClaudeBlock::Thinking { thinking, .. } => {
                    content.push(ContentPart::Reasoning { text: thinking })
                }
                ClaudeBlock::ToolUse { id, name, input } => content.push(ContentPart::ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ClaudeBlock::Image { .. }
                | ClaudeBlock::ToolResult { .. }
                | ClaudeBlock::RedactedThinking { .. } => {}
            }
        }
        GenerateResponse {
            id: self.id,
            model: self.model,
            content,
            finish_reason: parse_stop_reason(self.stop_reason.as_deref()),
            usage: Some(Usage::from(self.usage)),
        }
    }

    /// Caller-facing body for a canonical response.
    pub fn from_canonical(response: &GenerateResponse) -> Self {
        let content = response
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(ClaudeBlock::Text { text: text.clone() }),
                ContentPart::Reasoning { text } => Some(ClaudeBlock::Thinking {
                    thinking: text.clone(),
                    signature: None,
                }),
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ClaudeBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: match arguments {
                        Value::String(raw) => parse_tool_arguments(raw),
                        other => other.clone(),
                    },
                }),
                ContentPart::Image { .. } | ContentPart::ToolResult { .. } => None,
            })
            .collect();
        Self {
            id: response.id.clone(),
            kind: message_kind(),
            role: assistant_role(),
            model: response.model.clone(),
            content,
            stop_reason: Some(stop_reason_str(response.finish_reason).to_string()),
            stop_sequence: None,
            usage: response
                .usage
                .as_ref()
                .map(ClaudeUsage::from)
                .unwrap_or_default(),
        }
    }
}

pub fn parse_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

pub fn stop_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Stop | FinishReason::Error | FinishReason::Unknown => "end_turn",
    }
}

/// Typed events of the Anthropic streaming protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeStreamEvent {
    MessageStart {
        message: ClaudeStreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: ClaudeBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ClaudeDelta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: ClaudeMessageDelta,
        #[serde(default)]
        usage: Option<ClaudeUsage>,
    },
    MessageStop,
    Ping,
    Error {
        #[serde(default)]
        error: Value,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeStreamMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: ClaudeUsage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeMessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_messages_request_into_canonical() {
        let raw = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 256,
            "system": [{"type": "text", "text": "be brief"}],
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "sunny"},
                    {"type": "text", "text": "thanks"}
                ]}
            ],
            "tool_choice": {"type": "any"},
            "thinking": {"type": "enabled", "budget_tokens": 2048}
        });
        let request: MessagesRequest = serde_json::from_value(raw).expect("decode");
        let canonical = request.into_canonical().expect("canonical");

        assert_eq!(canonical.system_prompt().as_deref(), Some("be brief"));
        assert_eq!(canonical.max_tokens, Some(256));
        assert_eq!(canonical.thinking_budget, Some(2048));
        assert_eq!(canonical.tool_choice, Some(ToolChoice::Required));
        let roles: Vec<Role> = canonical.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::Tool,
                Role::User
            ]
        );
        assert_eq!(
            canonical.messages[3].content[0],
            ContentPart::ToolResult {
                tool_call_id: "toolu_1".to_string(),
                content: "sunny".to_string(),
                is_error: None,
            }
        );
    }

    #[test]
    fn upstream_body_merges_tool_results_into_user_turn() {
        let mut request = GenerateRequest::new(
            "claude",
            vec![
                Message::system("sys"),
                Message::user("hi"),
                Message {
                    role: Role::Assistant,
                    content: vec![ContentPart::ToolCall {
                        id: "toolu_1".to_string(),
                        name: "f".to_string(),
                        arguments: Value::String("{\"a\":1}".to_string()),
                    }],
                },
                Message::tool_result("toolu_1", "ok"),
                Message::user("next"),
            ],
        );
        request.temperature = Some(0.2);
        let body = MessagesRequest::from_canonical(&request, "claude-3-5-haiku");
        let value = serde_json::to_value(&body).expect("encode");

        assert_eq!(value["system"], "sys");
        assert_eq!(value["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["messages"][1]["content"][0]["input"]["a"], 1);
        assert_eq!(value["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(value["messages"][2]["content"][1]["text"], "next");
        let temperature = value["temperature"].as_f64().expect("temperature");
        assert!((temperature - 0.2).abs() < 1e-6);
    }

    #[test]
    fn usage_counts_cache_reads_as_prompt_tokens() {
        let usage = Usage::from(ClaudeUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_input_tokens: Some(90),
            cache_creation_input_tokens: None,
        });
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.cached_tokens, 90);
        assert_eq!(usage.total_tokens, 105);
    }

    #[test]
    fn decodes_stream_events() {
        let event: ClaudeStreamEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        )
        .expect("event");
        assert!(matches!(
            event,
            ClaudeStreamEvent::ContentBlockDelta {
                index: 0,
                delta: ClaudeDelta::TextDelta { .. }
            }
        ));
    }
}
