use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{is_false, null_default, parse_tool_arguments, tool_arguments_to_string};
use crate::types::{
    ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason, GenerateRequest,
    GenerateResponse, ImageSource, Message, Role, Tool, ToolChoice, ToolParameters, Usage,
};
use crate::{RelayError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(
        default,
        deserialize_with = "null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tools: Vec<ChatTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ChatToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(stop) => vec![stop],
            Self::Many(stops) => stops,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

impl ChatContent {
    fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ChatContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTool {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ChatFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ToolParameters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatToolChoice {
    Mode(String),
    Named(NamedToolChoice),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: NamedFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    #[serde(default)]
    pub function: ChatToolCallFunction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatToolCallFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ChatCompletionRequest {
    pub fn into_canonical(self) -> Result<GenerateRequest> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidRequest("model is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(RelayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }

        let mut messages = Vec::with_capacity(self.messages.len());
        for message in self.messages {
            messages.push(message_into_canonical(message)?);
        }

        let mut tools = Vec::with_capacity(self.tools.len());
        for tool in self.tools {
            if tool.kind != "function" {
                return Err(RelayError::InvalidRequest(format!(
                    "unsupported tool type: {}",
                    tool.kind
                )));
            }
            tools.push(Tool {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool
                    .function
                    .parameters
                    .unwrap_or_else(ToolParameters::empty_object),
            });
        }

        let tool_choice = match self.tool_choice {
            None => None,
            Some(ChatToolChoice::Mode(mode)) => Some(match mode.as_str() {
                "auto" => ToolChoice::Auto,
                "none" => ToolChoice::None,
                "required" => ToolChoice::Required,
                other => {
                    return Err(RelayError::InvalidRequest(format!(
                        "unsupported tool_choice: {other}"
                    )));
                }
            }),
            Some(ChatToolChoice::Named(named)) => Some(ToolChoice::Tool {
                name: named.function.name,
            }),
        };

        Ok(GenerateRequest {
            model: self.model,
            messages,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_completion_tokens.or(self.max_tokens),
            stop_sequences: self.stop.map(StopSequences::into_vec).unwrap_or_default(),
            tools,
            tool_choice,
            reasoning_effort: self.reasoning_effort,
            thinking_budget: None,
            stream: self.stream,
            include_usage: self
                .stream_options
                .map(|options| options.include_usage)
                .unwrap_or(false),
            user: self.user,
        })
    }

    /// Upstream body for OpenAI-shaped providers.
    pub fn from_canonical(request: &GenerateRequest, model: &str) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            messages.extend(message_from_canonical(message));
        }

        let tools = request
            .tools
            .iter()
            .map(|tool| ChatTool {
                kind: function_kind(),
                function: ChatFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.parameters.clone()),
                },
            })
            .collect();

        let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => ChatToolChoice::Mode("auto".to_string()),
            ToolChoice::None => ChatToolChoice::Mode("none".to_string()),
            ToolChoice::Required => ChatToolChoice::Mode("required".to_string()),
            ToolChoice::Tool { name } => ChatToolChoice::Named(NamedToolChoice {
                kind: function_kind(),
                function: NamedFunction { name: name.clone() },
            }),
        });

        let stop = match request.stop_sequences.len() {
            0 => None,
            _ => Some(StopSequences::Many(request.stop_sequences.clone())),
        };

        Self {
            model: model.to_string(),
            messages,
            stream: request.stream,
            stream_options: None,
            max_tokens: request.max_tokens,
            max_completion_tokens: None,
            temperature: request.temperature,
            top_p: request.top_p,
            stop,
            tools,
            tool_choice,
            reasoning_effort: request.reasoning_effort.clone(),
            user: request.user.clone(),
        }
    }
}

fn message_into_canonical(message: ChatMessage) -> Result<Message> {
    let role = Role::parse(&message.role)?;
    let mut content = Vec::<ContentPart>::new();

    if role == Role::Tool {
        let text = message
            .content
            .as_ref()
            .map(ChatContent::text)
            .unwrap_or_default();
        content.push(ContentPart::ToolResult {
            tool_call_id: message.tool_call_id.unwrap_or_default(),
            content: text,
            is_error: None,
        });
        return Ok(Message { role, content });
    }

    if let Some(reasoning) = message.reasoning_content.filter(|text| !text.is_empty()) {
        content.push(ContentPart::Reasoning { text: reasoning });
    }

    match message.content {
        None => {}
        Some(ChatContent::Text(text)) => {
            if !text.is_empty() {
                content.push(ContentPart::Text { text });
            }
        }
        Some(ChatContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ChatContentPart::Text { text } => content.push(ContentPart::Text { text }),
                    ChatContentPart::ImageUrl { image_url } => content.push(ContentPart::Image {
                        source: ImageSource::from_url(&image_url.url),
                    }),
                    ChatContentPart::Unsupported => {
                        return Err(RelayError::InvalidRequest(
                            "unsupported message content part".to_string(),
                        ));
                    }
                }
            }
        }
    }

    for call in message.tool_calls {
        content.push(ContentPart::ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: parse_tool_arguments(&call.function.arguments),
        });
    }

    Ok(Message { role, content })
}

fn message_from_canonical(message: &Message) -> Vec<ChatMessage> {
    if message.role == Role::Tool {
        return message
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => Some(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(content.clone())),
                    tool_call_id: Some(tool_call_id.clone()),
                    ..ChatMessage::default()
                }),
                _ => None,
            })
            .collect();
    }

    let mut parts = Vec::<ChatContentPart>::new();
    let mut tool_calls = Vec::<ChatToolCall>::new();
    let mut has_image = false;
    for part in &message.content {
        match part {
            ContentPart::Text { text } => parts.push(ChatContentPart::Text { text: text.clone() }),
            ContentPart::Image { source } => {
                has_image = true;
                parts.push(ChatContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: source.to_url(),
                        detail: None,
                    },
                });
            }
            ContentPart::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                kind: function_kind(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: tool_arguments_to_string(arguments),
                },
            }),
            ContentPart::ToolResult { .. } | ContentPart::Reasoning { .. } => {}
        }
    }

    let content = if has_image {
        Some(ChatContent::Parts(parts))
    } else {
        let text = parts
            .iter()
            .filter_map(|part| match part {
                ChatContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(ChatContent::Text(text))
        }
    };

    vec![ChatMessage {
        role: message.role.as_str().to_string(),
        content,
        tool_calls,
        ..ChatMessage::default()
    }]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cache_hit_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

impl From<OpenAiUsage> for Usage {
    fn from(raw: OpenAiUsage) -> Self {
        let prompt = raw.prompt_tokens_details.unwrap_or_default();
        let completion = raw.completion_tokens_details.unwrap_or_default();
        let cached = if prompt.cached_tokens > 0 {
            prompt.cached_tokens
        } else {
            raw.prompt_cache_hit_tokens.unwrap_or(0)
        };
        let mut usage = Usage {
            prompt_tokens: raw.prompt_tokens,
            completion_tokens: raw.completion_tokens,
            cached_tokens: cached,
            audio_prompt_tokens: prompt.audio_tokens,
            audio_completion_tokens: completion.audio_tokens,
            reasoning_tokens: completion.reasoning_tokens,
            total_tokens: raw.total_tokens,
        };
        usage.merge_total();
        usage
    }
}

impl From<&Usage> for OpenAiUsage {
    fn from(usage: &Usage) -> Self {
        let prompt_details = (usage.cached_tokens > 0 || usage.audio_prompt_tokens > 0).then_some(
            PromptTokensDetails {
                cached_tokens: usage.cached_tokens,
                audio_tokens: usage.audio_prompt_tokens,
            },
        );
        let completion_details = (usage.reasoning_tokens > 0
            || usage.audio_completion_tokens > 0)
            .then_some(CompletionTokensDetails {
                reasoning_tokens: usage.reasoning_tokens,
                audio_tokens: usage.audio_completion_tokens,
            });
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            prompt_tokens_details: prompt_details,
            completion_tokens_details: completion_details,
            prompt_cache_hit_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default, deserialize_with = "null_default")]
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

impl ChatCompletionResponse {
    pub fn into_canonical(self) -> GenerateResponse {
        let mut content = Vec::<ContentPart>::new();
        let mut finish_reason = FinishReason::Unknown;
        if let Some(choice) = self.choices.into_iter().next() {
            finish_reason = parse_finish_reason(choice.finish_reason.as_deref());
            let message = choice.message;
            if let Some(reasoning) = message.reasoning_content.filter(|text| !text.is_empty()) {
                content.push(ContentPart::Reasoning { text: reasoning });
            }
            if let Some(text) = message.content.as_ref().map(ChatContent::text) {
                if !text.is_empty() {
                    content.push(ContentPart::Text { text });
                }
            }
            for call in message.tool_calls {
                content.push(ContentPart::ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: parse_tool_arguments(&call.function.arguments),
                });
            }
        }
        GenerateResponse {
            id: self.id,
            model: self.model,
            content,
            finish_reason,
            usage: self.usage.map(Usage::from),
        }
    }

    /// Caller-facing body for a canonical response.
    pub fn from_canonical(response: &GenerateResponse, created: u64) -> Self {
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::<ChatToolCall>::new();
        for part in &response.content {
            match part {
                ContentPart::Text { text: delta } => text.push_str(delta),
                ContentPart::Reasoning { text: delta } => reasoning.push_str(delta),
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    kind: function_kind(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: tool_arguments_to_string(arguments),
                    },
                }),
                ContentPart::Image { .. } | ContentPart::ToolResult { .. } => {}
            }
        }

        let message = ChatMessage {
            role: "assistant".to_string(),
            content: if text.is_empty() && !tool_calls.is_empty() {
                None
            } else {
                Some(ChatContent::Text(text))
            },
            tool_calls,
            reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            ..ChatMessage::default()
        };

        Self {
            id: response.id.clone(),
            object: chat_completion_object(),
            created,
            model: response.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason: Some(finish_reason_str(response.finish_reason).to_string()),
            }],
            usage: response.usage.as_ref().map(OpenAiUsage::from),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chat_completion_chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default, deserialize_with = "null_default")]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<OpenAiUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkToolCall {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ChunkFunction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

fn chat_completion_chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

impl ChatCompletionChunk {
    pub fn new(id: &str, model: &str, created: u64) -> Self {
        Self {
            id: id.to_string(),
            object: chat_completion_chunk_object(),
            created,
            model: model.to_string(),
            choices: Vec::new(),
            usage: None,
            error: None,
        }
    }
}

pub fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("error") => FinishReason::Error,
        _ => FinishReason::Unknown,
    }
}

pub fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::Stop | FinishReason::Error | FinishReason::Unknown => "stop",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

impl EmbeddingsRequest {
    pub fn into_canonical(self) -> Result<EmbeddingRequest> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidRequest("model is required".to_string()));
        }
        if let Some(format) = self.encoding_format.as_deref() {
            if format != "float" {
                return Err(RelayError::InvalidRequest(format!(
                    "unsupported encoding_format: {format}"
                )));
            }
        }
        let input = match self.input {
            EmbeddingInput::One(text) => vec![text],
            EmbeddingInput::Many(texts) => texts,
        };
        if input.is_empty() {
            return Err(RelayError::InvalidRequest(
                "input must not be empty".to_string(),
            ));
        }
        Ok(EmbeddingRequest {
            model: self.model,
            input,
            dimensions: self.dimensions,
            user: self.user,
        })
    }

    pub fn from_canonical(request: &EmbeddingRequest, model: &str) -> Self {
        Self {
            model: model.to_string(),
            input: EmbeddingInput::Many(request.input.clone()),
            dimensions: request.dimensions,
            encoding_format: Some("float".to_string()),
            user: request.user.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    #[serde(default = "list_object")]
    pub object: String,
    #[serde(default, deserialize_with = "null_default")]
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    #[serde(default = "embedding_object")]
    pub object: String,
    #[serde(default)]
    pub index: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

fn list_object() -> String {
    "list".to_string()
}

fn embedding_object() -> String {
    "embedding".to_string()
}

impl EmbeddingsResponse {
    pub fn into_canonical(mut self) -> EmbeddingResponse {
        self.data.sort_by_key(|item| item.index);
        EmbeddingResponse {
            model: self.model,
            embeddings: self.data.into_iter().map(|item| item.embedding).collect(),
            usage: self
                .usage
                .map(|usage| Usage::new(usage.prompt_tokens, 0)),
        }
    }

    pub fn from_canonical(response: &EmbeddingResponse) -> Self {
        let usage = response.usage.unwrap_or_default();
        Self {
            object: list_object(),
            data: response
                .embeddings
                .iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingData {
                    object: embedding_object(),
                    index,
                    embedding: embedding.clone(),
                })
                .collect(),
            model: response.model.clone(),
            usage: Some(EmbeddingUsage {
                prompt_tokens: usage.prompt_tokens,
                total_tokens: usage.total_tokens,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_chat_request_into_canonical() {
        let raw = json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_completion_tokens": 64,
            "stop": "END",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "found"}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}],
            "tool_choice": {"type": "function", "function": {"name": "lookup"}}
        });
        let request: ChatCompletionRequest = serde_json::from_value(raw).expect("decode");
        let canonical = request.into_canonical().expect("canonical");

        assert!(canonical.stream);
        assert!(canonical.include_usage);
        assert_eq!(canonical.max_tokens, Some(64));
        assert_eq!(canonical.stop_sequences, vec!["END".to_string()]);
        assert_eq!(canonical.messages.len(), 4);
        assert_eq!(canonical.system_prompt().as_deref(), Some("be brief"));
        assert!(matches!(
            canonical.messages[1].content[1],
            ContentPart::Image {
                source: ImageSource::Base64 { .. }
            }
        ));
        assert_eq!(
            canonical.messages[2].content[0],
            ContentPart::ToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: json!({"q": "x"}),
            }
        );
        assert_eq!(
            canonical.tool_choice,
            Some(ToolChoice::Tool {
                name: "lookup".to_string()
            })
        );
    }

    #[test]
    fn rejects_non_object_tool_parameters() {
        let raw = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": [1, 2]}}]
        });
        assert!(serde_json::from_value::<ChatCompletionRequest>(raw).is_err());
    }

    #[test]
    fn canonical_round_trips_tool_results_as_tool_messages() {
        let request = GenerateRequest::new(
            "gpt-4o",
            vec![Message::user("hi"), Message::tool_result("call_1", "42")],
        );
        let upstream = ChatCompletionRequest::from_canonical(&request, "gpt-4o-2024");
        let value = serde_json::to_value(&upstream).expect("encode");
        assert_eq!(value["model"], "gpt-4o-2024");
        assert_eq!(value["messages"][1]["role"], "tool");
        assert_eq!(value["messages"][1]["tool_call_id"], "call_1");
        assert_eq!(value["messages"][1]["content"], "42");
    }

    #[test]
    fn parses_usage_details() {
        let raw = json!({
            "prompt_tokens": 10,
            "completion_tokens": 20,
            "total_tokens": 30,
            "prompt_tokens_details": {"cached_tokens": 4},
            "completion_tokens_details": {"reasoning_tokens": 7}
        });
        let usage: Usage = serde_json::from_value::<OpenAiUsage>(raw)
            .expect("usage")
            .into();
        assert_eq!(usage.cached_tokens, 4);
        assert_eq!(usage.reasoning_tokens, 7);
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn encodes_canonical_response_for_callers() {
        let response = GenerateResponse {
            id: "chatcmpl-1".to_string(),
            model: "gpt-4o".to_string(),
            content: vec![ContentPart::Text {
                text: "hello".to_string(),
            }],
            finish_reason: FinishReason::Stop,
            usage: Some(Usage::new(3, 2)),
        };
        let body = ChatCompletionResponse::from_canonical(&response, 1);
        let value = serde_json::to_value(&body).expect("encode");
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"]["total_tokens"], 5);
    }
}
