use std::collections::HashMap;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Adaptor, ChatAdaptor, EmbeddingAdaptor, StreamingAdaptor, channel_key, insert_header};
use crate::protocol::{generate_id, parse_tool_arguments};
use crate::relay::channel::ChannelKind;
use crate::relay::context::{RelayContext, RelayMode};
use crate::stream::ChunkMapper;
use crate::types::{
    ContentPart, EmbeddingRequest, EmbeddingResponse, FinishReason, GenerateRequest,
    GenerateResponse, ImageSource, Role, StreamChunk, ToolChoice, Usage,
};
use crate::{RelayError, Result};

#[derive(Debug, Clone, Default)]
pub struct GeminiAdaptor;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
    #[serde(default)]
    cached_content_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

impl From<UsageMetadata> for Usage {
    fn from(raw: UsageMetadata) -> Self {
        let mut usage = Usage {
            prompt_tokens: raw.prompt_token_count,
            completion_tokens: raw
                .candidates_token_count
                .saturating_add(raw.thoughts_token_count),
            cached_tokens: raw.cached_content_token_count,
            reasoning_tokens: raw.thoughts_token_count,
            total_tokens: raw.total_token_count,
            ..Usage::default()
        };
        usage.merge_total();
        usage
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchEmbedRequest {
    requests: Vec<EmbedContentRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest {
    model: String,
    content: GeminiContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

fn text_part(text: impl Into<String>) -> GeminiPart {
    GeminiPart {
        text: Some(text.into()),
        ..GeminiPart::default()
    }
}

fn parse_finish_reason(reason: Option<&str>, saw_tool_call: bool) -> FinishReason {
    match reason {
        Some("STOP") if saw_tool_call => FinishReason::ToolCalls,
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII") => {
            FinishReason::ContentFilter
        }
        Some("MALFORMED_FUNCTION_CALL") => FinishReason::Error,
        _ => FinishReason::Unknown,
    }
}

fn convert_request(request: &GenerateRequest) -> GenerateContentRequest {
    // Gemini matches tool results to calls by function name, not id.
    let mut call_names = HashMap::<&str, &str>::new();
    let mut contents = Vec::<GeminiContent>::new();

    for message in &request.messages {
        let role = match message.role {
            Role::System => continue,
            Role::Assistant => "model",
            Role::User | Role::Tool => "user",
        };
        let mut parts = Vec::new();
        for part in &message.content {
            match part {
                ContentPart::Text { text } => parts.push(text_part(text.clone())),
                ContentPart::Image { source } => parts.push(match source {
                    ImageSource::Base64 { media_type, data } => GeminiPart {
                        inline_data: Some(InlineData {
                            mime_type: media_type.clone(),
                            data: data.clone(),
                        }),
                        ..GeminiPart::default()
                    },
                    ImageSource::Url { url } => GeminiPart {
                        file_data: Some(FileData {
                            mime_type: None,
                            file_uri: url.clone(),
                        }),
                        ..GeminiPart::default()
                    },
                }),
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    call_names.insert(id.as_str(), name.as_str());
                    let args = match arguments {
                        Value::String(raw) => parse_tool_arguments(raw),
                        other => other.clone(),
                    };
                    parts.push(GeminiPart {
                        function_call: Some(FunctionCall {
                            name: name.clone(),
                            args,
                        }),
                        ..GeminiPart::default()
                    });
                }
                ContentPart::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => {
                    let name = call_names
                        .get(tool_call_id.as_str())
                        .copied()
                        .unwrap_or(tool_call_id.as_str());
                    let mut response = Map::new();
                    response.insert("content".to_string(), Value::String(content.clone()));
                    parts.push(GeminiPart {
                        function_response: Some(FunctionResponse {
                            name: name.to_string(),
                            response: Value::Object(response),
                        }),
                        ..GeminiPart::default()
                    });
                }
                ContentPart::Reasoning { .. } => {}
            }
        }
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(GeminiContent {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let tools = if request.tools.is_empty() {
        Vec::new()
    } else {
        vec![GeminiTool {
            function_declarations: request
                .tools
                .iter()
                .map(|tool| {
                    let mut declaration = Map::new();
                    declaration.insert("name".to_string(), Value::String(tool.name.clone()));
                    if let Some(description) = &tool.description {
                        declaration
                            .insert("description".to_string(), Value::String(description.clone()));
                    }
                    declaration.insert("parameters".to_string(), tool.parameters.clone().into());
                    Value::Object(declaration)
                })
                .collect(),
        }]
    };

    let tool_config = request.tool_choice.as_ref().map(|choice| {
        let config = match choice {
            ToolChoice::Auto => serde_json::json!({"mode": "AUTO"}),
            ToolChoice::None => serde_json::json!({"mode": "NONE"}),
            ToolChoice::Required => serde_json::json!({"mode": "ANY"}),
            ToolChoice::Tool { name } => {
                serde_json::json!({"mode": "ANY", "allowedFunctionNames": [name]})
            }
        };
        serde_json::json!({ "functionCallingConfig": config })
    });

    let generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop_sequences.clone(),
        thinking_config: request
            .thinking_budget
            .map(|budget| serde_json::json!({"thinkingBudget": budget, "includeThoughts": true})),
    };

    GenerateContentRequest {
        contents,
        system_instruction: request.system_prompt().map(|system| GeminiContent {
            role: None,
            parts: vec![text_part(system)],
        }),
        generation_config: Some(generation_config),
        tools,
        tool_config,
    }
}

impl Adaptor for GeminiAdaptor {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Gemini
    }

    fn init(&mut self, _ctx: &RelayContext) -> Result<()> {
        Ok(())
    }

    fn request_url(&self, ctx: &RelayContext) -> Result<String> {
        let base = ctx.channel.base_url();
        let prefix = if base.ends_with("/v1beta") || base.ends_with("/v1") {
            base.to_string()
        } else {
            format!("{base}/v1beta")
        };
        let model = &ctx.upstream_model;
        Ok(match (ctx.mode, ctx.is_stream) {
            (RelayMode::Embeddings, _) => format!("{prefix}/models/{model}:batchEmbedContents"),
            (RelayMode::ChatCompletions, true) => {
                format!("{prefix}/models/{model}:streamGenerateContent?alt=sse")
            }
            (RelayMode::ChatCompletions, false) => {
                format!("{prefix}/models/{model}:generateContent")
            }
        })
    }

    fn setup_request_header(&self, headers: &mut HeaderMap, ctx: &RelayContext) -> Result<()> {
        insert_header(headers, "x-goog-api-key", channel_key(ctx)?)
    }
}

impl ChatAdaptor for GeminiAdaptor {
    fn convert_chat_request(&self, _ctx: &RelayContext, request: &GenerateRequest) -> Result<Value> {
        Ok(serde_json::to_value(convert_request(request))?)
    }

    fn parse_chat_response(&self, ctx: &RelayContext, body: &[u8]) -> Result<GenerateResponse> {
        let parsed: GenerateContentResponse = serde_json::from_slice(body)?;
        if parsed.candidates.is_empty() {
            let reason = parsed
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(RelayError::UpstreamProtocol(format!(
                "gemini returned no candidates: {reason}"
            )));
        }

        let mut content = Vec::new();
        let mut finish = None;
        if let Some(candidate) = parsed.candidates.into_iter().next() {
            finish = candidate.finish_reason;
            for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
                if let Some(call) = part.function_call {
                    content.push(ContentPart::ToolCall {
                        id: generate_id("call_"),
                        name: call.name,
                        arguments: call.args,
                    });
                } else if let Some(text) = part.text {
                    if part.thought == Some(true) {
                        content.push(ContentPart::Reasoning { text });
                    } else {
                        content.push(ContentPart::Text { text });
                    }
                }
            }
        }
        let saw_tool_call = content
            .iter()
            .any(|part| matches!(part, ContentPart::ToolCall { .. }));

        Ok(GenerateResponse {
            id: parsed
                .response_id
                .unwrap_or_else(|| generate_id("chatcmpl-")),
            model: parsed
                .model_version
                .unwrap_or_else(|| ctx.upstream_model.clone()),
            content,
            finish_reason: parse_finish_reason(finish.as_deref(), saw_tool_call),
            usage: parsed.usage_metadata.map(Usage::from),
        })
    }
}

impl StreamingAdaptor for GeminiAdaptor {
    fn chunk_mapper(&self, _ctx: &RelayContext) -> Box<dyn ChunkMapper> {
        Box::new(GeminiChunkMapper::default())
    }
}

impl EmbeddingAdaptor for GeminiAdaptor {
    fn convert_embedding_request(
        &self,
        ctx: &RelayContext,
        request: &EmbeddingRequest,
    ) -> Result<Value> {
        let model = format!("models/{}", ctx.upstream_model);
        let body = BatchEmbedRequest {
            requests: request
                .input
                .iter()
                .map(|text| EmbedContentRequest {
                    model: model.clone(),
                    content: GeminiContent {
                        role: None,
                        parts: vec![text_part(text.clone())],
                    },
                    output_dimensionality: request.dimensions,
                })
                .collect(),
        };
        Ok(serde_json::to_value(body)?)
    }

    fn parse_embedding_response(
        &self,
        ctx: &RelayContext,
        body: &[u8],
    ) -> Result<EmbeddingResponse> {
        let parsed: BatchEmbedResponse = serde_json::from_slice(body)?;
        Ok(EmbeddingResponse {
            model: ctx.original_model.clone(),
            embeddings: parsed.embeddings.into_iter().map(|item| item.values).collect(),
            usage: None,
        })
    }
}

/// Gemini streams whole `GenerateContentResponse` objects, each carrying new parts and the
/// running usage totals.
#[derive(Debug, Default)]
pub struct GeminiChunkMapper {
    response_id_sent: bool,
    saw_tool_call: bool,
}

impl ChunkMapper for GeminiChunkMapper {
    fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
        let value: Value = serde_json::from_str(data)?;
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(RelayError::UpstreamProtocol(message));
        }
        let parsed: GenerateContentResponse = serde_json::from_value(value)?;

        let mut out = Vec::new();
        if !self.response_id_sent {
            if let Some(id) = parsed.response_id.filter(|id| !id.is_empty()) {
                self.response_id_sent = true;
                out.push(StreamChunk::ResponseId { id });
            }
        }
        for candidate in parsed.candidates {
            for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
                if let Some(call) = part.function_call {
                    self.saw_tool_call = true;
                    let id = generate_id("call_");
                    out.push(StreamChunk::ToolCallStart {
                        id: id.clone(),
                        name: call.name,
                    });
                    out.push(StreamChunk::ToolCallDelta {
                        id,
                        arguments_delta: call.args.to_string(),
                    });
                } else if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                    if part.thought == Some(true) {
                        out.push(StreamChunk::ReasoningDelta { text });
                    } else {
                        out.push(StreamChunk::TextDelta { text });
                    }
                }
            }
            if candidate.finish_reason.is_some() {
                out.push(StreamChunk::FinishReason(parse_finish_reason(
                    candidate.finish_reason.as_deref(),
                    self.saw_tool_call,
                )));
            }
        }
        if let Some(usage) = parsed.usage_metadata {
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
    use crate::types::{Message, Tool, ToolParameters};
    use serde_json::json;

    #[test]
    fn builds_generate_and_stream_urls() {
        let adaptor = GeminiAdaptor::default();
        let ctx = context(ChannelKind::Gemini, "gemini-2.0-flash", false);
        assert_eq!(
            adaptor.request_url(&ctx).expect("url"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        let ctx = context(ChannelKind::Gemini, "gemini-2.0-flash", true);
        assert!(
            adaptor
                .request_url(&ctx)
                .expect("url")
                .ends_with(":streamGenerateContent?alt=sse")
        );
        let ctx = context_with(
            Channel::new(1, ChannelKind::Gemini, "g-key"),
            "text-embedding-004",
            false,
            RelayMode::Embeddings,
        );
        assert!(
            adaptor
                .request_url(&ctx)
                .expect("url")
                .ends_with("/models/text-embedding-004:batchEmbedContents")
        );
        let mut headers = HeaderMap::new();
        adaptor.setup_request_header(&mut headers, &ctx).expect("headers");
        assert_eq!(headers["x-goog-api-key"], "g-key");
    }

    #[test]
    fn converts_roles_tools_and_tool_results() {
        let mut request = GenerateRequest::new(
            "gemini-2.0-flash",
            vec![
                Message::system("be brief"),
                Message::user("weather in Paris?"),
                Message {
                    role: Role::Assistant,
                    content: vec![ContentPart::ToolCall {
                        id: "call_1".to_string(),
                        name: "weather".to_string(),
                        arguments: json!({"city": "Paris"}),
                    }],
                },
                Message::tool_result("call_1", "sunny"),
            ],
        );
        request.tools = vec![Tool {
            name: "weather".to_string(),
            description: None,
            parameters: ToolParameters::empty_object(),
        }];
        request.tool_choice = Some(ToolChoice::Required);
        request.max_tokens = Some(100);

        let body = serde_json::to_value(convert_request(&request)).expect("body");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["name"], "weather");
        assert_eq!(
            body["contents"][2]["parts"][0]["functionResponse"]["name"],
            "weather"
        );
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "weather");
        assert_eq!(body["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn parses_response_usage_and_finish_reason() {
        let ctx = context(ChannelKind::Gemini, "gemini-2.0-flash", false);
        let body = br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"thinking...","thought":true},{"text":"Hello"}]},"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":6,"thoughtsTokenCount":3,"totalTokenCount":13}}"#;
        let response = GeminiAdaptor::default()
            .parse_chat_response(&ctx, body)
            .expect("response");
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.reasoning().as_deref(), Some("thinking..."));
        assert_eq!(response.finish_reason, FinishReason::Length);
        let usage = response.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.reasoning_tokens, 3);
        assert_eq!(usage.total_tokens, 13);

        let blocked = br#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        let err = GeminiAdaptor::default()
            .parse_chat_response(&ctx, blocked)
            .expect_err("blocked");
        assert!(matches!(err, RelayError::UpstreamProtocol(ref message) if message.contains("SAFETY")));
    }

    #[test]
    fn stream_function_calls_finish_as_tool_calls() {
        let mut mapper = GeminiChunkMapper::default();
        let chunks = mapper
            .map_chunk(r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"weather","args":{"city":"Paris"}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":2}}"#)
            .expect("chunk");
        assert_eq!(chunks.len(), 4);
        assert!(matches!(&chunks[0], StreamChunk::ToolCallStart { name, .. } if name == "weather"));
        assert!(matches!(
            &chunks[1],
            StreamChunk::ToolCallDelta { arguments_delta, .. } if arguments_delta == r#"{"city":"Paris"}"#
        ));
        assert_eq!(chunks[2], StreamChunk::FinishReason(FinishReason::ToolCalls));
        assert_eq!(chunks[3], StreamChunk::Usage(Usage::new(5, 2)));
    }

    #[test]
    fn embeddings_use_batch_requests() {
        let ctx = context_with(
            Channel::new(1, ChannelKind::Gemini, "k"),
            "text-embedding-004",
            false,
            RelayMode::Embeddings,
        );
        let request = EmbeddingRequest {
            model: "text-embedding-004".to_string(),
            input: vec!["a".to_string(), "b".to_string()],
            dimensions: Some(8),
            user: None,
        };
        let adaptor = GeminiAdaptor::default();
        let body = adaptor
            .convert_embedding_request(&ctx, &request)
            .expect("body");
        assert_eq!(body["requests"].as_array().map(Vec::len), Some(2));
        assert_eq!(body["requests"][0]["model"], "models/text-embedding-004");
        assert_eq!(body["requests"][1]["content"]["parts"][0]["text"], "b");
        assert_eq!(body["requests"][0]["outputDimensionality"], 8);

        let parsed = adaptor
            .parse_embedding_response(&ctx, br#"{"embeddings":[{"values":[0.1,0.2]},{"values":[0.3]}]}"#)
            .expect("parsed");
        assert_eq!(parsed.embeddings, vec![vec![0.1, 0.2], vec![0.3]]);
    }
}
