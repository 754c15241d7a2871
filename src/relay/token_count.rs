//! Local token estimates for reservations and for streams that never report usage.

use crate::types::{ContentPart, GenerateRequest};

/// Flat charge per image part; matches a low-detail image tile.
const IMAGE_TOKENS: u64 = 85;

#[cfg(feature = "relay-tokenizer")]
mod bpe {
    use tiktoken_rs::{CoreBPE, tokenizer};

    pub(super) fn for_model(model: &str) -> &'static CoreBPE {
        let tokenizer =
            tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
        match tokenizer {
            tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
            tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
            tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
            tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
                tiktoken_rs::r50k_base_singleton()
            }
            tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
            tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        }
    }
}

#[cfg(feature = "relay-tokenizer")]
pub fn count_text_tokens(model: &str, text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    bpe::for_model(model).encode_with_special_tokens(text).len() as u64
}

/// Without a tokenizer, roughly four bytes per token.
#[cfg(not(feature = "relay-tokenizer"))]
pub fn count_text_tokens(_model: &str, text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Prompt size of a chat request, including per-message framing overhead.
pub fn count_prompt_tokens(request: &GenerateRequest) -> u64 {
    let model = request.model.as_str();
    let tokens_per_message: u64 = if model.starts_with("gpt-3.5") { 4 } else { 3 };

    let mut total: u64 = 0;
    for message in &request.messages {
        total += tokens_per_message;
        total += count_text_tokens(model, message.role.as_str());
        for part in &message.content {
            total += match part {
                ContentPart::Text { text } | ContentPart::Reasoning { text } => {
                    count_text_tokens(model, text)
                }
                ContentPart::Image { .. } => IMAGE_TOKENS,
                ContentPart::ToolCall {
                    name, arguments, ..
                } => {
                    count_text_tokens(model, name)
                        + count_text_tokens(
                            model,
                            &crate::protocol::tool_arguments_to_string(arguments),
                        )
                }
                ContentPart::ToolResult { content, .. } => count_text_tokens(model, content),
            };
        }
    }
    total += 3;

    for tool in &request.tools {
        total += count_text_tokens(model, &tool.name);
        if let Some(description) = &tool.description {
            total += count_text_tokens(model, description);
        }
        let schema = serde_json::Value::Object(tool.parameters.as_map().clone());
        total += count_text_tokens(model, &schema.to_string());
    }
    for stop in &request.stop_sequences {
        total += count_text_tokens(model, stop);
    }
    total
}

pub fn count_embedding_input(model: &str, input: &[String]) -> u64 {
    input
        .iter()
        .map(|text| count_text_tokens(model, text))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn prompt_tokens_grow_with_messages() {
        let short = GenerateRequest::new("gpt-4o-mini", vec![Message::user("hi")]);
        let long = GenerateRequest::new(
            "gpt-4o-mini",
            vec![
                Message::system("you are a careful assistant"),
                Message::user("hi there, tell me a story about a lighthouse"),
            ],
        );
        let short_tokens = count_prompt_tokens(&short);
        assert!(short_tokens > 3);
        assert!(count_prompt_tokens(&long) > short_tokens);
    }

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(count_text_tokens("gpt-4o", ""), 0);
        assert!(count_text_tokens("unknown-model", "hello world") >= 1);
        assert_eq!(
            count_embedding_input("text-embedding-3-small", &[String::new(), String::new()]),
            0
        );
    }
}
