//! Model-name classification shared by adaptors, streaming and pricing.

pub const THINKING_SUFFIX: &str = "-thinking";

/// Models that think before answering: slower first byte, pricier completions.
pub fn is_reasoning_model(model: &str) -> bool {
    let model = model.trim().to_ascii_lowercase();
    let model = model.rsplit('/').next().unwrap_or(model.as_str());
    is_openai_reasoning_family(model)
        || model.starts_with("gpt-5")
        || model.contains("reasoner")
        || model.contains("-r1")
        || model.starts_with("qwq")
        || model.ends_with(THINKING_SUFFIX)
        || model.contains("thinking")
}

/// `o1`, `o3-mini`, `o4-mini-2025-04-16` and friends; these reject `max_tokens` and `temperature`.
pub fn is_openai_reasoning_family(model: &str) -> bool {
    let model = model.trim().to_ascii_lowercase();
    ["o1", "o3", "o4"].iter().any(|prefix| {
        model
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('-'))
    })
}

/// Splits a trailing `-thinking` marker off a model name.
pub fn strip_thinking_suffix(model: &str) -> (&str, bool) {
    match model.strip_suffix(THINKING_SUFFIX) {
        Some(base) if !base.is_empty() => (base, true),
        _ => (model, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reasoning_models() {
        assert!(is_reasoning_model("o1"));
        assert!(is_reasoning_model("o3-mini"));
        assert!(is_reasoning_model("deepseek-reasoner"));
        assert!(is_reasoning_model("deepseek-ai/DeepSeek-R1"));
        assert!(is_reasoning_model("claude-3-7-sonnet-thinking"));
        assert!(!is_reasoning_model("gpt-4o-mini"));
        assert!(!is_reasoning_model("o1x"));
        assert!(!is_openai_reasoning_family("gpt-4o"));
    }

    #[test]
    fn strips_thinking_suffix() {
        assert_eq!(
            strip_thinking_suffix("claude-3-7-sonnet-thinking"),
            ("claude-3-7-sonnet", true)
        );
        assert_eq!(strip_thinking_suffix("claude-3-5-haiku"), ("claude-3-5-haiku", false));
        assert_eq!(strip_thinking_suffix("-thinking"), ("-thinking", false));
    }
}
