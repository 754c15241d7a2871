use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::channel::Channel;
use super::store::{Token, User};
use crate::stream::{OutputFormat, StreamOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Embeddings,
}

impl RelayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Embeddings => "embeddings",
        }
    }
}

/// The authenticated key and account behind a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub group: String,
    pub unlimited_quota: bool,
    /// Token balance when the key was looked up.
    pub remain_quota: i64,
    pub allowed_models: Vec<String>,
}

impl Caller {
    pub fn new(token: &Token, user: &User) -> Self {
        Self {
            token_id: token.id,
            token_name: token.name.clone(),
            user_id: user.id,
            group: user.group.clone(),
            unlimited_quota: token.unlimited_quota,
            remain_quota: token.remain_quota,
            allowed_models: token.models.clone(),
        }
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

/// Per-attempt facts fixed before the upstream call.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub mode: RelayMode,
    pub format: OutputFormat,
    pub caller: Caller,
    pub channel: Arc<Channel>,
    pub original_model: String,
    /// `original_model` after the channel's model mapping.
    pub upstream_model: String,
    pub is_stream: bool,
    pub prompt_tokens: u64,
    pub attempt: usize,
    pub started_at: Instant,
    pub stats: Arc<StreamStats>,
}

impl RelayContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: impl Into<String>,
        mode: RelayMode,
        format: OutputFormat,
        caller: Caller,
        channel: Arc<Channel>,
        original_model: impl Into<String>,
        is_stream: bool,
        prompt_tokens: u64,
    ) -> Self {
        let original_model = original_model.into();
        let upstream_model = channel.map_model(&original_model).to_string();
        Self {
            request_id: request_id.into(),
            mode,
            format,
            caller,
            channel,
            original_model,
            upstream_model,
            is_stream,
            prompt_tokens,
            attempt: 0,
            started_at: Instant::now(),
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Stream facts that arrive after the context is built.
#[derive(Debug, Default)]
pub struct StreamStats {
    first_byte_ms: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
}

impl StreamStats {
    pub fn record(&self, outcome: &StreamOutcome) {
        if let Some(first_byte) = outcome.first_byte {
            let ms = u64::try_from(first_byte.as_millis()).unwrap_or(u64::MAX).max(1);
            let _ = self
                .first_byte_ms
                .compare_exchange(0, ms, Ordering::Relaxed, Ordering::Relaxed);
        }
        self.chunks.fetch_add(outcome.chunks, Ordering::Relaxed);
        self.bytes.fetch_add(outcome.bytes_sent, Ordering::Relaxed);
    }

    pub fn first_byte(&self) -> Option<Duration> {
        match self.first_byte_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::channel::ChannelKind;
    use crate::stream::StreamEnd;
    use crate::types::{FinishReason, Usage};

    #[test]
    fn context_maps_the_upstream_model() {
        let mut channel = Channel::new(1, ChannelKind::OpenAi, "k");
        channel
            .model_mapping
            .insert("gpt-4".to_string(), "gpt-4-0613".to_string());
        let mut token = Token::new(5, "abc", 2);
        token.models = vec!["gpt-4".to_string()];
        let caller = Caller::new(&token, &User::new(2, 100));
        assert!(caller.allows_model("gpt-4"));
        assert!(!caller.allows_model("gpt-4o"));

        let ctx = RelayContext::new(
            "req-1",
            RelayMode::ChatCompletions,
            OutputFormat::OpenAi,
            caller,
            Arc::new(channel),
            "gpt-4",
            false,
            12,
        )
        .with_attempt(2);
        assert_eq!(ctx.upstream_model, "gpt-4-0613");
        assert_eq!(ctx.original_model, "gpt-4");
        assert_eq!(ctx.attempt, 2);
    }

    #[test]
    fn stream_stats_keep_the_first_byte() {
        let stats = StreamStats::default();
        assert_eq!(stats.first_byte(), None);
        let outcome = StreamOutcome {
            end: StreamEnd::Done,
            usage: Usage::default(),
            usage_reported: false,
            finish_reason: FinishReason::Stop,
            chunks: 3,
            bytes_sent: 120,
            first_byte: Some(Duration::from_millis(40)),
        };
        stats.record(&outcome);
        stats.record(&StreamOutcome {
            first_byte: Some(Duration::from_millis(90)),
            ..outcome
        });
        assert_eq!(stats.first_byte(), Some(Duration::from_millis(40)));
        assert_eq!(stats.chunks(), 6);
        assert_eq!(stats.bytes(), 240);
    }
}
