//! The relay itself: authenticate, reserve, pick a channel, dispatch with retries, settle.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tracing::Instrument;

use super::cache::TokenCache;
use super::channel::{Channel, ChannelStatus};
use super::config::RelayConfig;
use super::context::{Caller, RelayContext, RelayMode};
use super::health::should_auto_disable;
use super::notify::{LogNotifier, NotificationGate};
use super::observability::{Observability, ObservabilitySnapshot};
use super::pricing::PricingTable;
use super::quota::{QuotaLedger, Reservation};
use super::registry::ChannelRegistry;
use super::store::{MemoryStore, RelayStore, TokenStatus};
use super::token_count::{count_embedding_input, count_prompt_tokens, count_text_tokens};
use crate::adaptor::{adaptor_set, do_request, upstream_body};
use crate::protocol::{generate_id, unix_now};
use crate::stream::{
    ClientBody, OutputFormat, StreamEnd, StreamOutcome, TranslateOptions, TranslatedStream,
    encoder_for, panic_message, translate,
};
use crate::types::{
    EmbeddingRequest, EmbeddingResponse, FinishReason, GenerateRequest, GenerateResponse, Message,
    Usage,
};
use crate::utils::task::{AbortOnDrop, spawn_interval};
use crate::{RelayError, Result};

/// Reply to a chat call: a full response, or a caller-format byte stream already being fed.
pub enum ChatReply {
    Complete(GenerateResponse),
    Stream(ClientBody),
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

enum Upstream {
    Complete(GenerateResponse),
    Stream(TranslatedStream),
}

pub struct Relay {
    store: Arc<dyn RelayStore>,
    registry: Arc<ChannelRegistry>,
    ledger: Arc<QuotaLedger>,
    client: reqwest::Client,
    config: RelayConfig,
    observability: Arc<Mutex<Observability>>,
    tokens: Mutex<TokenCache>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn record(observability: &Mutex<Observability>, update: impl FnOnce(&mut Observability)) {
    let mut guard = observability
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    update(&mut guard);
}

impl Relay {
    pub fn new(
        store: Arc<dyn RelayStore>,
        registry: Arc<ChannelRegistry>,
        ledger: Arc<QuotaLedger>,
        config: RelayConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| RelayError::Config(format!("http client error: {err}")))?;
        Ok(Self {
            store,
            registry,
            ledger,
            client,
            config,
            observability: Arc::new(Mutex::new(Observability::default())),
            tokens: Mutex::new(TokenCache::default()),
        })
    }

    /// Opens the configured store, writes seed records, loads pricing and builds the index.
    pub async fn from_config(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config).await?;

        for user in &config.seed.users {
            store.upsert_user(user).await?;
        }
        for token in &config.seed.tokens {
            let mut token = token.clone();
            token.key = strip_key_prefix(&token.key).to_string();
            store.upsert_token(&token).await?;
        }
        for channel in &config.seed.channels {
            store.upsert_channel(channel).await?;
        }

        let pricing = match &config.pricing_file {
            Some(path) => PricingTable::from_json_file(path)?,
            None => PricingTable::default(),
        };
        let ledger = QuotaLedger::new(
            Arc::clone(&store),
            Arc::new(pricing),
            NotificationGate::new(Arc::new(LogNotifier)),
            config.quota.clone(),
        );
        let registry = ChannelRegistry::new(
            Arc::clone(&store),
            config.memory_cache_enabled,
            config.smoothing,
        );
        registry.rebuild().await?;

        tracing::info!(
            channels = config.seed.channels.len(),
            sqlite = config.sqlite_path.is_some(),
            "relay initialized"
        );
        Self::new(store, Arc::new(registry), Arc::new(ledger), config)
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.store
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .snapshot()
    }

    /// Resolves an API key to its caller. The `sk-` prefix is optional.
    pub async fn authenticate(&self, raw_key: &str) -> Result<Caller> {
        let key = strip_key_prefix(raw_key.trim());
        if key.is_empty() {
            return Err(RelayError::Unauthorized("missing api key".to_string()));
        }
        let now = unix_now();

        let cached = self
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key, now);
        let (token, user) = match cached {
            Some(found) => found,
            None => {
                let token = self
                    .store
                    .find_token(key)
                    .await?
                    .ok_or_else(|| RelayError::Unauthorized("invalid api key".to_string()))?;
                let user = self.store.get_user(token.user_id).await?.ok_or_else(|| {
                    RelayError::Unauthorized(format!("user {} not found", token.user_id))
                })?;
                self.tokens
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(
                        key.to_string(),
                        token.clone(),
                        user.clone(),
                        &self.config.token_cache,
                        now,
                    );
                (token, user)
            }
        };

        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Disabled => {
                return Err(RelayError::Unauthorized("api key is disabled".to_string()));
            }
            TokenStatus::Expired => {
                return Err(RelayError::Unauthorized("api key has expired".to_string()));
            }
            TokenStatus::Exhausted => {
                return Err(RelayError::Unauthorized("api key quota is used up".to_string()));
            }
        }
        if token
            .expires_at
            .is_some_and(|expires_at| expires_at <= now as i64)
        {
            return Err(RelayError::Unauthorized("api key has expired".to_string()));
        }
        if !user.enabled {
            return Err(RelayError::Unauthorized("user is disabled".to_string()));
        }
        Ok(Caller::new(&token, &user))
    }

    /// Models the caller may request.
    pub async fn models(&self, caller: &Caller) -> Result<Vec<String>> {
        let models = self.registry.models_for_group(&caller.group).await?;
        Ok(models
            .into_iter()
            .filter(|model| caller.allows_model(model))
            .collect())
    }

    pub async fn relay_chat(
        &self,
        caller: &Caller,
        format: OutputFormat,
        request: GenerateRequest,
    ) -> Result<ChatReply> {
        let request_id = generate_id("req-");
        let span = tracing::info_span!(
            "relay.request",
            request_id = %request_id,
            model = %request.model,
            stream = request.stream,
            channel_id = tracing::field::Empty,
        );
        record(&self.observability, |obs| obs.record_request(request.stream));
        let result = self
            .relay_chat_inner(request_id, caller, format, request)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            record(&self.observability, |obs| obs.record_error(err));
        }
        result
    }

    async fn relay_chat_inner(
        &self,
        request_id: String,
        caller: &Caller,
        format: OutputFormat,
        request: GenerateRequest,
    ) -> Result<ChatReply> {
        if !caller.allows_model(&request.model) {
            return Err(RelayError::Unauthorized(format!(
                "api key cannot use model {}",
                request.model
            )));
        }
        let prompt_tokens = count_prompt_tokens(&request);
        let estimate = prompt_tokens.saturating_add(u64::from(request.max_tokens.unwrap_or(0)));
        let reservation = self
            .ledger
            .pre_consume(caller, &request.model, estimate)
            .await?;

        let mut last_error = None;
        for attempt in 0..=self.config.retry_times {
            let channel = match self
                .registry
                .select(&caller.group, &request.model, attempt)
                .await
            {
                Ok(channel) => channel,
                Err(err) => {
                    self.refund(reservation).await;
                    return Err(last_error.unwrap_or(err));
                }
            };
            tracing::Span::current().record("channel_id", channel.id);
            let ctx = RelayContext::new(
                request_id.clone(),
                RelayMode::ChatCompletions,
                format,
                caller.clone(),
                channel,
                request.model.clone(),
                request.stream,
                prompt_tokens,
            )
            .with_attempt(attempt);

            match contain_panic(self.dispatch_chat(&ctx, &request)).await {
                Ok(Upstream::Complete(mut response)) => {
                    if response.model.is_empty() {
                        response.model = ctx.original_model.clone();
                    }
                    // All-zero usage from upstream is recounted locally, as on the stream path.
                    let usage = response
                        .usage
                        .filter(|usage| !usage.is_empty())
                        .unwrap_or_else(|| estimate_usage(&ctx, &response));
                    self.settle(reservation, &usage, &ctx).await;
                    tracing::info!(
                        channel_id = ctx.channel.id,
                        attempt,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        elapsed_ms = ctx.elapsed().as_millis() as u64,
                        "relay completed"
                    );
                    return Ok(ChatReply::Complete(response));
                }
                Ok(Upstream::Stream(translated)) => {
                    let body = self.spawn_stream_settlement(translated, reservation, ctx);
                    return Ok(ChatReply::Stream(body));
                }
                Err(err) => {
                    self.handle_failure(&ctx, &err).await;
                    if !err.is_retryable() || attempt == self.config.retry_times {
                        self.refund(reservation).await;
                        return Err(err);
                    }
                    tracing::warn!(
                        channel_id = ctx.channel.id,
                        attempt,
                        error = %err,
                        "upstream call failed, retrying"
                    );
                    last_error = Some(err);
                }
            }
        }

        self.refund(reservation).await;
        Err(last_error.unwrap_or_else(|| RelayError::ChannelNotFound {
            group: caller.group.clone(),
            model: request.model.clone(),
        }))
    }

    async fn dispatch_chat(&self, ctx: &RelayContext, request: &GenerateRequest) -> Result<Upstream> {
        let mut adaptor = adaptor_set(ctx.channel.kind)?.chat;
        adaptor.init(ctx)?;
        let body = adaptor.convert_chat_request(ctx, request)?;

        record(&self.observability, |obs| obs.record_upstream_call(ctx.attempt));
        let response = do_request(&self.client, adaptor.as_ref(), ctx, &body).await?;

        if !ctx.is_stream {
            let bytes = response.bytes().await?;
            return Ok(Upstream::Complete(adaptor.parse_chat_response(ctx, &bytes)?));
        }

        let response_id = match ctx.format {
            OutputFormat::OpenAi => generate_id("chatcmpl-"),
            OutputFormat::Claude => generate_id("msg_"),
        };
        let encoder = encoder_for(
            ctx.format,
            &response_id,
            &ctx.original_model,
            ctx.prompt_tokens,
            request.include_usage,
        );
        let options = TranslateOptions::new(
            ctx.upstream_model.clone(),
            ctx.prompt_tokens,
            self.config.stream_idle_timeout(),
        );
        Ok(Upstream::Stream(translate(
            upstream_body(response),
            adaptor.framing(),
            adaptor.chunk_mapper(ctx),
            encoder,
            options,
        )))
    }

    /// Settles the reservation once the stream ends, however it ends.
    fn spawn_stream_settlement(
        &self,
        translated: TranslatedStream,
        reservation: Reservation,
        ctx: RelayContext,
    ) -> ClientBody {
        let TranslatedStream { body, outcome, .. } = translated;
        let ledger = Arc::clone(&self.ledger);
        let observability = Arc::clone(&self.observability);
        let span = tracing::Span::current();
        tokio::spawn(
            async move {
                let outcome = match outcome.await {
                    Ok(outcome) => outcome,
                    Err(err) => StreamOutcome {
                        end: StreamEnd::Panicked(err.to_string()),
                        usage: Usage::new(ctx.prompt_tokens, 0),
                        usage_reported: false,
                        finish_reason: FinishReason::Error,
                        chunks: 0,
                        bytes_sent: 0,
                        first_byte: None,
                    },
                };
                ctx.stats.record(&outcome);
                let quota = match ledger
                    .settle(reservation, &outcome.usage, &ctx, ctx.elapsed())
                    .await
                {
                    Ok(settlement) => settlement.quota,
                    Err(err) => {
                        tracing::error!(error = %err, "stream settlement failed");
                        0
                    }
                };
                record(&observability, |obs| {
                    obs.record_stream_end(&outcome.end);
                    obs.record_quota(quota);
                });
                tracing::info!(
                    channel_id = ctx.channel.id,
                    end = outcome.end.as_str(),
                    prompt_tokens = outcome.usage.prompt_tokens,
                    completion_tokens = outcome.usage.completion_tokens,
                    usage_reported = outcome.usage_reported,
                    chunks = ctx.stats.chunks(),
                    first_byte_ms = ctx.stats.first_byte().map(|d| d.as_millis() as u64),
                    quota,
                    "stream finished"
                );
            }
            .instrument(span),
        );
        body
    }

    async fn settle(&self, reservation: Reservation, usage: &Usage, ctx: &RelayContext) {
        match self
            .ledger
            .settle(reservation, usage, ctx, ctx.elapsed())
            .await
        {
            Ok(settlement) => {
                record(&self.observability, |obs| obs.record_quota(settlement.quota))
            }
            Err(err) => tracing::error!(error = %err, "quota settlement failed"),
        }
    }

    async fn refund(&self, reservation: Reservation) {
        if let Err(err) = self.ledger.refund(reservation).await {
            tracing::error!(error = %err, "quota refund failed");
        }
    }

    async fn handle_failure(&self, ctx: &RelayContext, err: &RelayError) {
        tracing::warn!(
            channel_id = ctx.channel.id,
            kind = %ctx.channel.kind,
            attempt = ctx.attempt,
            error = %err,
            "upstream call failed"
        );
        if !should_auto_disable(&self.config.health, &ctx.channel, err) {
            return;
        }
        match self
            .registry
            .update_status(ctx.channel.id, ChannelStatus::AutoDisabled)
            .await
        {
            Ok(_) => {
                record(&self.observability, |obs| obs.record_auto_disabled());
                tracing::warn!(channel_id = ctx.channel.id, "channel auto-disabled");
            }
            Err(update_err) => {
                tracing::error!(channel_id = ctx.channel.id, error = %update_err, "failed to disable channel");
            }
        }
    }

    pub async fn relay_embeddings(
        &self,
        caller: &Caller,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        let request_id = generate_id("req-");
        let span = tracing::info_span!(
            "relay.request",
            request_id = %request_id,
            model = %request.model,
            stream = false,
            channel_id = tracing::field::Empty,
        );
        record(&self.observability, |obs| obs.record_request(false));
        let result = self
            .relay_embeddings_inner(request_id, caller, request)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            record(&self.observability, |obs| obs.record_error(err));
        }
        result
    }

    async fn relay_embeddings_inner(
        &self,
        request_id: String,
        caller: &Caller,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        if !caller.allows_model(&request.model) {
            return Err(RelayError::Unauthorized(format!(
                "api key cannot use model {}",
                request.model
            )));
        }
        let prompt_tokens = count_embedding_input(&request.model, &request.input);
        let reservation = self
            .ledger
            .pre_consume(caller, &request.model, prompt_tokens)
            .await?;

        let mut last_error = None;
        for attempt in 0..=self.config.retry_times {
            let channel = match self
                .registry
                .select(&caller.group, &request.model, attempt)
                .await
            {
                Ok(channel) => channel,
                Err(err) => {
                    self.refund(reservation).await;
                    return Err(last_error.unwrap_or(err));
                }
            };
            tracing::Span::current().record("channel_id", channel.id);
            let ctx = RelayContext::new(
                request_id.clone(),
                RelayMode::Embeddings,
                OutputFormat::OpenAi,
                caller.clone(),
                channel,
                request.model.clone(),
                false,
                prompt_tokens,
            )
            .with_attempt(attempt);

            match contain_panic(self.dispatch_embeddings(&ctx, &request)).await {
                Ok(mut response) => {
                    if response.model.is_empty() {
                        response.model = ctx.original_model.clone();
                    }
                    let usage = response
                        .usage
                        .filter(|usage| !usage.is_empty())
                        .unwrap_or_else(|| Usage::new(prompt_tokens, 0));
                    self.settle(reservation, &usage, &ctx).await;
                    return Ok(response);
                }
                Err(err) => {
                    self.handle_failure(&ctx, &err).await;
                    if !err.is_retryable() || attempt == self.config.retry_times {
                        self.refund(reservation).await;
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        self.refund(reservation).await;
        Err(last_error.unwrap_or_else(|| RelayError::ChannelNotFound {
            group: caller.group.clone(),
            model: request.model.clone(),
        }))
    }

    async fn dispatch_embeddings(
        &self,
        ctx: &RelayContext,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        let Some(mut adaptor) = adaptor_set(ctx.channel.kind)?.embedding else {
            return Err(RelayError::Config(format!(
                "channel {} ({}) does not serve embeddings",
                ctx.channel.id, ctx.channel.kind
            )));
        };
        adaptor.init(ctx)?;
        let body = adaptor.convert_embedding_request(ctx, request)?;
        record(&self.observability, |obs| obs.record_upstream_call(ctx.attempt));
        let response = do_request(&self.client, adaptor.as_ref(), ctx, &body).await?;
        let bytes = response.bytes().await?;
        adaptor.parse_embedding_response(ctx, &bytes)
    }

    /// Sends a one-token request through every auto-disabled channel and re-enables the ones
    /// that answer. Returns how many were re-enabled.
    pub async fn probe_channels(&self) -> Result<usize> {
        let mut enabled = 0;
        for channel in self.registry.auto_disabled_channels().await? {
            if !channel.auto_ban {
                continue;
            }
            let Some(model) = channel.models.first().cloned() else {
                continue;
            };
            match self.probe_channel(Arc::clone(&channel), &model).await {
                Ok(elapsed) => {
                    tracing::info!(
                        channel_id = channel.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "channel probe succeeded"
                    );
                    if !self.config.health.auto_enable_channel {
                        continue;
                    }
                    self.registry
                        .update_status(channel.id, ChannelStatus::Enabled)
                        .await?;
                    record(&self.observability, |obs| obs.record_auto_enabled());
                    enabled += 1;
                }
                Err(err) => {
                    tracing::debug!(channel_id = channel.id, error = %err, "channel probe failed");
                }
            }
        }
        Ok(enabled)
    }

    async fn probe_channel(&self, channel: Arc<Channel>, model: &str) -> Result<Duration> {
        let group = channel
            .groups
            .first()
            .cloned()
            .unwrap_or_else(|| super::channel::DEFAULT_GROUP.to_string());
        let caller = Caller {
            token_id: 0,
            token_name: "channel-probe".to_string(),
            user_id: 0,
            group,
            unlimited_quota: true,
            remain_quota: 0,
            allowed_models: Vec::new(),
        };
        let mut request = GenerateRequest::new(model, vec![Message::user("hi")]);
        request.max_tokens = Some(1);
        let ctx = RelayContext::new(
            generate_id("probe-"),
            RelayMode::ChatCompletions,
            OutputFormat::OpenAi,
            caller,
            channel,
            model,
            false,
            count_prompt_tokens(&request),
        );
        match contain_panic(self.dispatch_chat(&ctx, &request)).await? {
            Upstream::Complete(_) => Ok(ctx.elapsed()),
            Upstream::Stream(translated) => {
                translated.stop.stop(StreamEnd::ClientGone);
                Ok(ctx.elapsed())
            }
        }
    }

    /// Periodic [`Relay::probe_channels`]; stops when the returned guard drops.
    pub fn spawn_probe_task(self: &Arc<Self>, interval: Duration) -> AbortOnDrop {
        let relay = Arc::clone(self);
        spawn_interval(interval, move || {
            let relay = relay.clone();
            async move {
                match relay.probe_channels().await {
                    Ok(0) => {}
                    Ok(enabled) => tracing::info!(enabled, "channels re-enabled by probe"),
                    Err(err) => tracing::warn!(error = %err, "channel probe round failed"),
                }
            }
        })
    }
}

async fn open_store(config: &RelayConfig) -> Result<Arc<dyn RelayStore>> {
    match &config.sqlite_path {
        #[cfg(feature = "relay-store-sqlite")]
        Some(path) => {
            let store = super::sqlite_store::SqliteStore::new(path.clone());
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "relay-store-sqlite"))]
        Some(_) => Err(RelayError::Config(
            "llm-relay built without sqlite support".to_string(),
        )),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

fn strip_key_prefix(key: &str) -> &str {
    key.strip_prefix("sk-").unwrap_or(key)
}

/// Usage rebuilt locally when a non-streaming upstream omits it.
/// Turns a panic inside an adaptor into `InternalPanic` so the reservation is still refunded.
async fn contain_panic<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(RelayError::InternalPanic(panic_message(payload.as_ref())))
        })
}

fn estimate_usage(ctx: &RelayContext, response: &GenerateResponse) -> Usage {
    let mut text = response.text();
    if let Some(reasoning) = response.reasoning() {
        text.push_str(&reasoning);
    }
    Usage::new(
        ctx.prompt_tokens,
        count_text_tokens(&ctx.upstream_model, &text),
    )
}

#[cfg(test)]
mod tests;
