use futures_util::StreamExt;
use httpmock::prelude::*;

use super::*;
use crate::relay::channel::ChannelKind;
use crate::relay::quota::QuotaConfig;
use crate::relay::store::{Token, User};

const USER_QUOTA: i64 = 10_000_000;

fn openai_channel(id: i64, base_url: String, priority: i64) -> Channel {
    let mut channel = Channel::new(id, ChannelKind::OpenAi, format!("upstream-{id}"));
    channel.base_url = Some(base_url);
    channel.models = vec!["gpt-4o-mini".to_string()];
    channel.priority = priority;
    channel
}

async fn relay_with(channels: Vec<Channel>) -> Relay {
    let mut config = RelayConfig::default();
    config.quota = QuotaConfig {
        trust_multiplier: None,
        ..QuotaConfig::default()
    };
    config.retry_times = 1;
    config.seed.users = vec![User::new(1, USER_QUOTA)];
    let mut token = Token::new(10, "sk-caller", 1);
    token.remain_quota = USER_QUOTA;
    config.seed.tokens = vec![token];
    config.seed.channels = channels;
    Relay::from_config(config).await.expect("relay")
}

async fn user_quota(relay: &Relay) -> i64 {
    relay
        .store()
        .get_user(1)
        .await
        .expect("store")
        .expect("user")
        .quota
}

fn expected_quota(relay: &Relay, usage: &Usage) -> i64 {
    let pricing = relay.ledger.pricing();
    pricing.quota_for_usage(
        "gpt-4o-mini",
        pricing.billing("gpt-4o-mini", "default"),
        usage,
    )
}

async fn wait_for_consume_logs(relay: &Relay) -> Vec<crate::relay::store::ConsumeLog> {
    for _ in 0..200 {
        let logs = relay
            .store()
            .list_consume_logs(Some(1), 10)
            .await
            .expect("logs");
        if !logs.is_empty() {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request was never settled");
}

fn chat_request(stream: bool) -> GenerateRequest {
    let mut request = GenerateRequest::new("gpt-4o-mini", vec![Message::user("hello there")]);
    request.stream = stream;
    request
}

#[tokio::test]
async fn authenticate_accepts_prefixed_and_bare_keys() {
    let relay = relay_with(Vec::new()).await;
    let caller = relay.authenticate("sk-caller").await.expect("prefixed");
    assert_eq!(caller.token_id, 10);
    assert_eq!(caller.group, "default");
    relay.authenticate("caller").await.expect("bare");

    let err = relay.authenticate("sk-nope").await.expect_err("unknown key");
    assert!(matches!(err, RelayError::Unauthorized(_)));
}

#[tokio::test]
async fn authenticate_rejects_expired_tokens() {
    let relay = relay_with(Vec::new()).await;
    let mut token = Token::new(11, "old", 1);
    token.expires_at = Some(1);
    relay.store().upsert_token(&token).await.expect("token");

    let err = relay.authenticate("sk-old").await.expect_err("expired");
    assert!(matches!(err, RelayError::Unauthorized(ref message) if message.contains("expired")));
}

#[tokio::test]
async fn non_stream_success_charges_exactly_the_usage_cost() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer upstream-1");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"chatcmpl-1","model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#);
        })
        .await;

    let relay = relay_with(vec![openai_channel(1, server.base_url(), 0)]).await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let reply = relay
        .relay_chat(&caller, OutputFormat::OpenAi, chat_request(false))
        .await
        .expect("reply");
    let ChatReply::Complete(response) = reply else {
        panic!("expected a complete response");
    };
    assert_eq!(response.text(), "hi");
    mock.assert_async().await;

    // 15 tokens at the default model ratio of 30.
    assert_eq!(user_quota(&relay).await, USER_QUOTA - 450);
    let logs = relay
        .store()
        .list_consume_logs(Some(1), 10)
        .await
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].quota, 450);
    assert_eq!(logs[0].channel_id, 1);
}

#[tokio::test]
async fn zero_usage_replies_are_counted_locally() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"chatcmpl-z","model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"a complete answer with several words"},"finish_reason":"stop"}],"usage":{"prompt_tokens":0,"completion_tokens":0,"total_tokens":0}}"#);
        })
        .await;

    let relay = relay_with(vec![openai_channel(1, server.base_url(), 0)]).await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let request = chat_request(false);
    let usage = Usage::new(
        count_prompt_tokens(&request),
        count_text_tokens("gpt-4o-mini", "a complete answer with several words"),
    );
    relay
        .relay_chat(&caller, OutputFormat::OpenAi, request)
        .await
        .expect("reply");

    let charged = expected_quota(&relay, &usage);
    assert!(charged > 0);
    let logs = wait_for_consume_logs(&relay).await;
    assert_eq!(logs[0].quota, charged);
    assert_eq!(logs[0].completion_tokens, usage.completion_tokens);
    assert_eq!(user_quota(&relay).await, USER_QUOTA - charged);
}

#[tokio::test]
async fn failed_request_refunds_the_reservation() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(400)
                .header("content-type", "application/json")
                .body(r#"{"error":{"message":"bad input","type":"invalid_request_error"}}"#);
        })
        .await;

    let relay = relay_with(vec![openai_channel(1, server.base_url(), 0)]).await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let err = relay
        .relay_chat(&caller, OutputFormat::OpenAi, chat_request(false))
        .await
        .expect_err("upstream 400");
    assert!(matches!(err, RelayError::UpstreamStatus { status: 400, .. }));
    mock.assert_calls(1);
    assert_eq!(user_quota(&relay).await, USER_QUOTA);
}

#[tokio::test]
async fn retries_fall_to_the_next_priority_and_disable_bad_keys() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let primary = MockServer::start_async().await;
    let primary_mock = primary
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401)
                .header("content-type", "application/json")
                .body(r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#);
        })
        .await;
    let secondary = MockServer::start_async().await;
    let secondary_mock = secondary
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"chatcmpl-2","model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"from backup"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#);
        })
        .await;

    let relay = relay_with(vec![
        openai_channel(1, primary.base_url(), 10),
        openai_channel(2, secondary.base_url(), 0),
    ])
    .await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let reply = relay
        .relay_chat(&caller, OutputFormat::OpenAi, chat_request(false))
        .await
        .expect("retry succeeds");
    assert!(matches!(reply, ChatReply::Complete(ref response) if response.text() == "from backup"));

    primary_mock.assert_calls(1);
    secondary_mock.assert_calls(1);
    assert_eq!(
        relay.registry().channel_status(1),
        Some(ChannelStatus::AutoDisabled)
    );
    let stats = relay.observability();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.channels_auto_disabled, 1);
    assert_eq!(user_quota(&relay).await, USER_QUOTA - 150);
}

#[tokio::test]
async fn missing_channel_is_reported_without_charging() {
    let relay = relay_with(Vec::new()).await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let err = relay
        .relay_chat(&caller, OutputFormat::OpenAi, chat_request(false))
        .await
        .expect_err("no channel");
    assert!(matches!(err, RelayError::ChannelNotFound { .. }));
    assert_eq!(user_quota(&relay).await, USER_QUOTA);
}

#[tokio::test]
async fn restricted_tokens_cannot_use_other_models() {
    let relay = relay_with(Vec::new()).await;
    let mut caller = relay.authenticate("sk-caller").await.expect("caller");
    caller.allowed_models = vec!["gpt-4o".to_string()];
    let err = relay
        .relay_chat(&caller, OutputFormat::OpenAi, chat_request(false))
        .await
        .expect_err("model not allowed");
    assert!(matches!(err, RelayError::Unauthorized(_)));
}

#[tokio::test]
async fn stream_settles_after_the_body_finishes() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_includes("\"stream\":true");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                    "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":20,\"completion_tokens\":10,\"total_tokens\":30}}\n\n",
                    "data: [DONE]\n\n",
                ));
        })
        .await;

    let relay = relay_with(vec![openai_channel(1, server.base_url(), 0)]).await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let reply = relay
        .relay_chat(&caller, OutputFormat::OpenAi, chat_request(true))
        .await
        .expect("reply");
    let ChatReply::Stream(mut body) = reply else {
        panic!("expected a stream");
    };
    let mut raw = Vec::new();
    while let Some(Ok(bytes)) = body.next().await {
        raw.extend_from_slice(&bytes);
    }
    let raw = String::from_utf8(raw).expect("utf8");
    assert!(raw.contains("\"Hel\""));
    assert!(raw.trim_end().ends_with("data: [DONE]"));

    let mut logs = Vec::new();
    for _ in 0..100 {
        logs = relay
            .store()
            .list_consume_logs(Some(1), 10)
            .await
            .expect("logs");
        if !logs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_stream);
    assert_eq!(logs[0].quota, 900);
    assert_eq!(user_quota(&relay).await, USER_QUOTA - 900);
    assert_eq!(relay.observability().streams_completed, 1);
}

#[tokio::test]
async fn interrupted_stream_settles_the_partial_usage() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"id\":\"c2\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n",
                    "data: {\"id\":\"c2\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"}}]}\n\n",
                    "data: {\"error\":{\"message\":\"upstream overloaded\"}}\n\n",
                ));
        })
        .await;

    let relay = relay_with(vec![openai_channel(1, server.base_url(), 0)]).await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let request = chat_request(true);
    let usage = Usage::new(
        count_prompt_tokens(&request),
        count_text_tokens("gpt-4o-mini", "Hello world"),
    );
    let reply = relay
        .relay_chat(&caller, OutputFormat::OpenAi, request)
        .await
        .expect("reply");
    let ChatReply::Stream(mut body) = reply else {
        panic!("expected a stream");
    };
    let mut raw = Vec::new();
    while let Some(Ok(bytes)) = body.next().await {
        raw.extend_from_slice(&bytes);
    }
    let raw = String::from_utf8(raw).expect("utf8");
    assert!(raw.contains("\"Hello\""));

    let logs = wait_for_consume_logs(&relay).await;
    let charged = expected_quota(&relay, &usage);
    assert!(charged > 0);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].quota, charged);
    assert_eq!(logs[0].prompt_tokens, usage.prompt_tokens);
    assert_eq!(logs[0].completion_tokens, usage.completion_tokens);
    // The reservation is fully reconciled: only the partial cost leaves the balance.
    assert_eq!(user_quota(&relay).await, USER_QUOTA - charged);
    let token = relay
        .store()
        .find_token("caller")
        .await
        .expect("store")
        .expect("token");
    assert_eq!(token.remain_quota, USER_QUOTA - charged);
    assert_eq!(relay.observability().streams_failed, 1);
}

#[tokio::test]
async fn adaptor_panics_become_internal_errors() {
    let err = contain_panic(async {
        if true {
            panic!("adaptor bug");
        }
        Ok(())
    })
    .await
    .expect_err("panic");
    assert!(matches!(err, RelayError::InternalPanic(ref message) if message == "adaptor bug"));
    assert!(!err.is_retryable());
    assert_eq!(err.public_message(), "internal server error");
}

#[tokio::test]
async fn embeddings_use_the_embedding_capability() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"object":"list","model":"text-embedding-3-small","data":[{"object":"embedding","index":0,"embedding":[0.5,0.25]}],"usage":{"prompt_tokens":4,"total_tokens":4}}"#);
        })
        .await;

    let mut channel = openai_channel(1, server.base_url(), 0);
    channel.models = vec!["text-embedding-3-small".to_string()];
    let relay = relay_with(vec![channel]).await;
    let caller = relay.authenticate("sk-caller").await.expect("caller");
    let response = relay
        .relay_embeddings(
            &caller,
            EmbeddingRequest {
                model: "text-embedding-3-small".to_string(),
                input: vec!["hello".to_string()],
                dimensions: None,
                user: None,
            },
        )
        .await
        .expect("embeddings");
    assert_eq!(response.embeddings, vec![vec![0.5, 0.25]]);
    assert_eq!(user_quota(&relay).await, USER_QUOTA - 120);
}

#[tokio::test]
async fn probe_re_enables_recovered_channels() {
    if crate::utils::test_support::should_skip_httpmock() {
        return;
    }
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_includes("\"max_tokens\":1");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"id":"chatcmpl-p","model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"h"},"finish_reason":"length"}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#);
        })
        .await;

    let mut config = RelayConfig::default();
    config.health.auto_enable_channel = true;
    let mut channel = openai_channel(1, server.base_url(), 0);
    channel.status = ChannelStatus::AutoDisabled;
    config.seed.channels = vec![channel];
    let relay = Relay::from_config(config).await.expect("relay");

    assert_eq!(relay.probe_channels().await.expect("probe"), 1);
    mock.assert_calls(1);
    assert_eq!(relay.registry().channel_status(1), Some(ChannelStatus::Enabled));
    let probe_group = Caller {
        token_id: 0,
        token_name: String::new(),
        user_id: 0,
        group: "default".to_string(),
        unlimited_quota: true,
        remain_quota: 0,
        allowed_models: Vec::new(),
    };
    assert_eq!(
        relay.models(&probe_group).await.expect("models"),
        vec!["gpt-4o-mini".to_string()]
    );
}
