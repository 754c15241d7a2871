//! Upstream stream translation: a scanner task feeds raw lines through a bounded queue to a
//! consumer task that maps provider chunks to canonical deltas and re-encodes them for the caller.

mod accumulate;
mod encode;
mod scanner;

use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

pub use accumulate::StreamAccumulator;
pub use encode::{ClaudeStreamEncoder, OpenAiStreamEncoder, StreamEncoder, encoder_for};

use crate::types::{FinishReason, StreamChunk, Usage};
use crate::utils::sse::DEFAULT_MAX_LINE_BYTES;
use crate::{RelayError, Result};

pub type ClientBody = BoxStream<'static, std::result::Result<Bytes, Infallible>>;

const CLIENT_QUEUE_CAPACITY: usize = 16;

/// Caller-facing wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    OpenAi,
    Claude,
}

/// How an upstream body delimits its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Sse,
    JsonLines,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameLine<'a> {
    Skip,
    Done,
    Data(&'a str),
}

impl Framing {
    pub fn decode(self, line: &str) -> FrameLine<'_> {
        match self {
            Self::Sse => {
                let Some(data) = line.strip_prefix("data:") else {
                    return FrameLine::Skip;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    FrameLine::Done
                } else if data.is_empty() {
                    FrameLine::Skip
                } else {
                    FrameLine::Data(data)
                }
            }
            Self::JsonLines => {
                let data = line.trim();
                if data.is_empty() {
                    FrameLine::Skip
                } else {
                    FrameLine::Data(data)
                }
            }
        }
    }
}

/// Provider-specific mapping from one decoded upstream chunk to canonical deltas.
///
/// Returning `RelayError::Json` skips the chunk; any other error ends the stream.
pub trait ChunkMapper: Send {
    fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamChunk>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Done,
    TimedOut,
    ClientGone,
    Error(String),
    Panicked(String),
}

impl StreamEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::TimedOut => "timed_out",
            Self::ClientGone => "client_gone",
            Self::Error(_) => "error",
            Self::Panicked(_) => "panicked",
        }
    }
}

#[derive(Debug, Default)]
struct StopInner {
    reason: OnceLock<StreamEnd>,
    token: CancellationToken,
}

/// One-shot stop shared by every party of a stream; the first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `end` and wakes all waiters. Returns `true` only for the winning caller.
    pub fn stop(&self, end: StreamEnd) -> bool {
        let won = self.inner.reason.set(end).is_ok();
        self.inner.token.cancel();
        won
    }

    pub fn reason(&self) -> Option<StreamEnd> {
        self.inner.reason.get().cloned()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }
}

struct StopOnDrop(StopSignal);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if !self.0.is_stopped() {
            self.0
                .stop(StreamEnd::Panicked("stream consumer exited early".to_string()));
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslateOptions {
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
    pub max_line_bytes: usize,
    /// Model used for local token counting when the upstream reports no usage.
    pub model: String,
    pub prompt_tokens: u64,
}

impl TranslateOptions {
    /// Reasoning-heavy models get twice the idle budget.
    pub fn new(model: impl Into<String>, prompt_tokens: u64, idle_timeout: Duration) -> Self {
        let model = model.into();
        let idle_timeout = if crate::model::is_reasoning_model(&model) {
            idle_timeout.saturating_mul(2)
        } else {
            idle_timeout
        };
        Self {
            idle_timeout,
            queue_capacity: 64,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            model,
            prompt_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub end: StreamEnd,
    /// Final usage: upstream-reported when available, otherwise rebuilt from the accumulated text.
    pub usage: Usage,
    pub usage_reported: bool,
    pub finish_reason: FinishReason,
    pub chunks: u64,
    pub bytes_sent: u64,
    pub first_byte: Option<Duration>,
}

pub struct TranslatedStream {
    pub body: ClientBody,
    pub outcome: JoinHandle<StreamOutcome>,
    pub stop: StopSignal,
}

impl std::fmt::Debug for TranslatedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatedStream")
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Spawns the scanner and consumer tasks for one upstream body.
pub fn translate<S>(
    upstream: S,
    framing: Framing,
    mapper: Box<dyn ChunkMapper>,
    encoder: Box<dyn StreamEncoder>,
    options: TranslateOptions,
) -> TranslatedStream
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    let stop = StopSignal::new();
    let (line_tx, line_rx) = mpsc::channel::<Result<String>>(options.queue_capacity.max(1));
    let (client_tx, client_rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE_CAPACITY);

    let reader = StreamReader::new(Box::pin(upstream));
    let scanner = tokio::spawn(scanner::scan_lines(
        reader,
        line_tx,
        stop.clone(),
        options.max_line_bytes,
    ));

    let consumer = Consumer {
        framing,
        mapper,
        encoder,
        accumulator: StreamAccumulator::new(),
        client: client_tx,
        stop: stop.clone(),
        bytes_sent: 0,
    };
    let outcome = tokio::spawn(consumer.run(line_rx, scanner, options));

    let body = stream::unfold(client_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok(frame), rx))
    });

    TranslatedStream {
        body: Box::pin(body),
        outcome,
        stop,
    }
}

struct Consumer {
    framing: Framing,
    mapper: Box<dyn ChunkMapper>,
    encoder: Box<dyn StreamEncoder>,
    accumulator: StreamAccumulator,
    client: mpsc::Sender<Bytes>,
    stop: StopSignal,
    bytes_sent: u64,
}

enum Step {
    Continue,
    Finish,
    Fail(String),
    Panic(String),
}

impl Consumer {
    async fn run(
        mut self,
        mut lines: mpsc::Receiver<Result<String>>,
        scanner: JoinHandle<()>,
        options: TranslateOptions,
    ) -> StreamOutcome {
        let _guard = StopOnDrop(self.stop.clone());
        let started = Instant::now();
        let mut first_byte = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.client.closed() => {
                    self.stop.stop(StreamEnd::ClientGone);
                    break;
                }
                next = tokio::time::timeout(options.idle_timeout, lines.recv()) => next,
            };
            let line = match next {
                Err(_) => {
                    tracing::warn!(
                        idle_timeout_ms = options.idle_timeout.as_millis() as u64,
                        model = %options.model,
                        "upstream stream idle timeout"
                    );
                    self.stop.stop(StreamEnd::TimedOut);
                    break;
                }
                Ok(None) => {
                    self.finish(&options).await;
                    break;
                }
                Ok(Some(Err(err))) => {
                    self.fail(StreamEnd::Error(err.to_string())).await;
                    break;
                }
                Ok(Some(Ok(line))) => line,
            };
            if first_byte.is_none() {
                first_byte = Some(started.elapsed());
            }

            match self.step(&line).await {
                Step::Continue => {}
                Step::Finish => {
                    self.finish(&options).await;
                    break;
                }
                Step::Fail(message) => {
                    self.fail(StreamEnd::Error(message)).await;
                    break;
                }
                Step::Panic(message) => {
                    self.fail(StreamEnd::Panicked(message)).await;
                    break;
                }
            }
        }

        drop(lines);
        if let Err(err) = scanner.await {
            tracing::error!(error = %err, "stream scanner task failed");
        }

        let (usage, usage_reported) = resolve_usage(&self.accumulator, &options);
        let end = self.stop.reason().unwrap_or(StreamEnd::Done);
        StreamOutcome {
            end,
            usage,
            usage_reported,
            finish_reason: self.accumulator.finish_reason(),
            chunks: self.accumulator.chunk_count(),
            bytes_sent: self.bytes_sent,
            first_byte,
        }
    }

    async fn step(&mut self, line: &str) -> Step {
        let data = match self.framing.decode(line) {
            FrameLine::Skip => return Step::Continue,
            FrameLine::Done => return Step::Finish,
            FrameLine::Data(data) => data,
        };

        let mapper = &mut self.mapper;
        let encoder = &mut self.encoder;
        let accumulator = &mut self.accumulator;
        let mapped = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let chunks = mapper.map_chunk(data)?;
            let mut frames = Vec::new();
            for chunk in &chunks {
                accumulator.observe(chunk);
                frames.extend(encoder.encode(chunk));
            }
            Ok::<_, RelayError>(frames)
        }));

        let frames = match mapped {
            Err(payload) => return Step::Panic(panic_message(payload.as_ref())),
            Ok(Err(RelayError::Json(err))) => {
                tracing::warn!(error = %err, "skipping undecodable stream chunk");
                return Step::Continue;
            }
            Ok(Err(err)) => return Step::Fail(err.to_string()),
            Ok(Ok(frames)) => frames,
        };

        if self.deliver(frames).await {
            Step::Continue
        } else {
            Step::Fail("client delivery stopped".to_string())
        }
    }

    /// Writes frames to the client unless the stream was stopped meanwhile.
    async fn deliver(&mut self, frames: Vec<Bytes>) -> bool {
        for frame in frames {
            let len = frame.len() as u64;
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return false,
                sent = self.client.send(frame) => {
                    if sent.is_err() {
                        self.stop.stop(StreamEnd::ClientGone);
                        return false;
                    }
                }
            }
            self.bytes_sent += len;
        }
        true
    }

    async fn finish(&mut self, options: &TranslateOptions) {
        let (usage, _) = resolve_usage(&self.accumulator, options);
        let frames = self.encoder.finish(self.accumulator.finish_reason(), &usage);
        self.deliver(frames).await;
        self.stop.stop(StreamEnd::Done);
    }

    async fn fail(&mut self, end: StreamEnd) {
        match &end {
            StreamEnd::Panicked(message) => {
                tracing::error!(panic = %message, "stream chunk mapper panicked")
            }
            StreamEnd::Error(message) => tracing::warn!(error = %message, "upstream stream failed"),
            _ => {}
        }
        if !self.stop.is_stopped() {
            let frames = self
                .encoder
                .abort("upstream stream interrupted, please retry later");
            self.deliver(frames).await;
        }
        self.stop.stop(end);
    }
}

fn resolve_usage(accumulator: &StreamAccumulator, options: &TranslateOptions) -> (Usage, bool) {
    if let Some(usage) = accumulator.reported_usage() {
        return (usage, true);
    }
    let text = accumulator.completion_text();
    let completion_tokens = if text.is_empty() {
        0
    } else {
        crate::relay::token_count::count_text_tokens(&options.model, &text)
    };
    (Usage::new(options.prompt_tokens, completion_tokens), false)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TextMapper;

    impl ChunkMapper for TextMapper {
        fn map_chunk(&mut self, data: &str) -> Result<Vec<StreamChunk>> {
            let value: serde_json::Value = serde_json::from_str(data)?;
            if value["boom"].as_bool() == Some(true) {
                panic!("mapper exploded");
            }
            let mut out = Vec::new();
            if let Some(text) = value["text"].as_str() {
                out.push(StreamChunk::TextDelta {
                    text: text.to_string(),
                });
            }
            if let Some(reason) = value["finish"].as_str() {
                out.push(StreamChunk::FinishReason(
                    crate::protocol::openai::parse_finish_reason(Some(reason)),
                ));
            }
            Ok(out)
        }
    }

    struct DropCounter<S> {
        inner: S,
        drops: Arc<AtomicUsize>,
    }

    impl<S: Stream + Unpin> Stream for DropCounter<S> {
        type Item = S::Item;

        fn poll_next(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            std::pin::Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl<S> Drop for DropCounter<S> {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn upstream(
        frames: &[&str],
    ) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Unpin + 'static {
        let owned: Vec<std::io::Result<Bytes>> = frames
            .iter()
            .map(|frame| Ok(Bytes::from(frame.to_string())))
            .collect();
        stream::iter(owned)
    }

    async fn collect_body(body: ClientBody) -> String {
        let frames: Vec<_> = body.collect().await;
        frames
            .into_iter()
            .map(|frame| match frame {
                Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                Err(never) => match never {},
            })
            .collect()
    }

    fn options() -> TranslateOptions {
        TranslateOptions::new("gpt-4o-mini", 7, Duration::from_secs(5))
    }

    #[test]
    fn sse_framing_strips_prefix_and_detects_sentinel() {
        assert_eq!(Framing::Sse.decode("data: {\"a\":1}"), FrameLine::Data("{\"a\":1}"));
        assert_eq!(Framing::Sse.decode("data:[DONE]"), FrameLine::Done);
        assert_eq!(Framing::Sse.decode("event: ping"), FrameLine::Skip);
        assert_eq!(Framing::Sse.decode(": keep-alive"), FrameLine::Skip);
        assert_eq!(Framing::JsonLines.decode(" {\"a\":1} "), FrameLine::Data("{\"a\":1}"));
    }

    #[test]
    fn stop_signal_first_caller_wins() {
        let stop = StopSignal::new();
        assert!(stop.stop(StreamEnd::TimedOut));
        assert!(!stop.stop(StreamEnd::Done));
        assert_eq!(stop.reason(), Some(StreamEnd::TimedOut));
        assert!(stop.is_stopped());
    }

    #[test]
    fn reasoning_models_get_double_idle_budget() {
        let plain = TranslateOptions::new("gpt-4o", 0, Duration::from_secs(30));
        let reasoning = TranslateOptions::new("o3-mini", 0, Duration::from_secs(30));
        assert_eq!(plain.idle_timeout, Duration::from_secs(30));
        assert_eq!(reasoning.idle_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn translates_to_claude_events_and_rebuilds_usage() {
        let drops = Arc::new(AtomicUsize::new(0));
        let source = DropCounter {
            inner: upstream(&[
                "data: {\"text\":\"a\"}\n\n",
                "data: {\"text\":\"b\"}\n\n",
                "data: {\"finish\":\"stop\"}\n\ndata: [DONE]\n\n",
            ]),
            drops: drops.clone(),
        };
        let encoder = encoder_for(OutputFormat::Claude, "msg_1", "gpt-4o-mini", 7, false);
        let translated = translate(source, Framing::Sse, Box::new(TextMapper), encoder, options());

        let body = collect_body(translated.body).await;
        let outcome = translated.outcome.await.expect("consumer");

        let events: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(
            events,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(outcome.end, StreamEnd::Done);
        assert!(!outcome.usage_reported);
        assert_eq!(outcome.usage.prompt_tokens, 7);
        assert!(outcome.usage.completion_tokens >= 1);
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_upstream_times_out_without_further_bytes() {
        let head = upstream(&["data: {\"text\":\"a\"}\n\n"]);
        let stalled = head.chain(stream::pending());
        let encoder = encoder_for(OutputFormat::OpenAi, "chatcmpl-1", "gpt-4o-mini", 7, true);
        let translated = translate(
            stalled,
            Framing::Sse,
            Box::new(TextMapper),
            encoder,
            TranslateOptions::new("gpt-4o-mini", 7, Duration::from_secs(2)),
        );

        let body = collect_body(translated.body).await;
        let outcome = translated.outcome.await.expect("consumer");

        assert_eq!(outcome.end, StreamEnd::TimedOut);
        assert_eq!(outcome.bytes_sent as usize, body.len());
        assert!(body.contains("\"content\":\"a\""));
        assert!(!body.contains("[DONE]"));
        assert!(!body.contains("finish_reason\":\"stop"));
    }

    #[tokio::test]
    async fn mapper_panic_is_contained() {
        let encoder = encoder_for(OutputFormat::OpenAi, "chatcmpl-1", "gpt-4o-mini", 7, false);
        let translated = translate(
            upstream(&[
                "data: {\"text\":\"a\"}\n\n",
                "data: {\"boom\":true}\n\n",
                "data: {\"text\":\"never\"}\n\n",
            ]),
            Framing::Sse,
            Box::new(TextMapper),
            encoder,
            options(),
        );

        let body = collect_body(translated.body).await;
        let outcome = translated.outcome.await.expect("consumer");

        assert!(matches!(outcome.end, StreamEnd::Panicked(ref message) if message.contains("exploded")));
        assert!(!body.contains("never"));
        assert!(body.contains("upstream stream interrupted"));
    }

    #[tokio::test]
    async fn undecodable_chunks_are_skipped() {
        let encoder = encoder_for(OutputFormat::OpenAi, "chatcmpl-1", "gpt-4o-mini", 7, false);
        let translated = translate(
            upstream(&["data: {oops\n\n", "data: {\"text\":\"ok\"}\n\n", "data: [DONE]\n\n"]),
            Framing::Sse,
            Box::new(TextMapper),
            encoder,
            options(),
        );

        let body = collect_body(translated.body).await;
        let outcome = translated.outcome.await.expect("consumer");
        assert_eq!(outcome.end, StreamEnd::Done);
        assert!(body.contains("\"content\":\"ok\""));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn dropped_client_stops_the_stream() {
        let drops = Arc::new(AtomicUsize::new(0));
        let source = DropCounter {
            inner: Box::pin(upstream(&["data: {\"text\":\"a\"}\n\n"]).chain(stream::pending())),
            drops: drops.clone(),
        };
        let encoder = encoder_for(OutputFormat::OpenAi, "chatcmpl-1", "gpt-4o-mini", 7, false);
        let translated = translate(source, Framing::Sse, Box::new(TextMapper), encoder, options());

        let mut body = translated.body;
        let first = body.next().await;
        assert!(first.is_some());
        drop(body);

        let outcome = translated.outcome.await.expect("consumer");
        assert_eq!(outcome.end, StreamEnd::ClientGone);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
