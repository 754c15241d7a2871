use serde::{Deserialize, Serialize};

use crate::RelayError;
use crate::stream::StreamEnd;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub stream_requests: u64,
    pub upstream_calls: u64,
    pub retries: u64,
    pub upstream_errors: u64,
    pub channel_not_found: u64,
    pub insufficient_quota: u64,
    pub channels_auto_disabled: u64,
    pub channels_auto_enabled: u64,
    pub streams_completed: u64,
    pub streams_timed_out: u64,
    pub streams_client_gone: u64,
    pub streams_failed: u64,
    pub quota_consumed: i64,
}

#[derive(Debug, Default)]
pub struct Observability {
    snapshot: ObservabilitySnapshot,
}

impl Observability {
    pub fn record_request(&mut self, stream: bool) {
        self.snapshot.requests = self.snapshot.requests.saturating_add(1);
        if stream {
            self.snapshot.stream_requests = self.snapshot.stream_requests.saturating_add(1);
        }
    }

    pub fn record_upstream_call(&mut self, attempt: usize) {
        self.snapshot.upstream_calls = self.snapshot.upstream_calls.saturating_add(1);
        if attempt > 0 {
            self.snapshot.retries = self.snapshot.retries.saturating_add(1);
        }
    }

    pub fn record_error(&mut self, err: &RelayError) {
        let counter = match err {
            RelayError::ChannelNotFound { .. } => &mut self.snapshot.channel_not_found,
            RelayError::InsufficientQuota { .. } => &mut self.snapshot.insufficient_quota,
            RelayError::UpstreamStatus { .. }
            | RelayError::UpstreamTransport(_)
            | RelayError::UpstreamProtocol(_) => &mut self.snapshot.upstream_errors,
            _ => return,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_auto_disabled(&mut self) {
        self.snapshot.channels_auto_disabled = self.snapshot.channels_auto_disabled.saturating_add(1);
    }

    pub fn record_auto_enabled(&mut self) {
        self.snapshot.channels_auto_enabled = self.snapshot.channels_auto_enabled.saturating_add(1);
    }

    pub fn record_stream_end(&mut self, end: &StreamEnd) {
        let counter = match end {
            StreamEnd::Done => &mut self.snapshot.streams_completed,
            StreamEnd::TimedOut => &mut self.snapshot.streams_timed_out,
            StreamEnd::ClientGone => &mut self.snapshot.streams_client_gone,
            StreamEnd::Error(_) | StreamEnd::Panicked(_) => &mut self.snapshot.streams_failed,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_quota(&mut self, quota: i64) {
        self.snapshot.quota_consumed = self.snapshot.quota_consumed.saturating_add(quota);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        self.snapshot.clone()
    }
}
