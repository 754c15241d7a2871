//! Decides when an upstream failure means the channel itself is unusable.

use serde::{Deserialize, Serialize};

use super::channel::Channel;
use crate::RelayError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub auto_disable_channel: bool,
    pub auto_enable_channel: bool,
    /// Seconds between probes of auto-disabled channels. `0` disables probing.
    pub probe_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            auto_disable_channel: true,
            auto_enable_channel: false,
            probe_interval_secs: 0,
        }
    }
}

const DISABLING_TYPES: &[&str] = &[
    "invalid_api_key",
    "authentication_error",
    "permission_error",
    "insufficient_quota",
    "forbidden",
    "access_terminated",
    "billing_not_active",
];

const DISABLING_CODES: &[&str] = &[
    "invalid_api_key",
    "account_deactivated",
    "insufficient_quota",
    "billing_not_active",
    "api_key_invalid",
];

const DISABLING_MESSAGES: &[&str] = &[
    "your credit balance is too low",
    "this organization has been disabled",
    "you exceeded your current quota",
    "permission denied",
    "the security token included in the request is invalid",
    "operation not allowed",
    "your account is not authorized",
    "api key not valid",
    "api key expired",
    "credit balance",
];

/// Whether `err` shows the channel's credential or account is unusable.
pub fn should_disable_channel(err: &RelayError) -> bool {
    let RelayError::UpstreamStatus {
        status,
        message,
        error_type,
        code,
    } = err
    else {
        return false;
    };
    if matches!(status, 401 | 403) {
        return true;
    }
    if error_type
        .as_deref()
        .is_some_and(|kind| DISABLING_TYPES.contains(&kind))
    {
        return true;
    }
    if code
        .as_deref()
        .is_some_and(|code| DISABLING_CODES.contains(&code))
    {
        return true;
    }
    let message = message.to_ascii_lowercase();
    DISABLING_MESSAGES
        .iter()
        .any(|needle| message.contains(needle))
}

/// Applies the configuration and the channel's own opt-out on top of [`should_disable_channel`].
pub fn should_auto_disable(config: &HealthConfig, channel: &Channel, err: &RelayError) -> bool {
    config.auto_disable_channel && channel.auto_ban && should_disable_channel(err)
}
