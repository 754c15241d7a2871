use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::channel::{Ability, Channel, ChannelStatus, DEFAULT_GROUP};
use crate::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "enabled" => Self::Enabled,
            "expired" => Self::Expired,
            "exhausted" => Self::Exhausted,
            _ => Self::Disabled,
        }
    }
}

/// A caller API key. `key` is stored without the `sk-` prefix.
#[derive(Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub key: String,
    pub user_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: TokenStatus,
    #[serde(default)]
    pub remain_quota: i64,
    #[serde(default)]
    pub unlimited_quota: bool,
    #[serde(default)]
    pub used_quota: i64,
    /// Empty means every model.
    #[serde(default)]
    pub models: Vec<String>,
    /// Unix seconds; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("remain_quota", &self.remain_quota)
            .field("unlimited_quota", &self.unlimited_quota)
            .field("used_quota", &self.used_quota)
            .field("models", &self.models)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Token {
    pub fn new(id: i64, key: impl Into<String>, user_id: i64) -> Self {
        Self {
            id,
            key: key.into(),
            user_id,
            name: String::new(),
            status: TokenStatus::Enabled,
            remain_quota: 0,
            unlimited_quota: false,
            used_quota: 0,
            models: Vec::new(),
            expires_at: None,
        }
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|allowed| allowed == model)
    }
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl User {
    pub fn new(id: i64, quota: i64) -> Self {
        Self {
            id,
            username: format!("user-{id}"),
            group: default_group(),
            quota,
            used_quota: 0,
            request_count: 0,
            email: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLog {
    #[serde(default)]
    pub id: i64,
    pub created_at: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub quota: i64,
    pub elapsed_ms: u64,
    pub is_stream: bool,
    pub content: String,
}

/// Persistent state behind the relay. Implementations must make `reserve_quota` atomic.
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn load_channels(&self) -> Result<Vec<Channel>>;

    async fn load_abilities(&self) -> Result<Vec<Ability>>;

    /// Enabled channels with an enabled ability for `(group, model)`, with their abilities.
    async fn find_channels(&self, group: &str, model: &str) -> Result<Vec<(Ability, Channel)>>;

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>>;

    /// Inserts or replaces a channel and regenerates all of its abilities.
    async fn upsert_channel(&self, channel: &Channel) -> Result<()>;

    /// Returns `false` when the channel does not exist.
    async fn update_channel_status(&self, id: i64, status: ChannelStatus) -> Result<bool>;

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<()>;

    async fn find_token(&self, key: &str) -> Result<Option<Token>>;

    async fn upsert_token(&self, token: &Token) -> Result<()>;

    async fn get_user(&self, id: i64) -> Result<Option<User>>;

    async fn upsert_user(&self, user: &User) -> Result<()>;

    /// Checks and decrements both balances by `amount` in one step.
    async fn reserve_quota(
        &self,
        token_id: i64,
        user_id: i64,
        amount: i64,
        unlimited: bool,
    ) -> Result<()>;

    /// Applies `delta` to both balances; positive spends more, negative refunds.
    async fn adjust_quota(&self, token_id: i64, user_id: i64, delta: i64) -> Result<()>;

    /// Appends the audit row and bumps user used quota and request count.
    async fn record_consume(&self, log: ConsumeLog) -> Result<()>;

    async fn list_consume_logs(&self, user_id: Option<i64>, limit: usize)
    -> Result<Vec<ConsumeLog>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    channels: HashMap<i64, Channel>,
    abilities: Vec<Ability>,
    tokens: HashMap<i64, Token>,
    users: HashMap<i64, User>,
    logs: Vec<ConsumeLog>,
}

/// In-process store for tests and single-node deployments without persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| RelayError::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn load_channels(&self) -> Result<Vec<Channel>> {
        let state = self.lock()?;
        let mut channels: Vec<Channel> = state.channels.values().cloned().collect();
        channels.sort_by_key(|channel| channel.id);
        Ok(channels)
    }

    async fn load_abilities(&self) -> Result<Vec<Ability>> {
        Ok(self.lock()?.abilities.clone())
    }

    async fn find_channels(&self, group: &str, model: &str) -> Result<Vec<(Ability, Channel)>> {
        let state = self.lock()?;
        Ok(state
            .abilities
            .iter()
            .filter(|ability| ability.enabled && ability.group == group && ability.model == model)
            .filter_map(|ability| {
                let channel = state.channels.get(&ability.channel_id)?;
                channel
                    .status
                    .is_enabled()
                    .then(|| (ability.clone(), channel.clone()))
            })
            .collect())
    }

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        Ok(self.lock()?.channels.get(&id).cloned())
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let mut state = self.lock()?;
        state
            .abilities
            .retain(|ability| ability.channel_id != channel.id);
        state.abilities.extend(channel.abilities());
        state.channels.insert(channel.id, channel.clone());
        Ok(())
    }

    async fn update_channel_status(&self, id: i64, status: ChannelStatus) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(channel) = state.channels.get_mut(&id) else {
            return Ok(false);
        };
        channel.status = status;
        for ability in state
            .abilities
            .iter_mut()
            .filter(|ability| ability.channel_id == id)
        {
            ability.enabled = status.is_enabled();
        }
        Ok(true)
    }

    async fn add_channel_used_quota(&self, id: i64, quota: i64) -> Result<()> {
        if let Some(channel) = self.lock()?.channels.get_mut(&id) {
            channel.used_quota = channel.used_quota.saturating_add(quota);
        }
        Ok(())
    }

    async fn find_token(&self, key: &str) -> Result<Option<Token>> {
        Ok(self
            .lock()?
            .tokens
            .values()
            .find(|token| token.key == key)
            .cloned())
    }

    async fn upsert_token(&self, token: &Token) -> Result<()> {
        self.lock()?.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        self.lock()?.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn reserve_quota(
        &self,
        token_id: i64,
        user_id: i64,
        amount: i64,
        unlimited: bool,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let user_quota = state
            .users
            .get(&user_id)
            .map(|user| user.quota)
            .ok_or_else(|| RelayError::Unauthorized(format!("user {user_id} not found")))?;
        let token_quota = state
            .tokens
            .get(&token_id)
            .map(|token| token.remain_quota)
            .ok_or_else(|| RelayError::Unauthorized(format!("token {token_id} not found")))?;

        if user_quota < amount {
            return Err(RelayError::InsufficientQuota {
                needed: amount,
                remaining: user_quota,
            });
        }
        if !unlimited && token_quota < amount {
            return Err(RelayError::InsufficientQuota {
                needed: amount,
                remaining: token_quota,
            });
        }

        if let Some(user) = state.users.get_mut(&user_id) {
            user.quota -= amount;
        }
        if let Some(token) = state.tokens.get_mut(&token_id) {
            token.remain_quota -= amount;
            token.used_quota += amount;
        }
        Ok(())
    }

    async fn adjust_quota(&self, token_id: i64, user_id: i64, delta: i64) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(user) = state.users.get_mut(&user_id) {
            user.quota -= delta;
        }
        if let Some(token) = state.tokens.get_mut(&token_id) {
            token.remain_quota -= delta;
            token.used_quota += delta;
        }
        Ok(())
    }

    async fn record_consume(&self, mut log: ConsumeLog) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(user) = state.users.get_mut(&log.user_id) {
            user.used_quota += log.quota;
            user.request_count += 1;
        }
        log.id = state.logs.len() as i64 + 1;
        state.logs.push(log);
        Ok(())
    }

    async fn list_consume_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConsumeLog>> {
        let state = self.lock()?;
        Ok(state
            .logs
            .iter()
            .rev()
            .filter(|log| user_id.is_none_or(|id| log.user_id == id))
            .take(limit)
            .cloned()
            .collect())
    }
}
