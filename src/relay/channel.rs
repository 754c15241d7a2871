use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::RelayError;

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::DeepSeek => "deepseek",
            Self::OpenAiCompatible => "openai-compatible",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiCompatible => "https://api.openai.com",
            Self::Azure => "",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Ollama => "http://localhost:11434",
            Self::DeepSeek => "https://api.deepseek.com",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" | "azure-openai" => Ok(Self::Azure),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "deepseek" => Ok(Self::DeepSeek),
            "openai-compatible" | "custom" => Ok(Self::OpenAiCompatible),
            other => Err(RelayError::Config(format!("unknown channel kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Enabled => 1,
            Self::ManuallyDisabled => 2,
            Self::AutoDisabled => 3,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Enabled,
            3 => Self::AutoDisabled,
            _ => Self::ManuallyDisabled,
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

fn default_groups() -> Vec<String> {
    vec![DEFAULT_GROUP.to_string()]
}

fn default_true() -> bool {
    true
}

/// An upstream provider account: endpoint, credential, and routing attributes.
#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub base_url: Option<String>,
    pub key: String,
    /// Provider-specific extra setting, e.g. the Azure API version.
    #[serde(default)]
    pub other: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: ChannelStatus,
    /// Requested model name to upstream model name.
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub used_quota: i64,
    /// Whether health checks may disable and re-enable this channel automatically.
    #[serde(default = "default_true")]
    pub auto_ban: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("key", &"<redacted>")
            .field("other", &self.other)
            .field("models", &self.models)
            .field("groups", &self.groups)
            .field("weight", &self.weight)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("model_mapping", &self.model_mapping)
            .field("used_quota", &self.used_quota)
            .field("auto_ban", &self.auto_ban)
            .finish()
    }
}

impl Channel {
    pub fn new(id: i64, kind: ChannelKind, key: impl Into<String>) -> Self {
        Self {
            id,
            name: format!("{kind}-{id}"),
            kind,
            base_url: None,
            key: key.into(),
            other: None,
            models: Vec::new(),
            groups: default_groups(),
            weight: 0,
            priority: 0,
            status: ChannelStatus::Enabled,
            model_mapping: BTreeMap::new(),
            used_quota: 0,
            auto_ban: true,
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
    }

    /// Upstream model name for a requested model.
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .filter(|mapped| !mapped.trim().is_empty())
            .unwrap_or(model)
    }

    /// Routing facts derived from the model and group lists.
    pub fn abilities(&self) -> Vec<Ability> {
        let mut out = Vec::with_capacity(self.models.len() * self.groups.len());
        for group in &self.groups {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            for model in &self.models {
                let model = model.trim();
                if model.is_empty() {
                    continue;
                }
                out.push(Ability {
                    group: group.to_string(),
                    model: model.to_string(),
                    channel_id: self.id,
                    enabled: self.status.is_enabled(),
                    priority: self.priority,
                    weight: self.weight,
                });
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ability {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: u32,
}
