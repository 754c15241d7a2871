//! Ratio and flat-price tables and the quota formula built on them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Usage;

pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;
pub const DEFAULT_MODEL_RATIO: f64 = 30.0;
/// Completion multiplier for reasoning-heavy models without an explicit entry.
pub const REASONING_COMPLETION_RATIO: f64 = 4.0;

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing ratio for {table}.{model}: {value}")]
    InvalidRatio {
        table: &'static str,
        model: String,
        value: f64,
    },
    #[error("failed to read pricing file: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<PricingTableError> for crate::RelayError {
    fn from(err: PricingTableError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Raw pricing tables as configured; every map is keyed by model name except `group_ratio`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    /// Flat price per call, in currency units.
    pub model_price: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    pub cache_ratio: HashMap<String, f64>,
    pub audio_ratio: HashMap<String, f64>,
    pub audio_completion_ratio: HashMap<String, f64>,
    pub default_model_ratio: Option<f64>,
    pub quota_per_unit: Option<f64>,
}

/// How a model is metered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Billing {
    Ratio { model_ratio: f64, group_ratio: f64 },
    Price { price: f64, group_ratio: f64 },
}

#[derive(Clone, Debug)]
pub struct PricingTable {
    config: PricingConfig,
    default_model_ratio: f64,
    quota_per_unit: f64,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            config: PricingConfig::default(),
            default_model_ratio: DEFAULT_MODEL_RATIO,
            quota_per_unit: DEFAULT_QUOTA_PER_UNIT,
        }
    }
}

fn validate(table: &'static str, entries: &HashMap<String, f64>) -> Result<(), PricingTableError> {
    for (model, value) in entries {
        if !value.is_finite() || *value < 0.0 {
            return Err(PricingTableError::InvalidRatio {
                table,
                model: model.clone(),
                value: *value,
            });
        }
    }
    Ok(())
}

impl PricingTable {
    pub fn from_config(config: PricingConfig) -> Result<Self, PricingTableError> {
        validate("model_ratio", &config.model_ratio)?;
        validate("completion_ratio", &config.completion_ratio)?;
        validate("model_price", &config.model_price)?;
        validate("group_ratio", &config.group_ratio)?;
        validate("cache_ratio", &config.cache_ratio)?;
        validate("audio_ratio", &config.audio_ratio)?;
        validate("audio_completion_ratio", &config.audio_completion_ratio)?;
        let default_model_ratio = config.default_model_ratio.unwrap_or(DEFAULT_MODEL_RATIO);
        let quota_per_unit = config
            .quota_per_unit
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(DEFAULT_QUOTA_PER_UNIT);
        Ok(Self {
            config,
            default_model_ratio,
            quota_per_unit,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PricingTableError> {
        Self::from_config(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: &std::path::Path) -> Result<Self, PricingTableError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn quota_per_unit(&self) -> f64 {
        self.quota_per_unit
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.config.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        lookup(&self.config.model_ratio, model).unwrap_or(self.default_model_ratio)
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        lookup(&self.config.completion_ratio, model).unwrap_or_else(|| {
            if crate::model::is_reasoning_model(model) {
                REASONING_COMPLETION_RATIO
            } else {
                1.0
            }
        })
    }

    pub fn cache_ratio(&self, model: &str) -> f64 {
        lookup(&self.config.cache_ratio, model).unwrap_or(1.0)
    }

    pub fn audio_ratio(&self, model: &str) -> f64 {
        lookup(&self.config.audio_ratio, model).unwrap_or(1.0)
    }

    pub fn audio_completion_ratio(&self, model: &str) -> f64 {
        lookup(&self.config.audio_completion_ratio, model).unwrap_or(1.0)
    }

    pub fn billing(&self, model: &str, group: &str) -> Billing {
        let group_ratio = self.group_ratio(group);
        match lookup(&self.config.model_price, model) {
            Some(price) => Billing::Price { price, group_ratio },
            None => Billing::Ratio {
                model_ratio: self.model_ratio(model),
                group_ratio,
            },
        }
    }

    /// Conservative pre-dispatch estimate.
    pub fn reservation(&self, billing: Billing, estimated_tokens: u64) -> i64 {
        match billing {
            Billing::Price { price, group_ratio } => {
                floor_quota(price * self.quota_per_unit * group_ratio)
            }
            Billing::Ratio {
                model_ratio,
                group_ratio,
            } => floor_quota(estimated_tokens as f64 * model_ratio * group_ratio),
        }
    }

    /// True cost of a finished call. Zero total tokens cost nothing; a nonzero ratio
    /// that rounds down to zero still costs one unit.
    pub fn quota_for_usage(&self, model: &str, billing: Billing, usage: &Usage) -> i64 {
        if usage.total_tokens == 0 {
            return 0;
        }
        let quota = match billing {
            Billing::Price { price, group_ratio } => {
                floor_quota(price * self.quota_per_unit * group_ratio)
            }
            Billing::Ratio {
                model_ratio,
                group_ratio,
            } => {
                let cached = usage.cached_tokens.min(usage.prompt_tokens);
                let audio_prompt = usage.audio_prompt_tokens.min(usage.prompt_tokens - cached);
                let text_prompt = usage.prompt_tokens - cached - audio_prompt;
                let audio_completion = usage.audio_completion_tokens.min(usage.completion_tokens);
                let text_completion = usage.completion_tokens - audio_completion;

                let weighted = text_prompt as f64
                    + cached as f64 * self.cache_ratio(model)
                    + audio_prompt as f64 * self.audio_ratio(model)
                    + text_completion as f64 * self.completion_ratio(model)
                    + audio_completion as f64 * self.audio_completion_ratio(model);
                floor_quota(weighted * model_ratio * group_ratio)
            }
        };
        let ratio_nonzero = match billing {
            Billing::Price { price, group_ratio } => price * group_ratio != 0.0,
            Billing::Ratio {
                model_ratio,
                group_ratio,
            } => model_ratio * group_ratio != 0.0,
        };
        if ratio_nonzero && quota <= 0 { 1 } else { quota }
    }
}

/// Exact match first, then the longest configured prefix ending in `*`.
fn lookup(entries: &HashMap<String, f64>, model: &str) -> Option<f64> {
    if let Some(value) = entries.get(model) {
        return Some(*value);
    }
    entries
        .iter()
        .filter_map(|(pattern, value)| {
            let prefix = pattern.strip_suffix('*')?;
            model.starts_with(prefix).then_some((prefix.len(), *value))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, value)| value)
}

fn floor_quota(value: f64) -> i64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    if value >= i64::MAX as f64 {
        return i64::MAX;
    }
    value.floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        PricingTable::from_json_str(
            r#"{
                "model_ratio": {"gpt-4o": 2.5, "tiny": 0.0001, "free": 0, "claude-*": 1.5},
                "completion_ratio": {"gpt-4o": 4},
                "model_price": {"dall-e-3": 0.04},
                "group_ratio": {"vip": 0.5},
                "cache_ratio": {"gpt-4o": 0.5},
                "audio_ratio": {"gpt-4o": 16}
            }"#,
        )
        .expect("pricing")
    }

    #[test]
    fn ratio_cost_applies_every_surcharge() {
        let table = table();
        let billing = table.billing("gpt-4o", "default");
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 100,
            cached_tokens: 400,
            audio_prompt_tokens: 10,
            total_tokens: 1100,
            ..Usage::default()
        };
        // (590 + 400*0.5 + 10*16 + 100*4) * 2.5 = 1350 * 2.5
        assert_eq!(table.quota_for_usage("gpt-4o", billing, &usage), 3375);

        let vip = table.billing("gpt-4o", "vip");
        assert_eq!(table.quota_for_usage("gpt-4o", vip, &usage), 1687);
    }

    #[test]
    fn zero_total_tokens_cost_nothing() {
        let table = table();
        let billing = table.billing("gpt-4o", "default");
        assert_eq!(table.quota_for_usage("gpt-4o", billing, &Usage::default()), 0);
    }

    #[test]
    fn tiny_nonzero_cost_floors_to_one_unit() {
        let table = table();
        let billing = table.billing("tiny", "default");
        assert_eq!(table.quota_for_usage("tiny", billing, &Usage::new(3, 1)), 1);

        let free = table.billing("free", "default");
        assert_eq!(table.quota_for_usage("free", free, &Usage::new(3, 1)), 0);
    }

    #[test]
    fn flat_price_models_ignore_tokens() {
        let table = table();
        let billing = table.billing("dall-e-3", "default");
        assert!(matches!(billing, Billing::Price { .. }));
        assert_eq!(table.reservation(billing, 10_000), 20_000);
        assert_eq!(table.quota_for_usage("dall-e-3", billing, &Usage::new(1, 1)), 20_000);
    }

    #[test]
    fn lookups_fall_back_sensibly() {
        let table = table();
        assert_eq!(table.model_ratio("claude-3-5-haiku"), 1.5);
        assert_eq!(table.model_ratio("unknown"), DEFAULT_MODEL_RATIO);
        assert_eq!(table.completion_ratio("o3-mini"), REASONING_COMPLETION_RATIO);
        assert_eq!(table.completion_ratio("gpt-3.5-turbo"), 1.0);
        assert_eq!(table.group_ratio("nobody"), 1.0);
    }

    #[test]
    fn rejects_negative_ratios() {
        let err = PricingTable::from_json_str(r#"{"model_ratio": {"x": -1}}"#)
            .expect_err("negative ratio");
        assert!(matches!(err, PricingTableError::InvalidRatio { .. }));
    }
}
