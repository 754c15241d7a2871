//! In-memory routing index from `(group, model)` to prioritized, weighted channels.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;

use super::channel::{Channel, ChannelStatus};
use super::store::RelayStore;
use crate::utils::task::{AbortOnDrop, spawn_interval};
use crate::{RelayError, Result};

pub const DEFAULT_SMOOTHING: u32 = 10;

/// Collapses per-assistant model names onto one routing bucket.
pub fn normalize_model_bucket(model: &str) -> String {
    for family in ["gpt-4-gizmo", "gpt-4o-gizmo"] {
        if model.starts_with(family) {
            return format!("{family}-*");
        }
    }
    model.to_string()
}

/// A routing candidate: a priority tier plus a weight inside the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Weighted {
    pub priority: i64,
    pub weight: u32,
}

/// Picks a candidate index: `attempt` walks the distinct priorities from highest to lowest
/// (clamped to the lowest), then draws inside the tier proportionally to `weight + smoothing`.
pub fn pick_candidate<R: Rng>(
    candidates: &[Weighted],
    attempt: usize,
    smoothing: u32,
    rng: &mut R,
) -> Option<usize> {
    let tiers: BTreeSet<i64> = candidates.iter().map(|c| c.priority).collect();
    let tier = *tiers.iter().rev().nth(attempt.min(tiers.len().checked_sub(1)?))?;

    let in_tier: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.priority == tier)
        .map(|(idx, _)| idx)
        .collect();
    let total: u64 = in_tier
        .iter()
        .map(|idx| u64::from(candidates[*idx].weight) + u64::from(smoothing))
        .sum();
    if total == 0 {
        return in_tier.get(rng.random_range(0..in_tier.len())).copied();
    }

    let mut remaining = rng.random_range(0..total) as i128;
    for idx in &in_tier {
        remaining -= i128::from(candidates[*idx].weight) + i128::from(smoothing);
        if remaining < 0 {
            return Some(*idx);
        }
    }
    in_tier.last().copied()
}

#[derive(Debug)]
pub struct IndexedChannel {
    pub channel: Arc<Channel>,
    status: AtomicU8,
}

impl IndexedChannel {
    fn new(channel: Channel) -> Self {
        let status = AtomicU8::new(channel.status.as_u8());
        Self {
            channel: Arc::new(channel),
            status,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone)]
struct Route {
    channel: Arc<IndexedChannel>,
    weighted: Weighted,
}

#[derive(Debug, Default)]
struct ChannelIndex {
    routes: HashMap<String, HashMap<String, Vec<Route>>>,
    channels: HashMap<i64, Arc<IndexedChannel>>,
}

impl ChannelIndex {
    fn build(channels: Vec<Channel>, abilities: Vec<super::channel::Ability>) -> Self {
        let channels: HashMap<i64, Arc<IndexedChannel>> = channels
            .into_iter()
            .map(|channel| (channel.id, Arc::new(IndexedChannel::new(channel))))
            .collect();

        let mut routes: HashMap<String, HashMap<String, Vec<Route>>> = HashMap::new();
        for ability in abilities {
            let Some(channel) = channels.get(&ability.channel_id) else {
                continue;
            };
            if channel.status() == ChannelStatus::ManuallyDisabled {
                continue;
            }
            routes
                .entry(ability.group)
                .or_default()
                .entry(ability.model)
                .or_default()
                .push(Route {
                    channel: channel.clone(),
                    weighted: Weighted {
                        priority: ability.priority,
                        weight: ability.weight,
                    },
                });
        }
        for models in routes.values_mut() {
            for list in models.values_mut() {
                list.sort_by(|a, b| {
                    b.weighted
                        .priority
                        .cmp(&a.weighted.priority)
                        .then(a.channel.channel.id.cmp(&b.channel.channel.id))
                });
            }
        }

        Self { routes, channels }
    }

    fn enabled_routes(&self, group: &str, bucket: &str) -> Vec<Route> {
        self.routes
            .get(group)
            .and_then(|models| models.get(bucket))
            .map(|list| {
                list.iter()
                    .filter(|route| route.channel.status().is_enabled())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct ChannelRegistry {
    store: Arc<dyn RelayStore>,
    index: RwLock<Arc<ChannelIndex>>,
    // Serializes rebuilds with status writes so a rebuild never resurrects a stale status.
    refresh: tokio::sync::Mutex<()>,
    memory_cache: bool,
    smoothing: u32,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("memory_cache", &self.memory_cache)
            .field("smoothing", &self.smoothing)
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn RelayStore>, memory_cache: bool, smoothing: u32) -> Self {
        Self {
            store,
            index: RwLock::new(Arc::new(ChannelIndex::default())),
            refresh: tokio::sync::Mutex::new(()),
            memory_cache,
            smoothing,
        }
    }

    fn snapshot(&self) -> Arc<ChannelIndex> {
        self.index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Loads channels and abilities and swaps in a fresh index.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rebuild(&self) -> Result<()> {
        let _refresh = self.refresh.lock().await;
        let channels = self.store.load_channels().await?;
        let abilities = self.store.load_abilities().await?;
        let channel_count = channels.len();
        let index = Arc::new(ChannelIndex::build(channels, abilities));
        *self
            .index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = index;
        tracing::debug!(channels = channel_count, "channel index rebuilt");
        Ok(())
    }

    pub async fn select(&self, group: &str, model: &str, attempt: usize) -> Result<Arc<Channel>> {
        let bucket = normalize_model_bucket(model);
        let not_found = || RelayError::ChannelNotFound {
            group: group.to_string(),
            model: model.to_string(),
        };

        if !self.memory_cache {
            let rows = self.store.find_channels(group, &bucket).await?;
            let weighted: Vec<Weighted> = rows
                .iter()
                .map(|(ability, _)| Weighted {
                    priority: ability.priority,
                    weight: ability.weight,
                })
                .collect();
            let picked = pick_candidate(&weighted, attempt, self.smoothing, &mut rand::rng())
                .ok_or_else(not_found)?;
            return rows
                .into_iter()
                .nth(picked)
                .map(|(_, channel)| Arc::new(channel))
                .ok_or_else(not_found);
        }

        let routes = self.snapshot().enabled_routes(group, &bucket);
        let weighted: Vec<Weighted> = routes.iter().map(|route| route.weighted).collect();
        let picked = pick_candidate(&weighted, attempt, self.smoothing, &mut rand::rng())
            .ok_or_else(not_found)?;
        Ok(routes[picked].channel.channel.clone())
    }

    /// Persists a channel's status, then applies it to the live index without a rebuild.
    pub async fn update_status(&self, channel_id: i64, status: ChannelStatus) -> Result<bool> {
        let _refresh = self.refresh.lock().await;
        let updated = self.store.update_channel_status(channel_id, status).await?;
        if let Some(indexed) = self.snapshot().channels.get(&channel_id) {
            indexed.status.store(status.as_u8(), Ordering::Release);
        }
        tracing::info!(channel_id, status = ?status, "channel status updated");
        Ok(updated)
    }

    pub fn channel_status(&self, channel_id: i64) -> Option<ChannelStatus> {
        self.snapshot()
            .channels
            .get(&channel_id)
            .map(|indexed| indexed.status())
    }

    /// Models servable for `group` through at least one enabled channel.
    pub async fn models_for_group(&self, group: &str) -> Result<Vec<String>> {
        if !self.memory_cache {
            let mut models = BTreeSet::new();
            for ability in self.store.load_abilities().await? {
                if ability.enabled && ability.group == group {
                    models.insert(ability.model);
                }
            }
            return Ok(models.into_iter().collect());
        }
        let index = self.snapshot();
        let mut models: Vec<String> = index
            .routes
            .get(group)
            .map(|by_model| {
                by_model
                    .iter()
                    .filter(|(_, routes)| {
                        routes
                            .iter()
                            .any(|route| route.channel.status().is_enabled())
                    })
                    .map(|(model, _)| model.clone())
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        Ok(models)
    }

    pub async fn auto_disabled_channels(&self) -> Result<Vec<Arc<Channel>>> {
        if !self.memory_cache {
            return Ok(self
                .store
                .load_channels()
                .await?
                .into_iter()
                .filter(|channel| channel.status == ChannelStatus::AutoDisabled)
                .map(Arc::new)
                .collect());
        }
        let mut channels: Vec<Arc<Channel>> = self
            .snapshot()
            .channels
            .values()
            .filter(|indexed| indexed.status() == ChannelStatus::AutoDisabled)
            .map(|indexed| indexed.channel.clone())
            .collect();
        channels.sort_by_key(|channel| channel.id);
        Ok(channels)
    }

    /// Periodic rebuild; stops when the returned guard drops.
    pub fn spawn_sync_task(self: &Arc<Self>, interval: Duration) -> AbortOnDrop {
        let registry = Arc::clone(self);
        spawn_interval(interval, move || {
            let registry = registry.clone();
            async move {
                if let Err(err) = registry.rebuild().await {
                    tracing::warn!(error = %err, "channel index sync failed");
                }
            }
        })
    }
}
