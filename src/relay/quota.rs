//! Two-phase quota accounting: reserve an estimate before dispatch, reconcile the true cost after.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::context::{Caller, RelayContext};
use super::notify::NotificationGate;
use super::pricing::{Billing, PricingTable};
use super::store::{ConsumeLog, RelayStore};
use crate::types::Usage;
use crate::{RelayError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Tokens added to every pre-dispatch estimate.
    pub pre_consumed_base: u64,
    /// Skip the reservation when balances exceed this multiple of it.
    pub trust_multiplier: Option<i64>,
    /// Notify when the user balance falls below this. `0` disables reminders.
    pub remind_threshold: i64,
    /// Whether consume logs carry the pricing breakdown.
    pub log_pricing_detail: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            pre_consumed_base: 500,
            trust_multiplier: Some(100),
            remind_threshold: 1_000,
            log_pricing_detail: true,
        }
    }
}

/// Quota held back for one in-flight request.
///
/// Must be handed to [`QuotaLedger::settle`] or [`QuotaLedger::refund`]. A reservation
/// dropped without either is refunded from a spawned task.
#[must_use = "a reservation must be settled or refunded"]
pub struct Reservation {
    token_id: i64,
    user_id: i64,
    amount: i64,
    model: String,
    billing: Billing,
    store: Option<Arc<dyn RelayStore>>,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("token_id", &self.token_id)
            .field("user_id", &self.user_id)
            .field("amount", &self.amount)
            .field("model", &self.model)
            .field("billing", &self.billing)
            .field("open", &self.store.is_some())
            .finish()
    }
}

impl Reservation {
    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn billing(&self) -> Billing {
        self.billing
    }

    fn close(&mut self) {
        self.store = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        if self.amount == 0 {
            return;
        }
        let (token_id, user_id, amount) = (self.token_id, self.user_id, self.amount);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.adjust_quota(token_id, user_id, -amount).await {
                        tracing::error!(token_id, user_id, amount, error = %err, "reservation refund failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(token_id, user_id, amount, "reservation dropped outside a runtime");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub quota: i64,
    /// Applied on top of the reservation; negative means a refund.
    pub delta: i64,
}

pub struct QuotaLedger {
    store: Arc<dyn RelayStore>,
    pricing: Arc<PricingTable>,
    notifications: NotificationGate,
    config: QuotaConfig,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn RelayStore>,
        pricing: Arc<PricingTable>,
        notifications: NotificationGate,
        config: QuotaConfig,
    ) -> Self {
        Self {
            store,
            pricing,
            notifications,
            config,
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Reserves the estimated cost of a call with `estimated_tokens` prompt plus output tokens.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = caller.user_id, model = model))]
    pub async fn pre_consume(
        &self,
        caller: &Caller,
        model: &str,
        estimated_tokens: u64,
    ) -> Result<Reservation> {
        let billing = self.pricing.billing(model, &caller.group);
        let estimate = self.pricing.reservation(
            billing,
            self.config.pre_consumed_base.saturating_add(estimated_tokens),
        );

        let user = self
            .store
            .get_user(caller.user_id)
            .await?
            .ok_or_else(|| RelayError::Unauthorized(format!("user {} not found", caller.user_id)))?;
        if user.quota <= 0 {
            return Err(RelayError::InsufficientQuota {
                needed: estimate.max(1),
                remaining: user.quota,
            });
        }
        if !caller.unlimited_quota && caller.remain_quota <= 0 {
            return Err(RelayError::InsufficientQuota {
                needed: estimate.max(1),
                remaining: caller.remain_quota,
            });
        }

        let trusted = self.config.trust_multiplier.is_some_and(|multiplier| {
            let bar = estimate.saturating_mul(multiplier);
            user.quota > bar && (caller.unlimited_quota || caller.remain_quota > bar)
        });
        let amount = if trusted { 0 } else { estimate };
        if amount > 0 {
            self.store
                .reserve_quota(caller.token_id, caller.user_id, amount, caller.unlimited_quota)
                .await?;
        }
        tracing::debug!(amount, trusted, "quota reserved");

        Ok(Reservation {
            token_id: caller.token_id,
            user_id: caller.user_id,
            amount,
            model: model.to_string(),
            billing,
            store: Some(Arc::clone(&self.store)),
        })
    }

    /// Returns the whole reservation.
    pub async fn refund(&self, mut reservation: Reservation) -> Result<()> {
        reservation.close();
        if reservation.amount != 0 {
            self.store
                .adjust_quota(reservation.token_id, reservation.user_id, -reservation.amount)
                .await?;
        }
        Ok(())
    }

    /// Charges the true cost of `usage`, writes the audit row and checks the reminder threshold.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(request_id = %ctx.request_id, channel_id = ctx.channel.id)
    )]
    pub async fn settle(
        &self,
        mut reservation: Reservation,
        usage: &Usage,
        ctx: &RelayContext,
        elapsed: Duration,
    ) -> Result<Settlement> {
        reservation.close();
        let quota = self
            .pricing
            .quota_for_usage(&reservation.model, reservation.billing, usage);
        let delta = quota - reservation.amount;
        if delta != 0 {
            self.store
                .adjust_quota(reservation.token_id, reservation.user_id, delta)
                .await?;
        }

        let content = if self.config.log_pricing_detail {
            self.pricing_detail(&reservation)
        } else {
            String::new()
        };
        self.store
            .record_consume(ConsumeLog {
                id: 0,
                created_at: crate::protocol::unix_now() as i64,
                user_id: reservation.user_id,
                token_id: reservation.token_id,
                token_name: ctx.caller.token_name.clone(),
                channel_id: ctx.channel.id,
                model: ctx.original_model.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                quota,
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                is_stream: ctx.is_stream,
                content,
            })
            .await?;
        if quota > 0 {
            self.store.add_channel_used_quota(ctx.channel.id, quota).await?;
        }

        self.check_balance(reservation.user_id).await;
        tracing::debug!(quota, delta, "quota settled");
        Ok(Settlement { quota, delta })
    }

    fn pricing_detail(&self, reservation: &Reservation) -> String {
        match reservation.billing {
            Billing::Ratio {
                model_ratio,
                group_ratio,
            } => format!(
                "model ratio {model_ratio:.2}, completion ratio {:.2}, group ratio {group_ratio:.2}",
                self.pricing.completion_ratio(&reservation.model)
            ),
            Billing::Price { price, group_ratio } => {
                format!("model price {price:.4}, group ratio {group_ratio:.2}")
            }
        }
    }

    async fn check_balance(&self, user_id: i64) {
        if self.config.remind_threshold <= 0 {
            return;
        }
        match self.store.get_user(user_id).await {
            Ok(Some(user)) if user.quota < self.config.remind_threshold => {
                self.notifications
                    .low_balance(&user, user.quota, self.config.remind_threshold);
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(user_id, error = %err, "balance check failed"),
        }
    }
}
