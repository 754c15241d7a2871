//! Multi-tenant relay: channel routing, quota metering and the HTTP surface.

pub mod cache;
pub mod channel;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod health;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod quota;
pub mod registry;
pub mod store;
pub mod token_count;

#[cfg(feature = "gateway")]
pub mod http;

#[cfg(feature = "relay-store-sqlite")]
mod sqlite_store;

pub use cache::{TokenCache, TokenCacheConfig};
pub use channel::{Ability, Channel, ChannelKind, ChannelStatus, DEFAULT_GROUP};
pub use config::{ConfigError, RelayConfig, SeedConfig};
pub use context::{Caller, RelayContext, RelayMode, StreamStats};
pub use dispatch::{ChatReply, Relay};
pub use health::{HealthConfig, should_auto_disable, should_disable_channel};
pub use notify::{LogNotifier, Notification, NotificationGate, Notifier};
pub use observability::{Observability, ObservabilitySnapshot};
pub use pricing::{Billing, PricingConfig, PricingTable, PricingTableError};
pub use quota::{QuotaConfig, QuotaLedger, Reservation, Settlement};
pub use registry::{ChannelRegistry, normalize_model_bucket};
pub use store::{ConsumeLog, MemoryStore, RelayStore, Token, TokenStatus, User};

#[cfg(feature = "relay-store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};

#[cfg(feature = "gateway")]
pub use http::{RelayHttpState, router};
