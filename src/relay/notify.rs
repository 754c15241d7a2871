use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::store::User;
use crate::Result;

pub const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user_id: i64,
    pub email: Option<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            user_id = notification.user_id,
            email = notification.email.as_deref().unwrap_or(""),
            subject = %notification.subject,
            "{}",
            notification.body
        );
        Ok(())
    }
}

/// Sends at most one notification per user per interval, off the request path.
pub struct NotificationGate {
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    last_sent: Mutex<HashMap<i64, Instant>>,
}

impl std::fmt::Debug for NotificationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationGate")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl NotificationGate {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_interval(notifier, DEFAULT_NOTIFY_INTERVAL)
    }

    pub fn with_interval(notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            notifier,
            interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn admit(&self, user_id: i64, now: Instant) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|p| p.into_inner());
        match last_sent.get(&user_id) {
            Some(previous) if now.saturating_duration_since(*previous) < self.interval => false,
            _ => {
                let interval = self.interval;
                last_sent.retain(|_, sent| now.saturating_duration_since(*sent) < interval);
                last_sent.insert(user_id, now);
                true
            }
        }
    }

    /// Returns whether a notification was dispatched. Delivery failures are only logged.
    pub fn low_balance(&self, user: &User, remaining: i64, threshold: i64) -> bool {
        if !self.admit(user.id, Instant::now()) {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let notification = Notification {
            user_id: user.id,
            email: user.email.clone(),
            subject: "Quota reminder".to_string(),
            body: format!(
                "remaining quota {remaining} is below the reminder threshold {threshold}"
            ),
        };
        let notifier = Arc::clone(&self.notifier);
        handle.spawn(async move {
            let user_id = notification.user_id;
            if let Err(err) = notifier.notify(notification).await {
                tracing::warn!(user_id, error = %err, "low balance notification failed");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, notification: Notification) -> Result<()> {
            self.sent.lock().expect("lock").push(notification);
            Ok(())
        }
    }

    #[tokio::test]
    async fn rate_limits_per_user() {
        let recording = Arc::new(Recording::default());
        let gate = NotificationGate::new(recording.clone());
        let alice = User::new(1, 0);
        let bob = User::new(2, 0);

        assert!(gate.low_balance(&alice, 10, 100));
        assert!(!gate.low_balance(&alice, 5, 100));
        assert!(gate.low_balance(&bob, 10, 100));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let sent = recording.sent.lock().expect("lock");
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn interval_elapses() {
        let gate = NotificationGate::with_interval(Arc::new(LogNotifier), Duration::from_secs(60));
        let start = Instant::now();
        assert!(gate.admit(1, start));
        assert!(!gate.admit(1, start + Duration::from_secs(30)));
        assert!(gate.admit(1, start + Duration::from_secs(61)));
    }

    #[test]
    fn expired_entries_are_pruned() {
        let gate = NotificationGate::with_interval(Arc::new(LogNotifier), Duration::from_secs(60));
        let start = Instant::now();
        for user_id in 0..100 {
            assert!(gate.admit(user_id, start));
        }
        assert!(gate.admit(1_000, start + Duration::from_secs(120)));
        let last_sent = gate.last_sent.lock().expect("lock");
        assert_eq!(last_sent.len(), 1);
        assert!(last_sent.contains_key(&1_000));
    }
}
