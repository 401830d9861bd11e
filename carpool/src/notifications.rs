//! Persists notifications and invalidates the per-user cache entry that
//! lists them. A notification is a projection-level side effect, not an
//! aggregate event, so it is emitted by handlers after a command succeeds
//! rather than from inside a reducer — the same "fire-and-forget, outside
//! the critical section" placement the concurrency model requires for
//! anything that is not the owning mutation itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CacheLayer;
use crate::types::{BookingId, NotificationId, RideRequestId, UserId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingRequest,
    BookingAccepted,
    BookingRejected,
    BookingCancelled,
    RideCancelled,
    ChatMessage,
    RateDriver,
    RatePassenger,
    OfferReceived,
    OfferRejected,
    RequestBooked,
    RatingReceived,
}

impl NotificationKind {
    /// `rate_driver`/`rate_passenger` notifications are capped at one per
    /// `(userId, bookingId)`; every other kind may recur.
    #[must_use]
    pub const fn is_singleton_per_booking(self) -> bool {
        matches!(self, Self::RateDriver | Self::RatePassenger)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub booking_id: Option<BookingId>,
    pub request_id: Option<RideRequestId>,
    pub payload: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable store backing the notification feed; implemented over Postgres
/// in the same `sqlx::query`/bind/map_err style as `postgres::event_store`.
pub trait NotificationStore: Send + Sync {
    fn insert(
        &self,
        notification: Notification,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), anyhow::Error>> + Send + '_>>;

    /// For kinds with `is_singleton_per_booking`, checks whether one already
    /// exists before a new one is created.
    fn exists_for_booking(
        &self,
        user_id: UserId,
        booking_id: BookingId,
        kind: NotificationKind,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, anyhow::Error>> + Send + '_>>;
}

pub struct NotificationBus<S: NotificationStore> {
    store: S,
    cache: std::sync::Arc<dyn CacheLayer>,
}

impl<S: NotificationStore> NotificationBus<S> {
    pub const fn new(store: S, cache: std::sync::Arc<dyn CacheLayer>) -> Self {
        Self { store, cache }
    }

    fn cache_key(user_id: UserId) -> String {
        format!("notifications:{user_id}")
    }

    /// Persists a notification and invalidates the affected user's cache
    /// entry. For `rate_driver`/`rate_passenger`, the caller must already
    /// have confirmed uniqueness via `exists_for_booking` — this method does
    /// not re-check, since the scheduler holds the authoritative booking
    /// iteration and is the only caller of those two kinds.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be persisted.
    pub async fn notify(&self, notification: Notification) -> Result<(), anyhow::Error> {
        let user_id = notification.user_id;
        self.store.insert(notification).await?;
        self.cache.del(&Self::cache_key(user_id)).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeStore {
        inserted: Mutex<Vec<Notification>>,
    }

    impl NotificationStore for FakeStore {
        fn insert(
            &self,
            notification: Notification,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), anyhow::Error>> + Send + '_>>
        {
            self.inserted.lock().unwrap().push(notification);
            Box::pin(async { Ok(()) })
        }

        fn exists_for_booking(
            &self,
            _user_id: UserId,
            _booking_id: BookingId,
            _kind: NotificationKind,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, anyhow::Error>> + Send + '_>>
        {
            Box::pin(async { Ok(false) })
        }
    }

    #[tokio::test]
    async fn notify_persists_and_invalidates_cache() {
        let bus = NotificationBus::new(FakeStore::default(), Arc::new(NoopCache));
        let user_id = UserId::new();
        bus.notify(Notification {
            id: NotificationId::new(),
            user_id,
            kind: NotificationKind::BookingRequest,
            booking_id: None,
            request_id: None,
            payload: serde_json::json!({}),
            read: false,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        assert_eq!(bus.store.inserted.lock().unwrap().len(), 1);
    }
}
