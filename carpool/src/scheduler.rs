//! The two long-lived background ticks owned by the app coordinator: the
//! rating-eligibility sweep and the ride-request expiry sweep. Both are
//! `tokio::spawn` loops started once at startup, per the workspace's
//! per-request-store-but-shared-scheduler-handle convention — there is no
//! per-request instance of either.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Abstracts the read side the scheduler needs, so it can run against a
/// real Postgres projection or an in-memory fake in tests without pulling
/// in the whole aggregate stack.
pub trait RatingSweepSource: Send + Sync {
    /// Rides with `departureAt` in `[now - 35min, now - 30min]` and still
    /// `active`.
    fn due_for_rating(
        &self,
        now: DateTime<Utc>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<RideDueForRating>> + Send + '_>>;
}

#[derive(Clone, Debug)]
pub struct RideDueForRating {
    pub ride_id: crate::types::RideId,
    pub driver_id: crate::types::UserId,
    pub accepted_bookings: Vec<AcceptedBooking>,
}

#[derive(Clone, Debug)]
pub struct AcceptedBooking {
    pub booking_id: crate::types::BookingId,
    pub passenger_id: crate::types::UserId,
    pub driver_already_rated: bool,
    pub passenger_already_rated: bool,
}

/// Runs the side effects for one rating-sweep tick: completing the ride and
/// emitting the two rating-eligibility notifications per accepted booking,
/// skipping any (user, booking) pair that already has a rating.
pub trait RatingSweepEffects: Send + Sync {
    fn complete_ride(
        &self,
        ride_id: crate::types::RideId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;

    fn notify_rate_driver(
        &self,
        passenger_id: crate::types::UserId,
        booking_id: crate::types::BookingId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;

    fn notify_rate_passenger(
        &self,
        driver_id: crate::types::UserId,
        booking_id: crate::types::BookingId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;
}

/// Runs the rating-eligibility sweep every `interval`, calling `source` to
/// find due rides and `effects` to complete the ride and fan out
/// notifications. Returns a `JoinHandle` the caller keeps to shut the loop
/// down at process exit.
pub fn spawn_rating_scheduler<S, E>(
    source: Arc<S>,
    effects: Arc<E>,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    S: RatingSweepSource + 'static,
    E: RatingSweepEffects + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for ride in source.due_for_rating(now).await {
                effects.complete_ride(ride.ride_id).await;
                for booking in ride.accepted_bookings {
                    if !booking.driver_already_rated {
                        effects
                            .notify_rate_driver(booking.passenger_id, booking.booking_id)
                            .await;
                    }
                    if !booking.passenger_already_rated {
                        effects
                            .notify_rate_passenger(ride.driver_id, booking.booking_id)
                            .await;
                    }
                }
            }
        }
    })
}

/// Marks ride requests whose `expiresAt < now` and still `pending` as
/// `expired`.
pub trait RequestExpirySource: Send + Sync {
    fn expired_pending_requests(
        &self,
        now: DateTime<Utc>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<crate::types::RideRequestId>> + Send + '_>>;
}

pub trait RequestExpiryEffects: Send + Sync {
    fn expire(
        &self,
        request_id: crate::types::RideRequestId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;
}

pub fn spawn_request_expiry_sweep<S, E>(
    source: Arc<S>,
    effects: Arc<E>,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    S: RequestExpirySource + 'static,
    E: RequestExpiryEffects + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for request_id in source.expired_pending_requests(now).await {
                effects.expire(request_id).await;
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{BookingId, RideId, UserId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        ride: RideDueForRating,
        yielded: std::sync::atomic::AtomicBool,
    }

    impl RatingSweepSource for FakeSource {
        fn due_for_rating(
            &self,
            _now: DateTime<Utc>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<RideDueForRating>> + Send + '_>>
        {
            Box::pin(async move {
                if self.yielded.swap(true, Ordering::SeqCst) {
                    Vec::new()
                } else {
                    vec![self.ride.clone()]
                }
            })
        }
    }

    #[derive(Default)]
    struct CountingEffects {
        completed: AtomicUsize,
        rate_driver: AtomicUsize,
        rate_passenger: AtomicUsize,
    }

    impl RatingSweepEffects for CountingEffects {
        fn complete_ride(
            &self,
            _ride_id: RideId,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn notify_rate_driver(
            &self,
            _passenger_id: UserId,
            _booking_id: BookingId,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            self.rate_driver.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn notify_rate_passenger(
            &self,
            _driver_id: UserId,
            _booking_id: BookingId,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            self.rate_passenger.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_already_rated_bookings() {
        let ride = RideDueForRating {
            ride_id: RideId::new(),
            driver_id: UserId::new(),
            accepted_bookings: vec![AcceptedBooking {
                booking_id: BookingId::new(),
                passenger_id: UserId::new(),
                driver_already_rated: true,
                passenger_already_rated: false,
            }],
        };
        let source = Arc::new(FakeSource {
            ride,
            yielded: std::sync::atomic::AtomicBool::new(false),
        });
        let effects = Arc::new(CountingEffects::default());
        let handle = spawn_rating_scheduler(source, effects.clone(), Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;

        assert_eq!(effects.completed.load(Ordering::SeqCst), 1);
        assert_eq!(effects.rate_driver.load(Ordering::SeqCst), 0);
        assert_eq!(effects.rate_passenger.load(Ordering::SeqCst), 1);

        handle.abort();
    }
}
