//! Ratings: a passenger rating a driver or a driver rating a passenger,
//! gated by the rateable window (invariant I7: `now >= departureAt + 30min`)
//! and unique per `(bookingId, fromUserId)`.
//!
//! Grounded on the same "validate against a read model before writing" shape
//! as `scheduler::RatingSweepSource` (which already queries the same
//! `ratings` table to decide whether a sweep notification is still due) —
//! this module is the write side that table was missing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BookingId, RatingId, RideId, UserId};
use crate::DomainError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingType {
    DriverToPassenger,
    PassengerToDriver,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rating {
    pub id: RatingId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub booking_id: BookingId,
    pub ride_id: RideId,
    pub rating_type: RatingType,
    pub stars: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What `RatingService` needs to know about the booking being rated, read
/// from the `rides`/`bookings` projections rather than replayed from the
/// aggregate streams — a rating has no bearing on ride/booking state, so
/// there is no reason to pay for a full stream replay to check eligibility.
#[derive(Clone, Copy, Debug)]
pub struct RatableBooking {
    pub ride_id: RideId,
    pub departure_at: DateTime<Utc>,
    pub driver_id: UserId,
    pub passenger_id: UserId,
    pub booking_accepted: bool,
}

pub trait RatingStore: Send + Sync {
    fn find_booking(
        &self,
        booking_id: BookingId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<RatableBooking>> + Send + '_>>;

    fn already_rated(
        &self,
        booking_id: BookingId,
        from_user_id: UserId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>>;

    fn insert(
        &self,
        rating: Rating,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), DomainError>> + Send + '_>>;

    fn stats_for_user(
        &self,
        user_id: UserId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RatingStats> + Send + '_>>;
}

#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct RatingStats {
    pub mean: f64,
    pub count: u64,
}

pub struct RatingService<S> {
    store: S,
    clock: std::sync::Arc<dyn carpool_core::environment::Clock>,
}

const RATEABLE_DELAY: chrono::Duration = chrono::Duration::minutes(30);

impl<S: RatingStore> RatingService<S> {
    pub const fn new(store: S, clock: std::sync::Arc<dyn carpool_core::environment::Clock>) -> Self {
        Self { store, clock }
    }

    /// Whether `user_id` (either side of the booking) may currently rate
    /// the other side of `booking_id`: the rateable window has opened, the
    /// booking was accepted, and no rating from this user exists yet for it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the booking does not exist, or
    /// `DomainError::Forbidden` if `user_id` was neither the driver nor the
    /// passenger on it.
    pub async fn can_rate(&self, booking_id: BookingId, user_id: UserId) -> Result<bool, DomainError> {
        let booking = self.booking_for(booking_id, user_id).await?;
        if !booking.booking_accepted {
            return Ok(false);
        }
        if self.clock.now() < booking.departure_at + RATEABLE_DELAY {
            return Ok(false);
        }
        Ok(!self.store.already_rated(booking_id, user_id).await)
    }

    /// Creates a rating from `from_user_id` for the other party on
    /// `booking_id`. Direction (`driver_to_passenger` vs `passenger_to_driver`)
    /// is inferred from which side of the booking `from_user_id` is on.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for out-of-range stars or a booking
    /// not yet in its rateable window, `DomainError::Forbidden` if the rater
    /// was not a party to the booking, and `DomainError::Conflict` if this
    /// user already rated this booking.
    pub async fn create_rating(
        &self,
        booking_id: BookingId,
        from_user_id: UserId,
        stars: u8,
        comment: Option<String>,
    ) -> Result<Rating, DomainError> {
        if !(1..=5).contains(&stars) {
            return Err(DomainError::Validation("stars must be between 1 and 5".into()));
        }
        let booking = self.booking_for(booking_id, from_user_id).await?;
        if !booking.booking_accepted {
            return Err(DomainError::Validation(
                "only an accepted booking can be rated".into(),
            ));
        }
        let now = self.clock.now();
        if now < booking.departure_at + RATEABLE_DELAY {
            return Err(DomainError::Validation(
                "rating window has not opened yet".into(),
            ));
        }
        if self.store.already_rated(booking_id, from_user_id).await {
            return Err(DomainError::Conflict("already rated".into()));
        }

        let (rating_type, to_user_id) = if from_user_id == booking.driver_id {
            (RatingType::DriverToPassenger, booking.passenger_id)
        } else {
            (RatingType::PassengerToDriver, booking.driver_id)
        };

        let rating = Rating {
            id: RatingId::new(),
            from_user_id,
            to_user_id,
            booking_id,
            ride_id: booking.ride_id,
            rating_type,
            stars,
            comment,
            created_at: now,
        };
        self.store.insert(rating.clone()).await?;
        Ok(rating)
    }

    /// # Errors
    ///
    /// Returns `DomainError` if the store cannot be reached.
    pub async fn stats_for_user(&self, user_id: UserId) -> Result<RatingStats, DomainError> {
        Ok(self.store.stats_for_user(user_id).await)
    }

    async fn booking_for(
        &self,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<RatableBooking, DomainError> {
        let booking = self.store.find_booking(booking_id).await.ok_or(DomainError::NotFound {
            resource: "booking",
            id: booking_id.to_string(),
        })?;
        if booking.driver_id != user_id && booking.passenger_id != user_id {
            return Err(DomainError::Forbidden(
                "only the driver or passenger on this booking may rate it".into(),
            ));
        }
        Ok(booking)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use carpool_core::environment::Clock as _;
    use carpool_testing::mocks::test_clock;
    use std::sync::Mutex;

    struct FakeStore {
        booking: RatableBooking,
        rated: Mutex<Vec<(BookingId, UserId)>>,
    }

    impl RatingStore for FakeStore {
        fn find_booking(
            &self,
            _booking_id: BookingId,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<RatableBooking>> + Send + '_>>
        {
            Box::pin(async move { Some(self.booking) })
        }

        fn already_rated(
            &self,
            booking_id: BookingId,
            from_user_id: UserId,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
            Box::pin(async move { self.rated.lock().unwrap().contains(&(booking_id, from_user_id)) })
        }

        fn insert(
            &self,
            rating: Rating,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), DomainError>> + Send + '_>>
        {
            Box::pin(async move {
                self.rated.lock().unwrap().push((rating.booking_id, rating.from_user_id));
                Ok(())
            })
        }

        fn stats_for_user(
            &self,
            _user_id: UserId,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RatingStats> + Send + '_>> {
            Box::pin(async { RatingStats::default() })
        }
    }

    fn booking(departure_at: DateTime<Utc>) -> (RatableBooking, BookingId, UserId, UserId) {
        let booking_id = BookingId::new();
        let driver_id = UserId::new();
        let passenger_id = UserId::new();
        (
            RatableBooking {
                ride_id: RideId::new(),
                departure_at,
                driver_id,
                passenger_id,
                booking_accepted: true,
            },
            booking_id,
            driver_id,
            passenger_id,
        )
    }

    #[tokio::test]
    async fn cannot_rate_before_window_opens() {
        let clock = test_clock();
        let now = clock.now();
        let (booking, booking_id, driver_id, _passenger_id) = booking(now - chrono::Duration::minutes(29));
        let store = FakeStore { booking, rated: Mutex::new(Vec::new()) };
        let service = RatingService::new(store, std::sync::Arc::new(clock));

        let err = service
            .create_rating(booking_id, driver_id, 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn second_rating_from_same_user_conflicts() {
        let clock = test_clock();
        let now = clock.now();
        let (booking, booking_id, driver_id, _passenger_id) = booking(now - chrono::Duration::minutes(31));
        let store = FakeStore { booking, rated: Mutex::new(Vec::new()) };
        let service = RatingService::new(store, std::sync::Arc::new(clock));

        service.create_rating(booking_id, driver_id, 4, None).await.unwrap();
        let err = service.create_rating(booking_id, driver_id, 4, None).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn direction_is_inferred_from_rater_side() {
        let clock = test_clock();
        let now = clock.now();
        let (booking, booking_id, _driver_id, passenger_id) = booking(now - chrono::Duration::minutes(31));
        let store = FakeStore { booking, rated: Mutex::new(Vec::new()) };
        let service = RatingService::new(store, std::sync::Arc::new(clock));

        let rating = service
            .create_rating(booking_id, passenger_id, 3, Some("fine".into()))
            .await
            .unwrap();
        assert_eq!(rating.rating_type, RatingType::PassengerToDriver);
        assert_eq!(rating.to_user_id, booking.driver_id);
    }
}
