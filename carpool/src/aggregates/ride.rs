//! The Ride aggregate: a driver's published trip together with its
//! bookings. Capacity (`seatsLeft`/`luggageLeft`) and booking decisions are
//! tightly coupled — a booking can only move to `accepted` while capacity
//! allows it — so, grounded on the ticketing example's `InventoryReducer`
//! (which keeps `sections` and their `reservations` in one stream so a
//! reservation and its capacity decrement are the same append), both the
//! ride and its bookings live in a single event stream per ride.

use std::sync::Arc;

use carpool_core::effect::Effect;
use carpool_core::environment::Clock;
use carpool_core::event::Event;
use carpool_core::event_bus::EventBus;
use carpool_core::event_store::EventStore;
use carpool_core::reducer::Reducer;
use carpool_core::stream::Version;
use carpool_macros::{Action, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::service::{persist_and_publish, ConflictAware, VersionedEnvironment};
use crate::types::{
    BookingId, Direction, GeoPoint, Money, PaymentMethod, RefundReason, RideId, UserId,
};

/// Topic this aggregate's events are published to for projections/notifications.
pub const TOPIC: &str = "ride-events";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Active,
    Cancelled,
    Completed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Failed,
    Refunded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub driver_id: UserId,
    pub airport_id: crate::types::AirportId,
    pub direction: Direction,
    pub home: GeoPoint,
    pub departure_at: DateTime<Utc>,
    pub seats_total: u32,
    pub seats_left: u32,
    pub luggage_total: u32,
    pub luggage_left: u32,
    pub price_per_seat: Money,
    pub route: Vec<GeoPoint>,
    pub status: RideStatus,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub ride_id: RideId,
    pub passenger_id: UserId,
    pub seats: u32,
    pub luggage: u32,
    pub status: BookingStatus,
    pub pickup: Option<GeoPoint>,
    pub dropoff: Option<GeoPoint>,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub psp_intent_id: Option<String>,
    pub refund_reason: Option<RefundReason>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, BookingStatus::Rejected | BookingStatus::Cancelled)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, State)]
pub struct RideState {
    pub ride: Option<Ride>,
    pub bookings: Vec<Booking>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub conflict: bool,
    #[version]
    pub version: Option<Version>,
}

impl RideState {
    #[must_use]
    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    fn booking_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    #[must_use]
    pub fn accepted_seats(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Accepted)
            .map(|b| b.seats)
            .sum()
    }
}

impl ConflictAware for RideState {
    fn take_conflict(&mut self) -> bool {
        std::mem::take(&mut self.conflict)
    }
}

#[derive(Clone, Debug, Action, Serialize, Deserialize)]
pub enum RideAction {
    #[command]
    PublishRide {
        ride_id: RideId,
        driver_id: UserId,
        airport_id: crate::types::AirportId,
        direction: Direction,
        home: GeoPoint,
        departure_at: DateTime<Utc>,
        seats_total: u32,
        luggage_total: u32,
        price_per_seat: Money,
        route: Vec<GeoPoint>,
        comment: Option<String>,
        now: DateTime<Utc>,
    },
    #[command]
    CreateBooking {
        booking_id: BookingId,
        passenger_id: UserId,
        seats: u32,
        luggage: u32,
        pickup: Option<GeoPoint>,
        dropoff: Option<GeoPoint>,
        now: DateTime<Utc>,
    },
    /// Reserves capacity and creates an already-`accepted`+`paid` booking.
    /// Used for both card payment (after the PSP intent succeeded) and
    /// wallet payment (after the passenger's wallet was debited) — the
    /// service layer is responsible for the payment step and for refunding
    /// if this command fails.
    #[command]
    ReserveAndBook {
        booking_id: BookingId,
        passenger_id: UserId,
        seats: u32,
        luggage: u32,
        payment_method: PaymentMethod,
        psp_intent_id: Option<String>,
        now: DateTime<Utc>,
    },
    #[command]
    TransitionBooking {
        booking_id: BookingId,
        actor_id: UserId,
        to: BookingStatus,
        now: DateTime<Utc>,
    },
    /// Cancels an accepted, paid booking. Passenger-initiated cancellation
    /// is only allowed `>= 24h` before departure; `reason` distinguishes
    /// who/what drove the cancellation so the service layer's refund fan-out
    /// can key off it without a second lookup. A driver-driven cancellation
    /// (`reason = DriverCancelled` or `RideCancelled`) skips both the actor
    /// and window checks, since it is only ever issued internally as part of
    /// `CancelRide`'s cascade.
    #[command]
    CancelBooking {
        booking_id: BookingId,
        actor_id: UserId,
        reason: RefundReason,
        now: DateTime<Utc>,
    },
    #[command]
    CancelRide { now: DateTime<Utc> },
    #[command]
    CompleteRide { now: DateTime<Utc> },

    #[event]
    RidePublished { ride: Box<Ride> },
    #[event]
    BookingCreated { booking: Box<Booking> },
    #[event]
    BookingReserved { booking: Box<Booking> },
    #[event]
    BookingTransitioned {
        booking_id: BookingId,
        to: BookingStatus,
        seats_released: u32,
        luggage_released: u32,
    },
    #[event]
    BookingCancelled {
        booking_id: BookingId,
        reason: RefundReason,
        seats_released: u32,
        luggage_released: u32,
    },
    #[event]
    RideCancelled,
    #[event]
    RideCompleted,
    #[event]
    ValidationFailed { reason: String },

    /// Internal bookkeeping actions fed back by the effect chain; never
    /// persisted (see `reduce`'s catch-all arm).
    #[event]
    PersistConflict,
    #[event]
    PersistFailed { reason: String },
}

impl Event for RideAction {
    fn event_type(&self) -> &'static str {
        self.event_type()
    }
}

pub struct RideEnvironment {
    pub event_store: Arc<dyn EventStore>,
    pub event_bus: Arc<dyn EventBus>,
    pub clock: Arc<dyn Clock>,
    pub version_cell: Arc<RwLock<Version>>,
    pub stream_id: carpool_core::stream::StreamId,
}

impl VersionedEnvironment for RideEnvironment {
    fn version_cell(&self) -> &Arc<RwLock<Version>> {
        &self.version_cell
    }
}

#[derive(Default)]
pub struct RideReducer;

impl RideReducer {
    fn emit(env: &RideEnvironment, event: RideAction) -> Vec<Effect<RideAction>> {
        let event_store = env.event_store.clone();
        let event_bus = env.event_bus.clone();
        let version_cell = env.version_cell.clone();
        let stream_id = env.stream_id.clone();
        vec![Effect::Future(Box::pin(async move {
            match persist_and_publish(&event_store, &event_bus, &version_cell, stream_id, TOPIC, &event)
                .await
            {
                Ok(()) => Some(event),
                Err(carpool_core::event_store::EventStoreError::ConcurrencyConflict { .. }) => {
                    Some(RideAction::PersistConflict)
                }
                Err(err) => Some(RideAction::PersistFailed {
                    reason: err.to_string(),
                }),
            }
        }))]
    }

    fn fail(env: &RideEnvironment, reason: impl Into<String>) -> Vec<Effect<RideAction>> {
        Self::emit(
            env,
            RideAction::ValidationFailed {
                reason: reason.into(),
            },
        )
    }
}

impl Reducer for RideReducer {
    type State = RideState;
    type Action = RideAction;
    type Environment = RideEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Vec<Effect<Self::Action>> {
        match action {
            RideAction::PublishRide {
                ride_id,
                driver_id,
                airport_id,
                direction,
                home,
                departure_at,
                seats_total,
                luggage_total,
                price_per_seat,
                route,
                comment,
                now,
            } => {
                if state.ride.is_some() {
                    return Self::fail(env, "ride already published");
                }
                if seats_total == 0 {
                    return Self::fail(env, "a ride needs at least one seat");
                }
                if departure_at <= now {
                    return Self::fail(env, "departure time must be in the future");
                }
                let ride = Ride {
                    id: ride_id,
                    driver_id,
                    airport_id,
                    direction,
                    home,
                    departure_at,
                    seats_total,
                    seats_left: seats_total,
                    luggage_total,
                    luggage_left: luggage_total,
                    price_per_seat,
                    route,
                    status: RideStatus::Active,
                    comment,
                    created_at: now,
                };
                Self::emit(env, RideAction::RidePublished { ride: Box::new(ride) })
            }

            RideAction::CreateBooking {
                booking_id,
                passenger_id,
                seats,
                luggage,
                pickup,
                dropoff,
                now,
            } => {
                let Some(ride) = &state.ride else {
                    return Self::fail(env, "ride not found");
                };
                if ride.status != RideStatus::Active {
                    return Self::fail(env, "ride is not active");
                }
                if ride.departure_at <= now {
                    return Self::fail(env, "ride has already departed");
                }
                if ride.driver_id == passenger_id {
                    return Self::fail(env, "a driver cannot book their own ride");
                }
                if state.bookings.iter().any(|b| b.passenger_id == passenger_id && !b.is_terminal()) {
                    return Self::fail(env, "a passenger may only have one active booking per ride");
                }
                if seats > ride.seats_left {
                    return Self::fail(env, "not enough seats left");
                }
                if luggage > ride.luggage_left {
                    return Self::fail(env, "not enough luggage capacity left");
                }
                let booking = Booking {
                    id: booking_id,
                    ride_id: ride.id,
                    passenger_id,
                    seats,
                    luggage,
                    status: BookingStatus::Pending,
                    pickup,
                    dropoff,
                    payment_status: PaymentStatus::Unpaid,
                    payment_method: PaymentMethod::None,
                    psp_intent_id: None,
                    refund_reason: None,
                    refunded_at: None,
                    created_at: now,
                };
                Self::emit(env, RideAction::BookingCreated { booking: Box::new(booking) })
            }

            RideAction::ReserveAndBook {
                booking_id,
                passenger_id,
                seats,
                luggage,
                payment_method,
                psp_intent_id,
                now,
            } => {
                let Some(ride) = &state.ride else {
                    return Self::fail(env, "ride not found");
                };
                if ride.status != RideStatus::Active {
                    return Self::fail(env, "ride is not active");
                }
                if seats > ride.seats_left {
                    return Self::fail(env, "not enough seats left");
                }
                if luggage > ride.luggage_left {
                    return Self::fail(env, "not enough luggage capacity left");
                }
                let booking = Booking {
                    id: booking_id,
                    ride_id: ride.id,
                    passenger_id,
                    seats,
                    luggage,
                    status: BookingStatus::Accepted,
                    pickup: None,
                    dropoff: None,
                    payment_status: PaymentStatus::Paid,
                    payment_method,
                    psp_intent_id,
                    refund_reason: None,
                    refunded_at: None,
                    created_at: now,
                };
                Self::emit(env, RideAction::BookingReserved { booking: Box::new(booking) })
            }

            RideAction::TransitionBooking {
                booking_id,
                actor_id,
                to,
                now: _,
            } => {
                let Some(ride) = state.ride.clone() else {
                    return Self::fail(env, "ride not found");
                };
                let Some(booking) = state.booking(booking_id) else {
                    return Self::fail(env, "booking not found");
                };
                let allowed = match (booking.status, to) {
                    (BookingStatus::Pending, BookingStatus::Accepted) => actor_id == ride.driver_id,
                    (BookingStatus::Pending, BookingStatus::Rejected) => actor_id == ride.driver_id,
                    (BookingStatus::Pending, BookingStatus::Cancelled) => {
                        actor_id == booking.passenger_id
                    }
                    _ => false,
                };
                if !allowed {
                    return Self::fail(env, "illegal booking transition");
                }
                let (seats_released, luggage_released) = if to == BookingStatus::Accepted {
                    if booking.seats > ride.seats_left || booking.luggage > ride.luggage_left {
                        return Self::fail(env, "not enough capacity left to accept this booking");
                    }
                    (0, 0)
                } else {
                    (0, 0)
                };
                Self::emit(
                    env,
                    RideAction::BookingTransitioned {
                        booking_id,
                        to,
                        seats_released,
                        luggage_released,
                    },
                )
            }

            RideAction::CancelBooking {
                booking_id,
                actor_id,
                reason,
                now,
            } => {
                let Some(ride) = &state.ride else {
                    return Self::fail(env, "ride not found");
                };
                let departure_at = ride.departure_at;
                let Some(booking) = state.booking(booking_id) else {
                    return Self::fail(env, "booking not found");
                };
                if booking.status != BookingStatus::Accepted {
                    return Self::fail(env, "only an accepted booking can be cancelled");
                }
                if reason == RefundReason::PassengerCancelled {
                    if actor_id != booking.passenger_id {
                        return Self::fail(env, "only the passenger may cancel their own booking");
                    }
                    if departure_at - now < chrono::Duration::hours(24) {
                        return Self::fail(env, "cancellation window has passed (24h)");
                    }
                }
                Self::emit(
                    env,
                    RideAction::BookingCancelled {
                        booking_id,
                        reason,
                        seats_released: booking.seats,
                        luggage_released: booking.luggage,
                    },
                )
            }

            RideAction::CancelRide { now } => {
                let Some(ride) = &state.ride else {
                    return Self::fail(env, "ride not found");
                };
                if ride.status != RideStatus::Active {
                    return Self::fail(env, "ride is not active");
                }
                if ride.departure_at - now <= chrono::Duration::hours(12) {
                    return Self::fail(env, "cancellation window has passed (12h)");
                }
                Self::emit(env, RideAction::RideCancelled)
            }

            RideAction::CompleteRide { now } => {
                let Some(ride) = &state.ride else {
                    return Self::fail(env, "ride not found");
                };
                if ride.status != RideStatus::Active {
                    return vec![Effect::None];
                }
                if now < ride.departure_at + chrono::Duration::minutes(30) {
                    return Self::fail(env, "ride is not yet eligible for completion");
                }
                Self::emit(env, RideAction::RideCompleted)
            }

            // --- pure event application: mutate state, no further effects ---
            RideAction::RidePublished { ride } => {
                state.ride = Some(*ride);
                vec![Effect::None]
            }
            RideAction::BookingCreated { booking } => {
                state.bookings.push(*booking);
                vec![Effect::None]
            }
            RideAction::BookingReserved { booking } => {
                if let Some(ride) = &mut state.ride {
                    ride.seats_left = ride.seats_left.saturating_sub(booking.seats);
                    ride.luggage_left = ride.luggage_left.saturating_sub(booking.luggage);
                }
                state.bookings.push(*booking);
                vec![Effect::None]
            }
            RideAction::BookingTransitioned {
                booking_id,
                to,
                seats_released,
                luggage_released,
            } => {
                let was_accepted = state
                    .booking(booking_id)
                    .is_some_and(|b| b.status == BookingStatus::Accepted);
                if to == BookingStatus::Accepted {
                    if let Some(booking) = state.booking(booking_id).cloned() {
                        if let Some(ride) = &mut state.ride {
                            ride.seats_left = ride.seats_left.saturating_sub(booking.seats);
                            ride.luggage_left = ride.luggage_left.saturating_sub(booking.luggage);
                        }
                    }
                } else if was_accepted {
                    if let Some(ride) = &mut state.ride {
                        ride.seats_left = ride.seats_left.saturating_add(seats_released);
                        ride.luggage_left = ride.luggage_left.saturating_add(luggage_released);
                    }
                }
                if let Some(booking) = state.booking_mut(booking_id) {
                    booking.status = to;
                }
                vec![Effect::None]
            }
            RideAction::BookingCancelled {
                booking_id,
                reason,
                seats_released,
                luggage_released,
            } => {
                if let Some(ride) = &mut state.ride {
                    ride.seats_left = ride.seats_left.saturating_add(seats_released);
                    ride.luggage_left = ride.luggage_left.saturating_add(luggage_released);
                }
                if let Some(booking) = state.booking_mut(booking_id) {
                    booking.status = BookingStatus::Cancelled;
                    booking.payment_status = PaymentStatus::Refunded;
                    booking.refund_reason = Some(reason);
                }
                vec![Effect::None]
            }
            RideAction::RideCancelled => {
                if let Some(ride) = &mut state.ride {
                    ride.status = RideStatus::Cancelled;
                }
                // Cascade onto every non-terminal booking in the same append:
                // the refund fan-out for previously-accepted ones is a
                // service-layer concern driven off the pre-cancel snapshot,
                // but the booking status itself belongs in this one event so
                // a reader of this stream never observes a cancelled ride
                // with a still-pending or still-accepted booking on it.
                for booking in &mut state.bookings {
                    if !booking.is_terminal() {
                        let was_paid = booking.payment_status == PaymentStatus::Paid;
                        booking.status = BookingStatus::Cancelled;
                        booking.refund_reason = Some(RefundReason::RideCancelled);
                        if was_paid {
                            booking.payment_status = PaymentStatus::Refunded;
                        }
                    }
                }
                vec![Effect::None]
            }
            RideAction::RideCompleted => {
                if let Some(ride) = &mut state.ride {
                    ride.status = RideStatus::Completed;
                }
                vec![Effect::None]
            }
            RideAction::ValidationFailed { reason } => {
                state.last_error = Some(reason);
                vec![Effect::None]
            }
            RideAction::PersistConflict => {
                state.conflict = true;
                vec![Effect::None]
            }
            RideAction::PersistFailed { reason } => {
                state.last_error = Some(reason);
                vec![Effect::None]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AirportId;
    use carpool_testing::{mocks::test_clock, InMemoryEventBus, InMemoryEventStore};
    use std::sync::Arc;

    fn env() -> (RideEnvironment, carpool_core::stream::StreamId) {
        let stream_id = carpool_core::stream::StreamId::new("ride-test");
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::default());
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::default());
        (
            RideEnvironment {
                event_store,
                event_bus,
                clock: Arc::new(test_clock()),
                version_cell: Arc::new(RwLock::new(Version::INITIAL)),
                stream_id: stream_id.clone(),
            },
            stream_id,
        )
    }

    fn publish_action(now: DateTime<Utc>) -> RideAction {
        RideAction::PublishRide {
            ride_id: RideId::new(),
            driver_id: UserId::new(),
            airport_id: AirportId::new(),
            direction: Direction::ToAirport,
            home: GeoPoint::new(2.35, 48.85),
            departure_at: now + chrono::Duration::hours(24),
            seats_total: 3,
            luggage_total: 3,
            price_per_seat: Money::from_minor(2000),
            route: vec![],
            comment: None,
            now,
        }
    }

    #[tokio::test]
    async fn publishing_a_ride_sets_full_capacity() {
        let (env, _sid) = env();
        let now = env.clock.now();
        let mut state = RideState::default();
        let effects = RideReducer.reduce(&mut state, publish_action(now), &env);
        let produced = super_drain(effects).await;
        let mut state2 = state;
        for action in produced {
            RideReducer.reduce(&mut state2, action, &env);
        }
        let ride = state2.ride.expect("ride should be published");
        assert_eq!(ride.seats_left, 3);
        assert_eq!(ride.status, RideStatus::Active);
    }

    #[tokio::test]
    async fn booking_more_seats_than_available_fails() {
        let (env, _sid) = env();
        let now = env.clock.now();
        let mut state = RideState::default();
        let published = super_drain(RideReducer.reduce(&mut state, publish_action(now), &env)).await;
        for a in published {
            RideReducer.reduce(&mut state, a, &env);
        }

        let cmd = RideAction::CreateBooking {
            booking_id: BookingId::new(),
            passenger_id: UserId::new(),
            seats: 10,
            luggage: 0,
            pickup: None,
            dropoff: None,
            now,
        };
        let events = super_drain(RideReducer.reduce(&mut state, cmd, &env)).await;
        for a in events {
            RideReducer.reduce(&mut state, a, &env);
        }
        assert_eq!(
            state.last_error.as_deref(),
            Some("not enough seats left")
        );
        assert!(state.bookings.is_empty());
    }

    /// Minimal inline effect drain for tests (mirrors `service::drain_effects`
    /// without exposing it as a public API surface).
    async fn super_drain(effects: Vec<Effect<RideAction>>) -> Vec<RideAction> {
        let mut out = Vec::new();
        for effect in effects {
            if let Effect::Future(fut) = effect {
                if let Some(action) = fut.await {
                    out.push(action);
                }
            }
        }
        out
    }
}
