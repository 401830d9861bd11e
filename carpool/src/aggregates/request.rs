//! The `RideRequest` aggregate: a passenger's open request for a ride, and
//! the driver offers made against it. An offer's acceptance is a payment
//! decision (card or wallet) just like a direct booking, so this reducer
//! mirrors `RideReducer`'s `ReserveAndBook` split between "offer accepted"
//! and "payment settled, offer finalized" rather than collapsing both into
//! one step.

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
    AirportId, Direction, GeoPoint, Money, OfferId, PaymentMethod, RideId, RideRequestId, UserId,
};

pub const TOPIC: &str = "request-events";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Matched,
    Expired,
    Cancelled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: RideRequestId,
    pub passenger_id: UserId,
    pub airport_id: AirportId,
    pub direction: Direction,
    pub home: GeoPoint,
    pub earliest_at: DateTime<Utc>,
    pub latest_at: DateTime<Utc>,
    pub seats: u32,
    pub luggage: u32,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub request_id: RideRequestId,
    pub ride_id: RideId,
    pub driver_id: UserId,
    pub price: Money,
    pub status: OfferStatus,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, State)]
pub struct RequestState {
    pub request: Option<RideRequest>,
    pub offers: Vec<Offer>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub conflict: bool,
    #[version]
    pub version: Option<Version>,
}

impl RequestState {
    fn offer_mut(&mut self, id: OfferId) -> Option<&mut Offer> {
        self.offers.iter_mut().find(|o| o.id == id)
    }
}

impl ConflictAware for RequestState {
    fn take_conflict(&mut self) -> bool {
        std::mem::take(&mut self.conflict)
    }
}

#[derive(Clone, Debug, Action, Serialize, Deserialize)]
pub enum RequestAction {
    #[command]
    CreateRequest {
        request_id: RideRequestId,
        passenger_id: UserId,
        airport_id: AirportId,
        direction: Direction,
        home: GeoPoint,
        earliest_at: DateTime<Utc>,
        latest_at: DateTime<Utc>,
        seats: u32,
        luggage: u32,
        now: DateTime<Utc>,
    },
    #[command]
    MakeOffer {
        offer_id: OfferId,
        ride_id: RideId,
        driver_id: UserId,
        price: Money,
        now: DateTime<Utc>,
    },
    /// Finalizes an offer after the passenger's payment (card or wallet)
    /// has settled; the service layer drives the payment step and calls
    /// this only once it has succeeded.
    #[command]
    AcceptOffer {
        offer_id: OfferId,
        payment_method: PaymentMethod,
        now: DateTime<Utc>,
    },
    #[command]
    RejectOffer { offer_id: OfferId, now: DateTime<Utc> },
    #[command]
    CancelRequest { now: DateTime<Utc> },
    #[command]
    ExpireRequest { now: DateTime<Utc> },

    #[event]
    RequestCreated { request: Box<RideRequest> },
    #[event]
    OfferMade { offer: Box<Offer> },
    #[event]
    OfferAccepted {
        offer_id: OfferId,
        payment_method: PaymentMethod,
    },
    #[event]
    OfferRejected { offer_id: OfferId },
    #[event]
    RequestCancelled,
    #[event]
    RequestExpired,
    #[event]
    ValidationFailed { reason: String },
    #[event]
    PersistConflict,
    #[event]
    PersistFailed { reason: String },
}

impl Event for RequestAction {
    fn event_type(&self) -> &'static str {
        self.event_type()
    }
}

pub struct RequestEnvironment {
    pub event_store: Arc<dyn EventStore>,
    pub event_bus: Arc<dyn EventBus>,
    pub clock: Arc<dyn Clock>,
    pub version_cell: Arc<RwLock<Version>>,
    pub stream_id: carpool_core::stream::StreamId,
}

impl VersionedEnvironment for RequestEnvironment {
    fn version_cell(&self) -> &Arc<RwLock<Version>> {
        &self.version_cell
    }
}

#[derive(Default)]
pub struct RequestReducer;

impl RequestReducer {
    fn emit(env: &RequestEnvironment, event: RequestAction) -> Vec<Effect<RequestAction>> {
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
                    Some(RequestAction::PersistConflict)
                }
                Err(err) => Some(RequestAction::PersistFailed {
                    reason: err.to_string(),
                }),
            }
        }))]
    }

    fn fail(env: &RequestEnvironment, reason: impl Into<String>) -> Vec<Effect<RequestAction>> {
        Self::emit(
            env,
            RequestAction::ValidationFailed {
                reason: reason.into(),
            },
        )
    }
}

impl Reducer for RequestReducer {
    type State = RequestState;
    type Action = RequestAction;
    type Environment = RequestEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Vec<Effect<Self::Action>> {
        match action {
            RequestAction::CreateRequest {
                request_id,
                passenger_id,
                airport_id,
                direction,
                home,
                earliest_at,
                latest_at,
                seats,
                luggage,
                now,
            } => {
                if state.request.is_some() {
                    return Self::fail(env, "request already created");
                }
                if latest_at <= earliest_at {
                    return Self::fail(env, "latest_at must be after earliest_at");
                }
                if seats == 0 {
                    return Self::fail(env, "a request needs at least one seat");
                }
                let request = RideRequest {
                    id: request_id,
                    passenger_id,
                    airport_id,
                    direction,
                    home,
                    earliest_at,
                    latest_at,
                    seats,
                    luggage,
                    status: RequestStatus::Open,
                    created_at: now,
                    expires_at: latest_at,
                };
                Self::emit(env, RequestAction::RequestCreated { request: Box::new(request) })
            }

            RequestAction::MakeOffer {
                offer_id,
                ride_id,
                driver_id,
                price,
                now,
            } => {
                let Some(request) = &state.request else {
                    return Self::fail(env, "request not found");
                };
                if request.status != RequestStatus::Open {
                    return Self::fail(env, "request is not open");
                }
                if state.offers.iter().any(|o| o.driver_id == driver_id && o.status == OfferStatus::Pending) {
                    return Self::fail(env, "driver already has a pending offer on this request");
                }
                let offer = Offer {
                    id: offer_id,
                    request_id: request.id,
                    ride_id,
                    driver_id,
                    price,
                    status: OfferStatus::Pending,
                    payment_method: PaymentMethod::None,
                    created_at: now,
                };
                Self::emit(env, RequestAction::OfferMade { offer: Box::new(offer) })
            }

            RequestAction::AcceptOffer {
                offer_id,
                payment_method,
                now: _,
            } => {
                let Some(request) = &state.request else {
                    return Self::fail(env, "request not found");
                };
                if request.status != RequestStatus::Open {
                    return Self::fail(env, "request is not open");
                }
                let Some(offer) = state.offers.iter().find(|o| o.id == offer_id) else {
                    return Self::fail(env, "offer not found");
                };
                if offer.status != OfferStatus::Pending {
                    return Self::fail(env, "offer is not pending");
                }
                Self::emit(
                    env,
                    RequestAction::OfferAccepted { offer_id, payment_method },
                )
            }

            RequestAction::RejectOffer { offer_id, now: _ } => {
                let Some(offer) = state.offers.iter().find(|o| o.id == offer_id) else {
                    return Self::fail(env, "offer not found");
                };
                if offer.status != OfferStatus::Pending {
                    return Self::fail(env, "offer is not pending");
                }
                Self::emit(env, RequestAction::OfferRejected { offer_id })
            }

            RequestAction::CancelRequest { now: _ } => {
                let Some(request) = &state.request else {
                    return Self::fail(env, "request not found");
                };
                if request.status != RequestStatus::Open {
                    return Self::fail(env, "request is not open");
                }
                Self::emit(env, RequestAction::RequestCancelled)
            }

            RequestAction::ExpireRequest { now } => {
                let Some(request) = &state.request else {
                    return vec![Effect::None];
                };
                if request.status != RequestStatus::Open || now < request.expires_at {
                    return vec![Effect::None];
                }
                Self::emit(env, RequestAction::RequestExpired)
            }

            RequestAction::RequestCreated { request } => {
                state.request = Some(*request);
                vec![Effect::None]
            }
            RequestAction::OfferMade { offer } => {
                state.offers.push(*offer);
                vec![Effect::None]
            }
            RequestAction::OfferAccepted { offer_id, payment_method } => {
                if let Some(offer) = state.offer_mut(offer_id) {
                    offer.status = OfferStatus::Accepted;
                    offer.payment_method = payment_method;
                }
                let accepted_ride = state.offers.iter().find(|o| o.id == offer_id).map(|o| o.ride_id);
                if let Some(request) = &mut state.request {
                    request.status = RequestStatus::Matched;
                }
                for offer in &mut state.offers {
                    if offer.id != offer_id && offer.status == OfferStatus::Pending {
                        offer.status = OfferStatus::Withdrawn;
                    }
                }
                let _ = accepted_ride;
                vec![Effect::None]
            }
            RequestAction::OfferRejected { offer_id } => {
                if let Some(offer) = state.offer_mut(offer_id) {
                    offer.status = OfferStatus::Rejected;
                }
                vec![Effect::None]
            }
            RequestAction::RequestCancelled => {
                if let Some(request) = &mut state.request {
                    request.status = RequestStatus::Cancelled;
                }
                vec![Effect::None]
            }
            RequestAction::RequestExpired => {
                if let Some(request) = &mut state.request {
                    request.status = RequestStatus::Expired;
                }
                vec![Effect::None]
            }
            RequestAction::ValidationFailed { reason } => {
                state.last_error = Some(reason);
                vec![Effect::None]
            }
            RequestAction::PersistConflict => {
                state.conflict = true;
                vec![Effect::None]
            }
            RequestAction::PersistFailed { reason } => {
                state.last_error = Some(reason);
                vec![Effect::None]
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use carpool_testing::{mocks::test_clock, InMemoryEventBus, InMemoryEventStore};

    fn env() -> RequestEnvironment {
        RequestEnvironment {
            event_store: Arc::new(InMemoryEventStore::default()),
            event_bus: Arc::new(InMemoryEventBus::default()),
            clock: Arc::new(test_clock()),
            version_cell: Arc::new(RwLock::new(Version::INITIAL)),
            stream_id: carpool_core::stream::StreamId::new("request-test"),
        }
    }

    async fn drain(effects: Vec<Effect<RequestAction>>) -> Vec<RequestAction> {
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

    #[tokio::test]
    async fn accepting_one_offer_withdraws_the_others() {
        let env = env();
        let now = env.clock.now();
        let mut state = RequestState::default();
        for a in drain(RequestReducer.reduce(
            &mut state,
            RequestAction::CreateRequest {
                request_id: RideRequestId::new(),
                passenger_id: UserId::new(),
                airport_id: AirportId::new(),
                direction: Direction::ToAirport,
                home: GeoPoint::new(2.35, 48.85),
                earliest_at: now,
                latest_at: now + chrono::Duration::hours(6),
                seats: 1,
                luggage: 1,
                now,
            },
            &env,
        ))
        .await
        {
            RequestReducer.reduce(&mut state, a, &env);
        }

        let offer_a = OfferId::new();
        let offer_b = OfferId::new();
        for (offer_id, driver) in [(offer_a, UserId::new()), (offer_b, UserId::new())] {
            for a in drain(RequestReducer.reduce(
                &mut state,
                RequestAction::MakeOffer {
                    offer_id,
                    ride_id: RideId::new(),
                    driver_id: driver,
                    price: Money::from_minor(1500),
                    now,
                },
                &env,
            ))
            .await
            {
                RequestReducer.reduce(&mut state, a, &env);
            }
        }

        for a in drain(RequestReducer.reduce(
            &mut state,
            RequestAction::AcceptOffer {
                offer_id: offer_a,
                payment_method: PaymentMethod::Wallet,
                now,
            },
            &env,
        ))
        .await
        {
            RequestReducer.reduce(&mut state, a, &env);
        }

        assert_eq!(
            state.request.as_ref().map(|r| r.status),
            Some(RequestStatus::Matched)
        );
        let accepted = state.offers.iter().find(|o| o.id == offer_a).unwrap();
        assert_eq!(accepted.status, OfferStatus::Accepted);
        let withdrawn = state.offers.iter().find(|o| o.id == offer_b).unwrap();
        assert_eq!(withdrawn.status, OfferStatus::Withdrawn);
    }
}
