//! Orchestrates the ride-request/offer matching flow: posting a request,
//! drivers making offers against it, and the passenger settling payment for
//! the chosen offer. Mirrors `booking_engine`'s split between "aggregate
//! owns the state machine" and "service owns the payment saga that gates
//! one of its transitions" — here the gated transition is `AcceptOffer`
//! rather than `ReserveAndBook`.

use std::sync::Arc;

use carpool_core::environment::Clock;
use carpool_core::event_bus::EventBus;
use carpool_core::event_store::EventStore;
use carpool_core::stream::Version;
use tokio::sync::RwLock;

use crate::aggregates::request::{
    Offer, OfferStatus, RequestAction, RequestEnvironment, RequestReducer, RequestState, RideRequest,
};
use crate::aggregates::wallet::TransactionKind;
use crate::error::DomainError;
use crate::ledger::WalletLedger;
use crate::notifications::{Notification, NotificationBus, NotificationKind, NotificationStore};
use crate::payment_gateway::{Intent, PaymentGateway};
use crate::types::{AirportId, Direction, GeoPoint, Money, NotificationId, OfferId, PaymentMethod, RideId, RideRequestId, UserId};

pub struct RequestEngine<N: NotificationStore> {
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    requests: crate::service::AggregateService<RequestReducer>,
    ledger: Arc<WalletLedger>,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Arc<NotificationBus<N>>,
    platform_fee_percent: u8,
}

impl<N: NotificationStore> RequestEngine<N> {
    #[must_use]
    pub fn new(
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        ledger: Arc<WalletLedger>,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Arc<NotificationBus<N>>,
        platform_fee_percent: u8,
    ) -> Self {
        Self {
            requests: crate::service::AggregateService::new(RequestReducer, event_store.clone()),
            event_store,
            event_bus,
            clock,
            ledger,
            gateway,
            notifications,
            platform_fee_percent,
        }
    }

    fn env(&self, request_id: RideRequestId) -> RequestEnvironment {
        RequestEnvironment {
            event_store: self.event_store.clone(),
            event_bus: self.event_bus.clone(),
            clock: self.clock.clone(),
            version_cell: Arc::new(RwLock::new(Version::INITIAL)),
            stream_id: request_id.into(),
        }
    }

    async fn load(&self, request_id: RideRequestId) -> Result<RequestState, DomainError> {
        let env = self.env(request_id);
        let (state, _version) = self.requests.load(request_id.into(), &env).await?;
        Ok(state)
    }

    fn failure(reason: &str) -> DomainError {
        if reason.contains("not found") {
            DomainError::NotFound { resource: "request", id: String::new() }
        } else {
            DomainError::Validation(reason.to_string())
        }
    }

    async fn notify(&self, user_id: UserId, kind: NotificationKind, request_id: Option<RideRequestId>, payload: serde_json::Value) {
        let result = self
            .notifications
            .notify(Notification {
                id: NotificationId::new(),
                user_id,
                kind,
                booking_id: None,
                request_id,
                payload,
                read: false,
                created_at: self.clock.now(),
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, ?kind, "failed to persist notification");
        }
    }

    /// Posts a new ride request. `expiresAt` is set to `latest_at` — once a
    /// request's flexibility window closes without a match, the expiry
    /// sweep marks it `expired`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the time window or seat count
    /// is invalid.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_request(
        &self,
        passenger_id: UserId,
        airport_id: AirportId,
        direction: Direction,
        home: GeoPoint,
        earliest_at: chrono::DateTime<chrono::Utc>,
        latest_at: chrono::DateTime<chrono::Utc>,
        seats: u32,
        luggage: u32,
    ) -> Result<RideRequest, DomainError> {
        let request_id = RideRequestId::new();
        let env = self.env(request_id);
        let now = self.clock.now();
        let state = self
            .requests
            .execute(
                request_id.into(),
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
                },
                &env,
            )
            .await?;
        if let Some(reason) = state.last_error {
            return Err(Self::failure(&reason));
        }
        state.request.ok_or(DomainError::Infra(anyhow::anyhow!("request vanished after creation")))
    }

    /// A driver makes an offer against an open request.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the request isn't open.
    pub async fn make_offer(
        &self,
        request_id: RideRequestId,
        ride_id: RideId,
        driver_id: UserId,
        price: Money,
    ) -> Result<Offer, DomainError> {
        let env = self.env(request_id);
        let now = self.clock.now();
        let offer_id = OfferId::new();
        let state = self
            .requests
            .execute(request_id.into(), RequestAction::MakeOffer { offer_id, ride_id, driver_id, price, now }, &env)
            .await?;
        if let Some(reason) = state.last_error {
            return Err(Self::failure(&reason));
        }
        let offer = state
            .offers
            .iter()
            .find(|o| o.id == offer_id)
            .cloned()
            .ok_or(DomainError::Infra(anyhow::anyhow!("offer vanished after creation")))?;
        if let Some(request) = &state.request {
            self.notify(
                request.passenger_id,
                NotificationKind::OfferReceived,
                Some(request_id),
                serde_json::json!({ "offerId": offer_id.to_string(), "price": price.minor() }),
            )
            .await;
        }
        Ok(offer)
    }

    fn offer_total(state: &RequestState, offer: &Offer) -> Money {
        let seats = state.request.as_ref().map_or(1, |r| r.seats);
        offer.price.times(i64::from(seats))
    }

    fn find_offer<'a>(state: &'a RequestState, offer_id: OfferId) -> Result<&'a Offer, DomainError> {
        state
            .offers
            .iter()
            .find(|o| o.id == offer_id)
            .ok_or(DomainError::NotFound { resource: "offer", id: offer_id.to_string() })
    }

    /// Creates a card intent sized `offer.pricePerSeat * request.seatsNeeded`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the request or offer don't exist,
    /// or `DomainError::Payment` if the gateway rejects the intent.
    pub async fn create_card_intent(&self, request_id: RideRequestId, offer_id: OfferId) -> Result<Intent, DomainError> {
        let state = self.load(request_id).await?;
        let offer = Self::find_offer(&state, offer_id)?;
        let total = Self::offer_total(&state, offer);
        self.gateway
            .create_intent(
                total,
                serde_json::json!({ "requestId": request_id.to_string(), "offerId": offer_id.to_string() }),
                None,
                None,
            )
            .await
            .map_err(|err| DomainError::Payment(err.to_string()))
    }

    /// Settles the chosen offer via wallet debit, then finalizes the match:
    /// the offer becomes `accepted`, every sibling offer is withdrawn, and
    /// the request moves to `matched`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InsufficientBalance` if the wallet can't cover
    /// the total, or `DomainError::Validation` if the offer is no longer
    /// pending.
    pub async fn accept_offer_with_wallet(
        &self,
        request_id: RideRequestId,
        offer_id: OfferId,
        passenger_id: UserId,
    ) -> Result<RideRequest, DomainError> {
        let pre = self.load(request_id).await?;
        let offer = Self::find_offer(&pre, offer_id)?.clone();
        let total = Self::offer_total(&pre, &offer);

        self.ledger
            .debit(passenger_id, TransactionKind::BookingPayment, total, None, "ride request payment")
            .await?;

        match self.finalize_offer(request_id, offer_id, PaymentMethod::Wallet).await {
            Ok(request) => {
                let (_fee, net) = total.split_fee(self.platform_fee_percent);
                if let Err(err) = self
                    .ledger
                    .credit(offer.driver_id, TransactionKind::BookingEarning, net, None, "ride request earning")
                    .await
                {
                    tracing::error!(%err, %offer_id, "failed to credit driver after accepting offer");
                }
                Ok(request)
            }
            Err(err) => {
                if let Err(refund_err) = self
                    .ledger
                    .credit(passenger_id, TransactionKind::Refund, total, None, "offer acceptance failed, refunding debit")
                    .await
                {
                    tracing::error!(%refund_err, %offer_id, "failed to roll back wallet debit");
                }
                Err(err)
            }
        }
    }

    /// Confirms a card-paid offer acceptance once the intent has succeeded.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Payment` if the intent never succeeded.
    pub async fn accept_offer_with_card(
        &self,
        request_id: RideRequestId,
        offer_id: OfferId,
        intent_id: &str,
    ) -> Result<RideRequest, DomainError> {
        let intent = self
            .gateway
            .get_intent(intent_id)
            .await
            .map_err(|err| DomainError::Payment(err.to_string()))?;
        if intent.status != crate::payment_gateway::IntentStatus::Succeeded {
            return Err(DomainError::Payment("card payment has not completed".into()));
        }
        self.finalize_offer(request_id, offer_id, PaymentMethod::Card).await
    }

    async fn finalize_offer(
        &self,
        request_id: RideRequestId,
        offer_id: OfferId,
        payment_method: PaymentMethod,
    ) -> Result<RideRequest, DomainError> {
        let env = self.env(request_id);
        let now = self.clock.now();
        let state = self
            .requests
            .execute(request_id.into(), RequestAction::AcceptOffer { offer_id, payment_method, now }, &env)
            .await?;
        if let Some(reason) = state.last_error {
            return Err(Self::failure(&reason));
        }
        let request = state
            .request
            .clone()
            .ok_or(DomainError::Infra(anyhow::anyhow!("request vanished after acceptance")))?;

        self.notify(
            request.passenger_id,
            NotificationKind::RequestBooked,
            Some(request_id),
            serde_json::json!({}),
        )
        .await;
        for offer in &state.offers {
            if offer.id == offer_id {
                self.notify(
                    offer.driver_id,
                    NotificationKind::OfferReceived,
                    Some(request_id),
                    serde_json::json!({ "accepted": true }),
                )
                .await;
            } else if offer.status == OfferStatus::Withdrawn {
                self.notify(
                    offer.driver_id,
                    NotificationKind::OfferRejected,
                    Some(request_id),
                    serde_json::json!({}),
                )
                .await;
            }
        }
        Ok(request)
    }

    /// The passenger rejects a driver's pending offer.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Forbidden` if `actor_id` isn't the passenger on
    /// this request, or `DomainError::Validation` if the offer isn't pending.
    pub async fn reject_offer(&self, request_id: RideRequestId, offer_id: OfferId, actor_id: UserId) -> Result<(), DomainError> {
        let state = self.load(request_id).await?;
        let request = state.request.as_ref().ok_or(DomainError::NotFound { resource: "request", id: request_id.to_string() })?;
        if request.passenger_id != actor_id {
            return Err(DomainError::Forbidden("only the requesting passenger may reject an offer".into()));
        }
        let offer = Self::find_offer(&state, offer_id)?.clone();
        self.reject_offer_inner(request_id, offer_id, offer.driver_id, NotificationKind::OfferRejected).await
    }

    /// A driver withdraws their own pending offer.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Forbidden` if `actor_id` did not make this
    /// offer, or `DomainError::Validation` if it isn't pending.
    pub async fn withdraw_offer(&self, request_id: RideRequestId, offer_id: OfferId, actor_id: UserId) -> Result<(), DomainError> {
        let state = self.load(request_id).await?;
        let offer = Self::find_offer(&state, offer_id)?.clone();
        if offer.driver_id != actor_id {
            return Err(DomainError::Forbidden("only the offering driver may withdraw this offer".into()));
        }
        let passenger_id = state.request.as_ref().map(|r| r.passenger_id);
        self.reject_offer_inner(request_id, offer_id, passenger_id.unwrap_or(actor_id), NotificationKind::OfferRejected)
            .await
    }

    async fn reject_offer_inner(
        &self,
        request_id: RideRequestId,
        offer_id: OfferId,
        notify_user: UserId,
        kind: NotificationKind,
    ) -> Result<(), DomainError> {
        let env = self.env(request_id);
        let now = self.clock.now();
        let state = self
            .requests
            .execute(request_id.into(), RequestAction::RejectOffer { offer_id, now }, &env)
            .await?;
        if let Some(reason) = state.last_error {
            return Err(Self::failure(&reason));
        }
        self.notify(notify_user, kind, Some(request_id), serde_json::json!({})).await;
        Ok(())
    }

    /// The passenger cancels their own open request.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Forbidden` if `actor_id` isn't the passenger,
    /// or `DomainError::Validation` if the request isn't open.
    pub async fn cancel_request(&self, request_id: RideRequestId, actor_id: UserId) -> Result<(), DomainError> {
        let state = self.load(request_id).await?;
        let request = state.request.as_ref().ok_or(DomainError::NotFound { resource: "request", id: request_id.to_string() })?;
        if request.passenger_id != actor_id {
            return Err(DomainError::Forbidden("only the requesting passenger may cancel it".into()));
        }
        let env = self.env(request_id);
        let now = self.clock.now();
        let state = self.requests.execute(request_id.into(), RequestAction::CancelRequest { now }, &env).await?;
        if let Some(reason) = state.last_error {
            return Err(Self::failure(&reason));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use crate::notifications::Notification as N;
    use carpool_testing::{mocks::test_clock, InMemoryEventBus, InMemoryEventStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeNotifications {
        sent: Mutex<Vec<N>>,
    }

    impl NotificationStore for FakeNotifications {
        fn insert(&self, notification: N) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
            self.sent.lock().unwrap().push(notification);
            Box::pin(async { Ok(()) })
        }
        fn exists_for_booking(&self, _user_id: UserId, _booking_id: crate::types::BookingId, _kind: NotificationKind) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, anyhow::Error>> + Send + '_>> {
            Box::pin(async { Ok(false) })
        }
    }

    fn engine() -> RequestEngine<FakeNotifications> {
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::default());
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::default());
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let ledger = Arc::new(WalletLedger::new(event_store.clone(), event_bus.clone(), clock.clone()));
        let notifications = Arc::new(NotificationBus::new(FakeNotifications::default(), Arc::new(NoopCache)));
        RequestEngine::new(event_store, event_bus, clock, ledger, crate::payment_gateway::MockPaymentGateway::shared(), notifications, 10)
    }

    #[tokio::test]
    async fn accepting_an_offer_with_wallet_pays_and_matches() {
        let engine = engine();
        let now = engine.clock.now();
        let passenger_id = UserId::new();
        let driver_id = UserId::new();
        let request = engine
            .create_request(
                passenger_id,
                AirportId::new(),
                Direction::ToAirport,
                GeoPoint::new(2.35, 48.85),
                now,
                now + chrono::Duration::hours(6),
                2,
                1,
            )
            .await
            .unwrap();

        let offer = engine.make_offer(request.id, RideId::new(), driver_id, Money::from_minor(1500)).await.unwrap();

        engine
            .ledger
            .credit(passenger_id, TransactionKind::TopUp, Money::from_minor(5000), None, "top up")
            .await
            .unwrap();

        let matched = engine.accept_offer_with_wallet(request.id, offer.id, passenger_id).await.unwrap();
        assert_eq!(matched.status, crate::aggregates::request::RequestStatus::Matched);
        assert_eq!(engine.ledger.balance(passenger_id).await.unwrap(), Money::from_minor(5000 - 3000));
        assert_eq!(engine.ledger.balance(driver_id).await.unwrap(), Money::from_minor(2700));
    }

    #[tokio::test]
    async fn second_offer_is_withdrawn_when_first_is_accepted() {
        let engine = engine();
        let now = engine.clock.now();
        let passenger_id = UserId::new();
        let request = engine
            .create_request(passenger_id, AirportId::new(), Direction::ToAirport, GeoPoint::new(2.35, 48.85), now, now + chrono::Duration::hours(6), 1, 0)
            .await
            .unwrap();
        let offer_a = engine.make_offer(request.id, RideId::new(), UserId::new(), Money::from_minor(1000)).await.unwrap();
        let offer_b = engine.make_offer(request.id, RideId::new(), UserId::new(), Money::from_minor(1200)).await.unwrap();

        engine
            .ledger
            .credit(passenger_id, TransactionKind::TopUp, Money::from_minor(5000), None, "top up")
            .await
            .unwrap();
        engine.accept_offer_with_wallet(request.id, offer_a.id, passenger_id).await.unwrap();

        let state = engine.load(request.id).await.unwrap();
        let rejected = state.offers.iter().find(|o| o.id == offer_b.id).unwrap();
        assert_eq!(rejected.status, OfferStatus::Withdrawn);
    }
}
