//! Orchestrates the ride/booking money-moving operations that span more
//! than one aggregate: reserving capacity, settling a card or wallet
//! payment, and fanning a cancellation's refund out across the PSP and the
//! wallet ledger. Grounded on the same "service owns the cross-aggregate
//! saga, aggregates own their own invariants" split as the ticketing
//! example's checkout flow, generalized from its single `PaymentReducer`
//! call into the card/wallet branch this domain's `RideAction::ReserveAndBook`
//! doc comment already anticipates.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use carpool_core::environment::Clock;
use carpool_core::event_bus::EventBus;
use carpool_core::event_store::EventStore;
use carpool_core::stream::Version;
use tokio::sync::RwLock;

use crate::aggregates::ride::{Booking, BookingStatus, RideAction, RideEnvironment, RideReducer, RideState};
use crate::aggregates::wallet::TransactionKind;
use crate::error::DomainError;
use crate::ledger::WalletLedger;
use crate::notifications::{Notification, NotificationBus, NotificationKind, NotificationStore};
use crate::payment_gateway::{Intent, PaymentGateway};
use crate::types::{BookingId, GeoPoint, Money, NotificationId, PaymentMethod, RefundReason, RideId, UserId};
use crate::webhook::ProcessedWebhookEvents;

/// Resolves a driver's PSP connected-account id, if they have one. A driver
/// with no connected account is paid out through the internal wallet
/// instead of a PSP transfer split.
pub trait DriverPayoutAccounts: Send + Sync {
    fn connected_account_for(
        &self,
        driver_id: UserId,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;
}

/// No driver has onboarded a connected account; every card payment is
/// settled entirely through the platform's PSP balance and reconciled into
/// driver wallets by the webhook handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoConnectedAccounts;

/// Shared idempotency key for the driver-side refund clawback, used by both
/// the synchronous `cancel_booking`/`cancel_ride` path here and the async
/// `charge.refunded` webhook in `webhook_reconciler::reconcile_refund`, so
/// whichever one runs first is the only one that debits the driver.
#[must_use]
pub fn refund_clawback_key(intent_id: &str) -> String {
    format!("refund-clawback:{intent_id}")
}

impl DriverPayoutAccounts for NoConnectedAccounts {
    fn connected_account_for(&self, _driver_id: UserId) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        Box::pin(async { None })
    }
}

pub struct BookingEngine<N: NotificationStore> {
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    rides: crate::service::AggregateService<RideReducer>,
    ledger: Arc<WalletLedger>,
    gateway: Arc<dyn PaymentGateway>,
    payout_accounts: Arc<dyn DriverPayoutAccounts>,
    notifications: Arc<NotificationBus<N>>,
    platform_fee_percent: u8,
    idempotency: Arc<dyn ProcessedWebhookEvents>,
}

impl<N: NotificationStore> BookingEngine<N> {
    #[must_use]
    pub fn new(
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        ledger: Arc<WalletLedger>,
        gateway: Arc<dyn PaymentGateway>,
        payout_accounts: Arc<dyn DriverPayoutAccounts>,
        notifications: Arc<NotificationBus<N>>,
        platform_fee_percent: u8,
        idempotency: Arc<dyn ProcessedWebhookEvents>,
    ) -> Self {
        Self {
            rides: crate::service::AggregateService::new(RideReducer, event_store.clone()),
            event_store,
            event_bus,
            clock,
            ledger,
            gateway,
            payout_accounts,
            notifications,
            platform_fee_percent,
            idempotency,
        }
    }

    fn ride_env(&self, ride_id: RideId) -> RideEnvironment {
        RideEnvironment {
            event_store: self.event_store.clone(),
            event_bus: self.event_bus.clone(),
            clock: self.clock.clone(),
            version_cell: Arc::new(RwLock::new(Version::INITIAL)),
            stream_id: ride_id.into(),
        }
    }

    async fn load(&self, ride_id: RideId) -> Result<RideState, DomainError> {
        let env = self.ride_env(ride_id);
        let (state, _version) = self.rides.load(ride_id.into(), &env).await?;
        Ok(state)
    }

    fn booking_failure(reason: &str) -> DomainError {
        if reason.contains("not enough seats") {
            DomainError::InsufficientSeats
        } else if reason.contains("not enough luggage") {
            DomainError::InsufficientLuggage
        } else if reason.contains("window") {
            DomainError::CancellationWindowPassed(reason.to_string())
        } else if reason.contains("only the passenger") || reason.contains("only the driver") {
            DomainError::Forbidden(reason.to_string())
        } else {
            DomainError::Validation(reason.to_string())
        }
    }

    async fn notify(&self, user_id: UserId, kind: NotificationKind, booking_id: Option<BookingId>, payload: serde_json::Value) {
        let result = self
            .notifications
            .notify(Notification {
                id: NotificationId::new(),
                user_id,
                kind,
                booking_id,
                request_id: None,
                payload,
                read: false,
                created_at: self.clock.now(),
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, ?kind, "failed to persist notification");
        }
    }

    /// Creates a `pending`, unpaid booking and notifies the driver. The
    /// driver accepts or rejects it later via `transition_booking`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the ride is not found/active, the requested
    /// capacity is unavailable, or the passenger already has an active
    /// booking on this ride.
    pub async fn create_booking(
        &self,
        ride_id: RideId,
        passenger_id: UserId,
        seats: u32,
        luggage: u32,
        pickup: Option<GeoPoint>,
        dropoff: Option<GeoPoint>,
    ) -> Result<Booking, DomainError> {
        let env = self.ride_env(ride_id);
        let now = self.clock.now();
        let booking_id = BookingId::new();
        let state = self
            .rides
            .execute(
                ride_id.into(),
                RideAction::CreateBooking {
                    booking_id,
                    passenger_id,
                    seats,
                    luggage,
                    pickup,
                    dropoff,
                    now,
                },
                &env,
            )
            .await?;
        if let Some(reason) = state.last_error {
            return Err(Self::booking_failure(&reason));
        }
        let booking = state
            .booking(booking_id)
            .cloned()
            .ok_or(DomainError::NotFound { resource: "booking", id: booking_id.to_string() })?;
        if let Some(ride) = &state.ride {
            self.notify(
                ride.driver_id,
                NotificationKind::BookingRequest,
                Some(booking_id),
                serde_json::json!({ "rideId": ride_id.to_string(), "seats": seats }),
            )
            .await;
        }
        Ok(booking)
    }

    /// Creates a PSP payment intent sized `pricePerSeat * seats`, split to
    /// the driver's connected account (with the platform fee withheld) when
    /// one exists. Does not touch the aggregate — `complete_card_payment`
    /// reserves capacity once the client has confirmed the intent.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the ride doesn't exist, or
    /// `DomainError::Payment` if the gateway rejects the intent.
    pub async fn create_card_intent(&self, ride_id: RideId, seats: u32) -> Result<Intent, DomainError> {
        let state = self.load(ride_id).await?;
        let ride = state.ride.ok_or(DomainError::NotFound { resource: "ride", id: ride_id.to_string() })?;
        let amount = ride.price_per_seat.times(i64::from(seats));
        let destination = self.payout_accounts.connected_account_for(ride.driver_id).await;
        let application_fee = destination.as_ref().map(|_| amount.split_fee(self.platform_fee_percent).0);
        self.gateway
            .create_intent(
                amount,
                serde_json::json!({ "rideId": ride_id.to_string(), "seats": seats }),
                destination,
                application_fee,
            )
            .await
            .map_err(|err| DomainError::Payment(err.to_string()))
    }

    /// Confirms a card-paid booking once the client reports the intent
    /// succeeded: re-validates capacity and reserves it atomically. Refunds
    /// the intent and surfaces the failure if reservation loses the race.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Payment` if the intent never succeeded, or the
    /// mapped reservation failure (`InsufficientSeats`, etc.) if capacity
    /// ran out between intent creation and confirmation.
    pub async fn complete_card_payment(
        &self,
        ride_id: RideId,
        intent_id: &str,
        passenger_id: UserId,
        seats: u32,
        luggage: u32,
    ) -> Result<Booking, DomainError> {
        let intent = self
            .gateway
            .get_intent(intent_id)
            .await
            .map_err(|err| DomainError::Payment(err.to_string()))?;
        if intent.status != crate::payment_gateway::IntentStatus::Succeeded {
            return Err(DomainError::Payment("card payment has not completed".into()));
        }

        let env = self.ride_env(ride_id);
        let now = self.clock.now();
        let booking_id = BookingId::new();
        let state = self
            .rides
            .execute(
                ride_id.into(),
                RideAction::ReserveAndBook {
                    booking_id,
                    passenger_id,
                    seats,
                    luggage,
                    payment_method: PaymentMethod::Card,
                    psp_intent_id: Some(intent_id.to_string()),
                    now,
                },
                &env,
            )
            .await?;

        if let Some(reason) = state.last_error {
            let has_transfer = intent.transfer_data.is_some();
            if let Err(err) = self.gateway.refund(intent_id, has_transfer, has_transfer).await {
                tracing::error!(%err, intent_id, "failed to refund after lost reservation race");
            }
            return Err(Self::booking_failure(&reason));
        }

        let booking = state
            .booking(booking_id)
            .cloned()
            .ok_or(DomainError::NotFound { resource: "booking", id: booking_id.to_string() })?;
        if let Some(ride) = &state.ride {
            self.notify(
                ride.driver_id,
                NotificationKind::BookingAccepted,
                Some(booking_id),
                serde_json::json!({ "rideId": ride_id.to_string() }),
            )
            .await;
        }
        Ok(booking)
    }

    /// Settles a booking entirely through the wallet ledger: no PSP
    /// round-trip. Debits the passenger, reserves capacity, and credits the
    /// driver's net share, rolling the debit back if any later step fails.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InsufficientBalance` if the passenger's wallet
    /// can't cover the total, or the mapped reservation failure.
    pub async fn pay_and_book_with_wallet(
        &self,
        ride_id: RideId,
        passenger_id: UserId,
        seats: u32,
        luggage: u32,
    ) -> Result<Booking, DomainError> {
        let state = self.load(ride_id).await?;
        let ride = state.ride.ok_or(DomainError::NotFound { resource: "ride", id: ride_id.to_string() })?;
        let gross = ride.price_per_seat.times(i64::from(seats));
        let (fee, net) = gross.split_fee(self.platform_fee_percent);
        let _ = fee;

        self.ledger
            .debit(passenger_id, TransactionKind::BookingPayment, gross, None, "ride payment")
            .await?;

        let env = self.ride_env(ride_id);
        let now = self.clock.now();
        let booking_id = BookingId::new();
        let reserved = self
            .rides
            .execute(
                ride_id.into(),
                RideAction::ReserveAndBook {
                    booking_id,
                    passenger_id,
                    seats,
                    luggage,
                    payment_method: PaymentMethod::Wallet,
                    psp_intent_id: None,
                    now,
                },
                &env,
            )
            .await;

        let state = match reserved {
            Ok(state) => state,
            Err(err) => {
                self.rollback_debit(passenger_id, gross, booking_id).await;
                return Err(err);
            }
        };
        if let Some(reason) = state.last_error {
            self.rollback_debit(passenger_id, gross, booking_id).await;
            return Err(Self::booking_failure(&reason));
        }

        if let Err(err) = self
            .ledger
            .credit(ride.driver_id, TransactionKind::BookingEarning, net, Some(booking_id), "ride earning")
            .await
        {
            tracing::error!(%err, %booking_id, "driver credit failed after reservation, compensating");
            self.compensate_reservation(ride_id, booking_id, passenger_id, gross).await;
            return Err(err);
        }

        let booking = state
            .booking(booking_id)
            .cloned()
            .ok_or(DomainError::NotFound { resource: "booking", id: booking_id.to_string() })?;
        self.notify(
            ride.driver_id,
            NotificationKind::BookingAccepted,
            Some(booking_id),
            serde_json::json!({ "rideId": ride_id.to_string() }),
        )
        .await;
        Ok(booking)
    }

    async fn rollback_debit(&self, passenger_id: UserId, gross: Money, booking_id: BookingId) {
        if let Err(err) = self
            .ledger
            .credit(passenger_id, TransactionKind::Refund, gross, Some(booking_id), "reservation failed, refunding debit")
            .await
        {
            tracing::error!(%err, %booking_id, "failed to roll back wallet debit");
        }
    }

    async fn compensate_reservation(&self, ride_id: RideId, booking_id: BookingId, passenger_id: UserId, gross: Money) {
        let env = self.ride_env(ride_id);
        let now = self.clock.now();
        if let Err(err) = self
            .rides
            .execute(
                ride_id.into(),
                RideAction::CancelBooking {
                    booking_id,
                    actor_id: passenger_id,
                    reason: RefundReason::AdminAction,
                    now,
                },
                &env,
            )
            .await
        {
            tracing::error!(%err, %booking_id, "failed to release capacity after compensating a failed driver credit");
        }
        self.rollback_debit(passenger_id, gross, booking_id).await;
    }

    /// Driver accepts/rejects a pending booking, or the passenger withdraws
    /// their own pending booking.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Forbidden` if `actor_id` isn't entitled to make
    /// this transition, or the mapped capacity failure if accepting would
    /// overrun remaining capacity.
    pub async fn transition_booking(
        &self,
        ride_id: RideId,
        booking_id: BookingId,
        actor_id: UserId,
        to: BookingStatus,
    ) -> Result<Booking, DomainError> {
        let env = self.ride_env(ride_id);
        let now = self.clock.now();
        let state = self
            .rides
            .execute(ride_id.into(), RideAction::TransitionBooking { booking_id, actor_id, to, now }, &env)
            .await?;
        if let Some(reason) = state.last_error {
            return Err(Self::booking_failure(&reason));
        }
        let booking = state
            .booking(booking_id)
            .cloned()
            .ok_or(DomainError::NotFound { resource: "booking", id: booking_id.to_string() })?;
        if let Some(ride) = &state.ride {
            let (target, kind) = match to {
                BookingStatus::Accepted => (booking.passenger_id, NotificationKind::BookingAccepted),
                BookingStatus::Rejected => (booking.passenger_id, NotificationKind::BookingRejected),
                BookingStatus::Cancelled => (ride.driver_id, NotificationKind::BookingCancelled),
                BookingStatus::Pending => return Ok(booking),
            };
            self.notify(target, kind, Some(booking_id), serde_json::json!({ "rideId": ride_id.to_string() }))
                .await;
        }
        Ok(booking)
    }

    /// Cancels an accepted, paid booking and refunds 100% of it, branching
    /// on how it was paid. Refund failures are logged, never roll back the
    /// cancellation itself.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::CancellationWindowPassed` inside 24h of
    /// departure, `DomainError::Forbidden` if `actor_id` isn't the
    /// passenger, or the underlying aggregate failure otherwise.
    pub async fn cancel_booking(&self, ride_id: RideId, booking_id: BookingId, actor_id: UserId) -> Result<Booking, DomainError> {
        let pre = self.load(ride_id).await?;
        let ride = pre.ride.clone().ok_or(DomainError::NotFound { resource: "ride", id: ride_id.to_string() })?;
        let booking_before = pre
            .booking(booking_id)
            .cloned()
            .ok_or(DomainError::NotFound { resource: "booking", id: booking_id.to_string() })?;

        let env = self.ride_env(ride_id);
        let now = self.clock.now();
        let state = self
            .rides
            .execute(
                ride_id.into(),
                RideAction::CancelBooking { booking_id, actor_id, reason: RefundReason::PassengerCancelled, now },
                &env,
            )
            .await?;
        if let Some(reason) = state.last_error {
            return Err(Self::booking_failure(&reason));
        }

        self.refund_cancelled_booking(&ride.driver_id, &booking_before, ride.price_per_seat).await;

        self.notify(
            ride.driver_id,
            NotificationKind::BookingCancelled,
            Some(booking_id),
            serde_json::json!({ "rideId": ride_id.to_string() }),
        )
        .await;

        Ok(state
            .booking(booking_id)
            .cloned()
            .ok_or(DomainError::NotFound { resource: "booking", id: booking_id.to_string() })?)
    }

    /// Cancels the whole ride (`>12h` before departure), cascading the
    /// refund fan-out across every booking that was accepted and paid, and
    /// notifying every affected passenger.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::CancellationWindowPassed` inside 12h of
    /// departure, or the underlying aggregate failure otherwise.
    pub async fn cancel_ride(&self, ride_id: RideId) -> Result<RideState, DomainError> {
        let pre = self.load(ride_id).await?;
        let ride = pre.ride.clone().ok_or(DomainError::NotFound { resource: "ride", id: ride_id.to_string() })?;
        let refundable: Vec<Booking> = pre
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Accepted && b.payment_status == crate::aggregates::ride::PaymentStatus::Paid)
            .cloned()
            .collect();

        let env = self.ride_env(ride_id);
        let now = self.clock.now();
        let state = self.rides.execute(ride_id.into(), RideAction::CancelRide { now }, &env).await?;
        if let Some(reason) = state.last_error {
            return Err(Self::booking_failure(&reason));
        }

        for booking in &refundable {
            self.refund_cancelled_booking(&ride.driver_id, booking, ride.price_per_seat).await;
            self.notify(
                booking.passenger_id,
                NotificationKind::RideCancelled,
                Some(booking.id),
                serde_json::json!({ "rideId": ride_id.to_string() }),
            )
            .await;
        }

        Ok(state)
    }

    /// Runs the §4.5 `CancelBooking` refund fan-out for an already-cancelled
    /// booking. Best-effort: every failure is logged and surfaced for
    /// reconciliation rather than undoing the cancellation.
    async fn refund_cancelled_booking(&self, driver_id: &UserId, booking: &Booking, price_per_seat: Money) {
        let gross = price_per_seat.times(i64::from(booking.seats));
        let (_fee, net) = gross.split_fee(self.platform_fee_percent);

        match booking.payment_method {
            PaymentMethod::Card => {
                let Some(intent_id) = &booking.psp_intent_id else {
                    tracing::error!(booking_id = %booking.id, "card booking has no psp intent id to refund");
                    return;
                };
                let had_transfer = match self.gateway.get_intent(intent_id).await {
                    Ok(intent) => intent.transfer_data.is_some(),
                    Err(err) => {
                        tracing::error!(%err, intent_id, "failed to look up intent before refunding");
                        false
                    }
                };
                match self.gateway.refund(intent_id, had_transfer, had_transfer).await {
                    Ok(_) => {
                        if let Err(err) = self
                            .ledger
                            .credit(booking.passenger_id, TransactionKind::Refund, gross, Some(booking.id), "card refund")
                            .await
                        {
                            tracing::error!(%err, booking_id = %booking.id, "failed to credit passenger after card refund");
                        }
                        if !had_transfer {
                            match self.idempotency.mark_processed(&refund_clawback_key(intent_id)).await {
                                Ok(true) => {
                                    if let Err(err) = self
                                        .ledger
                                        .debit(*driver_id, TransactionKind::Refund, net, Some(booking.id), "refund clawback")
                                        .await
                                    {
                                        tracing::error!(%err, booking_id = %booking.id, "failed to claw back driver wallet");
                                    }
                                }
                                Ok(false) => {}
                                Err(err) => {
                                    tracing::error!(%err, booking_id = %booking.id, "failed to check refund clawback idempotency, skipping to avoid a double debit");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, intent_id, booking_id = %booking.id, "psp refund failed, needs manual reconciliation");
                    }
                }
            }
            PaymentMethod::Wallet => {
                if let Err(err) = self
                    .ledger
                    .credit(booking.passenger_id, TransactionKind::Refund, gross, Some(booking.id), "wallet refund")
                    .await
                {
                    tracing::error!(%err, booking_id = %booking.id, "failed to credit passenger wallet refund");
                }
                if let Err(err) = self
                    .ledger
                    .debit(*driver_id, TransactionKind::Refund, net, Some(booking.id), "refund clawback")
                    .await
                {
                    tracing::error!(%err, booking_id = %booking.id, "failed to claw back driver wallet");
                }
            }
            PaymentMethod::None => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregates::ride::{Direction, RideAction as RA};
    use crate::cache::NoopCache;
    use crate::notifications::Notification as N;
    use crate::types::AirportId;
    use carpool_testing::{mocks::test_clock, InMemoryEventBus, InMemoryEventStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeNotifications {
        sent: Mutex<Vec<N>>,
    }

    impl NotificationStore for FakeNotifications {
        fn insert(
            &self,
            notification: N,
        ) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
            self.sent.lock().unwrap().push(notification);
            Box::pin(async { Ok(()) })
        }
        fn exists_for_booking(
            &self,
            _user_id: UserId,
            _booking_id: BookingId,
            _kind: NotificationKind,
        ) -> Pin<Box<dyn Future<Output = Result<bool, anyhow::Error>> + Send + '_>> {
            Box::pin(async { Ok(false) })
        }
    }

    #[derive(Default)]
    struct FakeIdempotency(Mutex<Vec<String>>);
    impl ProcessedWebhookEvents for FakeIdempotency {
        fn mark_processed(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = Result<bool, crate::webhook::WebhookError>> + Send + '_>> {
            let seen = {
                let mut guard = self.0.lock().unwrap();
                if guard.iter().any(|k| k == key) {
                    true
                } else {
                    guard.push(key.to_string());
                    false
                }
            };
            Box::pin(async move { Ok(!seen) })
        }
    }

    fn engine() -> (BookingEngine<FakeNotifications>, Arc<dyn EventStore>, Arc<dyn Clock>) {
        let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::default());
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::default());
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let ledger = Arc::new(WalletLedger::new(event_store.clone(), event_bus.clone(), clock.clone()));
        let notifications = Arc::new(NotificationBus::new(FakeNotifications::default(), Arc::new(NoopCache)));
        let engine = BookingEngine::new(
            event_store.clone(),
            event_bus.clone(),
            clock.clone(),
            ledger,
            crate::payment_gateway::MockPaymentGateway::shared(),
            Arc::new(NoConnectedAccounts),
            notifications,
            10,
            Arc::new(FakeIdempotency::default()),
        );
        (engine, event_store, clock)
    }

    async fn publish_ride(rides: &crate::service::AggregateService<RideReducer>, event_store: &Arc<dyn EventStore>, event_bus: &Arc<dyn EventBus>, clock: &Arc<dyn Clock>, ride_id: RideId, driver_id: UserId, seats: u32) {
        let now = clock.now();
        let env = RideEnvironment {
            event_store: event_store.clone(),
            event_bus: event_bus.clone(),
            clock: clock.clone(),
            version_cell: Arc::new(RwLock::new(Version::INITIAL)),
            stream_id: ride_id.into(),
        };
        rides
            .execute(
                ride_id.into(),
                RA::PublishRide {
                    ride_id,
                    driver_id,
                    airport_id: AirportId::new(),
                    direction: Direction::ToAirport,
                    home: GeoPoint::new(2.35, 48.85),
                    departure_at: now + chrono::Duration::hours(48),
                    seats_total: seats,
                    luggage_total: seats,
                    price_per_seat: Money::from_minor(4000),
                    route: vec![],
                    comment: None,
                    now,
                },
                &env,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wallet_booking_debits_passenger_and_credits_driver_net() {
        let (engine, event_store, clock) = engine();
        let ride_id = RideId::new();
        let driver_id = UserId::new();
        let passenger_id = UserId::new();
        publish_ride(&engine.rides, &event_store, &engine.event_bus, &clock, ride_id, driver_id, 3).await;

        engine
            .ledger
            .credit(passenger_id, TransactionKind::TopUp, Money::from_minor(10_000), None, "top up")
            .await
            .unwrap();

        let booking = engine.pay_and_book_with_wallet(ride_id, passenger_id, 2, 1).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Accepted);
        assert_eq!(
            engine.ledger.balance(passenger_id).await.unwrap(),
            Money::from_minor(10_000 - 8000)
        );
        assert_eq!(engine.ledger.balance(driver_id).await.unwrap(), Money::from_minor(7200));
    }

    #[tokio::test]
    async fn wallet_booking_without_funds_fails_before_reserving() {
        let (engine, event_store, clock) = engine();
        let ride_id = RideId::new();
        let driver_id = UserId::new();
        let passenger_id = UserId::new();
        publish_ride(&engine.rides, &event_store, &engine.event_bus, &clock, ride_id, driver_id, 3).await;

        let err = engine.pay_and_book_with_wallet(ride_id, passenger_id, 2, 1).await.unwrap_err();
        assert!(matches!(err, DomainError::InsufficientBalance));
        let state = engine.load(ride_id).await.unwrap();
        assert!(state.bookings.is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_ride_cascades_refunds_to_every_accepted_booking() {
        let (engine, event_store, clock) = engine();
        let ride_id = RideId::new();
        let driver_id = UserId::new();
        let passenger_id = UserId::new();
        publish_ride(&engine.rides, &event_store, &engine.event_bus, &clock, ride_id, driver_id, 3).await;
        engine
            .ledger
            .credit(passenger_id, TransactionKind::TopUp, Money::from_minor(10_000), None, "top up")
            .await
            .unwrap();
        engine.pay_and_book_with_wallet(ride_id, passenger_id, 2, 1).await.unwrap();

        let state = engine.cancel_ride(ride_id).await.unwrap();
        assert_eq!(state.ride.unwrap().status, crate::aggregates::ride::RideStatus::Cancelled);
        assert_eq!(state.bookings[0].status, BookingStatus::Cancelled);
        assert_eq!(engine.ledger.balance(passenger_id).await.unwrap(), Money::from_minor(10_000));
    }
}
