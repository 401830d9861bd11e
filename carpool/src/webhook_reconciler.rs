//! Turns a verified `webhook::WebhookEvent` into wallet-ledger effects.
//! Kept separate from `webhook.rs` itself the same way `booking_engine`
//! sits above `aggregates::ride`: signature verification and the wire shape
//! are pure and synchronous, reconciliation needs the ledger, a read model,
//! and the idempotency table.

use std::sync::Arc;

use crate::aggregates::wallet::TransactionKind;
use crate::booking_engine::DriverPayoutAccounts;
use crate::ledger::WalletLedger;
use crate::types::{BookingId, Money, PaymentMethod, UserId};
use crate::webhook::{ProcessedWebhookEvents, WebhookError, WebhookEvent};

/// What the reconciler needs to know about the booking a PSP intent paid
/// for, read from the `bookings`/`rides` projections rather than replayed
/// from the `ride` aggregate stream.
#[derive(Clone, Debug)]
pub struct PaidBooking {
    pub booking_id: BookingId,
    pub driver_id: UserId,
    pub passenger_id: UserId,
    pub amount: Money,
    pub payment_method: PaymentMethod,
}

pub trait WebhookBookingLookup: Send + Sync {
    fn find_by_intent(
        &self,
        intent_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<PaidBooking>> + Send + '_>>;
}

pub struct WebhookReconciler<L: WebhookBookingLookup, E: ProcessedWebhookEvents> {
    lookup: L,
    processed: E,
    ledger: Arc<WalletLedger>,
    payout_accounts: Arc<dyn DriverPayoutAccounts>,
    platform_fee_percent: u8,
}

impl<L: WebhookBookingLookup, E: ProcessedWebhookEvents> WebhookReconciler<L, E> {
    #[must_use]
    pub const fn new(
        lookup: L,
        processed: E,
        ledger: Arc<WalletLedger>,
        payout_accounts: Arc<dyn DriverPayoutAccounts>,
        platform_fee_percent: u8,
    ) -> Self {
        Self { lookup, processed, ledger, payout_accounts, platform_fee_percent }
    }

    /// Applies a verified webhook delivery. A redelivery of an already
    /// processed `event_id` is a silent no-op.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError` if the idempotency table can't be reached.
    /// Ledger failures are logged and swallowed — see module docs on
    /// `booking_engine::refund_cancelled_booking` for why a reconciliation
    /// failure must not turn into an HTTP 500 back to the PSP, which would
    /// just trigger endless redelivery of an event whose idempotency key
    /// we've already recorded.
    pub async fn handle(&self, event: WebhookEvent) -> Result<(), WebhookError> {
        if !self.processed.mark_processed(event.event_id()).await? {
            return Ok(());
        }
        match event {
            WebhookEvent::PaymentIntentSucceeded { intent_id, .. } => {
                self.credit_driver_for_intent(&intent_id).await;
            }
            WebhookEvent::ChargeRefunded { intent_id, refunded_minor, .. } => {
                self.reconcile_refund(&intent_id, Money::from_minor(refunded_minor)).await;
            }
            WebhookEvent::PaymentIntentFailed { intent_id, .. } => {
                tracing::warn!(%intent_id, "payment intent failed; booking remains unpaid, no ledger action taken");
            }
            WebhookEvent::AccountUpdated { account_id, .. } => {
                tracing::info!(%account_id, "connected account status updated");
            }
            WebhookEvent::TransferCreated { transfer_id, payout_id, .. } => {
                tracing::warn!(%transfer_id, %payout_id, "transfer created; no local payout record to attach it to");
            }
            WebhookEvent::PayoutPaid { payout_id, .. } | WebhookEvent::PayoutFailed { payout_id, .. } => {
                tracing::warn!(%payout_id, "payout status delivered; no local payout record to update");
            }
        }
        Ok(())
    }

    async fn credit_driver_for_intent(&self, intent_id: &str) {
        let Some(booking) = self.lookup.find_by_intent(intent_id).await else {
            tracing::warn!(%intent_id, "paymentIntent.succeeded for an intent with no matching booking");
            return;
        };
        if booking.payment_method != PaymentMethod::Card {
            return;
        }
        if self.payout_accounts.connected_account_for(booking.driver_id).await.is_some() {
            // the PSP already split the charge at source; nothing local to credit.
            return;
        }
        let (_fee, net) = booking.amount.split_fee(self.platform_fee_percent);
        if let Err(err) = self
            .ledger
            .credit(booking.driver_id, TransactionKind::BookingEarning, net, Some(booking.booking_id), "card booking earning")
            .await
        {
            tracing::error!(%err, %intent_id, "failed to credit driver after paymentIntent.succeeded");
        }
    }

    /// Fills in the driver-side clawback for a `charge.refunded` delivery.
    /// Crediting the passenger is `CancelBooking`'s synchronous job
    /// (`booking_engine::refund_cancelled_booking`), not this webhook's —
    /// doing it here too would double-credit every card refund, since that
    /// synchronous path already runs before the PSP's async webhook arrives.
    /// The driver debit is guarded by the same `refund-clawback:{intentId}`
    /// key the synchronous path marks, not just this event's `event_id`, so
    /// whichever of the two paths runs first is the only one that debits.
    async fn reconcile_refund(&self, intent_id: &str, refunded: Money) {
        let Some(booking) = self.lookup.find_by_intent(intent_id).await else {
            tracing::warn!(%intent_id, "charge.refunded for an intent with no matching booking");
            return;
        };
        if self.payout_accounts.connected_account_for(booking.driver_id).await.is_some() {
            return;
        }
        match self.processed.mark_processed(&crate::booking_engine::refund_clawback_key(intent_id)).await {
            Ok(true) => {
                let (_fee, net) = refunded.split_fee(self.platform_fee_percent);
                if let Err(err) = self
                    .ledger
                    .debit(booking.driver_id, TransactionKind::Refund, net, Some(booking.booking_id), "refund clawback")
                    .await
                {
                    tracing::error!(%err, %intent_id, "failed to debit driver for refund clawback");
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(%err, %intent_id, "failed to check refund clawback idempotency, skipping to avoid a double debit");
            }
        }
    }
}
