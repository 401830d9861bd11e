//! Reconciles signed PSP webhook deliveries against the wallet and booking
//! aggregates. Every handler is idempotent on the event id: a replayed
//! delivery is a no-op, tracked in a dedicated `processed_webhook_events`
//! table with a unique constraint on `event_id`, written in the same
//! transaction as the reconciliation effect it gates.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
}

/// Verifies an HMAC-SHA256 signature over the *raw* request body. Must run
/// before any JSON-parsing middleware touches the body, since re-serializing
/// would not reproduce byte-for-byte the payload the PSP signed.
///
/// # Errors
///
/// Returns `WebhookError::InvalidSignature` if the signature does not match.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature_hex: &str) -> Result<(), WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(raw_body);
    let expected = hex::decode(signature_hex).map_err(|_| WebhookError::InvalidSignature)?;
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WebhookEvent {
    #[serde(rename = "paymentIntent.succeeded")]
    PaymentIntentSucceeded { event_id: String, intent_id: String },
    #[serde(rename = "paymentIntent.failed")]
    PaymentIntentFailed { event_id: String, intent_id: String },
    #[serde(rename = "transfer.created")]
    TransferCreated {
        event_id: String,
        transfer_id: String,
        payout_id: String,
    },
    #[serde(rename = "payout.paid")]
    PayoutPaid { event_id: String, payout_id: String },
    #[serde(rename = "payout.failed")]
    PayoutFailed { event_id: String, payout_id: String },
    #[serde(rename = "account.updated")]
    AccountUpdated { event_id: String, account_id: String },
    #[serde(rename = "charge.refunded")]
    ChargeRefunded {
        event_id: String,
        intent_id: String,
        refunded_minor: i64,
    },
}

impl WebhookEvent {
    #[must_use]
    pub fn event_id(&self) -> &str {
        match self {
            Self::PaymentIntentSucceeded { event_id, .. }
            | Self::PaymentIntentFailed { event_id, .. }
            | Self::TransferCreated { event_id, .. }
            | Self::PayoutPaid { event_id, .. }
            | Self::PayoutFailed { event_id, .. }
            | Self::AccountUpdated { event_id, .. }
            | Self::ChargeRefunded { event_id, .. } => event_id,
        }
    }
}

/// Tracks which webhook event ids have already been reconciled, so a
/// redelivered event is a no-op rather than a double-credit.
pub trait ProcessedWebhookEvents: Send + Sync {
    /// Returns `true` and records the id if this is the first time it has
    /// been seen; returns `false` if it was already recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be reached.
    fn mark_processed(
        &self,
        event_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, WebhookError>> + Send + '_>>;
}
