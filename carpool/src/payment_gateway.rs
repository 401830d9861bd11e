//! The boundary to an external payment service provider (a Stripe-shaped
//! API: payment intents, connected accounts, transfers). Expanded from the
//! ticketing example's narrower `PaymentGateway` (which only had
//! `process_payment`/`refund_payment`) into the six operations the split-
//! payments flow actually needs, kept `Arc<dyn PaymentGateway>`-holdable the
//! same way.
//!
//! The core must treat every call as eventually consistent: a successful
//! intent is authoritative only once confirmed either by a direct
//! `get_intent` returning `succeeded`, or by a signed webhook
//! (`crate::webhook`). Nothing here commits money by itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{Money, UserId};

pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

#[derive(Debug, Clone)]
pub enum PaymentGatewayError {
    CardDeclined { reason: String },
    InsufficientFunds,
    InvalidRequest { reason: String },
    AccountNotOnboarded,
    Timeout,
    Other { message: String },
}

impl std::fmt::Display for PaymentGatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CardDeclined { reason } => write!(f, "card declined: {reason}"),
            Self::InsufficientFunds => write!(f, "insufficient funds"),
            Self::InvalidRequest { reason } => write!(f, "invalid request: {reason}"),
            Self::AccountNotOnboarded => write!(f, "connected account not onboarded"),
            Self::Timeout => write!(f, "gateway timeout"),
            Self::Other { message } => write!(f, "payment error: {message}"),
        }
    }
}

impl std::error::Error for PaymentGatewayError {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresAction,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub client_secret: String,
    pub status: IntentStatus,
    pub amount: Money,
    pub transfer_data: Option<TransferData>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferData {
    pub destination_account: String,
    pub application_fee: Money,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Refund {
    pub refund_id: String,
    pub amount: Money,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub account_id: String,
    pub onboarding_url: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountStatus {
    pub capabilities_enabled: bool,
    pub requirements_due: Vec<String>,
}

/// Abstraction over a split-payments-capable PSP (Stripe Connect-shaped).
/// Held as `Arc<dyn PaymentGateway>` inside reducer `Environment`s, same
/// convention as the ticketing example's narrower trait.
pub trait PaymentGateway: Send + Sync {
    fn create_intent(
        &self,
        amount: Money,
        metadata: serde_json::Value,
        split_destination: Option<String>,
        application_fee: Option<Money>,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Intent>> + Send>>;

    fn get_intent(
        &self,
        intent_id: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Intent>> + Send>>;

    fn refund(
        &self,
        intent_id: &str,
        reverse_transfer: bool,
        refund_application_fee: bool,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Refund>> + Send>>;

    fn create_transfer(
        &self,
        amount: Money,
        destination_account: &str,
        metadata: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Transfer>> + Send>>;

    fn create_connected_account(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<ConnectedAccount>> + Send>>;

    fn get_account(
        &self,
        account_id: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<AccountStatus>> + Send>>;
}

/// Always-succeeds gateway for development and tests, mirroring the
/// ticketing example's `MockPaymentGateway` but across the wider operation
/// set.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway;

impl MockPaymentGateway {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_intent(
        &self,
        amount: Money,
        metadata: serde_json::Value,
        split_destination: Option<String>,
        application_fee: Option<Money>,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Intent>> + Send>> {
        Box::pin(async move {
            let intent_id = format!("mock_pi_{}", uuid::Uuid::new_v4());
            tracing::info!(%intent_id, amount = amount.minor(), ?metadata, "mock intent created");
            Ok(Intent {
                client_secret: format!("{intent_id}_secret"),
                status: IntentStatus::Succeeded,
                amount,
                transfer_data: split_destination.map(|destination_account| TransferData {
                    destination_account,
                    application_fee: application_fee.unwrap_or(Money::ZERO),
                }),
                intent_id,
            })
        })
    }

    fn get_intent(
        &self,
        intent_id: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Intent>> + Send>> {
        let intent_id = intent_id.to_string();
        Box::pin(async move {
            Ok(Intent {
                intent_id,
                client_secret: String::new(),
                status: IntentStatus::Succeeded,
                amount: Money::ZERO,
                transfer_data: None,
            })
        })
    }

    fn refund(
        &self,
        intent_id: &str,
        reverse_transfer: bool,
        refund_application_fee: bool,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Refund>> + Send>> {
        let intent_id = intent_id.to_string();
        Box::pin(async move {
            let refund_id = format!("mock_re_{}", uuid::Uuid::new_v4());
            tracing::info!(%intent_id, %refund_id, reverse_transfer, refund_application_fee, "mock refund issued");
            Ok(Refund {
                refund_id,
                amount: Money::ZERO,
            })
        })
    }

    fn create_transfer(
        &self,
        amount: Money,
        destination_account: &str,
        metadata: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Transfer>> + Send>> {
        let destination_account = destination_account.to_string();
        Box::pin(async move {
            let transfer_id = format!("mock_tr_{}", uuid::Uuid::new_v4());
            tracing::info!(%transfer_id, %destination_account, amount = amount.minor(), ?metadata, "mock transfer created");
            Ok(Transfer { transfer_id })
        })
    }

    fn create_connected_account(
        &self,
        user_id: UserId,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<ConnectedAccount>> + Send>> {
        Box::pin(async move {
            let account_id = format!("mock_acct_{}", uuid::Uuid::new_v4());
            tracing::info!(%user_id, %account_id, "mock connected account created");
            Ok(ConnectedAccount {
                onboarding_url: format!("https://mock-psp.invalid/onboard/{account_id}"),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
                account_id,
            })
        })
    }

    fn get_account(
        &self,
        account_id: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<AccountStatus>> + Send>> {
        let _ = account_id;
        Box::pin(async move {
            Ok(AccountStatus {
                capabilities_enabled: true,
                requirements_due: Vec::new(),
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_intent_carries_split_destination() {
        let gateway = MockPaymentGateway::new();
        let intent = gateway
            .create_intent(
                Money::from_minor(5000),
                serde_json::json!({"rideId": "r1"}),
                Some("acct_driver".to_string()),
                Some(Money::from_minor(500)),
            )
            .await
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Succeeded);
        let transfer = intent.transfer_data.unwrap();
        assert_eq!(transfer.destination_account, "acct_driver");
        assert_eq!(transfer.application_fee, Money::from_minor(500));
    }
}
