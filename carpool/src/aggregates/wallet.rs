//! The Wallet aggregate: a passenger's or driver's internal balance and its
//! append-only transaction ledger. Every balance change is the result of one
//! `Transaction` event — there is no separate "set balance" operation —
//! mirroring the ticketing example's `PaymentReducer`, which never mutates a
//! stored total directly but always derives it from the event it is about to
//! append.

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
use crate::types::{BookingId, Money, TransactionId, UserId, WalletId};

pub const TOPIC: &str = "wallet-events";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    TopUp,
    BookingPayment,
    BookingEarning,
    Refund,
    Payout,
    PlatformFee,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub wallet_id: WalletId,
    pub kind: TransactionKind,
    pub amount: Money,
    pub balance_after: Money,
    pub booking_id: Option<BookingId>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, State)]
pub struct WalletState {
    pub wallet_id: Option<WalletId>,
    pub owner_id: Option<UserId>,
    pub balance: Money,
    pub transactions: Vec<Transaction>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub conflict: bool,
    #[version]
    pub version: Option<Version>,
}

impl ConflictAware for WalletState {
    fn take_conflict(&mut self) -> bool {
        std::mem::take(&mut self.conflict)
    }
}

#[derive(Clone, Debug, Action, Serialize, Deserialize)]
pub enum WalletAction {
    #[command]
    OpenWallet {
        wallet_id: WalletId,
        owner_id: UserId,
        now: DateTime<Utc>,
    },
    #[command]
    Credit {
        transaction_id: TransactionId,
        kind: TransactionKind,
        amount: Money,
        booking_id: Option<BookingId>,
        description: String,
        now: DateTime<Utc>,
    },
    /// Debits the wallet; rejected with `InsufficientBalance` (surfaced as a
    /// `ValidationFailed` event) if the balance would go negative.
    #[command]
    Debit {
        transaction_id: TransactionId,
        kind: TransactionKind,
        amount: Money,
        booking_id: Option<BookingId>,
        description: String,
        now: DateTime<Utc>,
    },

    #[event]
    WalletOpened { wallet_id: WalletId, owner_id: UserId },
    #[event]
    TransactionRecorded { transaction: Box<Transaction> },
    #[event]
    ValidationFailed { reason: String },
    #[event]
    PersistConflict,
    #[event]
    PersistFailed { reason: String },
}

impl Event for WalletAction {
    fn event_type(&self) -> &'static str {
        self.event_type()
    }
}

pub struct WalletEnvironment {
    pub event_store: Arc<dyn EventStore>,
    pub event_bus: Arc<dyn EventBus>,
    pub clock: Arc<dyn Clock>,
    pub version_cell: Arc<RwLock<Version>>,
    pub stream_id: carpool_core::stream::StreamId,
}

impl VersionedEnvironment for WalletEnvironment {
    fn version_cell(&self) -> &Arc<RwLock<Version>> {
        &self.version_cell
    }
}

#[derive(Default)]
pub struct WalletReducer;

impl WalletReducer {
    fn emit(env: &WalletEnvironment, event: WalletAction) -> Vec<Effect<WalletAction>> {
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
                    Some(WalletAction::PersistConflict)
                }
                Err(err) => Some(WalletAction::PersistFailed {
                    reason: err.to_string(),
                }),
            }
        }))]
    }

    fn fail(env: &WalletEnvironment, reason: impl Into<String>) -> Vec<Effect<WalletAction>> {
        Self::emit(
            env,
            WalletAction::ValidationFailed {
                reason: reason.into(),
            },
        )
    }
}

impl Reducer for WalletReducer {
    type State = WalletState;
    type Action = WalletAction;
    type Environment = WalletEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Vec<Effect<Self::Action>> {
        match action {
            WalletAction::OpenWallet {
                wallet_id,
                owner_id,
                now: _,
            } => {
                if state.wallet_id.is_some() {
                    return Self::fail(env, "wallet already open");
                }
                Self::emit(env, WalletAction::WalletOpened { wallet_id, owner_id })
            }

            WalletAction::Credit {
                transaction_id,
                kind,
                amount,
                booking_id,
                description,
                now,
            } => {
                let Some(wallet_id) = state.wallet_id else {
                    return Self::fail(env, "wallet not found");
                };
                let Some(balance_after) = state.balance.checked_add(amount) else {
                    return Self::fail(env, "balance overflow");
                };
                Self::emit(
                    env,
                    WalletAction::TransactionRecorded {
                        transaction: Box::new(Transaction {
                            id: transaction_id,
                            wallet_id,
                            kind,
                            amount,
                            balance_after,
                            booking_id,
                            description,
                            created_at: now,
                        }),
                    },
                )
            }

            WalletAction::Debit {
                transaction_id,
                kind,
                amount,
                booking_id,
                description,
                now,
            } => {
                let Some(wallet_id) = state.wallet_id else {
                    return Self::fail(env, "wallet not found");
                };
                let Some(balance_after) = state.balance.checked_sub(amount) else {
                    return Self::fail(env, "insufficient wallet balance");
                };
                if balance_after.is_negative() {
                    return Self::fail(env, "insufficient wallet balance");
                }
                Self::emit(
                    env,
                    WalletAction::TransactionRecorded {
                        transaction: Box::new(Transaction {
                            id: transaction_id,
                            wallet_id,
                            kind,
                            amount: -amount,
                            balance_after,
                            booking_id,
                            description,
                            created_at: now,
                        }),
                    },
                )
            }

            WalletAction::WalletOpened { wallet_id, owner_id } => {
                state.wallet_id = Some(wallet_id);
                state.owner_id = Some(owner_id);
                vec![Effect::None]
            }
            WalletAction::TransactionRecorded { transaction } => {
                state.balance = transaction.balance_after;
                state.transactions.push(*transaction);
                vec![Effect::None]
            }
            WalletAction::ValidationFailed { reason } => {
                state.last_error = Some(reason);
                vec![Effect::None]
            }
            WalletAction::PersistConflict => {
                state.conflict = true;
                vec![Effect::None]
            }
            WalletAction::PersistFailed { reason } => {
                state.last_error = Some(reason);
                vec![Effect::None]
            }
        }
    }
}
