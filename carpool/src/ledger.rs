//! Thin wrapper over `AggregateService<WalletReducer>` that gives every
//! other service (`BookingEngine`, `RequestEngine`, the webhook reconciler)
//! a single place to open-on-demand, credit, and debit a user's wallet
//! instead of re-deriving the wallet stream id and `OpenWallet`-if-absent
//! dance at every call site.
//!
//! One wallet per user, keyed by the user's own id — `LedgerStore.GetWallet`
//! in the source spec "creates one with zero balances if absent", which here
//! means executing `OpenWallet` the first time a stream has no events.

use std::sync::Arc;

use carpool_core::environment::Clock;
use carpool_core::event_bus::EventBus;
use carpool_core::event_store::EventStore;
use carpool_core::stream::Version;
use tokio::sync::RwLock;

use crate::aggregates::wallet::{TransactionKind, WalletAction, WalletEnvironment, WalletReducer};
use crate::error::DomainError;
use crate::service::AggregateService;
use crate::types::{BookingId, Money, TransactionId, UserId, WalletId};

pub struct WalletLedger {
    wallets: AggregateService<WalletReducer>,
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl WalletLedger {
    #[must_use]
    pub fn new(event_store: Arc<dyn EventStore>, event_bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            wallets: AggregateService::new(WalletReducer, event_store.clone()),
            event_store,
            event_bus,
            clock,
        }
    }

    #[must_use]
    pub fn wallet_id_for(user_id: UserId) -> WalletId {
        WalletId(user_id.0)
    }

    fn env(&self, user_id: UserId) -> WalletEnvironment {
        let stream_id: carpool_core::stream::StreamId = Self::wallet_id_for(user_id).into();
        WalletEnvironment {
            event_store: self.event_store.clone(),
            event_bus: self.event_bus.clone(),
            clock: self.clock.clone(),
            version_cell: Arc::new(RwLock::new(Version::INITIAL)),
            stream_id,
        }
    }

    async fn ensure_open(&self, user_id: UserId) -> Result<(), DomainError> {
        let env = self.env(user_id);
        let stream_id: carpool_core::stream::StreamId = Self::wallet_id_for(user_id).into();
        let (state, _version) = self.wallets.load(stream_id, &env).await?;
        if state.wallet_id.is_some() {
            return Ok(());
        }
        let now = self.clock.now();
        let state = self
            .wallets
            .execute(
                Self::wallet_id_for(user_id).into(),
                WalletAction::OpenWallet {
                    wallet_id: Self::wallet_id_for(user_id),
                    owner_id: user_id,
                    now,
                },
                &env,
            )
            .await?;
        if let Some(reason) = state.last_error {
            return Err(DomainError::Infra(anyhow::anyhow!(reason)));
        }
        Ok(())
    }

    /// Credits `user_id`'s wallet. Opens the wallet on first use.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` on overflow or a persistence failure.
    pub async fn credit(
        &self,
        user_id: UserId,
        kind: TransactionKind,
        amount: Money,
        booking_id: Option<BookingId>,
        description: impl Into<String>,
    ) -> Result<Money, DomainError> {
        self.ensure_open(user_id).await?;
        let env = self.env(user_id);
        let now = self.clock.now();
        let state = self
            .wallets
            .execute(
                Self::wallet_id_for(user_id).into(),
                WalletAction::Credit {
                    transaction_id: TransactionId::new(),
                    kind,
                    amount,
                    booking_id,
                    description: description.into(),
                    now,
                },
                &env,
            )
            .await?;
        if let Some(reason) = state.last_error {
            return Err(DomainError::Infra(anyhow::anyhow!(reason)));
        }
        Ok(state.balance)
    }

    /// Debits `user_id`'s wallet, rejecting the operation before it ever
    /// goes negative.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InsufficientBalance` if the balance would go
    /// negative, or `DomainError` on a persistence failure.
    pub async fn debit(
        &self,
        user_id: UserId,
        kind: TransactionKind,
        amount: Money,
        booking_id: Option<BookingId>,
        description: impl Into<String>,
    ) -> Result<Money, DomainError> {
        self.ensure_open(user_id).await?;
        let env = self.env(user_id);
        let now = self.clock.now();
        let state = self
            .wallets
            .execute(
                Self::wallet_id_for(user_id).into(),
                WalletAction::Debit {
                    transaction_id: TransactionId::new(),
                    kind,
                    amount,
                    booking_id,
                    description: description.into(),
                    now,
                },
                &env,
            )
            .await?;
        if let Some(reason) = state.last_error {
            return Err(if reason.contains("insufficient") {
                DomainError::InsufficientBalance
            } else {
                DomainError::Infra(anyhow::anyhow!(reason))
            });
        }
        Ok(state.balance)
    }

    /// Current balance, `Money::ZERO` if the wallet has never been opened.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the store cannot be read.
    pub async fn balance(&self, user_id: UserId) -> Result<Money, DomainError> {
        let env = self.env(user_id);
        let (state, _version) = self.wallets.load(Self::wallet_id_for(user_id).into(), &env).await?;
        Ok(state.balance)
    }
}
