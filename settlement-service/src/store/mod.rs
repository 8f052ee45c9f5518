//! Persistence seam for wallets, bets and rounds.
//!
//! Every method that changes a balance writes the balance and its transaction
//! as one unit. Postings are keyed by their transaction id: applying a posting
//! whose id is already in the log is a no-op that reports the current balance.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::configuration::{DatabaseSettings, StoreBackend};
use crate::error::StoreError;
use crate::model::{
    Bet, BetPlacement, BetResolution, Posting, Profile, ResolveOutcome, Round, Transaction,
    TransactionType, Wallet,
};

#[cfg(feature = "couchbase")]
pub mod couchbase_store;
pub mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Stores the profile and opens an empty wallet for it if none exists.
    async fn insert_profile(&self, profile: &Profile) -> Result<Wallet, StoreError>;

    async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError>;

    async fn wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, StoreError>;

    /// Transactions of one user, oldest first.
    async fn transactions(
        &self,
        user_id: Uuid,
        transaction_type: Option<TransactionType>,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn has_transaction(&self, transaction_id: Uuid) -> Result<bool, StoreError>;

    /// Applies a balance change with its transaction and returns the new balance.
    async fn post(&self, posting: &Posting) -> Result<i64, StoreError>;

    async fn insert_round(&self, round: &Round) -> Result<(), StoreError>;

    async fn round(&self, round_id: Uuid) -> Result<Option<Round>, StoreError>;

    /// Replaces the round if the stored version still equals `round.version`.
    /// Returns the stored round with its version bumped, or
    /// [`StoreError::VersionConflict`] when another writer got there first.
    async fn update_round(&self, round: &Round) -> Result<Round, StoreError>;

    async fn bet(&self, bet_id: Uuid) -> Result<Option<Bet>, StoreError>;

    /// All bets of one cycle of a round, whatever their status.
    async fn round_bets(&self, round_id: Uuid, cycle: u32) -> Result<Vec<Bet>, StoreError>;

    /// Debits the stake and inserts the bet, or tops up the user's pending bet
    /// in the same cycle. Returns the stored bet and the new balance.
    async fn place_bet(
        &self,
        placement: &BetPlacement,
        debit: &Posting,
    ) -> Result<(Bet, i64), StoreError>;

    /// Moves a pending bet to its terminal status and applies the optional
    /// credit in the same unit.
    async fn resolve_bet(&self, resolution: &BetResolution) -> Result<ResolveOutcome, StoreError>;
}

/// Opens the backend selected in configuration.
pub async fn build_store(settings: &DatabaseSettings) -> Result<Arc<dyn LedgerStore>, StoreError> {
    match settings.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory ledger store, balances are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "couchbase")]
        StoreBackend::Couchbase => {
            let store = couchbase_store::CouchbaseStore::connect(settings).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "couchbase"))]
        StoreBackend::Couchbase => Err(StoreError::Backend(
            "built without the `couchbase` feature".to_string(),
        )),
    }
}
