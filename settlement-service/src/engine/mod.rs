//! Ledger operations: round lifecycle, wagers, settlement, refunds and
//! administrative balance adjustments.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::events::{ChangeFeed, LedgerEvent};
use crate::model::{Profile, Role, Round, Transaction, TransactionType, Wallet};
use crate::store::LedgerStore;

pub mod adjustment;
pub mod bets;
pub mod payout;
pub mod refund;
pub mod rounds;
pub mod settlement;

pub use payout::FeeRate;

/// Attempts made to recompute a round total before giving up on contention.
const ROUND_UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub fee: FeeRate,
    /// Wallet that receives platform fees and rounding remainders.
    pub house_account: Uuid,
    /// Whether an administrative debit may leave a wallet below zero.
    pub allow_negative_adjustments: bool,
}

/// Bet that could not be settled or refunded. It stays pending and is picked
/// up again when the operation is re-triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBet {
    pub bet_id: Uuid,
    pub reason: String,
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    feed: ChangeFeed,
    policy: LedgerPolicy,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, feed: ChangeFeed, policy: LedgerPolicy) -> Ledger {
        Ledger {
            store,
            feed,
            policy,
        }
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Makes sure the house account can receive fee postings.
    #[tracing::instrument(name = "Bootstrapping ledger", skip(self))]
    pub async fn bootstrap(&self) -> Result<(), LedgerError> {
        if self.store.wallet(self.policy.house_account).await?.is_none() {
            tracing::info!(house_account = %self.policy.house_account, "Opening house wallet");
            self.store
                .insert_profile(&Profile {
                    user_id: self.policy.house_account,
                    role: Role::Admin,
                })
                .await?;
        }
        Ok(())
    }

    #[tracing::instrument(name = "Creating profile", skip(self))]
    pub async fn create_profile(&self, profile: Profile) -> Result<Wallet, LedgerError> {
        Ok(self.store.insert_profile(&profile).await?)
    }

    pub async fn require_admin(&self, caller: Uuid, action: &'static str) -> Result<(), LedgerError> {
        match self.store.profile(caller).await? {
            Some(Profile {
                role: Role::Admin, ..
            }) => Ok(()),
            _ => {
                tracing::warn!(%caller, action, "Rejected non-admin caller");
                Err(LedgerError::Forbidden(action))
            }
        }
    }

    pub async fn is_admin(&self, caller: Uuid) -> Result<bool, LedgerError> {
        Ok(matches!(
            self.store.profile(caller).await?,
            Some(Profile {
                role: Role::Admin,
                ..
            })
        ))
    }

    pub async fn wallet(&self, user_id: Uuid) -> Result<Wallet, LedgerError> {
        self.store
            .wallet(user_id)
            .await?
            .ok_or_else(|| crate::error::StoreError::MissingWallet(user_id).into())
    }

    pub async fn transactions(
        &self,
        user_id: Uuid,
        transaction_type: Option<TransactionType>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.store.transactions(user_id, transaction_type).await?)
    }

    async fn load_round(&self, round_id: Uuid) -> Result<Round, LedgerError> {
        self.store
            .round(round_id)
            .await?
            .ok_or(LedgerError::RoundNotFound(round_id))
    }

    /// Writes `round` and announces it on the change feed.
    async fn save_round(&self, round: &Round) -> Result<Round, LedgerError> {
        let stored = self.store.update_round(round).await?;
        self.feed.publish(LedgerEvent::RoundUpdated {
            round: stored.clone(),
        });
        Ok(stored)
    }

    /// Sets the round's pending total to the sum of its pending bets, read
    /// fresh from the store, retrying while other writers bump the version.
    async fn refresh_pending_total(&self, round_id: Uuid) -> Result<Round, LedgerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut round = self.load_round(round_id).await?;
            let total = rounds::pending_total(&self.store.round_bets(round_id, round.cycle).await?);
            if round.pending_total == total {
                return Ok(round);
            }
            round.pending_total = total;

            match self.save_round(&round).await {
                Err(LedgerError::Conflict(_)) if attempt < ROUND_UPDATE_ATTEMPTS => {
                    tracing::debug!(%round_id, attempt, "Round changed while recomputing total");
                }
                result => return result,
            }
        }
    }

    /// Refresh for callers whose own write has already committed: a failure
    /// is logged and handed back as a warning instead of an error.
    async fn refresh_after_commit(&self, round_id: Uuid) -> Result<Round, String> {
        self.refresh_pending_total(round_id).await.map_err(|e| {
            tracing::warn!(%round_id, error = %e, "Pending total not refreshed");
            format!("pending total of round {} not refreshed: {}", round_id, e)
        })
    }

    fn announce_balance(&self, user_id: Uuid, balance: i64, transaction_id: Uuid) {
        self.feed.publish(LedgerEvent::WalletChanged {
            user_id,
            balance,
            transaction_id,
        });
    }
}
