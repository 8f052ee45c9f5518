use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    Bet, BetPlacement, BetResolution, BetStatus, Posting, Profile, ResolveOutcome, Round,
    Transaction, TransactionType, Wallet,
};
use crate::store::LedgerStore;

/// In-process store. Each trait method runs under a single lock, which makes
/// every method one atomic unit.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    profiles: HashMap<Uuid, Profile>,
    wallets: HashMap<Uuid, Wallet>,
    transactions: Vec<Transaction>,
    transaction_ids: HashSet<Uuid>,
    rounds: HashMap<Uuid, Round>,
    bets: HashMap<Uuid, Bet>,
}

impl Inner {
    fn apply(&mut self, posting: &Posting) -> Result<i64, StoreError> {
        let wallet = self
            .wallets
            .get_mut(&posting.user_id)
            .ok_or(StoreError::MissingWallet(posting.user_id))?;

        if self.transaction_ids.contains(&posting.transaction_id) {
            return Ok(wallet.balance);
        }

        let balance =
            wallet
                .balance
                .checked_add(posting.amount)
                .ok_or(StoreError::AmountOverflow {
                    what: "balance",
                    id: posting.user_id,
                })?;
        if balance < 0 && posting.amount < 0 && !posting.allow_negative {
            return Err(StoreError::InsufficientBalance {
                available: wallet.balance,
                required: posting.amount.saturating_neg(),
            });
        }

        let now = Utc::now();
        wallet.balance = balance;
        wallet.updated_at = now;
        self.transaction_ids.insert(posting.transaction_id);
        self.transactions.push(posting.to_transaction(now));

        Ok(balance)
    }

    fn expect_open(&self, round_id: Uuid, cycle: u32) -> Result<(), StoreError> {
        let round = self.rounds.get(&round_id).ok_or(StoreError::NotFound {
            entity: "round",
            id: round_id,
        })?;
        if !round.accepts_bets(cycle) {
            return Err(StoreError::RoundNotOpen(round_id));
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    #[cfg(test)]
    pub(crate) fn remove_wallet(&self, user_id: Uuid) -> Option<Wallet> {
        self.inner.lock().wallets.remove(&user_id)
    }

    #[cfg(test)]
    pub(crate) fn restore_wallet(&self, wallet: Wallet) {
        self.inner.lock().wallets.insert(wallet.user_id, wallet);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_profile(&self, profile: &Profile) -> Result<Wallet, StoreError> {
        let mut inner = self.inner.lock();
        inner.profiles.insert(profile.user_id, profile.clone());
        let wallet = inner
            .wallets
            .entry(profile.user_id)
            .or_insert_with(|| Wallet {
                user_id: profile.user_id,
                balance: 0,
                updated_at: Utc::now(),
            });

        Ok(wallet.clone())
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        Ok(self.inner.lock().profiles.get(&user_id).cloned())
    }

    async fn wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, StoreError> {
        Ok(self.inner.lock().wallets.get(&user_id).cloned())
    }

    async fn transactions(
        &self,
        user_id: Uuid,
        transaction_type: Option<TransactionType>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let inner = self.inner.lock();
        let rows = inner
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| transaction_type.map_or(true, |kind| t.transaction_type == kind))
            .cloned()
            .collect();

        Ok(rows)
    }

    async fn has_transaction(&self, transaction_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.lock().transaction_ids.contains(&transaction_id))
    }

    async fn post(&self, posting: &Posting) -> Result<i64, StoreError> {
        self.inner.lock().apply(posting)
    }

    async fn insert_round(&self, round: &Round) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.rounds.contains_key(&round.id) {
            return Err(StoreError::AlreadyExists {
                entity: "round",
                id: round.id,
            });
        }
        inner.rounds.insert(round.id, round.clone());

        Ok(())
    }

    async fn round(&self, round_id: Uuid) -> Result<Option<Round>, StoreError> {
        Ok(self.inner.lock().rounds.get(&round_id).cloned())
    }

    async fn update_round(&self, round: &Round) -> Result<Round, StoreError> {
        let mut inner = self.inner.lock();
        let stored = inner.rounds.get_mut(&round.id).ok_or(StoreError::NotFound {
            entity: "round",
            id: round.id,
        })?;

        if stored.version != round.version {
            return Err(StoreError::VersionConflict(round.id));
        }

        *stored = round.clone();
        stored.version += 1;

        Ok(stored.clone())
    }

    async fn bet(&self, bet_id: Uuid) -> Result<Option<Bet>, StoreError> {
        Ok(self.inner.lock().bets.get(&bet_id).cloned())
    }

    async fn round_bets(&self, round_id: Uuid, cycle: u32) -> Result<Vec<Bet>, StoreError> {
        let inner = self.inner.lock();
        let mut bets: Vec<Bet> = inner
            .bets
            .values()
            .filter(|b| b.round_id == round_id && b.cycle == cycle)
            .cloned()
            .collect();
        bets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(bets)
    }

    async fn place_bet(
        &self,
        placement: &BetPlacement,
        debit: &Posting,
    ) -> Result<(Bet, i64), StoreError> {
        let mut inner = self.inner.lock();
        inner.expect_open(placement.round_id, placement.cycle)?;

        let existing = inner
            .bets
            .values()
            .find(|b| {
                b.round_id == placement.round_id
                    && b.cycle == placement.cycle
                    && b.user_id == placement.user_id
                    && b.status == BetStatus::Pending
            })
            .map(|b| (b.id, b.amount));
        let topped_up = match existing {
            Some((id, amount)) => Some((
                id,
                amount
                    .checked_add(placement.amount)
                    .ok_or(StoreError::AmountOverflow { what: "bet", id })?,
            )),
            None => None,
        };

        let balance = inner.apply(debit)?;
        let now = Utc::now();

        let bet = match topped_up {
            Some((id, amount)) => {
                let bet = inner.bets.get_mut(&id).ok_or(StoreError::NotFound {
                    entity: "bet",
                    id,
                })?;
                bet.amount = amount;
                bet.option = placement.option.clone();
                bet.updated_at = now;
                bet.clone()
            }
            None => {
                let bet = Bet {
                    id: Uuid::new_v4(),
                    round_id: placement.round_id,
                    cycle: placement.cycle,
                    user_id: placement.user_id,
                    option: placement.option.clone(),
                    amount: placement.amount,
                    status: BetStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };
                inner.bets.insert(bet.id, bet.clone());
                bet
            }
        };

        Ok((bet, balance))
    }

    async fn resolve_bet(&self, resolution: &BetResolution) -> Result<ResolveOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let bet = inner
            .bets
            .get(&resolution.bet_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "bet",
                id: resolution.bet_id,
            })?;

        if !bet.status.can_transition_to(resolution.status) {
            return Ok(ResolveOutcome::AlreadyResolved(bet));
        }
        if let Some(cycle) = resolution.open_cycle {
            inner.expect_open(bet.round_id, cycle)?;
        }

        let balance = match &resolution.credit {
            Some(posting) => Some(inner.apply(posting)?),
            None => None,
        };

        let stored = inner
            .bets
            .get_mut(&resolution.bet_id)
            .ok_or(StoreError::NotFound {
                entity: "bet",
                id: resolution.bet_id,
            })?;
        stored.status = resolution.status;
        stored.updated_at = Utc::now();

        Ok(ResolveOutcome::Applied {
            bet: stored.clone(),
            balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    async fn store_with_wallet(balance: i64) -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store
            .insert_profile(&Profile {
                user_id: user,
                role: Role::User,
            })
            .await
            .unwrap();
        if balance != 0 {
            store
                .post(&Posting::new(user, balance, TransactionType::Deposit, "seed"))
                .await
                .unwrap();
        }
        (store, user)
    }

    #[tokio::test]
    async fn posting_the_same_transaction_twice_applies_once() {
        let (store, user) = store_with_wallet(0).await;
        let posting = Posting::new(user, 40, TransactionType::Deposit, "top up").keyed("once");

        assert_eq!(store.post(&posting).await.unwrap(), 40);
        assert_eq!(store.post(&posting).await.unwrap(), 40);
        assert_eq!(store.transactions(user, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn debit_below_zero_is_refused_unless_allowed() {
        let (store, user) = store_with_wallet(10).await;

        let err = store
            .post(&Posting::new(user, -25, TransactionType::Withdrawal, "too much"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientBalance {
                available: 10,
                required: 25
            }
        ));

        let balance = store
            .post(&Posting::new(user, -25, TransactionType::Withdrawal, "fix").allow_negative(true))
            .await
            .unwrap();
        assert_eq!(balance, -15);
    }

    #[tokio::test]
    async fn stale_round_versions_are_rejected() {
        let store = MemoryStore::new();
        let round = Round::new("r".into(), vec!["A".into(), "B".into()]);
        store.insert_round(&round).await.unwrap();

        let mut first = round.clone();
        first.betting_locked = true;
        let stored = store.update_round(&first).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut second = round.clone();
        second.winning_option = Some("A".into());
        let err = store.update_round(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(id) if id == round.id));
    }

    async fn open_round(store: &MemoryStore) -> Round {
        let round = Round::new("r".into(), vec!["A".into(), "B".into()]);
        store.insert_round(&round).await.unwrap();
        round
    }

    async fn place(
        store: &MemoryStore,
        round: &Round,
        user: Uuid,
        option: &str,
        amount: i64,
    ) -> Result<(Bet, i64), StoreError> {
        store
            .place_bet(
                &BetPlacement {
                    round_id: round.id,
                    cycle: round.cycle,
                    user_id: user,
                    option: option.to_string(),
                    amount,
                },
                &Posting::new(user, -amount, TransactionType::Bet, "bet"),
            )
            .await
    }

    #[tokio::test]
    async fn second_wager_tops_up_the_pending_bet() {
        let (store, user) = store_with_wallet(100).await;
        let round = open_round(&store).await;

        let (first, _) = place(&store, &round, user, "A", 30).await.unwrap();
        let (second, balance) = place(&store, &round, user, "B", 20).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.amount, 50);
        assert_eq!(second.option, "B");
        assert_eq!(balance, 50);
        assert_eq!(store.round_bets(round.id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wagers_on_a_closed_round_are_refused_without_a_debit() {
        let (store, user) = store_with_wallet(100).await;
        let round = open_round(&store).await;
        let mut locked = round.clone();
        locked.betting_locked = true;
        store.update_round(&locked).await.unwrap();

        let err = place(&store, &round, user, "A", 30).await.unwrap_err();

        assert!(matches!(err, StoreError::RoundNotOpen(id) if id == round.id));
        assert_eq!(store.wallet(user).await.unwrap().unwrap().balance, 100);
        assert!(store.round_bets(round.id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wagers_for_a_past_cycle_are_refused() {
        let (store, user) = store_with_wallet(100).await;
        let round = open_round(&store).await;
        let mut next = round.clone();
        next.cycle = 1;
        store.update_round(&next).await.unwrap();

        let err = place(&store, &round, user, "A", 30).await.unwrap_err();
        assert!(matches!(err, StoreError::RoundNotOpen(_)));
    }

    #[tokio::test]
    async fn balance_overflow_is_an_error_not_a_panic() {
        let (store, user) = store_with_wallet(100).await;

        let err = store
            .post(&Posting::new(user, i64::MAX, TransactionType::Deposit, "huge"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::AmountOverflow { what: "balance", .. }));
        assert_eq!(store.wallet(user).await.unwrap().unwrap().balance, 100);
        assert_eq!(store.transactions(user, None).await.unwrap().len(), 1);

        let err = store
            .post(&Posting::new(user, i64::MIN, TransactionType::Withdrawal, "huge"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientBalance {
                required: i64::MAX,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stake_overflow_leaves_the_wallet_untouched() {
        let (store, user) = store_with_wallet(0).await;
        store
            .post(
                &Posting::new(user, i64::MAX, TransactionType::Deposit, "whale")
                    .allow_negative(true),
            )
            .await
            .unwrap();
        let round = open_round(&store).await;
        place(&store, &round, user, "A", i64::MAX - 1).await.unwrap();
        store
            .post(&Posting::new(user, 10, TransactionType::Deposit, "more"))
            .await
            .unwrap();

        let err = place(&store, &round, user, "A", 10).await.unwrap_err();

        assert!(matches!(err, StoreError::AmountOverflow { what: "bet", .. }));
        assert_eq!(store.wallet(user).await.unwrap().unwrap().balance, 11);
    }

    #[tokio::test]
    async fn failed_credit_leaves_the_bet_pending() {
        let (store, user) = store_with_wallet(10).await;
        let round = open_round(&store).await;
        let (bet, _) = place(&store, &round, user, "A", 10).await.unwrap();
        store.remove_wallet(user);

        let err = store
            .resolve_bet(&BetResolution {
                bet_id: bet.id,
                status: BetStatus::Won,
                credit: Some(Posting::new(user, 20, TransactionType::BetWon, "win")),
                open_cycle: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::MissingWallet(id) if id == user));
        let stored = store.bet(bet.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BetStatus::Pending);
    }

    #[tokio::test]
    async fn guarded_resolution_needs_an_open_round() {
        let (store, user) = store_with_wallet(10).await;
        let round = open_round(&store).await;
        let (bet, _) = place(&store, &round, user, "A", 10).await.unwrap();
        let mut locked = round.clone();
        locked.betting_locked = true;
        store.update_round(&locked).await.unwrap();

        let err = store
            .resolve_bet(&BetResolution {
                bet_id: bet.id,
                status: BetStatus::Cancelled,
                credit: Some(Posting::new(user, 10, TransactionType::Refund, "cancel")),
                open_cycle: Some(round.cycle),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::RoundNotOpen(_)));
        assert_eq!(store.wallet(user).await.unwrap().unwrap().balance, 0);
        assert_eq!(
            store.bet(bet.id).await.unwrap().unwrap().status,
            BetStatus::Pending
        );
    }

    #[tokio::test]
    async fn resolved_bets_are_not_resolved_again() {
        let (store, user) = store_with_wallet(10).await;
        let round = open_round(&store).await;
        let (bet, _) = place(&store, &round, user, "A", 10).await.unwrap();

        let refund = BetResolution {
            bet_id: bet.id,
            status: BetStatus::Refunded,
            credit: Some(Posting::new(user, 10, TransactionType::Refund, "refund")),
            open_cycle: None,
        };
        assert!(matches!(
            store.resolve_bet(&refund).await.unwrap(),
            ResolveOutcome::Applied {
                balance: Some(10),
                ..
            }
        ));

        let again = BetResolution {
            credit: Some(Posting::new(user, 10, TransactionType::Refund, "refund")),
            ..refund
        };
        assert!(matches!(
            store.resolve_bet(&again).await.unwrap(),
            ResolveOutcome::AlreadyResolved(_)
        ));
        assert_eq!(store.wallet(user).await.unwrap().unwrap().balance, 10);
    }
}
