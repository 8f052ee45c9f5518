use serde::Serialize;
use uuid::Uuid;

use crate::engine::rounds::expect_state;
use crate::engine::Ledger;
use crate::error::LedgerError;
use crate::events::LedgerEvent;
use crate::model::{
    Bet, BetPlacement, BetResolution, BetStatus, Posting, ResolveOutcome, RoundState,
    TransactionType,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedBet {
    pub bet: Bet,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledBet {
    pub bet: Bet,
    pub balance: i64,
    /// Pending total of the round after the cancellation, recomputed from the
    /// remaining bets.
    pub round_total: i64,
}

impl Ledger {
    /// Debits `amount` from the user's wallet and records the wager. A user
    /// keeps a single pending bet per round: a second wager is folded into
    /// the first one and moves it to the newly chosen option.
    #[tracing::instrument(name = "Placing bet", skip(self))]
    pub async fn place_bet(
        &self,
        round_id: Uuid,
        user_id: Uuid,
        option: &str,
        amount: i64,
    ) -> Result<PlacedBet, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::Validation("stake must be positive".into()));
        }

        let round = self.load_round(round_id).await?;
        expect_state(&round, RoundState::Open, "bet on")?;
        if !round.has_option(option) {
            return Err(LedgerError::Validation(format!(
                "`{}` is not an option of round {}",
                option, round_id
            )));
        }

        let debit = Posting::new(
            user_id,
            -amount,
            TransactionType::Bet,
            format!("Bet on `{}` in round {}", option, round_id),
        )
        .referencing(round_id);
        let placement = BetPlacement {
            round_id,
            cycle: round.cycle,
            user_id,
            option: option.to_string(),
            amount,
        };

        let (bet, balance) = self.store.place_bet(&placement, &debit).await?;
        tracing::info!(bet_id = %bet.id, stake = bet.amount, "Bet recorded");
        self.announce_balance(user_id, balance, debit.transaction_id);
        self.feed.publish(LedgerEvent::BetChanged { bet: bet.clone() });

        self.refresh_after_commit(round_id).await.ok();

        Ok(PlacedBet { bet, balance })
    }

    /// Withdraws a pending bet before the round locks and returns the full
    /// stake. Only the owner or an admin may cancel.
    #[tracing::instrument(name = "Cancelling bet", skip(self))]
    pub async fn cancel_bet(
        &self,
        round_id: Uuid,
        bet_id: Uuid,
        caller: Uuid,
    ) -> Result<CancelledBet, LedgerError> {
        let bet = self
            .store
            .bet(bet_id)
            .await?
            .filter(|b| b.round_id == round_id)
            .ok_or(LedgerError::BetNotFound(bet_id))?;

        if bet.user_id != caller && !self.is_admin(caller).await? {
            return Err(LedgerError::Forbidden("cancel another user's bet"));
        }

        let credit = Posting::new(
            bet.user_id,
            bet.amount,
            TransactionType::Refund,
            format!("Cancelled bet on `{}` in round {}", bet.option, round_id),
        )
        .keyed(&format!("cancel:{}", bet_id))
        .referencing(round_id);
        let transaction_id = credit.transaction_id;

        // A cancellation whose refund never landed is finished, not rejected.
        let unfinished = bet.status == BetStatus::Cancelled
            && !self.store.has_transaction(transaction_id).await?;
        if bet.status != BetStatus::Pending && !unfinished {
            return Err(LedgerError::BetNotPending {
                id: bet_id,
                status: bet.status,
            });
        }

        let round = self.load_round(round_id).await?;
        let open_cycle = if unfinished {
            None
        } else {
            expect_state(&round, RoundState::Open, "cancel a bet in")?;
            if bet.cycle != round.cycle {
                return Err(LedgerError::BetNotPending {
                    id: bet_id,
                    status: bet.status,
                });
            }
            Some(round.cycle)
        };

        let outcome = self
            .store
            .resolve_bet(&BetResolution {
                bet_id,
                status: BetStatus::Cancelled,
                credit: Some(credit),
                open_cycle,
            })
            .await?;

        let (bet, balance) = match outcome {
            ResolveOutcome::Applied {
                bet,
                balance: Some(balance),
            } => (bet, balance),
            ResolveOutcome::Applied { bet, balance: None } => {
                let balance = self.wallet(bet.user_id).await?.balance;
                (bet, balance)
            }
            ResolveOutcome::AlreadyResolved(bet) => {
                return Err(LedgerError::BetNotPending {
                    id: bet_id,
                    status: bet.status,
                })
            }
        };
        self.announce_balance(bet.user_id, balance, transaction_id);
        self.feed.publish(LedgerEvent::BetChanged { bet: bet.clone() });

        let round_total = match self.refresh_after_commit(round_id).await {
            Ok(refreshed) => refreshed.pending_total,
            Err(_) => round.pending_total.saturating_sub(bet.amount).max(0),
        };
        tracing::info!(%bet_id, round_total, "Bet cancelled");

        Ok(CancelledBet {
            bet,
            balance,
            round_total,
        })
    }
}
