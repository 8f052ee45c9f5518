use serde::Serialize;
use uuid::Uuid;

use crate::engine::{FailedBet, Ledger};
use crate::error::LedgerError;
use crate::events::LedgerEvent;
use crate::model::{
    BetResolution, BetStatus, Posting, ResolveOutcome, RoundState, TransactionType,
    CANCELLED_SENTINEL,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundReport {
    pub round_id: Uuid,
    pub resumed: bool,
    pub refunded: usize,
    pub refunded_total: i64,
    pub failed_bets: Vec<FailedBet>,
    /// Problems after the money moved that need no retry.
    pub warnings: Vec<String>,
}

impl RefundReport {
    pub fn is_complete(&self) -> bool {
        self.failed_bets.is_empty()
    }
}

impl Ledger {
    /// Cancels an open or locked round and gives every pending stake back in
    /// full. The round ends locked with the `cancelled` sentinel as its result
    /// and cannot be reopened.
    #[tracing::instrument(name = "Refunding round", skip(self))]
    pub async fn refund(&self, round_id: Uuid) -> Result<RefundReport, LedgerError> {
        let round = self.load_round(round_id).await?;

        let (round, resumed) = match round.state() {
            RoundState::Open | RoundState::Locked => {
                let mut cancelled = round;
                cancelled.betting_locked = true;
                cancelled.winning_option = Some(CANCELLED_SENTINEL.to_string());
                (self.save_round(&cancelled).await?, false)
            }
            RoundState::Cancelled => (round, true),
            RoundState::Resolved => {
                return Err(LedgerError::AlreadySettled {
                    round_id,
                    winning_option: round.winning_option.unwrap_or_default(),
                })
            }
        };

        let pending: Vec<_> = self
            .store
            .round_bets(round_id, round.cycle)
            .await?
            .into_iter()
            .filter(|b| b.status == BetStatus::Pending)
            .collect();

        if resumed && pending.is_empty() {
            return Err(LedgerError::AlreadySettled {
                round_id,
                winning_option: CANCELLED_SENTINEL.to_string(),
            });
        }

        let mut report = RefundReport {
            round_id,
            resumed,
            refunded: 0,
            refunded_total: 0,
            failed_bets: Vec::new(),
            warnings: Vec::new(),
        };

        for bet in pending {
            let credit = Posting::new(
                bet.user_id,
                bet.amount,
                TransactionType::Refund,
                format!("Refund for cancelled round {}", round_id),
            )
            .keyed(&format!("refund:{}", bet.id))
            .referencing(round_id);
            let transaction_id = credit.transaction_id;

            let resolution = BetResolution {
                bet_id: bet.id,
                status: BetStatus::Refunded,
                credit: Some(credit),
                open_cycle: None,
            };
            match self.store.resolve_bet(&resolution).await {
                Ok(ResolveOutcome::Applied { bet, balance }) => {
                    report.refunded += 1;
                    report.refunded_total = report.refunded_total.saturating_add(bet.amount);
                    if let Some(balance) = balance {
                        self.announce_balance(bet.user_id, balance, transaction_id);
                    }
                    self.feed.publish(LedgerEvent::BetChanged { bet });
                }
                Ok(ResolveOutcome::AlreadyResolved(bet)) => {
                    tracing::debug!(bet_id = %bet.id, status = %bet.status, "Bet already resolved");
                }
                Err(e) => {
                    tracing::error!(bet_id = %bet.id, error = %e, "Failed to refund bet");
                    report.failed_bets.push(FailedBet {
                        bet_id: bet.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Err(warning) = self.refresh_after_commit(round_id).await {
            report.warnings.push(warning);
        }
        tracing::info!(
            refunded = report.refunded,
            refunded_total = report.refunded_total,
            failed = report.failed_bets.len(),
            "Round cancelled"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{balance, funded_user, gated_ledger, ledger, HOUSE};
    use crate::store::LedgerStore;

    #[tokio::test]
    async fn refunds_return_the_exact_stakes() {
        let (ledger, store) = ledger().await;
        let round = ledger
            .create_round("r".into(), vec!["A".into(), "B".into()])
            .await
            .unwrap();
        let stakes = [("A", 100), ("B", 37), ("A", 1)];
        let mut users = Vec::new();
        for (option, stake) in stakes {
            let user = funded_user(&store, 500).await;
            ledger.place_bet(round.id, user, option, stake).await.unwrap();
            users.push(user);
        }
        ledger.lock_round(round.id).await.unwrap();

        let report = ledger.refund(round.id).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.refunded, 3);
        assert_eq!(report.refunded_total, 138);
        for user in &users {
            assert_eq!(balance(&store, *user).await, 500);
            let refunds = store
                .transactions(*user, Some(TransactionType::Refund))
                .await
                .unwrap();
            assert_eq!(refunds.len(), 1);
        }
        assert_eq!(balance(&store, HOUSE).await, 0);

        let round = store.round(round.id).await.unwrap().unwrap();
        assert_eq!(round.state(), RoundState::Cancelled);
        assert_eq!(round.winning_option.as_deref(), Some(CANCELLED_SENTINEL));
        assert!(round.betting_locked);
        assert_eq!(round.pending_total, 0);
        assert!(store
            .round_bets(round.id, 0)
            .await
            .unwrap()
            .iter()
            .all(|b| b.status == BetStatus::Refunded));
    }

    #[tokio::test]
    async fn resolved_rounds_cannot_be_refunded() {
        let (ledger, store) = ledger().await;
        let round = ledger
            .create_round("r".into(), vec!["A".into(), "B".into()])
            .await
            .unwrap();
        let user = funded_user(&store, 100).await;
        ledger.place_bet(round.id, user, "A", 100).await.unwrap();
        ledger.lock_round(round.id).await.unwrap();
        ledger.settle(round.id, "A").await.unwrap();

        assert!(matches!(
            ledger.refund(round.id).await,
            Err(LedgerError::AlreadySettled { .. })
        ));
        assert_eq!(balance(&store, user).await, 95);
    }

    #[tokio::test]
    async fn refunding_twice_is_rejected_and_cancelled_rounds_cannot_settle() {
        let (ledger, store) = ledger().await;
        let round = ledger
            .create_round("r".into(), vec!["A".into(), "B".into()])
            .await
            .unwrap();
        let user = funded_user(&store, 100).await;
        ledger.place_bet(round.id, user, "A", 60).await.unwrap();
        ledger.refund(round.id).await.unwrap();

        assert!(matches!(
            ledger.refund(round.id).await,
            Err(LedgerError::AlreadySettled { .. })
        ));
        assert!(matches!(
            ledger.settle(round.id, "A").await,
            Err(LedgerError::InvalidRoundState {
                state: RoundState::Cancelled,
                ..
            })
        ));
        assert_eq!(balance(&store, user).await, 100);
    }

    #[tokio::test]
    async fn failed_refunds_are_retried() {
        let (ledger, store) = ledger().await;
        let round = ledger
            .create_round("r".into(), vec!["A".into(), "B".into()])
            .await
            .unwrap();
        let alice = funded_user(&store, 100).await;
        let bob = funded_user(&store, 100).await;
        let stuck = ledger.place_bet(round.id, alice, "A", 60).await.unwrap().bet;
        ledger.place_bet(round.id, bob, "B", 40).await.unwrap();
        let saved = store.remove_wallet(alice).unwrap();

        let report = ledger.refund(round.id).await.unwrap();
        assert_eq!(report.failed_bets.len(), 1);
        assert_eq!(report.failed_bets[0].bet_id, stuck.id);
        assert_eq!(store.round(round.id).await.unwrap().unwrap().pending_total, 60);

        store.restore_wallet(saved);
        let retry = ledger.refund(round.id).await.unwrap();

        assert!(retry.resumed);
        assert_eq!(retry.refunded_total, 60);
        assert_eq!(balance(&store, alice).await, 100);
        assert_eq!(balance(&store, bob).await, 100);
    }

    #[tokio::test]
    async fn a_stale_total_after_refunds_is_a_warning() {
        let (ledger, gate) = gated_ledger().await;
        let round = ledger
            .create_round("r".into(), vec!["A".into(), "B".into()])
            .await
            .unwrap();
        let user = funded_user(&gate.inner, 100).await;
        ledger.place_bet(round.id, user, "B", 60).await.unwrap();
        gate.fail_total_updates();

        let report = ledger.refund(round.id).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.refunded_total, 60);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(balance(&gate.inner, user).await, 100);
        assert!(matches!(
            ledger.refund(round.id).await,
            Err(LedgerError::AlreadySettled { .. })
        ));
    }
}
