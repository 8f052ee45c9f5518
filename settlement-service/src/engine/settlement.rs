use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

use crate::engine::payout::{self, PayoutPlan};
use crate::engine::{FailedBet, Ledger};
use crate::error::LedgerError;
use crate::events::LedgerEvent;
use crate::model::{
    BetResolution, BetStatus, Posting, ResolveOutcome, Round, RoundState, TransactionType,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub round_id: Uuid,
    pub winning_option: String,
    /// True when this run picked up a settlement interrupted earlier.
    pub resumed: bool,
    pub winners: usize,
    pub losers: usize,
    pub winning_pool: i64,
    pub losing_pool: i64,
    pub fee_total: i64,
    pub remainder: i64,
    /// Sum credited to winners during this run.
    pub paid_out: i64,
    pub failed_bets: Vec<FailedBet>,
    /// Fee or remainder postings to the house account that did not go through.
    pub house_errors: Vec<String>,
    /// Problems after the money moved that need no retry.
    pub warnings: Vec<String>,
}

impl SettlementReport {
    pub fn is_complete(&self) -> bool {
        self.failed_bets.is_empty() && self.house_errors.is_empty()
    }
}

impl Ledger {
    /// Declares `winning_option` for a locked round and pays out the pool.
    ///
    /// The round is claimed first with a version-guarded update so a second,
    /// concurrent trigger fails instead of paying twice. Each bet is then
    /// settled as its own atomic unit; bets that fail stay pending and are
    /// listed in the report. Triggering again with the same option finishes
    /// whatever is still pending.
    #[tracing::instrument(name = "Settling round", skip(self))]
    pub async fn settle(
        &self,
        round_id: Uuid,
        winning_option: &str,
    ) -> Result<SettlementReport, LedgerError> {
        let round = self.load_round(round_id).await?;
        if !round.has_option(winning_option) {
            return Err(LedgerError::Validation(format!(
                "`{}` is not an option of round {}",
                winning_option, round_id
            )));
        }

        let resumed = match round.state() {
            RoundState::Locked => false,
            RoundState::Resolved if round.winning_option.as_deref() == Some(winning_option) => true,
            RoundState::Resolved => {
                return Err(LedgerError::AlreadySettled {
                    round_id,
                    winning_option: round.winning_option.unwrap_or_default(),
                })
            }
            state => {
                return Err(LedgerError::InvalidRoundState {
                    round_id,
                    state,
                    action: "settle",
                })
            }
        };

        // Bets of a locked round no longer change, so the plan can be made
        // before the round is claimed.
        let bets = self.store.round_bets(round_id, round.cycle).await?;
        let plan = payout::plan(&bets, winning_option, self.policy.fee)
            .map_err(|e| LedgerError::Validation(e.to_string()))?;

        let round = if resumed {
            round
        } else {
            self.claim_winner(round, winning_option).await?
        };

        let pending: HashSet<Uuid> = bets
            .iter()
            .filter(|b| b.status == BetStatus::Pending)
            .map(|b| b.id)
            .collect();
        let house_postings = self.house_postings(&round, &plan);

        let mut unposted = Vec::new();
        for posting in house_postings {
            if !self.store.has_transaction(posting.transaction_id).await? {
                unposted.push(posting);
            }
        }

        if resumed && pending.is_empty() && unposted.is_empty() {
            return Err(LedgerError::AlreadySettled {
                round_id,
                winning_option: winning_option.to_string(),
            });
        }

        let mut report = SettlementReport {
            round_id,
            winning_option: winning_option.to_string(),
            resumed,
            winners: plan.lines.iter().filter(|l| l.status == BetStatus::Won).count(),
            losers: plan.lines.iter().filter(|l| l.status == BetStatus::Lost).count(),
            winning_pool: plan.winning_pool,
            losing_pool: plan.losing_pool,
            fee_total: plan.fee_total,
            remainder: plan.remainder,
            paid_out: 0,
            failed_bets: Vec::new(),
            house_errors: Vec::new(),
            warnings: Vec::new(),
        };

        if !plan.has_winners() {
            tracing::info!("No winning bets, the pool is retained");
        }

        for line in plan.lines.iter().filter(|l| pending.contains(&l.bet_id)) {
            let credit = (line.status == BetStatus::Won && line.payout > 0).then(|| {
                Posting::new(
                    line.user_id,
                    line.payout,
                    TransactionType::BetWon,
                    format!("Won round {} on `{}`", round_id, winning_option),
                )
                .keyed(&format!("bet_won:{}", line.bet_id))
                .referencing(round_id)
            });
            let transaction_id = credit.as_ref().map(|c| c.transaction_id);

            let resolution = BetResolution {
                bet_id: line.bet_id,
                status: line.status,
                credit,
                open_cycle: None,
            };
            match self.store.resolve_bet(&resolution).await {
                Ok(ResolveOutcome::Applied { bet, balance }) => {
                    if let (Some(balance), Some(transaction_id)) = (balance, transaction_id) {
                        report.paid_out = report.paid_out.saturating_add(line.payout);
                        self.announce_balance(bet.user_id, balance, transaction_id);
                    }
                    self.feed.publish(LedgerEvent::BetChanged { bet });
                }
                Ok(ResolveOutcome::AlreadyResolved(bet)) => {
                    tracing::debug!(bet_id = %bet.id, status = %bet.status, "Bet already resolved");
                }
                Err(e) => {
                    tracing::error!(bet_id = %line.bet_id, error = %e, "Failed to settle bet");
                    report.failed_bets.push(FailedBet {
                        bet_id: line.bet_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        for posting in unposted {
            match self.store.post(&posting).await {
                Ok(balance) => {
                    self.announce_balance(posting.user_id, balance, posting.transaction_id)
                }
                Err(e) => {
                    tracing::error!(
                        kind = %posting.transaction_type,
                        amount = posting.amount,
                        error = %e,
                        "Failed to post to the house account"
                    );
                    report
                        .house_errors
                        .push(format!("{} of {}: {}", posting.transaction_type, posting.amount, e));
                }
            }
        }

        if let Err(warning) = self.refresh_after_commit(round_id).await {
            report.warnings.push(warning);
        }

        tracing::info!(
            winners = report.winners,
            losers = report.losers,
            paid_out = report.paid_out,
            failed = report.failed_bets.len(),
            "Round settled"
        );

        Ok(report)
    }

    /// Sets the winner only if nobody else resolved the round since it was read.
    async fn claim_winner(&self, round: Round, winning_option: &str) -> Result<Round, LedgerError> {
        let round_id = round.id;
        let mut claimed = round;
        claimed.winning_option = Some(winning_option.to_string());
        claimed.betting_locked = true;

        self.save_round(&claimed).await.map_err(|e| {
            if let LedgerError::Conflict(_) = e {
                tracing::warn!(%round_id, "Duplicate settlement trigger rejected");
            }
            e
        })
    }

    /// Fee and rounding-remainder postings to the house account. Only made when
    /// somebody won; otherwise the whole pool stays with the house untouched.
    fn house_postings(&self, round: &Round, plan: &PayoutPlan) -> Vec<Posting> {
        if !plan.has_winners() {
            return Vec::new();
        }

        let house = self.policy.house_account;
        let mut postings = Vec::new();
        if plan.fee_total > 0 {
            postings.push(
                Posting::new(
                    house,
                    plan.fee_total,
                    TransactionType::Fee,
                    format!("Platform fee for round {} cycle {}", round.id, round.cycle),
                )
                .keyed(&format!("fee:{}:{}", round.id, round.cycle))
                .referencing(round.id),
            );
        }
        if plan.remainder > 0 {
            postings.push(
                Posting::new(
                    house,
                    plan.remainder,
                    TransactionType::Rounding,
                    format!("Rounding remainder for round {} cycle {}", round.id, round.cycle),
                )
                .keyed(&format!("rounding:{}:{}", round.id, round.cycle))
                .referencing(round.id),
            );
        }
        postings
    }
}
