use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use uuid::Uuid;

use crate::engine::Ledger;
use crate::error::LedgerError;
use crate::events::LedgerEvent;
use crate::model::{Bet, BetStatus, Round, RoundState, CANCELLED_SENTINEL};

/// Round as shown to viewers: the stored record plus live pot totals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundView {
    #[serde(flatten)]
    pub round: Round,
    pub state: RoundState,
    /// Pending stakes per declared option.
    pub pots: BTreeMap<String, i64>,
    pub pending_bets: usize,
}

/// Sum of the pending stakes, saturating at `i64::MAX`.
pub fn pending_total(bets: &[Bet]) -> i64 {
    bets.iter()
        .filter(|b| b.status == BetStatus::Pending)
        .fold(0i64, |total, b| total.saturating_add(b.amount))
}

fn validate_options(options: &[String]) -> Result<(), LedgerError> {
    if options.len() < 2 {
        return Err(LedgerError::Validation(
            "a round needs at least two options".into(),
        ));
    }

    let mut seen = HashSet::new();
    for option in options {
        if option.trim().is_empty() {
            return Err(LedgerError::Validation("options must not be blank".into()));
        }
        if option == CANCELLED_SENTINEL {
            return Err(LedgerError::Validation(format!(
                "`{}` is reserved and cannot be an option",
                CANCELLED_SENTINEL
            )));
        }
        if !seen.insert(option.as_str()) {
            return Err(LedgerError::Validation(format!(
                "option `{}` is declared twice",
                option
            )));
        }
    }
    Ok(())
}

impl Ledger {
    #[tracing::instrument(name = "Creating round", skip(self))]
    pub async fn create_round(
        &self,
        title: String,
        options: Vec<String>,
    ) -> Result<Round, LedgerError> {
        validate_options(&options)?;

        let round = Round::new(title, options);
        self.store.insert_round(&round).await?;
        tracing::info!(round_id = %round.id, "Round opened");
        self.feed.publish(LedgerEvent::RoundUpdated {
            round: round.clone(),
        });

        Ok(round)
    }

    pub async fn round_view(&self, round_id: Uuid) -> Result<RoundView, LedgerError> {
        let round = self.load_round(round_id).await?;
        let bets = self.store.round_bets(round_id, round.cycle).await?;

        let mut pots: BTreeMap<String, i64> =
            round.options.iter().map(|o| (o.clone(), 0)).collect();
        let mut pending_bets = 0;
        for bet in bets.iter().filter(|b| b.status == BetStatus::Pending) {
            let pot = pots.entry(bet.option.clone()).or_insert(0);
            *pot = pot.saturating_add(bet.amount);
            pending_bets += 1;
        }

        Ok(RoundView {
            state: round.state(),
            round,
            pots,
            pending_bets,
        })
    }

    /// Stops accepting wagers: open → locked.
    #[tracing::instrument(name = "Locking round", skip(self))]
    pub async fn lock_round(&self, round_id: Uuid) -> Result<Round, LedgerError> {
        let mut round = self.load_round(round_id).await?;
        expect_state(&round, RoundState::Open, "lock")?;

        round.betting_locked = true;
        self.save_round(&round).await
    }

    /// Reopens a locked round that has no result yet: locked → open.
    #[tracing::instrument(name = "Unlocking round", skip(self))]
    pub async fn unlock_round(&self, round_id: Uuid) -> Result<Round, LedgerError> {
        let mut round = self.load_round(round_id).await?;
        expect_state(&round, RoundState::Locked, "unlock")?;

        round.betting_locked = false;
        self.save_round(&round).await
    }

    /// Starts a new cycle on a resolved round: the winner is cleared, betting
    /// reopens and bets of earlier cycles no longer count.
    #[tracing::instrument(name = "Resetting round", skip(self))]
    pub async fn reset_round(&self, round_id: Uuid) -> Result<Round, LedgerError> {
        let mut round = self.load_round(round_id).await?;
        expect_state(&round, RoundState::Resolved, "reset")?;

        let leftover = pending_total(&self.store.round_bets(round_id, round.cycle).await?);
        if leftover > 0 {
            return Err(LedgerError::Validation(format!(
                "round {} still has {} in unsettled bets; re-run settlement first",
                round_id, leftover
            )));
        }

        round.winning_option = None;
        round.betting_locked = false;
        round.cycle += 1;
        round.pending_total = 0;
        let round = self.save_round(&round).await?;
        tracing::info!(%round_id, cycle = round.cycle, "Round reset for a new cycle");

        Ok(round)
    }
}

pub(crate) fn expect_state(
    round: &Round,
    expected: RoundState,
    action: &'static str,
) -> Result<(), LedgerError> {
    let state = round.state();
    if state != expected {
        return Err(LedgerError::InvalidRoundState {
            round_id: round.id,
            state,
            action,
        });
    }
    Ok(())
}
