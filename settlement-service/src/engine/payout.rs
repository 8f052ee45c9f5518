//! Pari-mutuel payout arithmetic.
//!
//! Amounts are integer minor units. The platform fee is taken from every stake
//! before pooling and is floored, so a stake never loses more than
//! `amount * rate`. Each winner's share of the losing pool is floored as well;
//! whatever the flooring leaves behind is reported as `remainder` and booked
//! to the house account, so that
//! `sum(payout) + remainder == winning_pool + losing_pool`.

use serde::Serialize;
use uuid::Uuid;

use crate::model::{Bet, BetStatus};

const BPS_DENOMINATOR: i64 = 10_000;

/// Platform fee in basis points of the stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRate(u32);

impl FeeRate {
    pub fn from_bps(bps: u32) -> Result<FeeRate, String> {
        if i64::from(bps) > BPS_DENOMINATOR {
            return Err(format!("fee of {} bps exceeds 100%", bps));
        }
        Ok(FeeRate(bps))
    }

    pub fn bps(self) -> u32 {
        self.0
    }

    pub fn fee_on(self, amount: i64) -> i64 {
        let fee = i128::from(amount) * i128::from(self.0) / i128::from(BPS_DENOMINATOR);
        fee as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutLine {
    pub bet_id: Uuid,
    pub user_id: Uuid,
    pub stake: i64,
    pub effective: i64,
    pub status: BetStatus,
    /// Zero for losing bets.
    pub payout: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutPlan {
    pub winning_pool: i64,
    pub losing_pool: i64,
    pub fee_total: i64,
    pub remainder: i64,
    pub lines: Vec<PayoutLine>,
}

impl PayoutPlan {
    pub fn has_winners(&self) -> bool {
        self.lines.iter().any(|l| l.status == BetStatus::Won)
    }

    pub fn total_paid(&self) -> i64 {
        self.lines.iter().map(|l| l.payout).sum()
    }
}

/// The round's stakes add up to more than an `i64` amount can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("total stake of the round exceeds the largest representable amount")]
pub struct PoolOverflow;

/// Computes the outcome of every bet that takes part in the round.
///
/// Refunded and cancelled bets are left out. Bets that were already settled by
/// an earlier, interrupted run still count towards the pools so the lines are
/// identical on every run.
pub fn plan(
    bets: &[Bet],
    winning_option: &str,
    fee: FeeRate,
) -> Result<PayoutPlan, PoolOverflow> {
    let participating = bets.iter().filter(|b| {
        matches!(
            b.status,
            BetStatus::Pending | BetStatus::Won | BetStatus::Lost
        )
    });

    let mut lines = Vec::new();
    let mut winning_pool = 0i128;
    let mut losing_pool = 0i128;
    let mut fee_total = 0i128;

    for bet in participating {
        let bet_fee = fee.fee_on(bet.amount);
        let effective = bet.amount - bet_fee;
        fee_total += i128::from(bet_fee);

        let status = if bet.option == winning_option {
            winning_pool += i128::from(effective);
            BetStatus::Won
        } else {
            losing_pool += i128::from(effective);
            BetStatus::Lost
        };

        lines.push(PayoutLine {
            bet_id: bet.id,
            user_id: bet.user_id,
            stake: bet.amount,
            effective,
            status,
            payout: 0,
        });
    }

    // Every payout is bounded by the total stake, so this check covers them.
    i64::try_from(winning_pool + losing_pool + fee_total).map_err(|_| PoolOverflow)?;

    let mut remainder = 0i128;
    if winning_pool > 0 {
        let mut distributed = 0i128;
        for line in lines.iter_mut().filter(|l| l.status == BetStatus::Won) {
            let share = i128::from(line.effective) * losing_pool / winning_pool;
            distributed += share;
            line.payout = line.effective + share as i64;
        }
        remainder = losing_pool - distributed;
    }

    Ok(PayoutPlan {
        winning_pool: winning_pool as i64,
        losing_pool: losing_pool as i64,
        fee_total: fee_total as i64,
        remainder: remainder as i64,
        lines,
    })
}
