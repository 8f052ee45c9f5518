use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value written to `winning_option` when a round is cancelled instead of resolved.
pub const CANCELLED_SENTINEL: &str = "cancelled";

/// Namespace for transaction ids derived from the entity they settle.
/// Deriving the id makes every ledger posting safe to retry.
const LEDGER_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8c55_e2f1_7a3b_9d10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Pending,
    Won,
    Lost,
    Refunded,
    Cancelled,
}

impl BetStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BetStatus::Pending)
    }

    /// Bets only ever leave `pending`; nothing re-enters it.
    pub fn can_transition_to(self, next: BetStatus) -> bool {
        self == BetStatus::Pending && next != BetStatus::Pending
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BetStatus::Pending => write!(f, "pending"),
            BetStatus::Won => write!(f, "won"),
            BetStatus::Lost => write!(f, "lost"),
            BetStatus::Refunded => write!(f, "refunded"),
            BetStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub id: Uuid,
    pub round_id: Uuid,
    pub cycle: u32,
    pub user_id: Uuid,
    pub option: String,
    pub amount: i64,
    pub status: BetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub user_id: Uuid,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Bet,
    BetWon,
    Refund,
    Fee,
    Rounding,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionType::Deposit => write!(f, "deposit"),
            TransactionType::Withdrawal => write!(f, "withdrawal"),
            TransactionType::Bet => write!(f, "bet"),
            TransactionType::BetWon => write!(f, "bet_won"),
            TransactionType::Refund => write!(f, "refund"),
            TransactionType::Fee => write!(f, "fee"),
            TransactionType::Rounding => write!(f, "rounding"),
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "bet" => Ok(TransactionType::Bet),
            "bet_won" => Ok(TransactionType::BetWon),
            "refund" => Ok(TransactionType::Refund),
            "fee" => Ok(TransactionType::Fee),
            "rounding" => Ok(TransactionType::Rounding),
            other => Err(format!("unknown transaction type `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub description: String,
    pub reference: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A balance change waiting to be written together with its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub description: String,
    pub reference: Option<Uuid>,
    /// Allows the posting to leave the wallet below zero.
    pub allow_negative: bool,
}

impl Posting {
    pub fn new(
        user_id: Uuid,
        amount: i64,
        transaction_type: TransactionType,
        description: impl Into<String>,
    ) -> Posting {
        Posting {
            transaction_id: Uuid::new_v4(),
            user_id,
            amount,
            transaction_type,
            description: description.into(),
            reference: None,
            allow_negative: false,
        }
    }

    /// Pins the transaction id to `key` so a retried posting is applied once.
    pub fn keyed(mut self, key: &str) -> Posting {
        self.transaction_id = Uuid::new_v5(&LEDGER_NAMESPACE, key.as_bytes());
        self
    }

    pub fn referencing(mut self, reference: Uuid) -> Posting {
        self.reference = Some(reference);
        self
    }

    pub fn allow_negative(mut self, allow: bool) -> Posting {
        self.allow_negative = allow;
        self
    }

    pub fn to_transaction(&self, created_at: DateTime<Utc>) -> Transaction {
        Transaction {
            id: self.transaction_id,
            user_id: self.user_id,
            amount: self.amount,
            transaction_type: self.transaction_type,
            description: self.description.clone(),
            reference: self.reference,
            created_at,
        }
    }
}

/// Moves one pending bet to a terminal status, optionally crediting its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetResolution {
    pub bet_id: Uuid,
    pub status: BetStatus,
    pub credit: Option<Posting>,
    /// When set, the resolution only applies while the bet's round is still
    /// open for betting in this cycle.
    pub open_cycle: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Applied { bet: Bet, balance: Option<i64> },
    /// The bet had already left `pending`; nothing was written.
    AlreadyResolved(Bet),
}

/// A new wager or a top-up of the caller's pending wager in the same cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetPlacement {
    pub round_id: Uuid,
    pub cycle: u32,
    pub user_id: Uuid,
    pub option: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Open,
    Locked,
    Resolved,
    Cancelled,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RoundState::Open => write!(f, "open"),
            RoundState::Locked => write!(f, "locked"),
            RoundState::Resolved => write!(f, "resolved"),
            RoundState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: Uuid,
    pub title: String,
    pub options: Vec<String>,
    pub cycle: u32,
    pub betting_locked: bool,
    pub winning_option: Option<String>,
    pub pending_total: i64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Round {
    pub fn new(title: String, options: Vec<String>) -> Round {
        Round {
            id: Uuid::new_v4(),
            title,
            options,
            cycle: 0,
            betting_locked: false,
            winning_option: None,
            pending_total: 0,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> RoundState {
        match (&self.winning_option, self.betting_locked) {
            (Some(option), _) if option == CANCELLED_SENTINEL => RoundState::Cancelled,
            (Some(_), _) => RoundState::Resolved,
            (None, true) => RoundState::Locked,
            (None, false) => RoundState::Open,
        }
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    /// Whether wagers of `cycle` may still be placed or withdrawn.
    pub fn accepts_bets(&self, cycle: u32) -> bool {
        self.state() == RoundState::Open && self.cycle == cycle
    }
}
