use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use uuid::Uuid;

use crate::model::{BetStatus, RoundState};

/// Errors raised by a ledger store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("wallet for user {0} does not exist")]
    MissingWallet(Uuid),

    #[error("insufficient balance: {available} < {required}")]
    InsufficientBalance { available: i64, required: i64 },

    #[error("round {0} was modified concurrently")]
    VersionConflict(Uuid),

    #[error("round {0} is no longer open for betting")]
    RoundNotOpen(Uuid),

    #[error("{what} of {id} would overflow")]
    AmountOverflow { what: &'static str, id: Uuid },

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: Uuid },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors returned by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("caller is not allowed to {0}")]
    Forbidden(&'static str),

    #[error("round {0} not found")]
    RoundNotFound(Uuid),

    #[error("bet {0} not found")]
    BetNotFound(Uuid),

    #[error("cannot {action} round {round_id} while it is {state}")]
    InvalidRoundState {
        round_id: Uuid,
        state: RoundState,
        action: &'static str,
    },

    #[error("round {round_id} is already settled with `{winning_option}`")]
    AlreadySettled {
        round_id: Uuid,
        winning_option: String,
    },

    #[error("bet {id} is {status}, not pending")]
    BetNotPending { id: Uuid, status: BetStatus },

    #[error("round {0} was changed by a concurrent request")]
    Conflict(Uuid),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict(round_id) => LedgerError::Conflict(round_id),
            other => LedgerError::Store(other),
        }
    }
}

impl ResponseError for LedgerError {
    fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::Unauthenticated => StatusCode::UNAUTHORIZED,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::RoundNotFound(_) | LedgerError::BetNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InvalidRoundState { .. }
            | LedgerError::AlreadySettled { .. }
            | LedgerError::BetNotPending { .. }
            | LedgerError::Conflict(_) => StatusCode::CONFLICT,
            LedgerError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            LedgerError::Store(StoreError::AlreadyExists { .. })
            | LedgerError::Store(StoreError::RoundNotOpen(_)) => StatusCode::CONFLICT,
            LedgerError::Store(StoreError::MissingWallet(_))
            | LedgerError::Store(StoreError::InsufficientBalance { .. })
            | LedgerError::Store(StoreError::AmountOverflow { .. }) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
