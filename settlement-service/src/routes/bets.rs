use actix_web::{delete, post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{auth::Caller, engine::Ledger, error::LedgerError};

#[derive(Debug, Deserialize)]
pub struct PlaceBetRequest {
    pub option: String,
    pub amount: i64,
}

#[tracing::instrument(name = "Placing bet for /rounds/{round_id}/bets request", skip(ledger))]
#[post("/rounds/{round_id}/bets")]
pub async fn place_bet(
    ledger: web::Data<Ledger>,
    caller: Caller,
    path: web::Path<Uuid>,
    body: web::Json<PlaceBetRequest>,
) -> Result<HttpResponse, LedgerError> {
    let placed = ledger
        .place_bet(path.into_inner(), caller.0, &body.option, body.amount)
        .await?;

    Ok(HttpResponse::Created().json(placed))
}

#[tracing::instrument(
    name = "Cancelling bet for /rounds/{round_id}/bets/{bet_id} request",
    skip(ledger)
)]
#[delete("/rounds/{round_id}/bets/{bet_id}")]
pub async fn cancel_bet(
    ledger: web::Data<Ledger>,
    caller: Caller,
    path: web::Path<(Uuid, Uuid)>,
) -> Result<HttpResponse, LedgerError> {
    let (round_id, bet_id) = path.into_inner();
    let cancelled = ledger.cancel_bet(round_id, bet_id, caller.0).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "bet": cancelled.bet,
        "balance": cancelled.balance,
        "roundTotal": cancelled.round_total,
    })))
}
