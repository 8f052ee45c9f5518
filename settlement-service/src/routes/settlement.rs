use actix_web::{post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{auth::Caller, engine::Ledger, error::LedgerError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest {
    pub stream_id: Uuid,
    pub winning_option: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub stream_id: Uuid,
}

#[tracing::instrument(name = "Settling round for /settle request", skip(ledger))]
#[post("/settle")]
pub async fn settle(
    ledger: web::Data<Ledger>,
    caller: Caller,
    body: web::Json<SettleRequest>,
) -> Result<HttpResponse, LedgerError> {
    ledger.require_admin(caller.0, "settle rounds").await?;

    let report = ledger
        .settle(body.stream_id, &body.winning_option)
        .await?;

    let response = if report.is_complete() {
        json!({
            "success": true,
            "report": report,
            "failedBets": report.failed_bets,
        })
    } else {
        json!({
            "success": false,
            "error": format!(
                "{} bets and {} house postings failed; retry to finish the settlement",
                report.failed_bets.len(),
                report.house_errors.len()
            ),
            "report": report,
            "failedBets": report.failed_bets,
        })
    };

    Ok(HttpResponse::Ok().json(response))
}

#[tracing::instrument(name = "Refunding round for /refund request", skip(ledger))]
#[post("/refund")]
pub async fn refund(
    ledger: web::Data<Ledger>,
    caller: Caller,
    body: web::Json<RefundRequest>,
) -> Result<HttpResponse, LedgerError> {
    ledger.require_admin(caller.0, "refund rounds").await?;

    let report = ledger.refund(body.stream_id).await?;

    let response = if report.is_complete() {
        json!({
            "success": true,
            "report": report,
            "failedBets": report.failed_bets,
        })
    } else {
        json!({
            "success": false,
            "error": format!(
                "{} bets could not be refunded; retry to finish the refund",
                report.failed_bets.len()
            ),
            "report": report,
            "failedBets": report.failed_bets,
        })
    };

    Ok(HttpResponse::Ok().json(response))
}
