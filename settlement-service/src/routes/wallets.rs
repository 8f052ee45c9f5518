use actix_web::{get, web, HttpResponse};

use crate::{auth::Caller, engine::Ledger, error::LedgerError, model::TransactionType};

#[tracing::instrument(name = "Getting wallet for /wallet request", skip(ledger))]
#[get("/wallet")]
pub async fn get_wallet(ledger: web::Data<Ledger>, caller: Caller) -> Result<HttpResponse, LedgerError> {
    let wallet = ledger.wallet(caller.0).await?;

    Ok(HttpResponse::Ok().json(wallet))
}

#[tracing::instrument(
    name = "Getting transactions by type for /transactions/{type} request",
    skip(ledger)
)]
#[get("/transactions/{type}")]
pub async fn transactions_by_type(
    ledger: web::Data<Ledger>,
    caller: Caller,
    path: web::Path<String>,
) -> Result<HttpResponse, LedgerError> {
    let transaction_type = path
        .into_inner()
        .parse::<TransactionType>()
        .map_err(LedgerError::Validation)?;

    let rows = ledger
        .transactions(caller.0, Some(transaction_type))
        .await?;

    Ok(HttpResponse::Ok().json(rows))
}

#[tracing::instrument(name = "Getting transactions for /transactions request", skip(ledger))]
#[get("/transactions")]
pub async fn transactions(
    ledger: web::Data<Ledger>,
    caller: Caller,
) -> Result<HttpResponse, LedgerError> {
    let rows = ledger.transactions(caller.0, None).await?;

    Ok(HttpResponse::Ok().json(rows))
}
