use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::{auth::Caller, engine::Ledger, error::LedgerError};

#[derive(Debug, Deserialize)]
pub struct CreateRoundRequest {
    pub title: String,
    pub options: Vec<String>,
}

#[tracing::instrument(name = "Creating round for /rounds request", skip(ledger))]
#[post("/rounds")]
pub async fn create_round(
    ledger: web::Data<Ledger>,
    caller: Caller,
    body: web::Json<CreateRoundRequest>,
) -> Result<HttpResponse, LedgerError> {
    ledger.require_admin(caller.0, "create rounds").await?;

    let body = body.into_inner();
    let round = ledger.create_round(body.title, body.options).await?;

    Ok(HttpResponse::Created().json(round))
}

#[tracing::instrument(name = "Getting round for /rounds/{round_id} request", skip(ledger))]
#[get("/rounds/{round_id}")]
pub async fn get_round(
    ledger: web::Data<Ledger>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, LedgerError> {
    let view = ledger.round_view(path.into_inner()).await?;

    Ok(HttpResponse::Ok().json(view))
}

#[tracing::instrument(name = "Locking round for /rounds/{round_id}/lock request", skip(ledger))]
#[post("/rounds/{round_id}/lock")]
pub async fn lock_round(
    ledger: web::Data<Ledger>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, LedgerError> {
    ledger.require_admin(caller.0, "lock rounds").await?;

    let round = ledger.lock_round(path.into_inner()).await?;

    Ok(HttpResponse::Ok().json(round))
}

#[tracing::instrument(
    name = "Unlocking round for /rounds/{round_id}/unlock request",
    skip(ledger)
)]
#[post("/rounds/{round_id}/unlock")]
pub async fn unlock_round(
    ledger: web::Data<Ledger>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, LedgerError> {
    ledger.require_admin(caller.0, "unlock rounds").await?;

    let round = ledger.unlock_round(path.into_inner()).await?;

    Ok(HttpResponse::Ok().json(round))
}

#[tracing::instrument(
    name = "Resetting round for /rounds/{round_id}/reset request",
    skip(ledger)
)]
#[post("/rounds/{round_id}/reset")]
pub async fn reset_round(
    ledger: web::Data<Ledger>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, LedgerError> {
    ledger.require_admin(caller.0, "reset rounds").await?;

    let round = ledger.reset_round(path.into_inner()).await?;

    Ok(HttpResponse::Ok().json(round))
}
