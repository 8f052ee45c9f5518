use actix_web::{post, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::Caller,
    engine::Ledger,
    error::LedgerError,
    model::{Profile, Role},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustBalanceRequest {
    pub user_id: Uuid,
    pub amount: i64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProfileRequest {
    pub user_id: Uuid,
    pub role: Role,
}

#[tracing::instrument(name = "Adjusting balance for /admin/adjust-balance request", skip(ledger))]
#[post("/admin/adjust-balance")]
pub async fn adjust_balance(
    ledger: web::Data<Ledger>,
    caller: Caller,
    body: web::Json<AdjustBalanceRequest>,
) -> Result<HttpResponse, LedgerError> {
    let new_balance = ledger
        .adjust_balance(caller.0, body.user_id, body.amount, &body.description)
        .await?;

    Ok(HttpResponse::Ok().json(json!({ "success": true, "newBalance": new_balance })))
}

#[tracing::instrument(name = "Creating profile for /admin/profiles request", skip(ledger))]
#[post("/admin/profiles")]
pub async fn create_profile(
    ledger: web::Data<Ledger>,
    caller: Caller,
    body: web::Json<CreateProfileRequest>,
) -> Result<HttpResponse, LedgerError> {
    ledger.require_admin(caller.0, "create profiles").await?;

    let body = body.into_inner();
    let wallet = ledger
        .create_profile(Profile {
            user_id: body.user_id,
            role: body.role,
        })
        .await?;

    Ok(HttpResponse::Created().json(wallet))
}
