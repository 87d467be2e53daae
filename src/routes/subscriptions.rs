use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    #[serde(default)]
    purchase_token: Option<String>,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    package_name: Option<String>,
}

/// Client-initiated verification after a purchase. Unlike the webhook, this
/// endpoint surfaces real error codes — the client is expected to retry or
/// prompt re-purchase on failure.
pub async fn verify(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<VerifyBody>,
) -> Result<Json<Value>, AppError> {
    let purchase_token = body
        .purchase_token
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("purchaseToken is required".into()))?;
    let product_id = body
        .product_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("productId is required".into()))?;

    let (sub, ent) = state
        .reconciler
        .verify_and_upsert(
            user_id,
            &purchase_token,
            &product_id,
            body.package_name.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "ok": true,
        "subscription": {
            "status": sub.status,
            "expires_at": sub.expires_at,
        },
        "user": {
            "is_paid": ent.is_paid,
            "paid_until": ent.paid_until,
        }
    })))
}

pub async fn status(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, AppError> {
    let ent = state.db.user_entitlement(user_id).await?;
    let (is_paid, paid_until) = match ent {
        Some(e) => (e.is_paid, e.paid_until),
        None => (false, None),
    };
    Ok(Json(json!({
        "is_paid": is_paid,
        "paid_until": paid_until,
    })))
}
