use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConsumeBody {
    #[serde(default)]
    seconds: Option<i64>,
    #[serde(default)]
    context: Option<String>,
}

/// Draws down the free-listening ledger as a non-paying user listens. Paid
/// users never consume: the ledger is a free-tier mechanism, so their call
/// reports zero spend and the unchanged balance.
pub async fn consume(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<ConsumeBody>,
) -> Result<Json<Value>, AppError> {
    if let Some(ctx) = &body.context {
        debug!(user_id, context = %ctx, "credits consume");
    }

    let is_paid = state
        .db
        .user_entitlement(user_id)
        .await?
        .map(|e| e.is_paid)
        .unwrap_or(false);

    if is_paid {
        let remaining = state.db.credit_seconds(user_id).await?;
        return Ok(Json(json!({
            "ok": true,
            "spent": 0,
            "remaining_seconds": remaining,
            "remaining_minutes": remaining / 60,
            "note": "paid_user_no_consumption",
        })));
    }

    // Two capping layers: a request-level sanity clamp here, then the hard
    // per-call cap inside the ledger.
    let requested = body
        .seconds
        .unwrap_or(0)
        .clamp(0, state.config.consume_request_max);

    let (spent, remaining) = state
        .db
        .consume_seconds(user_id, requested, state.config.consume_call_cap)
        .await?;

    Ok(Json(json!({
        "ok": true,
        "spent": spent,
        "remaining_seconds": remaining,
        "remaining_minutes": remaining / 60,
    })))
}
