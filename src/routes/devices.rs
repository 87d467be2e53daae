use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterBody {
    #[serde(default)]
    token: Option<String>,
}

/// Registers a push device token for the authenticated user. The webhook's
/// paid→unpaid notification fans out over these tokens.
pub async fn register(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, AppError> {
    let token = body
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Validation("token is required".into()))?;

    state.db.register_device_token(user_id, &token).await?;

    Ok(Json(json!({ "ok": true })))
}
