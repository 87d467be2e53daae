use axum::extract::{Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::{GrantRewardData, PendingRewardData, RewardOutcome};
use crate::error::AppError;
use crate::state::AppState;

/// Pre-registers a reward event so the later ad-network callback can be
/// correlated. The nonce travels to the client, which embeds it as custom
/// data when requesting the ad.
pub async fn prepare(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let nonce = Uuid::new_v4().to_string();

    state
        .db
        .create_pending_reward(PendingRewardData {
            user_id,
            nonce: nonce.clone(),
            ip: header_str(&headers, "x-forwarded-for"),
            ua: header_str(&headers, "user-agent"),
        })
        .await?;

    info!(user_id, nonce = %nonce, "reward prepared");

    Ok(Json(json!({
        "nonce": nonce,
        "reward_minutes": state.config.reward_minutes,
    })))
}

#[derive(Deserialize)]
pub struct StatusParams {
    #[serde(default)]
    nonce: Option<String>,
}

/// Read-only status poll. Granting is strictly the callback's job; until one
/// arrives the event stays `pending`.
pub async fn status(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<StatusParams>,
) -> Result<Json<Value>, AppError> {
    let nonce = params
        .nonce
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("nonce is required".into()))?;

    let status = state
        .db
        .reward_status(user_id, &nonce)
        .await?
        .unwrap_or_else(|| "unknown".to_string());

    Ok(Json(json!({ "status": status })))
}

/// Server-side verification callback from the ad network. Unauthenticated;
/// trust comes from the ECDSA signature over the query string. Responds `OK`
/// even when the payload is rejected — the only 400 is a request we can tell
/// is malformed, which the network does not aggressively retry.
pub async fn ssv_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> (StatusCode, &'static str) {
    let query = query.unwrap_or_default();

    let mut user_id: Option<i64> = None;
    let mut ad_unit_id: Option<String> = None;
    let mut reward_amount: Option<i64> = None;
    let mut custom_data: Option<String> = None;
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        match k.as_ref() {
            "user_id" => user_id = v.parse().ok(),
            "ad_unit_id" => ad_unit_id = Some(v.to_string()).filter(|s| !s.is_empty()),
            "reward_amount" => reward_amount = v.parse().ok(),
            "custom_data" => custom_data = Some(v.to_string()),
            _ => {}
        }
    }

    let user_id = match user_id.filter(|id| *id > 0) {
        Some(id) => id,
        None => return (StatusCode::BAD_REQUEST, "Bad Request: missing user_id"),
    };

    if state.config.ssv_verify {
        if let Err(e) = state.ssv.verify_query(&query).await {
            warn!(user_id, "SSV: rejected callback: {e}");
            return (StatusCode::OK, "OK");
        }
    }

    let minutes = match reward_amount {
        Some(amount) if amount > 0 => {
            if amount != state.config.reward_minutes {
                // Promised and granted amounts are independent values; a
                // mismatch is an operator signal, never silently reconciled.
                warn!(
                    user_id,
                    callback_amount = amount,
                    configured = state.config.reward_minutes,
                    "SSV: reward amount differs from configured default"
                );
            }
            amount
        }
        _ => state.config.reward_minutes,
    };

    let nonce = custom_data.as_deref().and_then(parse_nonce);

    let data = GrantRewardData {
        user_id,
        lookup_nonce: nonce.clone(),
        create_nonce: nonce.unwrap_or_else(|| Uuid::new_v4().to_string()),
        minutes,
        ad_unit_id,
        source: "admob_ssv".to_string(),
        ip: header_str(&headers, "x-forwarded-for"),
        ua: header_str(&headers, "user-agent"),
    };

    match state.db.grant_reward(data).await {
        Ok(RewardOutcome::Granted) => {
            info!(user_id, minutes, "SSV: reward granted");
        }
        Ok(RewardOutcome::AlreadyGranted) => {
            info!(user_id, "SSV: duplicate callback, already granted");
        }
        Ok(RewardOutcome::UserMismatch) => {
            // Stale nonce or spoofing attempt; acknowledged but untouched.
            warn!(user_id, "SSV: nonce bound to a different user");
        }
        Ok(RewardOutcome::GrantedUnprepared) => {
            info!(user_id, minutes, "SSV: granted without prepared event");
        }
        Err(e) => {
            error!(user_id, "SSV: grant failed: {e}");
        }
    }

    (StatusCode::OK, "OK")
}

/// custom_data is client-supplied JSON; a missing or malformed nonce just
/// means the callback is processed without correlation.
fn parse_nonce(custom_data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(custom_data).ok()?;
    value
        .get("nonce")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nonce() {
        assert_eq!(
            parse_nonce(r#"{"nonce":"abc-123"}"#).as_deref(),
            Some("abc-123")
        );
        assert!(parse_nonce(r#"{"nonce":""}"#).is_none());
        assert!(parse_nonce("not json").is_none());
        assert!(parse_nonce(r#"{"other":"x"}"#).is_none());
    }
}
