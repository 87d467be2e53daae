use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::db::Db;
use crate::fcm::PushSender;
use crate::reconcile::Reconciler;
use crate::state::AppState;

#[derive(Debug, PartialEq)]
pub enum RtdnStatus {
    Ok,
    OkNoToken,
    BadRequest,
    SubscriptionNotFound,
    ServerError,
}

impl RtdnStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::OkNoToken => "ok_no_token",
            Self::BadRequest => "bad_request",
            Self::SubscriptionNotFound => "subscription_not_found",
            Self::ServerError => "server_error",
        }
    }
}

/// Real-time developer notifications pushed by the store via Pub/Sub.
///
/// Everything except an undecodable envelope is acknowledged with HTTP 200 —
/// the store retries on error responses and its retry cadence is not ours to
/// control. Internal failures land in the `status` field and the logs.
pub async fn webhook(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let status = process_rtdn(&state.db, &state.reconciler, state.push.as_ref(), &body).await;
    let code = match status {
        RtdnStatus::BadRequest => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (code, Json(json!({ "status": status.as_str() })))
}

pub async fn process_rtdn(
    db: &Db,
    reconciler: &Reconciler,
    push: &dyn PushSender,
    body: &Value,
) -> RtdnStatus {
    // Pub/Sub wraps the actual notification in base64 at message.data.
    let payload = match decode_envelope(body) {
        Some(p) => p,
        None => {
            warn!("RTDN: undecodable Pub/Sub envelope");
            return RtdnStatus::BadRequest;
        }
    };

    let notification = payload
        .get("subscriptionNotification")
        .or_else(|| payload.get("testNotification"));

    let purchase_token = notification
        .and_then(|n| n.get("purchaseToken"))
        .and_then(|v| v.as_str());

    let purchase_token = match purchase_token {
        Some(t) => t,
        None => {
            // Connectivity tests and non-subscription notifications carry no
            // token; acknowledge without touching the store.
            info!("RTDN: notification without purchaseToken, ignoring");
            return RtdnStatus::OkNoToken;
        }
    };

    let notification_type = notification
        .and_then(|n| n.get("notificationType"))
        .and_then(|v| v.as_i64());
    info!(token = %purchase_token, notification_type = ?notification_type, "RTDN: notification received");

    let sub = match db.find_subscription_by_token(purchase_token).await {
        Ok(Some(sub)) => sub,
        Ok(None) => {
            // Data-integrity signal, not a processing error: a token we never
            // saw a verification for. Acknowledge so the store stops retrying.
            error!(token = %purchase_token, "RTDN: purchase token not in our store");
            return RtdnStatus::SubscriptionNotFound;
        }
        Err(e) => {
            error!("RTDN: subscription lookup failed: {e}");
            return RtdnStatus::ServerError;
        }
    };

    let was_paid = match db.user_entitlement(sub.user_id).await {
        Ok(ent) => ent.map(|e| e.is_paid).unwrap_or(false),
        Err(e) => {
            error!(user_id = sub.user_id, "RTDN: entitlement read failed: {e}");
            return RtdnStatus::ServerError;
        }
    };

    // The notification names the product as subscriptionId; fall back to the
    // stored one when absent.
    let product_id = notification
        .and_then(|n| n.get("subscriptionId"))
        .and_then(|v| v.as_str())
        .unwrap_or(&sub.product_id)
        .to_string();

    let ent = match reconciler
        .verify_and_upsert(
            sub.user_id,
            purchase_token,
            &product_id,
            sub.package_name.as_deref(),
        )
        .await
    {
        Ok((row, ent)) => {
            info!(
                user_id = sub.user_id,
                token = %purchase_token,
                new_status = %row.status,
                "RTDN: subscription reconciled"
            );
            ent
        }
        Err(e) => {
            error!(user_id = sub.user_id, token = %purchase_token, "RTDN: reconciliation failed: {e}");
            return RtdnStatus::ServerError;
        }
    };

    // Silent push when entitlement flipped paid → unpaid, so the app refreshes
    // its state. Content-free on purpose: no billing text reaches the device.
    if was_paid && !ent.is_paid {
        info!(user_id = sub.user_id, "RTDN: user lost paid status, notifying devices");
        match db.device_tokens_for_user(sub.user_id).await {
            Ok(tokens) => {
                for token in tokens {
                    push.send_data(&token, &[("type", "subscription_update")]).await;
                }
            }
            Err(e) => {
                error!(user_id = sub.user_id, "RTDN: device token read failed: {e}");
            }
        }
    }

    RtdnStatus::Ok
}

fn decode_envelope(body: &Value) -> Option<Value> {
    let data = body.pointer("/message/data")?.as_str()?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}
