pub mod credits;
pub mod devices;
pub mod health;
pub mod rewards;
pub mod subscriptions;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/subscriptions/verify", post(subscriptions::verify))
        .route("/api/subscriptions/status", get(subscriptions::status))
        .route(
            "/api/webhooks/subscription-notification",
            post(webhook::webhook),
        )
        .route("/api/rewards/prepare", post(rewards::prepare))
        .route("/api/rewards/status", get(rewards::status))
        .route(
            "/api/ads/ssv-callback",
            get(rewards::ssv_callback).post(rewards::ssv_callback),
        )
        .route("/api/credits/consume", post(credits::consume))
        .route("/api/device-tokens", post(devices::register))
}
