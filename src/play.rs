use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::gauth::TokenSource;

/// Canonical subscription status, normalized from the Play Subscriptions V2
/// `subscriptionState` strings. Anything unrecognized maps to `Expired` so an
/// unknown provider state can never grant entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Grace,
    OnHold,
    Paused,
    Canceled,
    Expired,
    Refunded,
    Revoked,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Grace => "grace",
            Self::OnHold => "on_hold",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
            Self::Refunded => "refunded",
            Self::Revoked => "revoked",
        }
    }

    /// Statuses that still carry entitlement while the expiry is in the future.
    pub fn is_active_like(&self) -> bool {
        matches!(self, Self::Active | Self::Grace | Self::OnHold | Self::Paused)
    }
}

/// Provider-agnostic view of one verified subscription, extracted from the raw
/// Play response. Missing fields are None, never an error.
#[derive(Debug, Clone)]
pub struct NormalizedSubscription {
    pub status: SubscriptionStatus,
    pub order_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// Normalize a Subscriptions V2 response.
///
/// Expiry is fallback-chained: the line-item expiry is authoritative, the
/// top-level `expiryTime` is a fallback for older response shapes. V2 carries
/// no renewal timestamp, so `renewed_at` stays None.
pub fn normalize(raw: &Value) -> NormalizedSubscription {
    let state = raw.get("subscriptionState").and_then(|v| v.as_str());
    let status = match state {
        Some("SUBSCRIPTION_STATE_ACTIVE") => SubscriptionStatus::Active,
        Some("SUBSCRIPTION_STATE_IN_GRACE") | Some("SUBSCRIPTION_STATE_IN_GRACE_PERIOD") => {
            SubscriptionStatus::Grace
        }
        Some("SUBSCRIPTION_STATE_ON_HOLD") => SubscriptionStatus::OnHold,
        Some("SUBSCRIPTION_STATE_PAUSED") => SubscriptionStatus::Paused,
        Some("SUBSCRIPTION_STATE_CANCELED") => SubscriptionStatus::Canceled,
        Some("SUBSCRIPTION_STATE_EXPIRED") => SubscriptionStatus::Expired,
        other => {
            if let Some(s) = other {
                warn!(state = %s, "unmapped subscriptionState, treating as expired");
            }
            SubscriptionStatus::Expired
        }
    };

    let order_id = raw
        .get("latestOrderId")
        .and_then(|v| v.as_str())
        .or_else(|| {
            raw.pointer("/lineItems/0/offerDetails/basePlanId")
                .and_then(|v| v.as_str())
        })
        .map(|s| s.to_string());

    let expires_at = raw
        .pointer("/lineItems/0/expiryTime")
        .and_then(|v| v.as_str())
        .or_else(|| raw.get("expiryTime").and_then(|v| v.as_str()))
        .and_then(parse_ts);

    let started_at = raw.get("startTime").and_then(|v| v.as_str()).and_then(parse_ts);

    let acknowledged = raw
        .get("acknowledgementState")
        .and_then(|v| v.as_str())
        .map(|s| s == "ACKNOWLEDGEMENT_STATE_ACKNOWLEDGED")
        .unwrap_or(false);

    let canceled_at = raw
        .pointer("/canceledStateContext/userInitiatedCancellation/cancelTime")
        .and_then(|v| v.as_str())
        .and_then(parse_ts);

    NormalizedSubscription {
        status,
        order_id,
        started_at,
        renewed_at: None,
        expires_at,
        acknowledged,
        canceled_at,
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug)]
pub enum PlayError {
    /// Transport error, timeout, auth failure or provider 5xx — retryable.
    Unavailable(String),
    /// The provider answered authoritatively that the token is invalid.
    Rejected(String),
}

impl std::fmt::Display for PlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "provider unavailable: {msg}"),
            Self::Rejected(msg) => write!(f, "provider rejected: {msg}"),
        }
    }
}

/// Read-only client for the billing provider's subscription-status API.
/// Abstracted so reconciliation never sees provider SDK types and tests can
/// substitute a fake.
#[async_trait::async_trait]
pub trait PlayApi: Send + Sync {
    async fn fetch_subscription(
        &self,
        package: &str,
        purchase_token: &str,
    ) -> Result<Value, PlayError>;
}

pub struct GooglePlayClient {
    http: reqwest::Client,
    auth: Arc<TokenSource>,
}

impl GooglePlayClient {
    pub fn new(http: reqwest::Client, auth: Arc<TokenSource>) -> Self {
        Self { http, auth }
    }
}

#[async_trait::async_trait]
impl PlayApi for GooglePlayClient {
    async fn fetch_subscription(
        &self,
        package: &str,
        purchase_token: &str,
    ) -> Result<Value, PlayError> {
        let access_token = self
            .auth
            .token()
            .await
            .map_err(|e| PlayError::Unavailable(format!("oauth: {e}")))?;

        let url = format!(
            "https://androidpublisher.googleapis.com/androidpublisher/v3/applications/{package}/purchases/subscriptionsv2/tokens/{purchase_token}"
        );

        let resp = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| PlayError::Unavailable(format!("transport: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| PlayError::Unavailable(format!("decode: {e}")));
        }

        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();

        // 400/404/410 are authoritative verdicts on the token itself; everything
        // else (our credentials, rate limits, provider outage) is retryable.
        if status.as_u16() == 400 || status.as_u16() == 404 || status.as_u16() == 410 {
            Err(PlayError::Rejected(format!("{status}: {snippet}")))
        } else {
            Err(PlayError::Unavailable(format!("{status}: {snippet}")))
        }
    }
}
