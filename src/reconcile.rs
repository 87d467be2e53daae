use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::db::{Db, ReconcileData, SubscriptionRow, UserEntitlement};
use crate::entitlement;
use crate::error::AppError;
use crate::play::{normalize, PlayApi, PlayError};

/// Sole writer of subscription state and user entitlement. Both the
/// client-initiated verify endpoint and the store webhook funnel through
/// here, so a webhook and a racing verify can never interleave their writes.
pub struct Reconciler {
    play: Arc<dyn PlayApi>,
    db: Db,
    default_package: String,
}

impl Reconciler {
    pub fn new(play: Arc<dyn PlayApi>, db: Db, default_package: String) -> Self {
        Self {
            play,
            db,
            default_package,
        }
    }

    /// Fetch the authoritative provider state for `purchase_token`, then
    /// upsert the subscription row and the user's denormalized entitlement in
    /// one transaction. The provider call happens before the store is locked;
    /// a provider failure aborts with no state change.
    pub async fn verify_and_upsert(
        &self,
        user_id: i64,
        purchase_token: &str,
        product_id: &str,
        package_name: Option<&str>,
    ) -> Result<(SubscriptionRow, UserEntitlement), AppError> {
        let package = package_name.unwrap_or(&self.default_package);

        let raw = self
            .play
            .fetch_subscription(package, purchase_token)
            .await
            .map_err(|e| match e {
                PlayError::Unavailable(msg) => AppError::ProviderUnavailable(msg),
                PlayError::Rejected(msg) => AppError::ProviderRejected(msg),
            })?;

        let norm = normalize(&raw);
        let now = Utc::now();
        let ent = entitlement::compute(norm.status, norm.expires_at, now);

        info!(
            user_id,
            status = norm.status.as_str(),
            is_paid = ent.is_paid,
            "verified subscription"
        );

        let data = ReconcileData {
            user_id,
            platform: "google".to_string(),
            package_name: package.to_string(),
            product_id: product_id.to_string(),
            purchase_token: purchase_token.to_string(),
            order_id: norm.order_id,
            status: norm.status.as_str().to_string(),
            started_at: norm.started_at.map(|t| t.to_rfc3339()),
            renewed_at: norm.renewed_at.map(|t| t.to_rfc3339()),
            expires_at: norm.expires_at.map(|t| t.to_rfc3339()),
            acknowledged_at: norm.acknowledged.then(|| now.to_rfc3339()),
            canceled_at: norm.canceled_at.map(|t| t.to_rfc3339()),
            raw_payload: raw.to_string(),
            is_paid: ent.is_paid,
            paid_until: ent.paid_until.map(|t| t.to_rfc3339()),
            now: now.to_rfc3339(),
        };

        self.db.reconcile_subscription(data).await
    }
}
