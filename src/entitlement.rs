use chrono::{DateTime, Utc};

use crate::play::SubscriptionStatus;

/// Derived paid/unpaid state denormalized onto the user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entitlement {
    pub is_paid: bool,
    pub paid_until: Option<DateTime<Utc>>,
}

/// Pure entitlement calculation.
///
/// `is_paid` requires an active-like status AND an expiry strictly in the
/// future. `paid_until` mirrors the expiry whenever one is known, even when
/// already past, so callers can always see when the last entitlement window
/// ended.
pub fn compute(
    status: SubscriptionStatus,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Entitlement {
    let is_paid = match expires_at {
        Some(expiry) => status.is_active_like() && expiry > now,
        None => false,
    };
    Entitlement {
        is_paid,
        paid_until: expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        "2025-06-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_active_future_expiry_is_paid() {
        let e = compute(SubscriptionStatus::Active, Some(now() + Duration::days(30)), now());
        assert!(e.is_paid);
        assert_eq!(e.paid_until, Some(now() + Duration::days(30)));
    }

    #[test]
    fn test_active_like_statuses_grant() {
        let expiry = Some(now() + Duration::days(1));
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Grace,
            SubscriptionStatus::OnHold,
            SubscriptionStatus::Paused,
        ] {
            assert!(compute(status, expiry, now()).is_paid, "{status:?}");
        }
    }

    #[test]
    fn test_inactive_statuses_never_grant() {
        let expiry = Some(now() + Duration::days(365));
        for status in [
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Refunded,
            SubscriptionStatus::Revoked,
        ] {
            let e = compute(status, expiry, now());
            assert!(!e.is_paid, "{status:?}");
            // paid_until still reports the known window end
            assert_eq!(e.paid_until, expiry);
        }
    }

    #[test]
    fn test_past_expiry_not_paid_even_when_active() {
        let e = compute(SubscriptionStatus::Active, Some(now() - Duration::seconds(1)), now());
        assert!(!e.is_paid);
        assert!(e.paid_until.is_some());
    }

    #[test]
    fn test_expiry_exactly_now_not_paid() {
        let e = compute(SubscriptionStatus::Active, Some(now()), now());
        assert!(!e.is_paid);
    }

    #[test]
    fn test_missing_expiry_not_paid() {
        let e = compute(SubscriptionStatus::Active, None, now());
        assert!(!e.is_paid);
        assert!(e.paid_until.is_none());
    }
}
