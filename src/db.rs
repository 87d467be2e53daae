use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::AppError;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id          INTEGER PRIMARY KEY,
    is_paid     INTEGER NOT NULL DEFAULT 0,
    paid_until  TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS api_tokens (
    token_hash  TEXT PRIMARY KEY,
    user_id     INTEGER NOT NULL REFERENCES users(id),
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         INTEGER NOT NULL,
    platform        TEXT NOT NULL DEFAULT 'google',
    package_name    TEXT,
    product_id      TEXT NOT NULL,
    purchase_token  TEXT NOT NULL UNIQUE,
    order_id        TEXT,
    status          TEXT NOT NULL,
    started_at      TEXT,
    renewed_at      TEXT,
    expires_at      TEXT,
    acknowledged_at TEXT,
    canceled_at     TEXT,
    raw_payload     TEXT,
    latest_rtdn_at  TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS credit_balances (
    user_id      INTEGER PRIMARY KEY,
    seconds_left INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at   TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS reward_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL DEFAULT 0,
    nonce       TEXT NOT NULL UNIQUE,
    status      TEXT NOT NULL DEFAULT 'pending',
    ad_unit_id  TEXT,
    source      TEXT,
    ip          TEXT,
    ua          TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS device_tokens (
    token       TEXT PRIMARY KEY,
    user_id     INTEGER NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id);
CREATE INDEX IF NOT EXISTS idx_subscriptions_order ON subscriptions(order_id);
CREATE INDEX IF NOT EXISTS idx_reward_events_user_status ON reward_events(user_id, status);
CREATE INDEX IF NOT EXISTS idx_device_tokens_user ON device_tokens(user_id);
"#;

impl Db {
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn =
            Connection::open(path).map_err(|e| AppError::Internal(format!("db open: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| AppError::Internal(format!("db schema: {e}")))?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub(crate) fn test_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ─── Auth ───────────────────────────────────────────────────────

    pub async fn lookup_api_token(&self, token_hash: &str) -> Result<Option<i64>, AppError> {
        let conn = self.conn.clone();
        let hash = token_hash.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let user_id: Option<i64> = conn
                .query_row(
                    "SELECT user_id FROM api_tokens WHERE token_hash=?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AppError::Internal(format!("db token lookup: {e}")))?;
            Ok(user_id)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    // ─── Users (denormalized entitlement projection) ────────────────

    pub async fn user_entitlement(&self, user_id: i64) -> Result<Option<UserEntitlement>, AppError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let row: Option<UserEntitlement> = conn
                .query_row(
                    "SELECT is_paid, paid_until FROM users WHERE id=?1",
                    params![user_id],
                    |row| {
                        Ok(UserEntitlement {
                            is_paid: row.get::<_, i64>(0)? != 0,
                            paid_until: row.get(1)?,
                        })
                    },
                )
                .optional()
                .map_err(|e| AppError::Internal(format!("db user entitlement: {e}")))?;
            Ok(row)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    // ─── Subscriptions ──────────────────────────────────────────────

    pub async fn find_subscription_by_token(
        &self,
        purchase_token: &str,
    ) -> Result<Option<SubscriptionRow>, AppError> {
        let conn = self.conn.clone();
        let token = purchase_token.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            read_subscription(&conn, &token)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    /// Transactional heart of reconciliation: upsert the subscription row by
    /// purchase token and write the derived entitlement onto the user, as one
    /// atomic unit. `acknowledged_at` is sticky — once set it survives later
    /// verifications that report the purchase as unacknowledged.
    pub async fn reconcile_subscription(
        &self,
        data: ReconcileData,
    ) -> Result<(SubscriptionRow, UserEntitlement), AppError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AppError::Internal(format!("db tx: {e}")))?;

            // user_id/platform/package/product bind at creation and stay put;
            // the remaining fields follow the latest verified provider state.
            tx.execute(
                "INSERT INTO subscriptions
                   (user_id, platform, package_name, product_id, purchase_token, order_id,
                    status, started_at, renewed_at, expires_at, acknowledged_at, canceled_at,
                    raw_payload, latest_rtdn_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(purchase_token) DO UPDATE SET
                   order_id=excluded.order_id,
                   status=excluded.status,
                   started_at=excluded.started_at,
                   renewed_at=excluded.renewed_at,
                   expires_at=excluded.expires_at,
                   acknowledged_at=COALESCE(subscriptions.acknowledged_at, excluded.acknowledged_at),
                   canceled_at=excluded.canceled_at,
                   raw_payload=excluded.raw_payload,
                   latest_rtdn_at=excluded.latest_rtdn_at,
                   updated_at=excluded.latest_rtdn_at",
                params![
                    data.user_id,
                    data.platform,
                    data.package_name,
                    data.product_id,
                    data.purchase_token,
                    data.order_id,
                    data.status,
                    data.started_at,
                    data.renewed_at,
                    data.expires_at,
                    data.acknowledged_at,
                    data.canceled_at,
                    data.raw_payload,
                    data.now,
                ],
            )
            .map_err(|e| AppError::Internal(format!("db upsert subscription: {e}")))?;

            tx.execute(
                "INSERT INTO users (id, is_paid, paid_until) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                   is_paid=excluded.is_paid,
                   paid_until=excluded.paid_until,
                   updated_at=datetime('now')",
                params![data.user_id, data.is_paid as i64, data.paid_until],
            )
            .map_err(|e| AppError::Internal(format!("db update user: {e}")))?;

            let row = read_subscription(&tx, &data.purchase_token)?
                .ok_or_else(|| AppError::Internal("subscription vanished mid-upsert".into()))?;

            tx.commit()
                .map_err(|e| AppError::Internal(format!("db commit: {e}")))?;

            Ok((
                row,
                UserEntitlement {
                    is_paid: data.is_paid,
                    paid_until: data.paid_until,
                },
            ))
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    // ─── Device tokens ──────────────────────────────────────────────

    pub async fn register_device_token(&self, user_id: i64, token: &str) -> Result<(), AppError> {
        let conn = self.conn.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO device_tokens (token, user_id) VALUES (?1, ?2)
                 ON CONFLICT(token) DO UPDATE SET user_id=excluded.user_id",
                params![token, user_id],
            )
            .map_err(|e| AppError::Internal(format!("db register device token: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    pub async fn device_tokens_for_user(&self, user_id: i64) -> Result<Vec<String>, AppError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT token FROM device_tokens WHERE user_id=?1")
                .map_err(|e| AppError::Internal(format!("db prepare device tokens: {e}")))?;
            let tokens = stmt
                .query_map(params![user_id], |row| row.get(0))
                .map_err(|e| AppError::Internal(format!("db device tokens: {e}")))?
                .collect::<Result<Vec<String>, _>>()
                .map_err(|e| AppError::Internal(format!("db device tokens: {e}")))?;
            Ok(tokens)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    // ─── Credits ledger ─────────────────────────────────────────────

    pub async fn credit_seconds(&self, user_id: i64) -> Result<i64, AppError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let seconds: Option<i64> = conn
                .query_row(
                    "SELECT seconds_left FROM credit_balances WHERE user_id=?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AppError::Internal(format!("db credit seconds: {e}")))?;
            Ok(seconds.unwrap_or(0).max(0))
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    pub async fn grant_minutes(&self, user_id: i64, minutes: i64) -> Result<(), AppError> {
        if minutes <= 0 {
            return Ok(());
        }
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AppError::Internal(format!("db tx: {e}")))?;
            credit_seconds_tx(&tx, user_id, minutes * 60)?;
            tx.commit()
                .map_err(|e| AppError::Internal(format!("db commit: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    /// Atomic consume. The request is clamped to `[0, per_call_cap]` before
    /// touching the balance; the balance never goes negative and is never
    /// created by consumption.
    pub async fn consume_seconds(
        &self,
        user_id: i64,
        requested_seconds: i64,
        per_call_cap: i64,
    ) -> Result<(i64, i64), AppError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AppError::Internal(format!("db tx: {e}")))?;

            let current: Option<i64> = tx
                .query_row(
                    "SELECT seconds_left FROM credit_balances WHERE user_id=?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AppError::Internal(format!("db consume read: {e}")))?;

            let current = match current {
                None => {
                    tx.commit()
                        .map_err(|e| AppError::Internal(format!("db commit: {e}")))?;
                    return Ok((0, 0));
                }
                Some(c) => c.max(0),
            };

            let delta = requested_seconds.max(0).min(per_call_cap.max(1));
            if delta == 0 || current == 0 {
                tx.commit()
                    .map_err(|e| AppError::Internal(format!("db commit: {e}")))?;
                return Ok((0, current));
            }

            let spent = delta.min(current);
            let remaining = current - spent;
            tx.execute(
                "UPDATE credit_balances SET seconds_left=?1, updated_at=datetime('now') WHERE user_id=?2",
                params![remaining, user_id],
            )
            .map_err(|e| AppError::Internal(format!("db consume write: {e}")))?;

            tx.commit()
                .map_err(|e| AppError::Internal(format!("db commit: {e}")))?;
            Ok((spent, remaining))
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    // ─── Reward events ──────────────────────────────────────────────

    pub async fn create_pending_reward(&self, data: PendingRewardData) -> Result<(), AppError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO reward_events (user_id, nonce, status, ip, ua)
                 VALUES (?1, ?2, 'pending', ?3, ?4)",
                params![data.user_id, data.nonce, data.ip, data.ua],
            )
            .map_err(|e| AppError::Internal(format!("db create pending reward: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    pub async fn reward_status(
        &self,
        user_id: i64,
        nonce: &str,
    ) -> Result<Option<String>, AppError> {
        let conn = self.conn.clone();
        let nonce = nonce.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM reward_events WHERE user_id=?1 AND nonce=?2",
                    params![user_id, nonce],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AppError::Internal(format!("db reward status: {e}")))?;
            Ok(status)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }

    /// Apply one signed reward callback, exactly once.
    ///
    /// Looks up the event by nonce: granted → replay no-op; pending for the
    /// same user → credit and flip to granted; pending for another user →
    /// untouched (stale or spoofed nonce). With no matching event the callback
    /// itself is authoritative and a granted event is created alongside the
    /// credit. Event flip and ledger credit commit together.
    pub async fn grant_reward(&self, data: GrantRewardData) -> Result<RewardOutcome, AppError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AppError::Internal(format!("db tx: {e}")))?;

            let existing: Option<(i64, i64, String)> = match &data.lookup_nonce {
                Some(nonce) => tx
                    .query_row(
                        "SELECT id, user_id, status FROM reward_events WHERE nonce=?1",
                        params![nonce],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()
                    .map_err(|e| AppError::Internal(format!("db reward lookup: {e}")))?,
                None => None,
            };

            let outcome = match existing {
                Some((_, _, ref status)) if status == "granted" => RewardOutcome::AlreadyGranted,
                Some((_, event_user, _)) if event_user != data.user_id => {
                    RewardOutcome::UserMismatch
                }
                Some((event_id, _, _)) => {
                    credit_seconds_tx(&tx, data.user_id, data.minutes * 60)?;
                    tx.execute(
                        "UPDATE reward_events SET
                           status='granted',
                           ad_unit_id=COALESCE(?1, ad_unit_id),
                           source=?2,
                           ip=COALESCE(?3, ip),
                           ua=COALESCE(?4, ua),
                           updated_at=datetime('now')
                         WHERE id=?5",
                        params![data.ad_unit_id, data.source, data.ip, data.ua, event_id],
                    )
                    .map_err(|e| AppError::Internal(format!("db reward grant: {e}")))?;
                    RewardOutcome::Granted
                }
                None => {
                    credit_seconds_tx(&tx, data.user_id, data.minutes * 60)?;
                    tx.execute(
                        "INSERT INTO reward_events (user_id, nonce, status, ad_unit_id, source, ip, ua)
                         VALUES (?1, ?2, 'granted', ?3, ?4, ?5, ?6)",
                        params![
                            data.user_id,
                            data.create_nonce,
                            data.ad_unit_id,
                            data.source,
                            data.ip,
                            data.ua,
                        ],
                    )
                    .map_err(|e| AppError::Internal(format!("db reward create granted: {e}")))?;
                    RewardOutcome::GrantedUnprepared
                }
            };

            tx.commit()
                .map_err(|e| AppError::Internal(format!("db commit: {e}")))?;
            Ok(outcome)
        })
        .await
        .map_err(|e| AppError::Internal(format!("spawn_blocking: {e}")))?
    }
}

/// Add seconds to a user's balance inside an open transaction, creating the
/// row lazily.
fn credit_seconds_tx(
    tx: &Connection,
    user_id: i64,
    add_seconds: i64,
) -> Result<(), AppError> {
    tx.execute(
        "INSERT INTO credit_balances (user_id, seconds_left) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET
           seconds_left=credit_balances.seconds_left + excluded.seconds_left,
           updated_at=datetime('now')",
        params![user_id, add_seconds],
    )
    .map_err(|e| AppError::Internal(format!("db credit: {e}")))?;
    Ok(())
}

fn read_subscription(
    conn: &Connection,
    purchase_token: &str,
) -> Result<Option<SubscriptionRow>, AppError> {
    conn.query_row(
        "SELECT id, user_id, platform, package_name, product_id, purchase_token,
                order_id, status, started_at, renewed_at, expires_at,
                acknowledged_at, canceled_at
         FROM subscriptions WHERE purchase_token=?1",
        params![purchase_token],
        |row| {
            Ok(SubscriptionRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                platform: row.get(2)?,
                package_name: row.get(3)?,
                product_id: row.get(4)?,
                purchase_token: row.get(5)?,
                order_id: row.get(6)?,
                status: row.get(7)?,
                started_at: row.get(8)?,
                renewed_at: row.get(9)?,
                expires_at: row.get(10)?,
                acknowledged_at: row.get(11)?,
                canceled_at: row.get(12)?,
            })
        },
    )
    .optional()
    .map_err(|e| AppError::Internal(format!("db read subscription: {e}")))
}

// ─── Data types ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UserEntitlement {
    pub is_paid: bool,
    pub paid_until: Option<String>,
}

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct SubscriptionRow {
    pub id: i64,
    pub user_id: i64,
    pub platform: String,
    pub package_name: Option<String>,
    pub product_id: String,
    pub purchase_token: String,
    pub order_id: Option<String>,
    pub status: String,
    pub started_at: Option<String>,
    pub renewed_at: Option<String>,
    pub expires_at: Option<String>,
    pub acknowledged_at: Option<String>,
    pub canceled_at: Option<String>,
}

/// Everything the reconciliation transaction writes, pre-normalized.
/// Timestamps are RFC 3339 strings; `acknowledged_at` is Some only when the
/// provider reported the purchase acknowledged.
pub struct ReconcileData {
    pub user_id: i64,
    pub platform: String,
    pub package_name: String,
    pub product_id: String,
    pub purchase_token: String,
    pub order_id: Option<String>,
    pub status: String,
    pub started_at: Option<String>,
    pub renewed_at: Option<String>,
    pub expires_at: Option<String>,
    pub acknowledged_at: Option<String>,
    pub canceled_at: Option<String>,
    pub raw_payload: String,
    pub is_paid: bool,
    pub paid_until: Option<String>,
    pub now: String,
}

pub struct PendingRewardData {
    pub user_id: i64,
    pub nonce: String,
    pub ip: Option<String>,
    pub ua: Option<String>,
}

pub struct GrantRewardData {
    pub user_id: i64,
    /// Nonce supplied by the callback, if any.
    pub lookup_nonce: Option<String>,
    /// Nonce to store when the callback has no matching prepared event.
    pub create_nonce: String,
    pub minutes: i64,
    pub ad_unit_id: Option<String>,
    pub source: String,
    pub ip: Option<String>,
    pub ua: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum RewardOutcome {
    Granted,
    AlreadyGranted,
    UserMismatch,
    GrantedUnprepared,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Db {
        Db::open(":memory:").expect("open in-memory db")
    }

    fn insert_user(db: &Db, id: i64, is_paid: bool, paid_until: Option<&str>) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, is_paid, paid_until) VALUES (?1, ?2, ?3)",
            params![id, is_paid as i64, paid_until],
        )
        .unwrap();
    }

    fn make_reconcile(
        user_id: i64,
        token: &str,
        status: &str,
        expires_at: Option<&str>,
        acknowledged_at: Option<&str>,
        is_paid: bool,
    ) -> ReconcileData {
        ReconcileData {
            user_id,
            platform: "google".to_string(),
            package_name: "com.booka_app".to_string(),
            product_id: "premium_monthly".to_string(),
            purchase_token: token.to_string(),
            order_id: Some("GPA.0000-1111".to_string()),
            status: status.to_string(),
            started_at: Some("2025-01-01T00:00:00+00:00".to_string()),
            renewed_at: None,
            expires_at: expires_at.map(|s| s.to_string()),
            acknowledged_at: acknowledged_at.map(|s| s.to_string()),
            canceled_at: None,
            raw_payload: "{}".to_string(),
            is_paid,
            paid_until: expires_at.map(|s| s.to_string()),
            now: "2025-06-01T00:00:00+00:00".to_string(),
        }
    }

    // ─── Credits ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_get_seconds_missing_row_is_zero() {
        let db = test_db();
        assert_eq!(db.credit_seconds(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_grant_minutes_creates_row() {
        let db = test_db();
        db.grant_minutes(1, 15).await.unwrap();
        assert_eq!(db.credit_seconds(1).await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_grant_minutes_accumulates() {
        let db = test_db();
        db.grant_minutes(1, 15).await.unwrap();
        db.grant_minutes(1, 10).await.unwrap();
        assert_eq!(db.credit_seconds(1).await.unwrap(), 1500);
    }

    #[tokio::test]
    async fn test_grant_zero_minutes_is_noop() {
        let db = test_db();
        db.grant_minutes(1, 0).await.unwrap();
        db.grant_minutes(1, -5).await.unwrap();
        assert_eq!(db.credit_seconds(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_without_row() {
        let db = test_db();
        let (spent, remaining) = db.consume_seconds(1, 100, 300).await.unwrap();
        assert_eq!((spent, remaining), (0, 0));
    }

    #[tokio::test]
    async fn test_consume_basic() {
        let db = test_db();
        db.grant_minutes(1, 15).await.unwrap();
        let (spent, remaining) = db.consume_seconds(1, 300, 300).await.unwrap();
        assert_eq!((spent, remaining), (300, 600));
    }

    #[tokio::test]
    async fn test_consume_clamps_to_cap() {
        let db = test_db();
        db.grant_minutes(1, 15).await.unwrap();
        let (spent, remaining) = db.consume_seconds(1, 1000, 300).await.unwrap();
        assert_eq!((spent, remaining), (300, 600));
    }

    #[tokio::test]
    async fn test_consume_negative_request_spends_nothing() {
        let db = test_db();
        db.grant_minutes(1, 15).await.unwrap();
        let (spent, remaining) = db.consume_seconds(1, -50, 300).await.unwrap();
        assert_eq!((spent, remaining), (0, 900));
    }

    #[tokio::test]
    async fn test_consume_more_than_balance_spends_balance() {
        let db = test_db();
        db.grant_minutes(1, 1).await.unwrap(); // 60s
        let (spent, remaining) = db.consume_seconds(1, 300, 300).await.unwrap();
        assert_eq!((spent, remaining), (60, 0));
        let (spent, remaining) = db.consume_seconds(1, 300, 300).await.unwrap();
        assert_eq!((spent, remaining), (0, 0));
    }

    #[tokio::test]
    async fn test_concurrent_consumes_never_overspend() {
        let db = test_db();
        db.grant_minutes(1, 15).await.unwrap(); // 900s

        let mut handles = Vec::new();
        for _ in 0..5 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.consume_seconds(1, 300, 300).await.unwrap().0
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 900);
        assert_eq!(db.credit_seconds(1).await.unwrap(), 0);
    }

    // ─── Rewards ────────────────────────────────────────────────────

    fn make_grant(user_id: i64, nonce: Option<&str>) -> GrantRewardData {
        GrantRewardData {
            user_id,
            lookup_nonce: nonce.map(|s| s.to_string()),
            create_nonce: nonce.unwrap_or("generated-nonce").to_string(),
            minutes: 15,
            ad_unit_id: Some("ca-app-pub-1/2".to_string()),
            source: "admob_ssv".to_string(),
            ip: Some("203.0.113.9".to_string()),
            ua: None,
        }
    }

    #[tokio::test]
    async fn test_grant_pending_reward() {
        let db = test_db();
        db.create_pending_reward(PendingRewardData {
            user_id: 1,
            nonce: "n1".to_string(),
            ip: None,
            ua: Some("booka-android/1.0".to_string()),
        })
        .await
        .unwrap();

        let outcome = db.grant_reward(make_grant(1, Some("n1"))).await.unwrap();
        assert_eq!(outcome, RewardOutcome::Granted);
        assert_eq!(db.credit_seconds(1).await.unwrap(), 900);
        assert_eq!(
            db.reward_status(1, "n1").await.unwrap().as_deref(),
            Some("granted")
        );
    }

    #[tokio::test]
    async fn test_grant_replay_is_noop() {
        let db = test_db();
        db.create_pending_reward(PendingRewardData {
            user_id: 1,
            nonce: "n1".to_string(),
            ip: None,
            ua: None,
        })
        .await
        .unwrap();

        db.grant_reward(make_grant(1, Some("n1"))).await.unwrap();
        let outcome = db.grant_reward(make_grant(1, Some("n1"))).await.unwrap();
        assert_eq!(outcome, RewardOutcome::AlreadyGranted);
        assert_eq!(db.credit_seconds(1).await.unwrap(), 900); // credited once
    }

    #[tokio::test]
    async fn test_grant_user_mismatch_changes_nothing() {
        let db = test_db();
        db.create_pending_reward(PendingRewardData {
            user_id: 1,
            nonce: "n1".to_string(),
            ip: None,
            ua: None,
        })
        .await
        .unwrap();

        let outcome = db.grant_reward(make_grant(2, Some("n1"))).await.unwrap();
        assert_eq!(outcome, RewardOutcome::UserMismatch);
        assert_eq!(db.credit_seconds(1).await.unwrap(), 0);
        assert_eq!(db.credit_seconds(2).await.unwrap(), 0);
        assert_eq!(
            db.reward_status(1, "n1").await.unwrap().as_deref(),
            Some("pending")
        );
    }

    #[tokio::test]
    async fn test_grant_without_prepare_creates_granted_event() {
        let db = test_db();
        let outcome = db.grant_reward(make_grant(1, Some("unseen"))).await.unwrap();
        assert_eq!(outcome, RewardOutcome::GrantedUnprepared);
        assert_eq!(db.credit_seconds(1).await.unwrap(), 900);
        assert_eq!(
            db.reward_status(1, "unseen").await.unwrap().as_deref(),
            Some("granted")
        );
    }

    #[tokio::test]
    async fn test_grant_without_nonce_uses_fresh_one() {
        let db = test_db();
        let outcome = db.grant_reward(make_grant(1, None)).await.unwrap();
        assert_eq!(outcome, RewardOutcome::GrantedUnprepared);
        assert_eq!(
            db.reward_status(1, "generated-nonce").await.unwrap().as_deref(),
            Some("granted")
        );
    }

    #[tokio::test]
    async fn test_reward_status_unknown_nonce() {
        let db = test_db();
        assert!(db.reward_status(1, "nope").await.unwrap().is_none());
    }

    // ─── Reconciliation ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_reconcile_creates_subscription_and_user() {
        let db = test_db();
        let data = make_reconcile(7, "tok_1", "active", Some("2025-12-01T00:00:00+00:00"), None, true);
        let (row, ent) = db.reconcile_subscription(data).await.unwrap();

        assert_eq!(row.user_id, 7);
        assert_eq!(row.status, "active");
        assert!(ent.is_paid);

        let stored = db.user_entitlement(7).await.unwrap().unwrap();
        assert!(stored.is_paid);
        assert_eq!(stored.paid_until.as_deref(), Some("2025-12-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_reconcile_updates_same_row_in_place() {
        let db = test_db();
        let first = make_reconcile(7, "tok_1", "active", Some("2025-12-01T00:00:00+00:00"), None, true);
        let (row1, _) = db.reconcile_subscription(first).await.unwrap();

        let second = make_reconcile(7, "tok_1", "expired", Some("2025-12-01T00:00:00+00:00"), None, false);
        let (row2, ent) = db.reconcile_subscription(second).await.unwrap();

        assert_eq!(row1.id, row2.id);
        assert_eq!(row2.status, "expired");
        assert!(!ent.is_paid);

        let count: i64 = db
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM subscriptions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_acknowledged_at_is_sticky() {
        let db = test_db();
        let first = make_reconcile(
            7,
            "tok_1",
            "active",
            Some("2025-12-01T00:00:00+00:00"),
            Some("2025-06-01T00:00:00+00:00"),
            true,
        );
        let (row1, _) = db.reconcile_subscription(first).await.unwrap();
        assert_eq!(row1.acknowledged_at.as_deref(), Some("2025-06-01T00:00:00+00:00"));

        // Later verification reports the purchase unacknowledged — keep the
        // prior timestamp.
        let second = make_reconcile(7, "tok_1", "active", Some("2025-12-01T00:00:00+00:00"), None, true);
        let (row2, _) = db.reconcile_subscription(second).await.unwrap();
        assert_eq!(row2.acknowledged_at.as_deref(), Some("2025-06-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_acknowledged_at_set_when_previously_null() {
        let db = test_db();
        let first = make_reconcile(7, "tok_1", "active", Some("2025-12-01T00:00:00+00:00"), None, true);
        let (row1, _) = db.reconcile_subscription(first).await.unwrap();
        assert!(row1.acknowledged_at.is_none());

        let second = make_reconcile(
            7,
            "tok_1",
            "active",
            Some("2025-12-01T00:00:00+00:00"),
            Some("2025-07-01T00:00:00+00:00"),
            true,
        );
        let (row2, _) = db.reconcile_subscription(second).await.unwrap();
        assert_eq!(row2.acknowledged_at.as_deref(), Some("2025-07-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_reconcile_flips_existing_paid_user() {
        let db = test_db();
        insert_user(&db, 7, true, Some("2025-12-01T00:00:00+00:00"));

        let data = make_reconcile(7, "tok_1", "expired", Some("2025-05-01T00:00:00+00:00"), None, false);
        db.reconcile_subscription(data).await.unwrap();

        let stored = db.user_entitlement(7).await.unwrap().unwrap();
        assert!(!stored.is_paid);
        assert_eq!(stored.paid_until.as_deref(), Some("2025-05-01T00:00:00+00:00"));
    }

    // ─── Auth / device tokens ───────────────────────────────────────

    #[tokio::test]
    async fn test_lookup_api_token() {
        let db = test_db();
        insert_user(&db, 3, false, None);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO api_tokens (token_hash, user_id) VALUES ('hash1', 3)",
                [],
            )
            .unwrap();
        }
        assert_eq!(db.lookup_api_token("hash1").await.unwrap(), Some(3));
        assert_eq!(db.lookup_api_token("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_device_tokens_roundtrip() {
        let db = test_db();
        db.register_device_token(7, "dev_a").await.unwrap();
        db.register_device_token(7, "dev_b").await.unwrap();
        let mut tokens = db.device_tokens_for_user(7).await.unwrap();
        tokens.sort();
        assert_eq!(tokens, vec!["dev_a".to_string(), "dev_b".to_string()]);

        // Re-registering a token moves it to the new user.
        db.register_device_token(8, "dev_a").await.unwrap();
        assert_eq!(db.device_tokens_for_user(8).await.unwrap(), vec!["dev_a".to_string()]);
        assert_eq!(db.device_tokens_for_user(7).await.unwrap(), vec!["dev_b".to_string()]);
    }
}
