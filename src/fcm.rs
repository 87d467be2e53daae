use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::gauth::TokenSource;

/// Fire-and-forget push dispatch, addressed per device token. Returns whether
/// the message was accepted; failures are logged, never retried here.
#[async_trait::async_trait]
pub trait PushSender: Send + Sync {
    async fn send_data(&self, device_token: &str, data: &[(&str, &str)]) -> bool;
}

/// FCM HTTP v1 client sending data-only ("silent") messages.
pub struct FcmClient {
    http: reqwest::Client,
    auth: Arc<TokenSource>,
    project_id: String,
}

impl FcmClient {
    pub fn new(http: reqwest::Client, auth: Arc<TokenSource>, project_id: String) -> Self {
        Self {
            http,
            auth,
            project_id,
        }
    }
}

#[async_trait::async_trait]
impl PushSender for FcmClient {
    async fn send_data(&self, device_token: &str, data: &[(&str, &str)]) -> bool {
        let access_token = match self.auth.token().await {
            Ok(t) => t,
            Err(e) => {
                warn!("FCM token mint failed: {e}");
                return false;
            }
        };

        let mut map = serde_json::Map::new();
        for (k, v) in data {
            map.insert(k.to_string(), json!(v));
        }

        // Data-only message: no notification block, high priority so the app
        // wakes up to refresh its subscription state.
        let payload = json!({
            "message": {
                "token": device_token,
                "data": map,
                "android": { "priority": "HIGH" },
                "apns": {
                    "headers": { "apns-priority": "10" },
                    "payload": { "aps": { "content-available": 1 } }
                }
            }
        });

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.project_id
        );

        match self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let snippet: String = body.chars().take(200).collect();
                warn!(%status, token = %device_token, "FCM non-2xx response: {snippet}");
                false
            }
            Err(e) => {
                warn!(token = %device_token, "FCM request failed: {e}");
                false
            }
        }
    }
}

/// Used when no FCM project is configured; sends nothing.
pub struct DisabledPush;

#[async_trait::async_trait]
impl PushSender for DisabledPush {
    async fn send_data(&self, device_token: &str, _data: &[(&str, &str)]) -> bool {
        debug!(token = %device_token, "push dispatch disabled, dropping message");
        false
    }
}
