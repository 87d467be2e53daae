use std::sync::Mutex;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Slack subtracted from the token expiry so a token is never used right at
/// its deadline.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug)]
pub struct TokenError(pub String);

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token error: {}", self.0)
    }
}

/// OAuth2 access-token source for one Google service-account scope.
/// Tokens are cached in-process and reused until shortly before expiry, so a
/// burst of requests mints a single assertion.
pub struct TokenSource {
    http: reqwest::Client,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    scope: String,
    cached: Mutex<Option<(String, i64)>>,
}

impl TokenSource {
    pub fn from_file(
        http: reqwest::Client,
        path: &str,
        scope: &str,
    ) -> Result<Self, TokenError> {
        let data = std::fs::read(path)
            .map_err(|e| TokenError(format!("read service account key {path}: {e}")))?;
        let key: ServiceAccountKey = serde_json::from_slice(&data)
            .map_err(|e| TokenError(format!("parse service account key: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| TokenError(format!("service account private key: {e}")))?;
        Ok(Self {
            http,
            key,
            encoding_key,
            scope: scope.to_string(),
            cached: Mutex::new(None),
        })
    }

    pub async fn token(&self) -> Result<String, TokenError> {
        let now = chrono::Utc::now().timestamp();

        if let Some((token, exp)) = self.cached.lock().unwrap().clone() {
            if now + EXPIRY_SLACK_SECS < exp {
                return Ok(token);
            }
        }

        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )
        .map_err(|e| TokenError(format!("sign assertion: {e}")))?;

        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TokenError(format!("token exchange: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(TokenError(format!("token exchange {status}: {snippet}")));
        }

        let tok: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TokenError(format!("token exchange decode: {e}")))?;

        debug!(scope = %self.scope, expires_in = tok.expires_in, "minted access token");

        let exp = now + tok.expires_in;
        *self.cached.lock().unwrap() = Some((tok.access_token.clone(), exp));
        Ok(tok.access_token)
    }
}
