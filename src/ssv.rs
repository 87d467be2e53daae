use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use tracing::debug;

/// Public verifier keys for AdMob server-side verification callbacks.
pub const ADMOB_KEYS_URL: &str = "https://www.gstatic.com/admob/reward/verifier-keys.json";

/// How long a fetched key set is reused before re-fetching.
const KEYS_TTL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub enum SsvError {
    MissingSignature,
    KeysUnavailable(String),
    UnknownKey(String),
    BadKey,
    BadSignature,
    SignatureMismatch,
}

impl std::fmt::Display for SsvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSignature => write!(f, "missing signature/key_id parameters"),
            Self::KeysUnavailable(msg) => write!(f, "verifier keys unavailable: {msg}"),
            Self::UnknownKey(id) => write!(f, "unknown key_id: {id}"),
            Self::BadKey => write!(f, "verifier key unparsable"),
            Self::BadSignature => write!(f, "signature undecodable"),
            Self::SignatureMismatch => write!(f, "signature mismatch"),
        }
    }
}

/// ECDSA P-256 verification of AdMob SSV callbacks.
///
/// The signed content is the raw query string up to (not including)
/// `&signature=`; the ad network always appends `signature` and `key_id`
/// last. Keys are fetched from the public endpoint and cached.
pub struct SsvVerifier {
    http: reqwest::Client,
    keys_url: String,
    ttl: Duration,
    cache: Mutex<Option<(Instant, HashMap<String, String>)>>,
}

impl SsvVerifier {
    pub fn new(http: reqwest::Client, keys_url: &str) -> Self {
        Self {
            http,
            keys_url: keys_url.to_string(),
            ttl: KEYS_TTL,
            cache: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_static_keys(keys: HashMap<String, String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            keys_url: String::new(),
            ttl: Duration::from_secs(3600 * 24 * 365),
            cache: Mutex::new(Some((Instant::now(), keys))),
        }
    }

    /// Verify the signature over a full callback query string.
    pub async fn verify_query(&self, query: &str) -> Result<(), SsvError> {
        let mut signature = None;
        let mut key_id = None;
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            match k.as_ref() {
                "signature" => signature = Some(v.to_string()),
                "key_id" => key_id = Some(v.to_string()),
                _ => {}
            }
        }
        let signature = signature.filter(|s| !s.is_empty()).ok_or(SsvError::MissingSignature)?;
        let key_id = key_id.filter(|s| !s.is_empty()).ok_or(SsvError::MissingSignature)?;

        let content_end = query.find("&signature=").ok_or(SsvError::MissingSignature)?;
        let content = &query[..content_end];

        let keys = self.keys().await?;
        let pem = keys.get(&key_id).ok_or(SsvError::UnknownKey(key_id.clone()))?;
        let vk = VerifyingKey::from_public_key_pem(pem).map_err(|_| SsvError::BadKey)?;

        let sig_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(signature.as_bytes())
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(signature.as_bytes()))
            .map_err(|_| SsvError::BadSignature)?;
        let sig = Signature::from_der(&sig_bytes).map_err(|_| SsvError::BadSignature)?;

        vk.verify(content.as_bytes(), &sig)
            .map_err(|_| SsvError::SignatureMismatch)
    }

    async fn keys(&self) -> Result<HashMap<String, String>, SsvError> {
        if let Some((fetched, keys)) = self.cache.lock().unwrap().as_ref() {
            if fetched.elapsed() < self.ttl {
                return Ok(keys.clone());
            }
        }

        let resp = self
            .http
            .get(&self.keys_url)
            .send()
            .await
            .map_err(|e| SsvError::KeysUnavailable(format!("fetch: {e}")))?;
        if !resp.status().is_success() {
            return Err(SsvError::KeysUnavailable(format!("status {}", resp.status())));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SsvError::KeysUnavailable(format!("decode: {e}")))?;

        let mut keys = HashMap::new();
        if let Some(entries) = body.get("keys").and_then(|v| v.as_array()) {
            for k in entries {
                // The endpoint spells the id "keyId"; tolerate "key_id" too.
                let id = k
                    .get("keyId")
                    .or_else(|| k.get("key_id"))
                    .map(|v| match v {
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                let pem = k.get("pem").and_then(|v| v.as_str());
                if let (Some(id), Some(pem)) = (id, pem) {
                    keys.insert(id, pem.to_string());
                }
            }
        }
        debug!(count = keys.len(), "fetched SSV verifier keys");

        *self.cache.lock().unwrap() = Some((Instant::now(), keys.clone()));
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;
    use rand_core::OsRng;

    const B64URL: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn make_verifier(key_id: &str) -> (SsvVerifier, SigningKey) {
        let sk = SigningKey::random(&mut OsRng);
        let pem = VerifyingKey::from(&sk)
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();
        let mut keys = HashMap::new();
        keys.insert(key_id.to_string(), pem);
        (SsvVerifier::with_static_keys(keys), sk)
    }

    fn signed_query(sk: &SigningKey, content: &str, key_id: &str) -> String {
        let sig: Signature = sk.sign(content.as_bytes());
        let sig_b64 = B64URL.encode(sig.to_der().as_bytes());
        format!("{content}&signature={sig_b64}&key_id={key_id}")
    }

    #[tokio::test]
    async fn test_valid_signature() {
        let (verifier, sk) = make_verifier("1");
        let content = "ad_network=5450213213286189855&ad_unit=123&reward_amount=15&user_id=7";
        let query = signed_query(&sk, content, "1");
        assert!(verifier.verify_query(&query).await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_content_rejected() {
        let (verifier, sk) = make_verifier("1");
        let query = signed_query(&sk, "reward_amount=15&user_id=7", "1");
        let tampered = query.replace("reward_amount=15", "reward_amount=9999");
        assert!(matches!(
            verifier.verify_query(&tampered).await,
            Err(SsvError::SignatureMismatch)
        ));
    }

    #[tokio::test]
    async fn test_unknown_key_id() {
        let (verifier, sk) = make_verifier("1");
        let query = signed_query(&sk, "user_id=7", "2");
        assert!(matches!(
            verifier.verify_query(&query).await,
            Err(SsvError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_signature_params() {
        let (verifier, _) = make_verifier("1");
        assert!(matches!(
            verifier.verify_query("user_id=7&reward_amount=15").await,
            Err(SsvError::MissingSignature)
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_signature_rejected() {
        let (verifier, _) = make_verifier("1");
        let other = SigningKey::random(&mut OsRng);
        let query = signed_query(&other, "user_id=7", "1");
        assert!(matches!(
            verifier.verify_query(&query).await,
            Err(SsvError::SignatureMismatch)
        ));
    }
}
