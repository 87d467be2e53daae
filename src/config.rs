#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Default Android package used when a verify request omits packageName.
    pub play_package: String,
    /// Path to the Google service-account JSON key (Play API + FCM).
    pub service_account_json: String,
    /// FCM project id; push dispatch is disabled when unset.
    pub fcm_project_id: Option<String>,
    /// Toggle AdMob SSV signature verification (off only for local testing).
    pub ssv_verify: bool,
    /// Minutes credited per rewarded-ad view when the callback omits an amount.
    pub reward_minutes: i64,
    /// API-layer sanity clamp on a single consume request, in seconds.
    pub consume_request_max: i64,
    /// Ledger-layer hard cap on a single consume call, in seconds.
    pub consume_call_cap: i64,
}

impl Config {
    pub fn from_env() -> Self {
        let service_account_json = required_env("GOOGLE_SERVICE_ACCOUNT_JSON");

        let play_package = std::env::var("GOOGLE_PLAY_PACKAGE")
            .unwrap_or_else(|_| "com.booka_app".to_string())
            .trim()
            .to_string();

        let fcm_project_id = optional_env("FCM_PROJECT_ID");

        let ssv_verify = std::env::var("ADMOB_SSV_VERIFY")
            .map(|v| !v.trim().eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let reward_minutes = env_i64("ADMOB_REWARD_MINUTES", 15);
        let consume_request_max = env_i64("CONSUME_REQUEST_MAX_SECONDS", 3600);
        let consume_call_cap = env_i64("CONSUME_CALL_CAP_SECONDS", 300);

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "/data/booka-billing.db".to_string());

        Config {
            port,
            database_url,
            play_package,
            service_account_json,
            fcm_project_id,
            ssv_verify,
            reward_minutes,
            consume_request_max,
            consume_call_cap,
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| panic!("missing required env var: {key}"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|v| {
        let v = v.trim().to_string();
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    })
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
