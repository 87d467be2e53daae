mod auth;
mod config;
mod db;
mod entitlement;
mod error;
mod fcm;
mod gauth;
mod play;
mod reconcile;
mod routes;
mod ssv;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use config::Config;
use db::Db;
use fcm::{DisabledPush, FcmClient, PushSender};
use gauth::TokenSource;
use play::GooglePlayClient;
use reconcile::Reconciler;
use ssv::SsvVerifier;
use state::AppState;

const PLAY_SCOPE: &str = "https://www.googleapis.com/auth/androidpublisher";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

#[tokio::main]
async fn main() {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Config (panics on missing required vars — fail-fast)
    let config = Config::from_env();
    let port = config.port;

    // Database
    let db = Db::open(&config.database_url).expect("failed to open database");

    // Shared outbound HTTP client (Play API, FCM, OAuth, SSV keys)
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(15))
        .build()
        .expect("failed to build HTTP client");

    // Billing provider client
    let play_auth = Arc::new(
        TokenSource::from_file(http_client.clone(), &config.service_account_json, PLAY_SCOPE)
            .expect("failed to init Play token source"),
    );
    let play = Arc::new(GooglePlayClient::new(http_client.clone(), play_auth));

    let reconciler = Arc::new(Reconciler::new(
        play,
        db.clone(),
        config.play_package.clone(),
    ));

    // Push dispatch (optional — disabled without an FCM project)
    let push: Arc<dyn PushSender> = match &config.fcm_project_id {
        Some(project_id) => {
            let fcm_auth = Arc::new(
                TokenSource::from_file(
                    http_client.clone(),
                    &config.service_account_json,
                    FCM_SCOPE,
                )
                .expect("failed to init FCM token source"),
            );
            Arc::new(FcmClient::new(
                http_client.clone(),
                fcm_auth,
                project_id.clone(),
            ))
        }
        None => {
            info!("FCM_PROJECT_ID not set, push dispatch disabled");
            Arc::new(DisabledPush)
        }
    };

    let ssv = Arc::new(SsvVerifier::new(http_client.clone(), ssv::ADMOB_KEYS_URL));

    let state = AppState {
        db,
        config: Arc::new(config),
        reconciler,
        push,
        ssv,
    };

    // Router
    let app = routes::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
