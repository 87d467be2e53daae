use std::sync::Arc;

use crate::config::Config;
use crate::db::Db;
use crate::fcm::PushSender;
use crate::reconcile::Reconciler;
use crate::ssv::SsvVerifier;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub reconciler: Arc<Reconciler>,
    pub push: Arc<dyn PushSender>,
    pub ssv: Arc<SsvVerifier>,
}
