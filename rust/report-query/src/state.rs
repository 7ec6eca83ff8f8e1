use crate::{auth::JwtKeys, config::AppConfig, service::QueryService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jwt: Arc<JwtKeys>,
    pub service: Arc<QueryService>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, service: Arc<QueryService>) -> Self {
        let jwt = Arc::new(JwtKeys::new(&config.jwt_secret));
        Self {
            config,
            jwt,
            service,
        }
    }
}
