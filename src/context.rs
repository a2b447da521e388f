use crate::auth::AuthPolicy;
use crate::chat::Behavior;
use crate::config::types::AppConfig;
use std::sync::Arc;
use std::time::Instant;

/// Shared application context handed to every session.
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub policy: Arc<AuthPolicy>,
    pub ssh_config: Arc<russh::server::Config>,
    pub behavior: Arc<dyn Behavior>,
    pub start_time: Instant,
}
