//! Process-wide state shared by every connection handler.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use seg_core::config::GatewayConfig;
use seg_core::model_pool::ModelPool;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pool: Arc<ModelPool>,
    pub available_modes: Arc<Vec<&'static str>>,
    pub active_sessions: Arc<AtomicUsize>,
}
