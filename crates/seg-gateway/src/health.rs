//! Liveness probe, independent of any session or loaded model.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthBody {
    status: &'static str,
    active_sessions: usize,
    available_modes: Vec<&'static str>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "healthy",
        active_sessions: state.active_sessions.load(Ordering::Relaxed),
        available_modes: (*state.available_modes).clone(),
    })
}
