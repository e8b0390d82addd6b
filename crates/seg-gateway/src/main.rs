//! Entry point: parses configuration, builds the model pool, and serves the
//! WebSocket/health HTTP API.

mod health;
mod state;
mod ws;

use std::process::ExitCode as StdExitCode;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use seg_core::config::{ExitCode, GatewayConfig};
use seg_core::inference::ModelMode;
use seg_core::model_pool::ModelPool;

use crate::state::AppState;

#[tokio::main]
async fn main() -> StdExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "seg_gateway=info,seg_core=info".into()))
        .init();

    let config = GatewayConfig::parse();
    run(config).await
}

async fn run(config: GatewayConfig) -> StdExitCode {
    let model_paths: Vec<(ModelMode, String)> = ModelMode::ALL
        .iter()
        .filter_map(|&mode| config.model_path(mode).map(|path| (mode, path.to_string())))
        .collect();

    if model_paths.is_empty() {
        error!("no SEG_MODEL_* artifact paths configured, refusing to start with an empty model pool");
        return to_std(ExitCode::ModelPoolInitFailure);
    }

    let available_modes: Vec<&'static str> = model_paths.iter().map(|(mode, _)| mode.wire_name()).collect();
    let loaders = seg_core::onnx::build_loaders(model_paths);
    let pool = Arc::new(ModelPool::new(loaders));

    if pool.get(config.default_mode).await.is_err() {
        error!(mode = ?config.default_mode, "failed to load the default model at startup");
        return to_std(ExitCode::ModelPoolInitFailure);
    }

    let bind_addr = config.bind_addr;
    let state = AppState {
        config: Arc::new(config),
        pool,
        available_modes: Arc::new(available_modes),
        active_sessions: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let builder = match axum::Server::try_bind(&bind_addr) {
        Ok(builder) => builder,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind listen socket");
            return to_std(ExitCode::ListenSocketFailure);
        }
    };
    info!(addr = %bind_addr, "seg-gateway listening");

    let serve = builder.serve(app.into_make_service());
    if let Err(e) = serve.with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "server exited with an error");
        return to_std(ExitCode::ListenSocketFailure);
    }

    to_std(ExitCode::Clean)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let session_id = next_session_id();
    ws.on_upgrade(move |socket| ws::handle_socket(socket, session_id, state))
}

/// A connection identifier unique enough for log correlation. The gateway
/// has no need for globally-unique session IDs beyond the life of one
/// process, so a counter avoids pulling in a UUID dependency the rest of
/// the stack has no other use for.
fn next_session_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess-{n:x}")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c, shutting down gracefully");
}

fn to_std(code: ExitCode) -> StdExitCode {
    StdExitCode::from(code as u8)
}
