//! Process-wide configuration, overridable via CLI flags and environment
//! variables at startup. Nothing here is per-session.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::inference::ModelMode;

/// Segmentation gateway configuration.
///
/// Model artifact paths are environment-only (`SEG_MODEL_FAST`, etc.)
/// since they name files on disk produced by a separate download step,
/// not something a CLI user tunes per run.
#[derive(Debug, Clone, Parser)]
#[command(name = "seg-gateway", about = "Real-time semantic-segmentation WebSocket gateway")]
pub struct GatewayConfig {
    /// Address the server binds its WebSocket/health listener to.
    #[arg(long, env = "SEG_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// Default model mode assigned to a new session.
    #[arg(long, env = "SEG_DEFAULT_MODE", default_value = "balanced", value_parser = parse_mode)]
    pub default_mode: ModelMode,

    /// JPEG quality (0-100) used when encoding segmentation replies.
    #[arg(long, env = "SEG_REPLY_QUALITY", default_value_t = 60)]
    pub reply_quality: u8,

    /// Expected JPEG quality of inbound client frames. Informational only
    /// (surfaced in logs/diagnostics) — decoding never validates against
    /// it, since a client is free to send whatever quality it wants.
    #[arg(long, env = "SEG_INBOUND_QUALITY_HINT", default_value_t = 80)]
    pub inbound_quality_hint: u8,

    /// Reply images are downscaled to fit within this many pixels per side.
    #[arg(long, env = "SEG_REPLY_MAX_WIDTH", default_value_t = 960)]
    pub reply_max_width: u32,

    #[arg(long, env = "SEG_REPLY_MAX_HEIGHT", default_value_t = 540)]
    pub reply_max_height: u32,

    /// Maximum frames in flight per session before new frames are dropped.
    #[arg(long, env = "SEG_MAX_IN_FLIGHT", default_value_t = 2)]
    pub max_in_flight: usize,

    /// Minimum milliseconds between accepted frames per session.
    #[arg(long, env = "SEG_MIN_FRAME_INTERVAL_MS", default_value_t = 33)]
    pub min_frame_interval_ms: u64,

    /// Synthetic forward passes run the first time a mode is warmed up.
    #[arg(long, env = "SEG_WARM_UP_ITERATIONS", default_value_t = 3)]
    pub warm_up_iterations: usize,

    /// Seconds of inactivity tolerated after a session reaches READY.
    #[arg(long, env = "SEG_INACTIVITY_TIMEOUT_SECS", default_value_t = 10)]
    pub inactivity_timeout_secs: u64,

    /// Path to the `fast` mode's ONNX artifact.
    #[arg(long, env = "SEG_MODEL_FAST")]
    pub model_path_fast: Option<String>,

    #[arg(long, env = "SEG_MODEL_BALANCED")]
    pub model_path_balanced: Option<String>,

    #[arg(long, env = "SEG_MODEL_ACCURATE")]
    pub model_path_accurate: Option<String>,

    #[arg(long, env = "SEG_MODEL_SOTA")]
    pub model_path_sota: Option<String>,
}

fn parse_mode(raw: &str) -> Result<ModelMode, String> {
    ModelMode::from_wire_name(raw).ok_or_else(|| format!("unknown model mode '{raw}'"))
}

impl GatewayConfig {
    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_millis(self.min_frame_interval_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn model_path(&self, mode: ModelMode) -> Option<&str> {
        match mode {
            ModelMode::Fast => self.model_path_fast.as_deref(),
            ModelMode::Balanced => self.model_path_balanced.as_deref(),
            ModelMode::Accurate => self.model_path_accurate.as_deref(),
            ModelMode::Sota => self.model_path_sota.as_deref(),
        }
    }
}

/// Process exit codes, per the startup failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Clean = 0,
    ListenSocketFailure = 1,
    ModelPoolInitFailure = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_match_the_documented_spec() {
        let cfg = GatewayConfig::parse_from(["seg-gateway"]);
        assert_eq!(cfg.default_mode, ModelMode::Balanced);
        assert_eq!(cfg.reply_quality, 60);
        assert_eq!((cfg.reply_max_width, cfg.reply_max_height), (960, 540));
        assert_eq!(cfg.max_in_flight, 2);
        assert_eq!(cfg.min_frame_interval_ms, 33);
        assert_eq!(cfg.warm_up_iterations, 3);
        assert_eq!(cfg.inactivity_timeout_secs, 10);
    }

    #[test]
    fn unknown_mode_flag_is_rejected() {
        let result = GatewayConfig::try_parse_from(["seg-gateway", "--default-mode", "turbo"]);
        assert!(result.is_err());
    }

    #[test]
    fn model_path_looks_up_the_mode_specific_field() {
        let cfg = GatewayConfig::parse_from(["seg-gateway", "--model-path-fast", "/models/fast.onnx"]);
        assert_eq!(cfg.model_path(ModelMode::Fast), Some("/models/fast.onnx"));
        assert_eq!(cfg.model_path(ModelMode::Sota), None);
    }
}
