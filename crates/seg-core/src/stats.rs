//! Exponentially-weighted rolling statistics for per-session inference stats.

/// Smoothing factor for all rolling averages. Chosen over a fixed window so
/// a session's stats have no buffer to size and converge smoothly regardless
/// of frame rate.
pub const EWMA_ALPHA: f32 = 0.1;

/// Tracks a rolling average and a running count, the numbers reported back
/// to a client on `get_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingStats {
    avg_latency_ms: Option<f32>,
    avg_fps: Option<f32>,
    frames_processed: u64,
    last_frame_at_ms: Option<i64>,
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully processed frame's wall-clock latency and the
    /// client timestamp it carried (used to derive instantaneous fps).
    pub fn record_frame(&mut self, latency_ms: f32, client_timestamp_ms: i64) {
        self.frames_processed += 1;
        self.avg_latency_ms = Some(ewma(self.avg_latency_ms, latency_ms));

        if let Some(prev) = self.last_frame_at_ms {
            let delta_ms = (client_timestamp_ms - prev).max(1) as f32;
            let instant_fps = 1000.0 / delta_ms;
            self.avg_fps = Some(ewma(self.avg_fps, instant_fps));
        }
        self.last_frame_at_ms = Some(client_timestamp_ms);
    }

    pub fn avg_latency_ms(&self) -> f32 {
        self.avg_latency_ms.unwrap_or(0.0)
    }

    pub fn avg_fps(&self) -> f32 {
        self.avg_fps.unwrap_or(0.0)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}

fn ewma(prev: Option<f32>, sample: f32) -> f32 {
    match prev {
        None => sample,
        Some(p) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * p,
    }
}
