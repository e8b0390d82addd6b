//! Per-connection state machine: dispatches inbound wire messages, runs the
//! frame pipeline, and keeps segmentation replies in FIFO admission order
//! even while several predicts run concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::codec::{self, Frame};
use crate::colormap::ClassVocabulary;
use crate::error::ErrorKind;
use crate::inference::{InferenceEngine, ModelMode};
use crate::model_pool::ModelPool;
use crate::pipeline::{AdmitDecision, FramePipeline};
use crate::protocol::{InboundMessage, OutboundMessage, SegmentationMetadata, VizSettings};
use crate::renderer::{self, ClassFilter, VizMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Initializing,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplyConfig {
    pub jpeg_quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

/// Mutable display/session settings a client can change via `update_viz`
/// and `change_mode`.
#[derive(Clone)]
struct SessionSettings {
    viz_mode: VizMode,
    opacity: f32,
    class_filter: ClassFilter,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { viz_mode: VizMode::Filled, opacity: 0.6, class_filter: None }
    }
}

/// Per-connection engine: everything a session needs except the transport
/// (WebSocket framing, connection liveness) which the gateway binary owns.
pub struct Session {
    pub id: String,
    pub phase: SessionPhase,
    settings: SessionSettings,
    engine: InferenceEngine,
    pipeline: FramePipeline,
    reply: ReplyConfig,
    last_activity: Instant,
}

impl Session {
    pub fn new(id: String, pool: Arc<ModelPool>, default_mode: ModelMode, warm_up_iterations: usize, reply: ReplyConfig, max_in_flight: usize, min_interval: std::time::Duration) -> Self {
        Self {
            id,
            phase: SessionPhase::Connecting,
            settings: SessionSettings::default(),
            engine: InferenceEngine::new(pool, default_mode, warm_up_iterations),
            pipeline: FramePipeline::new(max_in_flight, min_interval),
            reply,
            last_activity: Instant::now(),
        }
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    /// Current overlay opacity, always in `[0, 1]` regardless of what was
    /// last requested via `update_viz`.
    pub fn viz_opacity(&self) -> f32 {
        self.settings.opacity
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.last_activity)
    }

    /// `INITIALIZING` entry point: sets the default mode, warms it up, and
    /// builds the `connected` envelope. A failure here drops the session to
    /// `CLOSED` without any client-visible error, per the protocol's init
    /// failure edge.
    pub async fn initialize(&mut self) -> Option<OutboundMessage> {
        self.phase = SessionPhase::Initializing;
        let mode = self.engine.mode();
        if let Err(e) = self.engine.set_mode(mode).await {
            warn!(session = %self.id, error = %e, "initialization failed, closing silently");
            self.phase = SessionPhase::Closed;
            return None;
        }
        if let Err(e) = self.engine.warm_up(false).await {
            warn!(session = %self.id, error = %e, "warm-up failed, closing silently");
            self.phase = SessionPhase::Closed;
            return None;
        }
        self.phase = SessionPhase::Ready;
        info!(session = %self.id, ?mode, "session ready");
        let info = mode.info();
        Some(OutboundMessage::Connected {
            status: "ready",
            available_models: ModelMode::ALL.iter().map(|m| m.wire_name()).collect(),
            class_labels: info.vocabulary.labels().to_vec(),
            current_model: mode.wire_name(),
        })
    }

    /// Admission check for an inbound `frame`. The caller is responsible
    /// for calling `release_frame_slot` once the spawned predict completes.
    pub fn try_admit_frame(&mut self, now: Instant) -> AdmitDecision {
        self.pipeline.try_admit(now)
    }

    pub fn release_frame_slot(&mut self) {
        self.pipeline.release();
    }

    /// Snapshots everything a frame's processing needs into a `Clone`able,
    /// `'static` value so it can be moved into a spawned task and run
    /// concurrently with sibling in-flight frames, while `&mut self` stays
    /// free for the caller's event loop to keep admitting and dispatching
    /// control messages. Viz settings are captured at admission time: a
    /// frame has no causal link to a `change_mode`/`update_viz` that raced
    /// it, so reading them once up front rather than at completion is a
    /// legitimate interleaving, not a bug.
    pub fn frame_context(&self) -> FrameContext {
        FrameContext { id: self.id.clone(), engine: self.engine.clone(), reply: self.reply, settings: self.settings.clone() }
    }

    /// `change_mode`: validates the requested mode, switches and re-warms
    /// the engine. Switching to the already-active mode is an idempotent
    /// no-op that still confirms via `mode_changed`.
    pub async fn change_mode(&mut self, requested: &str) -> OutboundMessage {
        let mode = match ModelMode::from_wire_name(requested) {
            Some(m) => m,
            None => return error_envelope(ErrorKind::ModeChangeFailed, format!("unknown model mode '{requested}'")),
        };
        if let Err(e) = self.engine.set_mode(mode).await {
            return error_envelope(ErrorKind::ModeChangeFailed, e.to_string());
        }
        if let Err(e) = self.engine.warm_up(false).await {
            return error_envelope(ErrorKind::ModeChangeFailed, e.to_string());
        }
        debug!(session = %self.id, ?mode, "mode changed");
        OutboundMessage::ModeChanged { model_mode: mode.wire_name(), class_labels: mode.info().vocabulary.labels().to_vec() }
    }

    /// `update_viz`: applies any subset of `{viz_mode, opacity, class_filter}`
    /// present in `settings`. Applying the same settings twice is a no-op
    /// the second time (idempotent).
    pub fn update_viz(&mut self, settings: VizSettings) -> OutboundMessage {
        if let Some(raw) = &settings.visualization_mode {
            match parse_viz_mode(raw) {
                Some(mode) => self.settings.viz_mode = mode,
                None => return error_envelope(ErrorKind::VizUpdateFailed, format!("unknown visualization mode '{raw}'")),
            }
        }
        if let Some(opacity) = settings.overlay_opacity {
            self.settings.opacity = opacity.clamp(0.0, 1.0);
        }
        if let Some(filter) = settings.class_filter.clone() {
            self.settings.class_filter = filter.map(|classes| {
                let num_classes = self.engine.mode().info().vocabulary.num_classes();
                let mut mask = vec![false; num_classes];
                for c in classes {
                    if let Some(slot) = mask.get_mut(c as usize) {
                        *slot = true;
                    }
                }
                mask
            });
        }
        OutboundMessage::VizUpdated { settings }
    }

    pub fn get_stats(&self) -> OutboundMessage {
        let stats = self.engine.stats();
        OutboundMessage::Stats {
            fps: stats.avg_fps(),
            avg_inference_ms: stats.avg_latency_ms(),
            frames_in_flight: self.pipeline.in_flight(),
            frames_dropped: self.pipeline.dropped(),
        }
    }
}

/// A `'static`, cheaply `Clone`-able snapshot of one session's frame-path
/// dependencies, built by [`Session::frame_context`] and moved into a
/// spawned task so a frame's predict/render/encode can run without holding
/// a borrow of the owning `Session`.
#[derive(Clone)]
pub struct FrameContext {
    id: String,
    engine: InferenceEngine,
    reply: ReplyConfig,
    settings: SessionSettings,
}

impl FrameContext {
    /// Runs the full frame path: predict, render, encode.
    pub async fn process_frame(&self, frame: Frame) -> OutboundMessage {
        let vocab = self.engine.mode().info().vocabulary;
        match self.engine.predict(&frame).await {
            Ok((class_map, meta)) => self.render_and_encode(&frame, &class_map, vocab, meta.latency_ms, meta.mode),
            Err(e) => {
                let kind: ErrorKind = (&e).into();
                warn!(session = %self.id, error = %e, "predict failed");
                error_envelope(kind, e.to_string())
            }
        }
    }

    fn render_and_encode(
        &self,
        frame: &Frame,
        class_map: &codec::ClassMap,
        vocab: ClassVocabulary,
        latency_ms: f32,
        mode: ModelMode,
    ) -> OutboundMessage {
        let rendered = match renderer::render(
            &frame.image,
            class_map,
            vocab,
            self.settings.viz_mode,
            self.settings.opacity,
            &self.settings.class_filter,
        ) {
            Ok(img) => img,
            Err(e) => return error_envelope(ErrorKind::InferenceFailed, e.to_string()),
        };

        let (tw, th) = clamp_to_max(rendered.width(), rendered.height(), self.reply.max_width, self.reply.max_height);
        let resized = if (tw, th) == rendered.dimensions() {
            rendered
        } else {
            codec::resize_for_model(&rendered, tw, th)
        };

        let encoded = match codec::encode(&resized, self.reply.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(e) => return error_envelope(ErrorKind::EncodeFailed, e.to_string()),
        };

        let fps = self.engine.stats().avg_fps();
        let detected_classes = detected_class_labels(class_map, vocab);
        OutboundMessage::Segmentation {
            data: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, encoded),
            metadata: SegmentationMetadata {
                inference_time_ms: latency_ms,
                fps,
                model_mode: mode.wire_name(),
                detected_classes,
            },
        }
    }
}

fn parse_viz_mode(raw: &str) -> Option<VizMode> {
    match raw {
        "filled" => Some(VizMode::Filled),
        "contour" => Some(VizMode::Contour),
        "side-by-side" => Some(VizMode::SideBySide),
        "blend" => Some(VizMode::Blend),
        _ => None,
    }
}

fn clamp_to_max(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    (((w as f64 * scale).round() as u32).max(1), ((h as f64 * scale).round() as u32).max(1))
}

fn detected_class_labels(class_map: &codec::ClassMap, vocab: ClassVocabulary) -> Vec<String> {
    let mut seen = vec![false; vocab.num_classes()];
    for &class in class_map.iter() {
        if let Some(slot) = seen.get_mut(class as usize) {
            *slot = true;
        }
    }
    let labels = vocab.labels();
    (1..seen.len()).filter(|&c| seen[c]).filter_map(|c| labels.get(c)).map(|s| s.to_string()).collect()
}

fn error_envelope(kind: ErrorKind, message: String) -> OutboundMessage {
    OutboundMessage::Error { code: kind.wire_code(), message, recoverable: kind.recoverable() }
}

/// Keeps segmentation replies in strict FIFO admission order while their
/// predicts run concurrently: each admitted frame gets a ticket
/// (`oneshot::Receiver`), pushed in admission order; `next_reply` always
/// awaits the oldest ticket first, so a fast frame 2 never overtakes a slow
/// frame 1 even though both may finish out of order.
///
/// Safe to race inside a `tokio::select!` alongside the channel that feeds
/// new tickets in: the front ticket is only popped once its reply has
/// actually arrived, so a cancelled poll never discards anything, and a
/// `Notify` permit issued by `push_ticket` while nobody is awaiting
/// `notified()` is stored on the `Notify` itself and still observed by the
/// next call, not lost when the previous `next_reply` future is dropped.
pub struct ReplyOrdering {
    tickets: VecDeque<oneshot::Receiver<OutboundMessage>>,
    notify: std::sync::Arc<tokio::sync::Notify>,
    closed: bool,
}

impl Default for ReplyOrdering {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyOrdering {
    pub fn new() -> Self {
        Self { tickets: VecDeque::new(), notify: std::sync::Arc::new(tokio::sync::Notify::new()), closed: false }
    }

    pub fn issue_ticket(&mut self) -> oneshot::Sender<OutboundMessage> {
        let (tx, rx) = oneshot::channel();
        self.push_ticket(rx);
        tx
    }

    /// Registers a ticket created elsewhere (e.g. by a caller in a
    /// different task than the one driving `next_reply`) in admission
    /// order.
    pub fn push_ticket(&mut self, ticket: oneshot::Receiver<OutboundMessage>) {
        self.tickets.push_back(ticket);
        self.notify.notify_one();
    }

    /// Signals that no further tickets will be issued, waking a blocked
    /// `next_reply` so the pump loop can drain what remains and exit.
    pub fn close(&mut self) {
        self.closed = true;
        self.notify.notify_one();
    }

    /// Awaits the oldest outstanding ticket and returns its reply, blocking
    /// until one is issued if the queue is momentarily empty. Returns
    /// `None` once `close` has been called and the queue has drained. If
    /// the task that held a sender was dropped without sending (panic,
    /// abort) this still resolves to a synthesized error, never hangs.
    pub async fn next_reply(&mut self) -> Option<OutboundMessage> {
        loop {
            if let Some(rx) = self.tickets.front_mut() {
                let result = rx.await;
                self.tickets.pop_front();
                return Some(match result {
                    Ok(msg) => msg,
                    Err(_) => error_envelope(ErrorKind::InferenceFailed, "predict task terminated unexpectedly".into()),
                });
            }
            if self.closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_to_max_leaves_small_images_untouched() {
        assert_eq!(clamp_to_max(100, 50, 960, 540), (100, 50));
    }

    #[test]
    fn clamp_to_max_downscales_preserving_aspect_ratio() {
        let (w, h) = clamp_to_max(1920, 1080, 960, 540);
        assert_eq!((w, h), (960, 540));
    }

    #[test]
    fn clamp_to_max_is_limited_by_the_tighter_dimension() {
        let (w, h) = clamp_to_max(1000, 2000, 960, 540);
        assert!(w <= 960 && h <= 540);
        let ratio = w as f64 / h as f64;
        assert!((ratio - 0.5).abs() < 0.01);
    }

    #[test]
    fn parse_viz_mode_accepts_wire_names_and_rejects_unknown() {
        assert_eq!(parse_viz_mode("side-by-side"), Some(VizMode::SideBySide));
        assert_eq!(parse_viz_mode("nonexistent"), None);
    }

    #[test]
    fn detected_class_labels_excludes_background() {
        let mut cm = codec::ClassMap::zeros((2, 2));
        cm[(0, 0)] = 1;
        let labels = detected_class_labels(&cm, ClassVocabulary::Coco21);
        assert_eq!(labels, vec!["aeroplane".to_string()]);
    }

    #[tokio::test]
    async fn reply_ordering_preserves_admission_order_despite_out_of_order_completion() {
        let mut ordering = ReplyOrdering::new();
        let tx1 = ordering.issue_ticket();
        let tx2 = ordering.issue_ticket();

        // frame 2 "finishes" first, frame 1 finishes later.
        tx2.send(OutboundMessage::Stats { fps: 2.0, avg_inference_ms: 0.0, frames_in_flight: 0, frames_dropped: 0 }).unwrap();
        tx1.send(OutboundMessage::Stats { fps: 1.0, avg_inference_ms: 0.0, frames_in_flight: 0, frames_dropped: 0 }).unwrap();

        let first = ordering.next_reply().await.unwrap();
        let second = ordering.next_reply().await.unwrap();
        match (first, second) {
            (OutboundMessage::Stats { fps: f1, .. }, OutboundMessage::Stats { fps: f2, .. }) => {
                assert_eq!(f1, 1.0);
                assert_eq!(f2, 2.0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn reply_ordering_synthesizes_an_error_if_a_ticket_is_dropped_without_sending() {
        let mut ordering = ReplyOrdering::new();
        let tx = ordering.issue_ticket();
        drop(tx);
        let reply = ordering.next_reply().await.unwrap();
        assert!(matches!(reply, OutboundMessage::Error { .. }));
    }

    #[tokio::test]
    async fn reply_ordering_is_empty_when_drained() {
        let mut ordering = ReplyOrdering::new();
        assert!(ordering.is_empty());
        let tx = ordering.issue_ticket();
        tx.send(OutboundMessage::Stats { fps: 0.0, avg_inference_ms: 0.0, frames_in_flight: 0, frames_dropped: 0 }).unwrap();
        ordering.next_reply().await;
        assert!(ordering.is_empty());
    }
}
