//! Per-connection WebSocket handling: upgrade, dispatch loop, and the
//! plumbing that lets several frames predict concurrently while replies
//! still leave the socket in admission order.
//!
//! Three tasks share one connection:
//!
//! - the **main loop** (this function's body), which reads inbound
//!   messages, owns the `&mut Session`, admits/drops frames, and handles
//!   `change_mode`/`update_viz`/`get_stats` synchronously;
//! - a **writer task**, the sole owner of the socket's send half, so a
//!   slow or failed write never blocks or poisons anything else — sends
//!   that fail are logged and swallowed, never propagated;
//! - a **reply-pump task**, which matches replies back to the socket in the
//!   order their messages were admitted, regardless of which predict
//!   finishes first. Segmentation replies reach it via a ticket pushed
//!   before the frame's predict task is spawned; `change_mode`/`update_viz`/
//!   `get_stats` replies reach it via a ticket resolved immediately, since
//!   they're computed synchronously in the main loop but must not overtake
//!   a frame that was admitted first and is still predicting.
//!
//! A spawned per-frame task cannot hold `&mut Session` (the main loop needs
//! it free to keep admitting and dispatching), so it works off a
//! [`seg_core::session::FrameContext`] snapshot and reports completion back
//! to the main loop over `release_tx` so `FramePipeline`'s in-flight count
//! stays accurate without the task ever touching `Session` directly.

use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use seg_core::codec;
use seg_core::error::ErrorKind;
use seg_core::protocol::{InboundMessage, OutboundMessage};
use seg_core::session::{ReplyOrdering, Session, SessionPhase};

use crate::state::AppState;

/// Decrements `AppState::active_sessions` when the connection ends, however
/// it ends — early return, break, or panic unwinding through the handler.
struct ActiveSessionGuard(std::sync::Arc<std::sync::atomic::AtomicUsize>);

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

pub async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    state.active_sessions.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let _active_guard = ActiveSessionGuard(state.active_sessions.clone());

    let (sink, mut stream) = socket.split();

    let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Message>();
    let writer_handle = tokio::spawn(run_writer(sink, writer_rx));

    let (ticket_tx, ticket_rx) = mpsc::unbounded_channel::<oneshot::Receiver<OutboundMessage>>();
    let pump_handle = tokio::spawn(run_reply_pump(ticket_rx, writer_tx.clone()));

    let (release_tx, mut release_rx) = mpsc::unbounded_channel::<()>();

    let reply_cfg = seg_core::session::ReplyConfig {
        jpeg_quality: state.config.reply_quality,
        max_width: state.config.reply_max_width,
        max_height: state.config.reply_max_height,
    };
    let mut session = Session::new(
        session_id.clone(),
        state.pool.clone(),
        state.config.default_mode,
        state.config.warm_up_iterations,
        reply_cfg,
        state.config.max_in_flight,
        state.config.min_frame_interval(),
    );

    match session.initialize().await {
        Some(connected) => {
            let _ = writer_tx.send(Message::Text(connected.to_json()));
        }
        None => {
            info!(session = %session_id, "session failed to initialize, closing");
            drop(ticket_tx);
            let _ = pump_handle.await;
            writer_handle.abort();
            return;
        }
    }

    let inactivity_timeout = state.config.inactivity_timeout();

    loop {
        let idle_budget = inactivity_timeout.saturating_sub(session.idle_for(Instant::now()));
        tokio::select! {
            biased;

            _ = tokio::time::sleep(idle_budget) => {
                info!(session = %session_id, "closing idle session");
                break;
            }

            Some(()) = release_rx.recv() => {
                session.release_frame_slot();
            }

            next = stream.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => {
                        session.touch();
                        handle_inbound_text(&mut session, &text, &writer_tx, &ticket_tx, &release_tx).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        session.touch();
                        debug!(session = %session_id, "ignoring unexpected binary frame, protocol is JSON-only");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session = %session_id, "client closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong are handled transparently by axum's WebSocket.
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "websocket read error, closing");
                        break;
                    }
                }
            }
        }
    }

    session.phase = SessionPhase::Closing;
    drop(ticket_tx);
    let _ = pump_handle.await;
    session.phase = SessionPhase::Closed;
    writer_handle.abort();
}

async fn handle_inbound_text(
    session: &mut Session,
    text: &str,
    writer_tx: &mpsc::UnboundedSender<Message>,
    ticket_tx: &mpsc::UnboundedSender<oneshot::Receiver<OutboundMessage>>,
    release_tx: &mpsc::UnboundedSender<()>,
) {
    let parsed: Result<InboundMessage, _> = serde_json::from_str(text);
    let inbound = match parsed {
        Ok(msg) => msg,
        Err(e) => {
            debug!(session = %session.id, error = %e, "dropping message with unrecognized shape");
            let envelope = OutboundMessage::Error {
                code: ErrorKind::MalformedFrame.wire_code(),
                message: format!("could not parse inbound message: {e}"),
                recoverable: true,
            };
            let _ = writer_tx.send(Message::Text(envelope.to_json()));
            return;
        }
    };

    match inbound {
        InboundMessage::Frame { data, timestamp } => {
            handle_frame(session, data, timestamp, ticket_tx, release_tx).await;
        }
        InboundMessage::ChangeMode { model_mode } => {
            let reply = session.change_mode(&model_mode).await;
            send_ticketed(ticket_tx, reply);
        }
        InboundMessage::UpdateViz { settings } => {
            let reply = session.update_viz(settings);
            send_ticketed(ticket_tx, reply);
        }
        InboundMessage::GetStats => {
            let reply = session.get_stats();
            send_ticketed(ticket_tx, reply);
        }
    }
}

/// Queues an already-computed reply behind any frames already admitted,
/// instead of writing it straight to the socket: `change_mode`, `update_viz`,
/// and `get_stats` are handled synchronously in the main loop, but a
/// frame's `predict` may still be running in a spawned task, so skipping
/// the ticket queue would let a control-message reply overtake a
/// segmentation reply that was admitted first.
fn send_ticketed(ticket_tx: &mpsc::UnboundedSender<oneshot::Receiver<OutboundMessage>>, reply: OutboundMessage) {
    let (done_tx, done_rx) = oneshot::channel::<OutboundMessage>();
    if ticket_tx.send(done_rx).is_ok() {
        let _ = done_tx.send(reply);
    }
}

async fn handle_frame(
    session: &mut Session,
    data: String,
    timestamp: i64,
    ticket_tx: &mpsc::UnboundedSender<oneshot::Receiver<OutboundMessage>>,
    release_tx: &mpsc::UnboundedSender<()>,
) {
    let decision = session.try_admit_frame(Instant::now());
    if decision != seg_core::pipeline::AdmitDecision::Accept {
        // Dropped frames are never reported to the client, only counted.
        return;
    }

    let (done_tx, done_rx) = oneshot::channel::<OutboundMessage>();
    if ticket_tx.send(done_rx).is_err() {
        session.release_frame_slot();
        return;
    }

    let raw = codec::strip_data_uri_prefix(&data);
    let bytes = match base64::engine::general_purpose::STANDARD.decode(raw) {
        Ok(bytes) => bytes,
        Err(e) => {
            session.release_frame_slot();
            let envelope = OutboundMessage::Error {
                code: ErrorKind::MalformedFrame.wire_code(),
                message: format!("frame payload was not valid base64: {e}"),
                recoverable: true,
            };
            let _ = done_tx.send(envelope);
            return;
        }
    };

    let frame = match codec::decode(&bytes, timestamp) {
        Ok(frame) => frame,
        Err(e) => {
            session.release_frame_slot();
            let kind: ErrorKind = (&e).into();
            let envelope = OutboundMessage::Error { code: kind.wire_code(), message: e.to_string(), recoverable: kind.recoverable() };
            let _ = done_tx.send(envelope);
            return;
        }
    };

    let ctx = session.frame_context();
    let release_tx = release_tx.clone();
    tokio::spawn(async move {
        let reply = ctx.process_frame(frame).await;
        let _ = done_tx.send(reply);
        let _ = release_tx.send(());
    });
}

/// Owns the socket's send half exclusively. A failed send means the peer is
/// gone; log it and stop, rather than let a write error cascade back into
/// the dispatch loop or the reply pump.
async fn run_writer(mut sink: futures::stream::SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    use futures::SinkExt;
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "writer task stopping after send error");
            break;
        }
    }
}

/// Drains tickets in admission order and forwards each resolved reply to
/// the writer. See the module doc for why racing [`ReplyOrdering::next_reply`]
/// against the ticket channel here is sound.
async fn run_reply_pump(mut ticket_rx: mpsc::UnboundedReceiver<oneshot::Receiver<OutboundMessage>>, writer_tx: mpsc::UnboundedSender<Message>) {
    let mut ordering = ReplyOrdering::new();
    let mut tickets_open = true;
    loop {
        tokio::select! {
            incoming = ticket_rx.recv(), if tickets_open => {
                match incoming {
                    Some(rx) => ordering.push_ticket(rx),
                    None => {
                        tickets_open = false;
                        ordering.close();
                    }
                }
            }
            reply = ordering.next_reply() => {
                match reply {
                    Some(msg) => { let _ = writer_tx.send(Message::Text(msg.to_json())); }
                    None => break,
                }
            }
        }
    }
}
