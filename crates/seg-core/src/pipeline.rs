//! Per-session admission control: bounds concurrent in-flight predicts and
//! throttles the accept rate, silently dropping frames that exceed either.

use std::time::{Duration, Instant};

/// Admits or drops incoming frames before they reach the inference engine.
/// Never queues: at most `max_in_flight` frames are ever outstanding, and a
/// drop is never reported to the client, only counted.
pub struct FramePipeline {
    max_in_flight: usize,
    min_interval: Duration,
    in_flight: usize,
    last_accept: Option<Instant>,
    dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Accept,
    DropBackpressure,
    DropTooSoon,
}

impl FramePipeline {
    pub fn new(max_in_flight: usize, min_interval: Duration) -> Self {
        Self { max_in_flight, min_interval, in_flight: 0, last_accept: None, dropped: 0 }
    }

    /// Call once per inbound frame, before any work is scheduled for it.
    /// Call `release` once that frame's predict completes, regardless of
    /// outcome, whenever this returned `Accept`.
    pub fn try_admit(&mut self, now: Instant) -> AdmitDecision {
        if self.in_flight >= self.max_in_flight {
            self.dropped += 1;
            return AdmitDecision::DropBackpressure;
        }
        if let Some(last) = self.last_accept {
            if now.duration_since(last) < self.min_interval {
                self.dropped += 1;
                return AdmitDecision::DropTooSoon;
            }
        }
        self.in_flight += 1;
        self.last_accept = Some(now);
        AdmitDecision::Accept
    }

    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
