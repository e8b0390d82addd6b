//! Wire envelope types: the JSON shapes exchanged with browser clients.

use serde::{Deserialize, Serialize};

/// Messages a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Frame {
        data: String,
        timestamp: i64,
    },
    ChangeMode {
        model_mode: String,
    },
    UpdateViz {
        settings: VizSettings,
    },
    GetStats,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VizSettings {
    pub visualization_mode: Option<String>,
    pub overlay_opacity: Option<f32>,
    pub class_filter: Option<Option<Vec<u16>>>,
}

/// Messages the gateway may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Connected {
        status: &'static str,
        available_models: Vec<&'static str>,
        class_labels: Vec<&'static str>,
        current_model: &'static str,
    },
    Segmentation {
        data: String,
        metadata: SegmentationMetadata,
    },
    ModeChanged {
        model_mode: &'static str,
        class_labels: Vec<&'static str>,
    },
    VizUpdated {
        settings: VizSettings,
    },
    Stats {
        fps: f32,
        avg_inference_ms: f32,
        frames_in_flight: usize,
        frames_dropped: u64,
    },
    Error {
        code: &'static str,
        message: String,
        recoverable: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentationMetadata {
    pub inference_time_ms: f32,
    pub fps: f32,
    pub model_mode: &'static str,
    pub detected_classes: Vec<String>,
}

impl OutboundMessage {
    /// Serializes for the wire. Serialization of these types cannot fail
    /// (no maps with non-string keys, no floats requiring custom handling),
    /// so callers are spared a `Result`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("outbound envelopes are always representable as JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_message_parses() {
        let raw = r#"{"type":"frame","data":"AAAA","timestamp":123}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::Frame { data, timestamp } => {
                assert_eq!(data, "AAAA");
                assert_eq!(timestamp, 123);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn change_mode_message_parses() {
        let raw = r#"{"type":"change_mode","model_mode":"accurate"}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, InboundMessage::ChangeMode { model_mode } if model_mode == "accurate"));
    }

    #[test]
    fn update_viz_with_null_class_filter_parses() {
        let raw = r#"{"type":"update_viz","settings":{"visualization_mode":"blend","overlay_opacity":0.5,"class_filter":null}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::UpdateViz { settings } => {
                assert_eq!(settings.visualization_mode.as_deref(), Some("blend"));
                assert_eq!(settings.class_filter, Some(None));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn update_viz_with_all_fields_omitted_parses_as_untouched() {
        let raw = r#"{"type":"update_viz","settings":{}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::UpdateViz { settings } => {
                assert!(settings.visualization_mode.is_none());
                assert!(settings.overlay_opacity.is_none());
                assert!(settings.class_filter.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn get_stats_has_no_payload() {
        let raw = r#"{"type":"get_stats"}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, InboundMessage::GetStats));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"teleport"}"#;
        assert!(serde_json::from_str::<InboundMessage>(raw).is_err());
    }

    #[test]
    fn error_envelope_serializes_with_expected_fields() {
        let msg = OutboundMessage::Error { code: "MODE_CHANGE_FAILED", message: "unknown mode".into(), recoverable: true };
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"MODE_CHANGE_FAILED\""));
        assert!(json.contains("\"recoverable\":true"));
    }

    #[test]
    fn stats_envelope_serializes() {
        let msg = OutboundMessage::Stats { fps: 12.5, avg_inference_ms: 40.0, frames_in_flight: 1, frames_dropped: 3 };
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"stats\""));
        assert!(json.contains("\"frames_dropped\":3"));
    }
}
