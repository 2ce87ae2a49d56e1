use serde::{Deserialize, Serialize};

use super::{EncodedImage, ProtocolError};

/// Workflow commands sent to the detection service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartCalibration,
    Capture { image: EncodedImage },
    StartDistance,
    StopAll,
}

/// Everything the client puts on the wire. Bare frames carry no `command`
/// key and are never acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Command(Command),
    Frame { image: EncodedImage },
}

impl ClientMessage {
    pub fn frame(image: EncodedImage) -> Self {
        ClientMessage::Frame { image }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Command(Command::StartCalibration) => "start_calibration",
            ClientMessage::Command(Command::Capture { .. }) => "capture",
            ClientMessage::Command(Command::StartDistance) => "start_distance",
            ClientMessage::Command(Command::StopAll) => "stop_all",
            ClientMessage::Frame { .. } => "frame",
        }
    }
}

impl From<Command> for ClientMessage {
    fn from(command: Command) -> Self {
        ClientMessage::Command(command)
    }
}

/// Structured acknowledgments a service may attach under `event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEvent {
    CalibrationComplete,
    #[serde(other)]
    Unknown,
}

/// One detected face. Only `distance` matters to the session; the box and
/// score are passed through for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Expected face box, in pixels, at the service's target distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceBox {
    pub width: i64,
    pub height: i64,
}

/// A result pushed by the service. Every field is optional and a missing
/// field means "no update", never "reset".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_image: Option<EncodedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focal_length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faces: Option<Vec<FaceDetection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_box: Option<ReferenceBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<ServiceEvent>,
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(ProtocolError::Decode)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        serde_json::from_value(value).map_err(ProtocolError::Decode)
    }

    pub fn primary_face(&self) -> Option<&FaceDetection> {
        self.faces.as_ref().and_then(|faces| faces.first())
    }

    /// Whether this message confirms a completed calibration. A typed
    /// `calibration_complete` event wins; otherwise the status text is
    /// matched against `marker`, case-insensitively. Explicit failures never
    /// confirm.
    pub fn confirms_calibration(&self, marker: &str) -> bool {
        if self.success == Some(false) || self.error.is_some() {
            return false;
        }
        if self.event == Some(ServiceEvent::CalibrationComplete) {
            return true;
        }
        let marker = marker.trim().to_lowercase();
        !marker.is_empty()
            && self
                .message
                .as_deref()
                .is_some_and(|text| text.to_lowercase().contains(&marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_serialize_to_wire_shape() {
        let start = ClientMessage::from(Command::StartCalibration).to_json().unwrap();
        assert_eq!(start, r#"{"command":"start_calibration"}"#);

        let stop = ClientMessage::from(Command::StopAll).to_json().unwrap();
        assert_eq!(stop, r#"{"command":"stop_all"}"#);

        let image = EncodedImage::from_data_url("data:image/jpeg;base64,AAAA");
        let capture: serde_json::Value = serde_json::from_str(
            &ClientMessage::from(Command::Capture { image }).to_json().unwrap(),
        )
        .unwrap();
        assert_eq!(
            capture,
            json!({"command": "capture", "image": "data:image/jpeg;base64,AAAA"})
        );
    }

    #[test]
    fn bare_frame_has_no_command_key() {
        let frame = ClientMessage::frame(EncodedImage::from_data_url("data:image/jpeg;base64,AAAA"));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"image": "data:image/jpeg;base64,AAAA"}));
        assert_eq!(frame.kind(), "frame");
    }

    #[test]
    fn client_messages_parse_back_into_the_right_variant() {
        let frame: ClientMessage = serde_json::from_str(r#"{"image":"x"}"#).unwrap();
        assert!(matches!(frame, ClientMessage::Frame { .. }));

        let capture: ClientMessage =
            serde_json::from_str(r#"{"command":"capture","image":"x"}"#).unwrap();
        assert!(matches!(capture, ClientMessage::Command(Command::Capture { .. })));
    }

    #[test]
    fn absent_fields_stay_none() {
        let msg = InboundMessage::parse(r#"{"message": "Measurement stopped"}"#).unwrap();
        assert_eq!(msg.message.as_deref(), Some("Measurement stopped"));
        assert!(msg.success.is_none());
        assert!(msg.focal_length.is_none());
        assert!(msg.faces.is_none());
        assert!(msg.processed_image.is_none());
    }

    #[test]
    fn full_measurement_reply_parses() {
        let raw = json!({
            "success": true,
            "faces": [{
                "x": 10, "y": 20, "width": 80, "height": 120,
                "confidence": 0.91, "distance": 1.2
            }],
            "focal_length": 450.2,
            "reference_box": {"width": 16, "height": 24},
            "processed_image": "data:image/jpeg;base64,AAAA"
        })
        .to_string();
        let msg = InboundMessage::parse(&raw).unwrap();
        assert_eq!(msg.faces.as_ref().map(Vec::len), Some(1));
        assert_eq!(msg.primary_face().and_then(|f| f.distance), Some(1.2));
        assert_eq!(msg.reference_box, Some(ReferenceBox { width: 16, height: 24 }));
    }

    #[test]
    fn null_reference_box_means_no_update() {
        let msg = InboundMessage::parse(r#"{"success": false, "reference_box": null}"#).unwrap();
        assert!(msg.reference_box.is_none());
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(matches!(InboundMessage::parse("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(InboundMessage::parse("not json"), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn calibration_confirmed_by_marker_or_event() {
        let by_text = InboundMessage::parse(
            r#"{"success": true, "message": "Calibration COMPLETE", "focal_length": 450.2}"#,
        )
        .unwrap();
        assert!(by_text.confirms_calibration("calibration complete"));

        let by_event = InboundMessage::parse(r#"{"event": "calibration_complete"}"#).unwrap();
        assert!(by_event.confirms_calibration("calibration complete"));

        let unknown_event = InboundMessage::parse(r#"{"event": "something_new"}"#).unwrap();
        assert_eq!(unknown_event.event, Some(ServiceEvent::Unknown));
        assert!(!unknown_event.confirms_calibration("calibration complete"));
    }

    #[test]
    fn failed_replies_never_confirm_calibration() {
        let failed = InboundMessage::parse(
            r#"{"success": false, "message": "Calibration complete? No face detected"}"#,
        )
        .unwrap();
        assert!(!failed.confirms_calibration("calibration complete"));

        let prompt = InboundMessage::parse(
            r#"{"message": "Please stand at one-arm distance and click Capture"}"#,
        )
        .unwrap();
        assert!(!prompt.confirms_calibration("calibration complete"));
    }
}
