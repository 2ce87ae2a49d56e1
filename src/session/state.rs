use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    metrics::{DistanceDisplay, MeasurementSample, MetricsAggregator},
    protocol::{ClientMessage, Command, EncodedImage, FaceDetection, InboundMessage, ReferenceBox},
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Idle,
    Calibrating,
    Calibrated,
    Measuring,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {action} while {phase:?}")]
    InvalidPhase { action: &'static str, phase: Phase },
    #[error("not connected to the detection service")]
    ChannelNotOpen,
    #[error("no camera snapshot available")]
    SnapshotUnavailable,
    #[error("camera snapshot is unusable: {0}")]
    InvalidSnapshot(String),
    #[error("session has shut down")]
    ShutDown,
}

const RESULTS_RESUMED: &str = "Receiving results again";

/// Work a transition asks the controller to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ClientMessage),
    StartPump,
    StopPump,
}

/// Read-only view of the session handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub phase: Phase,
    pub connection_state: ConnectionState,
    pub focal_length: f64,
    pub distance: Option<DistanceDisplay>,
    pub primary_face: Option<FaceDetection>,
    pub reference_box: Option<ReferenceBox>,
    pub processed_image: Option<EncodedImage>,
    pub status_message: String,
    pub status_is_error: bool,
    pub fps: u32,
    pub camera_visible: bool,
    pub pump_active: bool,
    pub measurement_stalled: bool,
    pub last_result_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// `"1.2m"`, `"Calculating..."`, or empty when there is no live sample.
    pub fn current_distance_display(&self) -> String {
        self.distance
            .map(|distance| distance.to_string())
            .unwrap_or_default()
    }
}

/// Workflow phase plus everything derived from service results.
///
/// Transitions are pure: they update the state and return the effects the
/// caller must perform, in order.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub connection_state: ConnectionState,
    pub focal_length: f64,
    pub status_message: String,
    pub status_is_error: bool,
    pub sample: Option<MeasurementSample>,
    pub processed_image: Option<EncodedImage>,
    pub reference_box: Option<ReferenceBox>,
    pub camera_visible: bool,
    pub measurement_stalled: bool,
    pub last_result_at: Option<DateTime<Utc>>,
    calibration_marker: String,
}

impl SessionState {
    pub fn new(calibration_marker: impl Into<String>) -> Self {
        Self {
            phase: Phase::Idle,
            connection_state: ConnectionState::Disconnected,
            focal_length: 0.0,
            status_message: String::new(),
            status_is_error: false,
            sample: None,
            processed_image: None,
            reference_box: None,
            camera_visible: false,
            measurement_stalled: false,
            last_result_at: None,
            calibration_marker: calibration_marker.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    fn require_phase(&self, expected: Phase, action: &'static str) -> Result<(), SessionError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidPhase {
                action,
                phase: self.phase,
            })
        }
    }

    fn require_connected(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::ChannelNotOpen)
        }
    }

    fn set_status(&mut self, text: impl Into<String>, is_error: bool) {
        self.status_message = text.into();
        self.status_is_error = is_error;
    }

    fn clear_measurement(&mut self) {
        self.sample = None;
        self.processed_image = None;
        self.reference_box = None;
        self.measurement_stalled = false;
    }

    pub fn request_calibration(&mut self) -> Result<Vec<Effect>, SessionError> {
        self.require_phase(Phase::Idle, "start calibration")?;
        self.require_connected()?;

        self.phase = Phase::Calibrating;
        self.camera_visible = true;
        Ok(vec![Effect::Send(Command::StartCalibration.into())])
    }

    /// The phase does not move here; it waits for the service to confirm.
    pub fn request_capture(
        &mut self,
        snapshot: Option<EncodedImage>,
    ) -> Result<Vec<Effect>, SessionError> {
        self.require_phase(Phase::Calibrating, "capture")?;
        let image = snapshot.ok_or(SessionError::SnapshotUnavailable)?;
        // Calibration runs on this one image, so it must at least decode.
        image
            .decode_bytes()
            .map_err(|err| SessionError::InvalidSnapshot(err.to_string()))?;
        Ok(vec![Effect::Send(Command::Capture { image }.into())])
    }

    pub fn request_start_measuring(&mut self) -> Result<Vec<Effect>, SessionError> {
        self.require_phase(Phase::Calibrated, "start measuring")?;
        self.require_connected()?;

        self.phase = Phase::Measuring;
        self.clear_measurement();
        Ok(vec![
            Effect::Send(Command::StartDistance.into()),
            Effect::StartPump,
        ])
    }

    /// Always clears the live sample and annotated image, whether or not a
    /// result ever arrived.
    pub fn request_stop_measuring(&mut self) -> Result<Vec<Effect>, SessionError> {
        self.require_phase(Phase::Measuring, "stop measuring")?;

        self.phase = Phase::Calibrated;
        self.clear_measurement();
        Ok(vec![Effect::StopPump, Effect::Send(Command::StopAll.into())])
    }

    /// On a re-open the service has lost its mode, so the command for the
    /// current phase is issued again.
    pub fn on_channel_opened(&mut self) -> Vec<Effect> {
        self.connection_state = ConnectionState::Connected;
        if self.status_is_error {
            self.set_status("Connected to detection service", false);
        }

        match self.phase {
            Phase::Calibrating => vec![Effect::Send(Command::StartCalibration.into())],
            Phase::Measuring => {
                self.measurement_stalled = false;
                vec![
                    Effect::Send(Command::StartDistance.into()),
                    Effect::StartPump,
                ]
            }
            Phase::Idle | Phase::Calibrated => Vec::new(),
        }
    }

    /// `reason` is `Some` for transport errors and `None` for a clean close.
    pub fn on_channel_lost(&mut self, reason: Option<&str>) -> Vec<Effect> {
        match reason {
            Some(reason) => {
                self.connection_state = ConnectionState::Errored;
                self.set_status(format!("Connection error: {reason}"), true);
            }
            None => {
                self.connection_state = ConnectionState::Disconnected;
                self.set_status("Disconnected from detection service", true);
            }
        }

        if self.phase == Phase::Measuring {
            self.measurement_stalled = false;
            vec![Effect::StopPump]
        } else {
            Vec::new()
        }
    }

    /// Apply one service message. Fields the message leaves out keep their
    /// current values. Status text updates in every phase; images and
    /// samples only while a capture or measurement is in progress, so late
    /// results for frames sent before a stop cannot bring them back.
    pub fn on_message(&mut self, message: &InboundMessage, metrics: &MetricsAggregator) {
        self.last_result_at = Some(Utc::now());
        let was_stalled = std::mem::replace(&mut self.measurement_stalled, false);

        if let Some(error) = &message.error {
            self.set_status(error.clone(), true);
        } else if let Some(text) = &message.message {
            self.set_status(text.clone(), false);
        } else if was_stalled {
            self.set_status(RESULTS_RESUMED, false);
        }

        if let Some(focal_length) = message.focal_length {
            if focal_length.is_finite() && focal_length >= 0.0 {
                self.focal_length = focal_length;
            }
        }

        match self.phase {
            Phase::Calibrating => {
                if let Some(image) = &message.processed_image {
                    self.processed_image = Some(image.clone());
                }
                if message.confirms_calibration(&self.calibration_marker) {
                    self.phase = Phase::Calibrated;
                    self.set_status(
                        format!("Calibration complete. Focal length: {:.2}", self.focal_length),
                        false,
                    );
                }
            }
            Phase::Measuring => {
                if let Some(image) = &message.processed_image {
                    self.processed_image = Some(image.clone());
                }
                if let Some(reference_box) = message.reference_box {
                    self.reference_box = Some(reference_box);
                }
                if let Some(sample) = metrics.interpret(message) {
                    self.sample = Some(sample);
                }
            }
            Phase::Idle | Phase::Calibrated => {}
        }
    }

    /// Returns `true` when the session was newly marked as stalled.
    pub fn on_watchdog_expired(&mut self) -> bool {
        if self.phase != Phase::Measuring || self.measurement_stalled {
            return false;
        }
        self.measurement_stalled = true;
        self.set_status("No response from detection service", true);
        true
    }

    pub fn snapshot(&self, session_id: Uuid, fps: u32, pump_active: bool) -> SessionSnapshot {
        SessionSnapshot {
            session_id,
            phase: self.phase,
            connection_state: self.connection_state,
            focal_length: self.focal_length,
            distance: self.sample.as_ref().map(|sample| sample.distance),
            primary_face: self.sample.as_ref().map(|sample| sample.face.clone()),
            reference_box: self.reference_box,
            processed_image: self.processed_image.clone(),
            status_message: self.status_message.clone(),
            status_is_error: self.status_is_error,
            fps,
            camera_visible: self.camera_visible,
            pump_active,
            measurement_stalled: self.measurement_stalled,
            last_result_at: self.last_result_at,
        }
    }
}
