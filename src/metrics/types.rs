use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::FaceDetection;

pub const CALCULATING_LABEL: &str = "Calculating...";

/// What the distance readout should show for the live sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "meters", rename_all = "camelCase")]
pub enum DistanceDisplay {
    /// Detection gap or unresolved distance; never shown as a number.
    Calculating,
    Meters(f64),
}

impl DistanceDisplay {
    /// Positive, finite distances are shown; anything else is provisional.
    pub fn from_reading(distance: Option<f64>) -> Self {
        match distance {
            Some(meters) if meters.is_finite() && meters > 0.0 => DistanceDisplay::Meters(meters),
            _ => DistanceDisplay::Calculating,
        }
    }
}

impl fmt::Display for DistanceDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceDisplay::Calculating => f.write_str(CALCULATING_LABEL),
            DistanceDisplay::Meters(meters) => write!(f, "{meters}m"),
        }
    }
}

/// The single live distance estimate. Replaced by every new result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementSample {
    pub distance: DistanceDisplay,
    pub face: FaceDetection,
    pub received_at: DateTime<Utc>,
}
