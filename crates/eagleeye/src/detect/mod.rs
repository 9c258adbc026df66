//! Object detection and tracking boundary.
//!
//! The model itself is external. A [`Detector`] is handed frames of the
//! designated source in arrival order and owns whatever tracking state it
//! needs to keep object ids stable across calls; the rest of the system never
//! looks inside it. [`DetectionStage`] wraps a detector with the class
//! allow-list and failure containment, and [`OffloadedStage`] runs a stage on
//! its own task.

pub mod remote;
pub mod stage;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::CodecError;
use crate::config::BackendConfig;
use crate::frame::Frame;

pub use remote::RemoteDetector;
pub use stage::DetectionStage;
pub use worker::{DetectionOutput, OffloadedStage};

/// Class ids tracked by default: person, bicycle, car, motorcycle, bus, truck.
pub const DEFAULT_CLASSES: [u32; 6] = [0, 1, 2, 3, 5, 7];

/// Display name for a class id; unknown ids are "Object".
pub fn class_name(class_id: u32) -> &'static str {
    match class_id {
        0 => "Person",
        1 => "Bicycle",
        2 => "Car",
        3 => "Motorcycle",
        5 => "Bus",
        7 => "Truck",
        _ => "Object",
    }
}

/// One tracked object in one frame.
///
/// On the wire a box is the array `[x1, y1, x2, y2, track_id, confidence, class_id]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Stable identity assigned by the tracker
    pub track_id: u64,
    /// 0..=1
    pub confidence: f32,
    pub class_id: u32,
}

type WireBox = (f32, f32, f32, f32, u64, f32, u32);

impl Serialize for DetectionBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.x1,
            self.y1,
            self.x2,
            self.y2,
            self.track_id,
            self.confidence,
            self.class_id,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DetectionBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (x1, y1, x2, y2, track_id, confidence, class_id) = WireBox::deserialize(deserializer)?;
        Ok(Self {
            x1,
            y1,
            x2,
            y2,
            track_id,
            confidence,
            class_id,
        })
    }
}

/// Errors from a detector call. Any of these costs one tick's detections,
/// nothing more.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("detector panicked: {0}")]
    Panicked(String),
}

/// An external detection + tracking capability.
///
/// Calls arrive strictly in frame order and never overlap. `classes` is the
/// allow-list the caller will keep; implementations may use it to skip work.
/// CPU-heavy implementations should move inference off the async runtime
/// (e.g. `tokio::task::spawn_blocking`).
#[async_trait]
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    async fn infer(&mut self, frame: &Frame, classes: &[u32]) -> Result<Vec<DetectionBox>, DetectError>;
}

/// Detector used when no model is attached: never reports anything.
#[derive(Debug, Default)]
pub struct NullDetector;

#[async_trait]
impl Detector for NullDetector {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn infer(&mut self, _frame: &Frame, _classes: &[u32]) -> Result<Vec<DetectionBox>, DetectError> {
        Ok(Vec::new())
    }
}

/// Build the detector selected in the configuration.
pub fn build_detector(config: &BackendConfig) -> Result<Box<dyn Detector>, DetectError> {
    match config {
        BackendConfig::None => Ok(Box::new(NullDetector)),
        BackendConfig::Remote {
            url,
            timeout_ms,
            min_confidence,
        } => Ok(Box::new(RemoteDetector::new(
            url,
            std::time::Duration::from_millis(*timeout_ms),
            *min_confidence,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_names() {
        assert_eq!(class_name(0), "Person");
        assert_eq!(class_name(2), "Car");
        assert_eq!(class_name(7), "Truck");
        assert_eq!(class_name(4), "Object");
    }

    #[test]
    fn test_box_wire_format() {
        let b = DetectionBox {
            x1: 1.0,
            y1: 2.0,
            x2: 3.5,
            y2: 4.0,
            track_id: 7,
            confidence: 0.9,
            class_id: 2,
        };
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[1.0,2.0,3.5,4.0,7,0.9,2]");

        let back: DetectionBox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn test_box_rejects_short_array() {
        assert!(serde_json::from_str::<DetectionBox>("[1,2,3,4,7,0.9]").is_err());
    }

    #[tokio::test]
    async fn test_null_detector_reports_nothing() {
        let frame = Frame::blank("rgb", 2, 2, 3);
        let mut detector = build_detector(&BackendConfig::None).unwrap();
        assert_eq!(detector.name(), "none");
        assert!(detector.infer(&frame, &DEFAULT_CLASSES).await.unwrap().is_empty());
    }
}
