use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use super::{DetectError, DetectionBox, Detector};
use crate::frame::Frame;

/// A detector plus the class allow-list the hub retains.
///
/// Boxes of classes outside the list are dropped here even when the detector
/// ignores the hint, confidences are clamped into 0..=1, and a panicking
/// detector is reported as an error instead of taking the caller down.
pub struct DetectionStage {
    detector: Box<dyn Detector>,
    classes: Vec<u32>,
}

impl DetectionStage {
    pub fn new(detector: Box<dyn Detector>, classes: Vec<u32>) -> Self {
        Self { detector, classes }
    }

    pub fn backend(&self) -> &'static str {
        self.detector.name()
    }

    pub async fn infer(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, DetectError> {
        let call = AssertUnwindSafe(self.detector.infer(frame, &self.classes));
        let boxes = match call.catch_unwind().await {
            Ok(result) => result?,
            Err(panic) => return Err(DetectError::Panicked(panic_message(panic.as_ref()))),
        };

        Ok(boxes
            .into_iter()
            .filter(|b| self.classes.contains(&b.class_id))
            .map(|b| DetectionBox {
                confidence: b.confidence.clamp(0.0, 1.0),
                ..b
            })
            .collect())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DEFAULT_CLASSES;
    use async_trait::async_trait;

    struct Fixed(Vec<DetectionBox>);

    #[async_trait]
    impl Detector for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn infer(&mut self, _frame: &Frame, _classes: &[u32]) -> Result<Vec<DetectionBox>, DetectError> {
            Ok(self.0.clone())
        }
    }

    struct Panics;

    #[async_trait]
    impl Detector for Panics {
        fn name(&self) -> &'static str {
            "panics"
        }

        async fn infer(&mut self, _frame: &Frame, _classes: &[u32]) -> Result<Vec<DetectionBox>, DetectError> {
            panic!("model exploded");
        }
    }

    fn bx(track_id: u64, confidence: f32, class_id: u32) -> DetectionBox {
        DetectionBox {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
            track_id,
            confidence,
            class_id,
        }
    }

    #[tokio::test]
    async fn test_filters_classes_outside_allow_list() {
        let mut stage = DetectionStage::new(
            Box::new(Fixed(vec![bx(1, 0.8, 2), bx(2, 0.7, 16), bx(3, 1.4, 0)])),
            DEFAULT_CLASSES.to_vec(),
        );
        let frame = Frame::blank("rgb", 2, 2, 3);
        let boxes = stage.infer(&frame).await.unwrap();

        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].track_id, 1);
        assert_eq!(boxes[1].track_id, 3);
        assert_eq!(boxes[1].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let mut stage = DetectionStage::new(Box::new(Panics), DEFAULT_CLASSES.to_vec());
        let frame = Frame::blank("rgb", 2, 2, 3);
        match stage.infer(&frame).await {
            Err(DetectError::Panicked(msg)) => assert!(msg.contains("model exploded")),
            other => panic!("expected panic error, got {:?}", other),
        }
        assert_eq!(stage.backend(), "panics");
    }
}
