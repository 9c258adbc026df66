use tokio::task::JoinHandle;

use super::{DetectionBox, DetectionStage};
use crate::channel::{latest, SlotReader, SlotWriter};
use crate::frame::Frame;

/// Result of one offloaded inference.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutput {
    /// Capture time of the frame the boxes belong to
    pub timestamp: f64,
    pub boxes: Vec<DetectionBox>,
}

/// A [`DetectionStage`] running on its own task.
///
/// Frames go in through a latest-value slot: while one inference is in
/// flight, newer frames replace older unprocessed ones, so the stage sees
/// frames in arrival order and is never called concurrently. Results come
/// back through a second latest-value slot that the hub polls once per tick.
pub struct OffloadedStage {
    input: SlotWriter<Frame>,
    output: SlotReader<DetectionOutput>,
    task: JoinHandle<()>,
}

impl OffloadedStage {
    /// Spawn the inference task. Must be called inside a tokio runtime.
    pub fn spawn(mut stage: DetectionStage) -> Self {
        let (input, jobs) = latest::<Frame>();
        let (results, output) = latest::<DetectionOutput>();

        let task = tokio::spawn(async move {
            log::info!("[detect] offloaded stage started ({})", stage.backend());
            while let Some(frame) = jobs.recv().await {
                match stage.infer(&frame).await {
                    Ok(boxes) => {
                        results.publish(DetectionOutput {
                            timestamp: frame.timestamp,
                            boxes,
                        });
                    }
                    Err(e) => log::warn!("[detect] inference failed: {}", e),
                }
            }
            log::info!("[detect] offloaded stage stopped");
        });

        Self {
            input,
            output,
            task,
        }
    }

    /// Queue a frame for inference. Returns `true` if an older frame that
    /// had not started yet was dropped in its favour.
    pub fn submit(&self, frame: Frame) -> bool {
        self.input.publish(frame)
    }

    /// Take the most recent completed result, if a new one is ready.
    pub fn poll(&self) -> Option<DetectionOutput> {
        self.output.take()
    }

    /// False once the inference task has exited.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for OffloadedStage {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectError, Detector, DEFAULT_CLASSES};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records the timestamps it sees and reports one box per frame whose
    /// track id is the frame timestamp.
    struct Recorder {
        seen: Arc<Mutex<Vec<f64>>>,
        delay: Duration,
    }

    #[async_trait]
    impl Detector for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn infer(&mut self, frame: &Frame, _classes: &[u32]) -> Result<Vec<DetectionBox>, DetectError> {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push(frame.timestamp);
            Ok(vec![DetectionBox {
                x1: 0.0,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
                track_id: frame.timestamp as u64,
                confidence: 0.5,
                class_id: 0,
            }])
        }
    }

    fn frame(ts: f64) -> Frame {
        Frame::new("rgb", 1, 1, 3, vec![0, 0, 0], ts).unwrap()
    }

    async fn wait_for(stage: &OffloadedStage) -> DetectionOutput {
        for _ in 0..200 {
            if let Some(out) = stage.poll() {
                return out;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no detection output");
    }

    #[tokio::test]
    async fn test_results_come_back_with_frame_timestamp() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = OffloadedStage::spawn(DetectionStage::new(
            Box::new(Recorder {
                seen: seen.clone(),
                delay: Duration::ZERO,
            }),
            DEFAULT_CLASSES.to_vec(),
        ));

        stage.submit(frame(3.0));
        let out = wait_for(&stage).await;
        assert_eq!(out.timestamp, 3.0);
        assert_eq!(out.boxes[0].track_id, 3);
        assert!(stage.is_running());
    }

    #[tokio::test]
    async fn test_frames_stay_in_order_while_busy() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = OffloadedStage::spawn(DetectionStage::new(
            Box::new(Recorder {
                seen: seen.clone(),
                delay: Duration::from_millis(30),
            }),
            DEFAULT_CLASSES.to_vec(),
        ));

        for ts in 1..=10 {
            stage.submit(frame(ts as f64));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.len() < 10, "busy stage must skip stale frames");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "order preserved: {:?}", seen);
        assert_eq!(*seen.last().unwrap(), 10.0, "newest frame is processed");
    }
}
