//! HTTP inference service backend.
//!
//! Each frame is POSTed as a JPEG body to the configured URL with the class
//! allow-list and confidence threshold as query parameters:
//!
//! ```text
//! POST /track?classes=0,1,2,3,5,7&conf=0.25
//! Content-Type: image/jpeg
//! ```
//!
//! The service answers `{"boxes": [[x1, y1, x2, y2, track_id, confidence, class_id], ...]}`
//! and keeps its own tracker state between requests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use super::{DetectError, DetectionBox, Detector};
use crate::codec::{FrameEncoder, Jpeg};
use crate::frame::Frame;

const UPLOAD_QUALITY: u8 = 90;

#[derive(Debug, Deserialize)]
struct TrackResponse {
    #[serde(default)]
    boxes: Vec<DetectionBox>,
}

pub struct RemoteDetector {
    client: reqwest::Client,
    url: String,
    min_confidence: f32,
    encoder: Jpeg,
}

impl RemoteDetector {
    pub fn new(url: &str, timeout: Duration, min_confidence: f32) -> Result<Self, DetectError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            min_confidence,
            encoder: Jpeg::new(UPLOAD_QUALITY),
        })
    }
}

#[async_trait]
impl Detector for RemoteDetector {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn infer(&mut self, frame: &Frame, classes: &[u32]) -> Result<Vec<DetectionBox>, DetectError> {
        let body = self.encoder.encode(frame)?;
        let classes = classes
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("classes", classes),
                ("conf", self.min_confidence.to_string()),
            ])
            .header(CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DetectError::Backend(format!(
                "status {}: {}",
                status.as_u16(),
                message
            )));
        }

        let parsed: TrackResponse = response.json().await?;
        Ok(parsed.boxes)
    }
}
