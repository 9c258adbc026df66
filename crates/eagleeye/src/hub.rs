//! The broadcast hub: one loop that moves frames from camera workers to
//! WebSocket subscribers and runs detection on the designated source.
//!
//! ```text
//!  CameraWorker ──▶ FrameChannel ──┐
//!  CameraWorker ──▶ FrameChannel ──┼──▶ BroadcastHub (tick) ──▶ per-source registries
//!  /ws_upload   ──▶ FrameChannel ──┘          │
//!                                             └──▶ DetectionStage ──▶ TrackHistoryStore
//!                                                                 └─▶ detections registry
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::channel::{frame_channel, ChannelStats, FrameReceiver, FrameSender};
use crate::codec::FrameEncoder;
use crate::config::{DetectionMode, HubConfig, DETECTIONS_CHANNEL};
use crate::detect::{class_name, DetectionBox, DetectionStage, OffloadedStage};
use crate::registry::SubscriberRegistry;
use crate::track::{TrackHistory, TrackHistoryStore};

/// Errors that stop the hub loop
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("tick rate must be positive, got {0}")]
    InvalidTickRate(f64),
    #[error("unknown source '{0}'")]
    UnknownSource(String),
    #[error("offloaded detection task exited")]
    DetectionStopped,
}

// ── Shared state ──

/// One broadcast source: the frame channel the hub drains and the
/// subscribers it fans out to.
pub struct SourceChannel {
    frames: FrameReceiver,
    subscribers: SubscriberRegistry<Bytes>,
}

impl SourceChannel {
    pub fn subscribers(&self) -> &SubscriberRegistry<Bytes> {
        &self.subscribers
    }

    pub fn stats(&self) -> ChannelStats {
        self.frames.stats()
    }
}

/// Where `/ws_upload` publishes decoded frames.
pub struct UploadSink {
    pub source: String,
    /// Only every Nth message of a connection is processed
    pub frame_skip: u32,
    pub frames: FrameSender,
}

/// Everything the hub loop and the HTTP handlers share.
///
/// Built once at startup, then wrapped in an `Arc`. The hub loop is the only
/// writer of the track store; connection tasks only add and remove
/// themselves from registries.
pub struct HubState {
    sources: BTreeMap<String, SourceChannel>,
    detections: SubscriberRegistry<Arc<str>>,
    tracks: TrackHistoryStore,
    upload: Option<UploadSink>,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            detections: SubscriberRegistry::new(DETECTIONS_CHANNEL),
            tracks: TrackHistoryStore::new(),
            upload: None,
        }
    }

    /// Register a source and return the sender its producer writes to.
    pub fn add_source(&mut self, name: &str) -> FrameSender {
        let (tx, rx) = frame_channel();
        self.sources.insert(
            name.to_string(),
            SourceChannel {
                frames: rx,
                subscribers: SubscriberRegistry::new(name),
            },
        );
        tx
    }

    /// Register the upload virtual source.
    pub fn enable_upload(&mut self, name: &str, frame_skip: u32) {
        let frames = self.add_source(name);
        self.upload = Some(UploadSink {
            source: name.to_string(),
            frame_skip: frame_skip.max(1),
            frames,
        });
    }

    pub fn source(&self, name: &str) -> Option<&SourceChannel> {
        self.sources.get(name)
    }

    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn detections(&self) -> &SubscriberRegistry<Arc<str>> {
        &self.detections
    }

    pub fn tracks(&self) -> &TrackHistoryStore {
        &self.tracks
    }

    pub fn upload(&self) -> Option<&UploadSink> {
        self.upload.as_ref()
    }

    /// The `{"track_history": {...}}` message sent to new detection subscribers.
    pub fn track_history_message(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&TrackHistoryMessage {
            track_history: self.tracks.snapshot(),
        })
    }

    pub fn health(&self) -> HealthReport {
        let sources = self
            .sources
            .iter()
            .map(|(name, channel)| {
                let stats = channel.frames.stats();
                (
                    name.clone(),
                    SourceHealth {
                        alive: !stats.closed,
                        frames: stats.writes,
                        overwritten: stats.overwritten,
                        subscribers: channel.subscribers.len(),
                    },
                )
            })
            .collect();

        HealthReport {
            status: "ok",
            sources,
            detection_subscribers: self.detections.len(),
            tracked_objects: self.tracks.len(),
        }
    }
}

#[derive(Serialize)]
struct TrackHistoryMessage {
    track_history: TrackHistory,
}

#[derive(Serialize)]
struct DetectionMessage<'a> {
    ts: f64,
    boxes: &'a [DetectionBox],
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub sources: BTreeMap<String, SourceHealth>,
    pub detection_subscribers: usize,
    pub tracked_objects: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    /// The producer is still running
    pub alive: bool,
    /// Frames written by the producer
    pub frames: u64,
    /// Frames replaced before the hub picked them up
    pub overwritten: u64,
    pub subscribers: usize,
}

// ── Detection ──

enum Runner {
    Inline(DetectionStage),
    Offload(OffloadedStage),
}

struct Detection {
    source: String,
    runner: Runner,
}

/// Update the track store and fan the payload out to detection subscribers.
fn publish_detections(state: &HubState, timestamp: f64, boxes: &[DetectionBox]) {
    for b in boxes {
        state
            .tracks
            .upsert(b.track_id, b.confidence, class_name(b.class_id), timestamp);
    }

    if state.detections.is_empty() {
        return;
    }
    match serde_json::to_string(&DetectionMessage { ts: timestamp, boxes }) {
        Ok(payload) => {
            state.detections.broadcast(Arc::from(payload));
        }
        Err(e) => log::warn!("[hub] failed to serialize detections: {}", e),
    }
}

// ── Loop ──

#[derive(Debug, Default)]
struct SourceCounters {
    consumed: u64,
    deliveries: u64,
    encode_errors: u64,
}

/// The single coordinating loop.
pub struct BroadcastHub {
    state: Arc<HubState>,
    period: Duration,
    encoder: Box<dyn FrameEncoder>,
    detection: Option<Detection>,
    inline_budget: Duration,
    counters: BTreeMap<String, SourceCounters>,
    last_stats: Instant,
}

impl BroadcastHub {
    pub fn new(
        state: Arc<HubState>,
        config: &HubConfig,
        encoder: Box<dyn FrameEncoder>,
    ) -> Result<Self, HubError> {
        if !(config.tick_hz > 0.0 && config.tick_hz.is_finite()) {
            return Err(HubError::InvalidTickRate(config.tick_hz));
        }
        let period = Duration::from_secs_f64(1.0 / config.tick_hz);
        Ok(Self {
            state,
            period,
            encoder,
            detection: None,
            inline_budget: period,
            counters: BTreeMap::new(),
            last_stats: Instant::now(),
        })
    }

    /// Route `source` through `stage`. Offload mode spawns the inference
    /// task, so it must be called inside a tokio runtime.
    pub fn with_detection(
        mut self,
        source: &str,
        stage: DetectionStage,
        mode: DetectionMode,
    ) -> Result<Self, HubError> {
        if self.state.source(source).is_none() {
            return Err(HubError::UnknownSource(source.to_string()));
        }
        log::info!(
            "[hub] detection on '{}' ({} backend, {:?})",
            source,
            stage.backend(),
            mode
        );
        let runner = match mode {
            DetectionMode::Inline => Runner::Inline(stage),
            DetectionMode::Offload => Runner::Offload(OffloadedStage::spawn(stage)),
        };
        self.detection = Some(Detection {
            source: source.to_string(),
            runner,
        });
        Ok(self)
    }

    /// Upper bound on one inline inference call, one tick period unless set.
    /// A call that runs over is abandoned and its frame gets no detections.
    pub fn with_inline_budget(mut self, budget: Duration) -> Self {
        self.inline_budget = budget;
        self
    }

    /// Run one broadcast cycle over every source.
    ///
    /// Every source is fanned out before detection runs, so a slow detector
    /// delays the next tick but never the frames of this one.
    pub async fn tick(&mut self) -> Result<(), HubError> {
        let state = self.state.clone();
        let mut detect_frame = None;

        for (name, channel) in &state.sources {
            // nothing new: nothing is re-sent
            let Some(frame) = channel.frames.take() else {
                continue;
            };

            let counters = self.counters.entry(name.clone()).or_default();
            counters.consumed += 1;

            if !channel.subscribers.is_empty() {
                match self.encoder.encode(&frame) {
                    Ok(jpeg) => counters.deliveries += channel.subscribers.broadcast(jpeg) as u64,
                    Err(e) => {
                        counters.encode_errors += 1;
                        log::warn!("[hub] {}: frame dropped: {}", name, e);
                    }
                }
            }

            if self.detection.as_ref().is_some_and(|d| d.source == *name) {
                detect_frame = Some(frame);
            }
        }

        let Some(detection) = self.detection.as_mut() else {
            return Ok(());
        };

        match &mut detection.runner {
            Runner::Inline(stage) => {
                if let Some(frame) = detect_frame {
                    match tokio::time::timeout(self.inline_budget, stage.infer(&frame)).await {
                        Ok(Ok(boxes)) => publish_detections(&state, frame.timestamp, &boxes),
                        Ok(Err(e)) => {
                            log::warn!("[detect] frame {:.3} skipped: {}", frame.timestamp, e)
                        }
                        Err(_) => log::warn!(
                            "[detect] frame {:.3} skipped: inference exceeded {:?}",
                            frame.timestamp,
                            self.inline_budget
                        ),
                    }
                }
            }
            Runner::Offload(stage) => {
                if let Some(frame) = detect_frame {
                    stage.submit(frame);
                }
                if let Some(output) = stage.poll() {
                    publish_detections(&state, output.timestamp, &output.boxes);
                }
                if !stage.is_running() {
                    return Err(HubError::DetectionStopped);
                }
            }
        }

        Ok(())
    }

    fn log_stats(&mut self) {
        if self.last_stats.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.last_stats = Instant::now();

        for (name, channel) in &self.state.sources {
            let Some(counters) = self.counters.get(name) else {
                continue;
            };
            let stats = channel.frames.stats();
            log::debug!(
                "[hub] {}: {} frames consumed, {} dropped before pickup, {} sent to {} subscribers, {} encode errors",
                name,
                counters.consumed,
                stats.overwritten,
                counters.deliveries,
                channel.subscribers.len(),
                counters.encode_errors
            );
        }
    }

    /// Tick at the configured rate until shutdown is signalled.
    ///
    /// An error return means the pipeline cannot continue.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) -> Result<(), HubError> {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!(
            "[hub] broadcasting {} sources every {:?}",
            self.state.sources.len(),
            self.period
        );

        loop {
            tokio::select! {
                // a dropped sender also means shutdown
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    self.tick().await?;
                    self.log_stats();
                }
            }
        }

        log::info!("[hub] stopped");
        Ok(())
    }
}
