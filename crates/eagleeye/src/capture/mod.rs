//! Frame acquisition.
//!
//! Every source is driven through one capability, [`Capture::capture`], which
//! yields the next frame. Two variants exist, chosen when the source is opened:
//!
//! - [`Capture::Continuous`]: a frame reader polled at a target cadence
//! - [`Capture::Windowed`]: an event stream integrated into one image per
//!   fixed time window
//!
//! The hardware behind a reader or event stream is hidden behind the
//! [`FrameReader`] and [`EventStream`] traits.

pub mod continuous;
pub mod events;
pub mod worker;

use std::time::{Duration, Instant};

use crate::config::{SourceConfig, SourceKind};
use crate::frame::Frame;

pub use continuous::{ContinuousCapture, FrameReader, ImageDirectory, SyntheticPattern};
pub use events::{CdEvent, CsvEvents, EventAccumulator, EventStream, SyntheticEvents, WindowedCapture};
pub use worker::{CameraWorker, WorkerExit};

/// Errors raised while opening or reading a source
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("could not open source: {0}")]
    Open(String),
    #[error("read failed: {0}")]
    Read(String),
}

/// A source opened for capture.
pub enum Capture {
    Continuous(ContinuousCapture),
    Windowed(WindowedCapture),
}

impl Capture {
    /// Open the source described by `config`.
    pub fn open(config: &SourceConfig) -> Result<Self, CaptureError> {
        let name = config.name.as_str();
        let capture = match &config.kind {
            SourceKind::Synthetic {
                width,
                height,
                channels,
                fps,
            } => Capture::Continuous(ContinuousCapture::new(
                Box::new(SyntheticPattern::new(name, *width, *height, *channels)),
                *fps,
            )),
            SourceKind::Images { path, fps, repeat } => Capture::Continuous(
                ContinuousCapture::new(Box::new(ImageDirectory::open(name, path, *repeat)?), *fps),
            ),
            SourceKind::EventCsv {
                path,
                width,
                height,
                window_us,
                accumulation_us,
            } => Capture::Windowed(WindowedCapture::new(
                Box::new(CsvEvents::open(path)?),
                EventAccumulator::new(name, *width, *height, *window_us, *accumulation_us),
            )),
            SourceKind::SyntheticEvents {
                width,
                height,
                window_us,
                accumulation_us,
                events_per_window,
            } => Capture::Windowed(WindowedCapture::new(
                Box::new(SyntheticEvents::new(
                    *width,
                    *height,
                    *window_us,
                    *events_per_window,
                )),
                EventAccumulator::new(name, *width, *height, *window_us, *accumulation_us),
            )),
        };
        Ok(capture)
    }

    /// Next frame; `Ok(None)` once the source has ended.
    pub fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self {
            Capture::Continuous(c) => c.capture(),
            Capture::Windowed(w) => w.capture(),
        }
    }
}

/// Holds a loop to a fixed cadence. The first call returns immediately;
/// later calls sleep until one period after the previous one. A caller that
/// falls behind is not made to catch up with a burst.
#[derive(Debug)]
pub struct Pacer {
    period: Duration,
    due: Option<Instant>,
}

impl Pacer {
    pub fn new(period: Duration) -> Self {
        Self { period, due: None }
    }

    pub fn from_hz(hz: f64) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / hz))
    }

    pub fn wait(&mut self) {
        if let Some(due) = self.due {
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        let now = Instant::now();
        self.due = Some(match self.due {
            Some(due) if due + self.period > now => due + self.period,
            _ => now + self.period,
        });
    }
}
