//! Sources that deliver whole frames at their own rate.

use std::path::{Path, PathBuf};

use super::{CaptureError, Pacer};
use crate::frame::{unix_now, Frame};

/// A device or file that yields one frame per read.
pub trait FrameReader: Send {
    /// Read the next frame. `Ok(None)` means the stream has ended
    /// (device unplugged, end of file).
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Polls a [`FrameReader`] at a target cadence.
pub struct ContinuousCapture {
    reader: Box<dyn FrameReader>,
    pacer: Pacer,
}

impl ContinuousCapture {
    pub fn new(reader: Box<dyn FrameReader>, fps: f64) -> Self {
        Self {
            reader,
            pacer: Pacer::from_hz(fps),
        }
    }

    pub fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        self.pacer.wait();
        self.reader.read()
    }
}

/// Generated test pattern: a diagonal gradient with a bright bar sweeping
/// across it, so motion is visible on the viewer.
pub struct SyntheticPattern {
    name: String,
    width: u32,
    height: u32,
    channels: u8,
    tick: u64,
}

impl SyntheticPattern {
    pub fn new(name: &str, width: u32, height: u32, channels: u8) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            channels,
            tick: 0,
        }
    }
}

impl FrameReader for SyntheticPattern {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let width = self.width as usize;
        let height = self.height as usize;
        let channels = self.channels as usize;
        let bar = (self.tick as usize * 4) % width.max(1);
        let mut data = vec![0u8; width * height * channels];

        for y in 0..height {
            for x in 0..width {
                let base = (y * width + x) * channels;
                let shade = (((x + y) * 255) / (width + height).max(1)) as u8;
                let on_bar = x >= bar && x < bar + 8;
                for c in 0..channels {
                    data[base + c] = if on_bar {
                        255
                    } else {
                        shade.wrapping_add((c * 60) as u8)
                    };
                }
            }
        }

        self.tick = self.tick.wrapping_add(1);
        Frame::new(
            self.name.as_str(),
            self.width,
            self.height,
            self.channels,
            data,
            unix_now(),
        )
        .map(Some)
        .map_err(|e| CaptureError::Read(e.to_string()))
    }
}

/// Replays the JPEG/PNG files of a directory in file-name order.
pub struct ImageDirectory {
    name: String,
    files: Vec<PathBuf>,
    next: usize,
    repeat: bool,
}

impl ImageDirectory {
    pub fn open(name: &str, dir: &Path, repeat: bool) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CaptureError::Open(format!("{}: {}", dir.display(), e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CaptureError::Open(format!(
                "{}: no .jpg/.jpeg/.png files",
                dir.display()
            )));
        }

        log::debug!("[camera:{}] replaying {} images", name, files.len());

        Ok(Self {
            name: name.to_string(),
            files,
            next: 0,
            repeat,
        })
    }
}

impl FrameReader for ImageDirectory {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.next >= self.files.len() {
            if !self.repeat {
                return Ok(None);
            }
            self.next = 0;
        }
        let path = &self.files[self.next];
        self.next += 1;

        let image = image::open(path)
            .map_err(|e| CaptureError::Read(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Frame::new(self.name.as_str(), width, height, 3, image.into_raw(), unix_now())
            .map(Some)
            .map_err(|e| CaptureError::Read(e.to_string()))
    }
}
