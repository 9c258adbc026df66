//! Event-camera sources and windowed accumulation.
//!
//! An event camera reports per-pixel brightness changes instead of frames.
//! Events are grouped into fixed windows (`window_us`, ~33 ms by default) by
//! their own timestamps; each window becomes one synthesized image in which
//! only the events of its last `accumulation_us` are drawn.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{CaptureError, Pacer};
use crate::frame::{unix_now, Frame};

const BACKGROUND: [u8; 3] = [30, 37, 52];
const ON_COLOR: [u8; 3] = [216, 223, 236];
const OFF_COLOR: [u8; 3] = [64, 126, 201];

/// A change-detection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdEvent {
    pub x: u16,
    pub y: u16,
    /// true = brightness increased
    pub polarity: bool,
    /// Microseconds, monotonic within a stream
    pub t: u64,
}

/// A device or recording that yields events in timestamp order.
pub trait EventStream: Send {
    /// Next event; `Ok(None)` at end of stream.
    fn next_event(&mut self) -> Result<Option<CdEvent>, CaptureError>;
}

/// Renders one window of events into an RGB frame.
#[derive(Debug, Clone)]
pub struct EventAccumulator {
    name: String,
    width: u32,
    height: u32,
    window_us: u64,
    accumulation_us: u64,
}

impl EventAccumulator {
    pub fn new(name: &str, width: u32, height: u32, window_us: u64, accumulation_us: u64) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            window_us: window_us.max(1),
            accumulation_us: accumulation_us.clamp(1, window_us.max(1)),
        }
    }

    pub fn window_us(&self) -> u64 {
        self.window_us
    }

    /// Start of the window containing `t`.
    pub fn window_start(&self, t: u64) -> u64 {
        (t / self.window_us) * self.window_us
    }

    /// Draw the events of the window ending at `window_end` (exclusive).
    pub fn render(&self, events: &[CdEvent], window_end: u64) -> Frame {
        let width = self.width as usize;
        let height = self.height as usize;
        let mut data = BACKGROUND.repeat(width * height);
        let since = window_end.saturating_sub(self.accumulation_us);

        for ev in events.iter().filter(|ev| ev.t >= since && ev.t < window_end) {
            let (x, y) = (ev.x as usize, ev.y as usize);
            if x >= width || y >= height {
                continue;
            }
            let base = (y * width + x) * 3;
            let color = if ev.polarity { ON_COLOR } else { OFF_COLOR };
            data[base..base + 3].copy_from_slice(&color);
        }

        Frame {
            data,
            width: self.width,
            height: self.height,
            channels: 3,
            timestamp: unix_now(),
            source: self.name.clone(),
        }
    }
}

/// Integrates an [`EventStream`] into one frame per window, paced to real
/// time.
pub struct WindowedCapture {
    stream: Box<dyn EventStream>,
    accumulator: EventAccumulator,
    pacer: Pacer,
    window_start: Option<u64>,
    buffer: Vec<CdEvent>,
    carry: Option<CdEvent>,
    ended: bool,
}

impl WindowedCapture {
    pub fn new(stream: Box<dyn EventStream>, accumulator: EventAccumulator) -> Self {
        let pacer = Pacer::new(Duration::from_micros(accumulator.window_us()));
        Self {
            stream,
            accumulator,
            pacer,
            window_start: None,
            buffer: Vec::new(),
            carry: None,
            ended: false,
        }
    }

    pub fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(frame) = self.next_window()? else {
            return Ok(None);
        };
        self.pacer.wait();
        Ok(Some(frame))
    }

    /// Collect events until the current window closes and render it.
    fn next_window(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.ended {
            return Ok(None);
        }
        loop {
            let event = match self.carry.take() {
                Some(ev) => Some(ev),
                None => self.stream.next_event()?,
            };

            let Some(ev) = event else {
                self.ended = true;
                // flush a partially filled final window
                return Ok(match self.window_start {
                    Some(start) if !self.buffer.is_empty() => {
                        Some(self.emit(start + self.accumulator.window_us()))
                    }
                    _ => None,
                });
            };

            let start = *self
                .window_start
                .get_or_insert_with(|| self.accumulator.window_start(ev.t));
            let end = start + self.accumulator.window_us();

            if ev.t >= end {
                self.carry = Some(ev);
                let frame = self.emit(end);
                self.window_start = Some(end);
                return Ok(Some(frame));
            }
            self.buffer.push(ev);
        }
    }

    fn emit(&mut self, window_end: u64) -> Frame {
        let frame = self.accumulator.render(&self.buffer, window_end);
        self.buffer.clear();
        frame
    }
}

/// Events recorded as `x,y,p,t` CSV lines. Blank lines and lines starting
/// with `%` or `#` are skipped, as is a textual header row.
pub struct CsvEvents {
    reader: csv::Reader<File>,
    record: csv::StringRecord,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    x: u16,
    y: u16,
    p: i8,
    t: u64,
}

impl From<EventRecord> for CdEvent {
    fn from(r: EventRecord) -> Self {
        Self {
            x: r.x,
            y: r.y,
            polarity: r.p > 0,
            t: r.t,
        }
    }
}

impl CsvEvents {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b'%'))
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(|e| CaptureError::Open(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            reader,
            record: csv::StringRecord::new(),
        })
    }
}

impl EventStream for CsvEvents {
    fn next_event(&mut self) -> Result<Option<CdEvent>, CaptureError> {
        loop {
            let more = self
                .reader
                .read_record(&mut self.record)
                .map_err(|e| CaptureError::Read(e.to_string()))?;
            if !more {
                return Ok(None);
            }
            if self.record.iter().all(str::is_empty)
                || self.record.get(0).is_some_and(|f| f.starts_with('#'))
            {
                continue;
            }

            let line = self.record.position().map_or(0, |p| p.line());
            match self.record.deserialize::<EventRecord>(None) {
                Ok(record) => return Ok(Some(record.into())),
                Err(_) if line == 1 => continue,
                Err(e) => {
                    return Err(CaptureError::Read(format!(
                        "line {}: expected x,y,p,t: {}",
                        line, e
                    )))
                }
            }
        }
    }
}

/// Endless generated event stream: a dot circling the sensor, leaving ON
/// events on its leading edge and OFF events behind it.
pub struct SyntheticEvents {
    width: u32,
    height: u32,
    step_us: u64,
    t: u64,
    seed: u64,
}

impl SyntheticEvents {
    pub fn new(width: u32, height: u32, window_us: u64, events_per_window: u32) -> Self {
        Self {
            width,
            height,
            step_us: (window_us / events_per_window.max(1) as u64).max(1),
            t: 0,
            seed: 0x2545_f491_4f6c_dd1d,
        }
    }

    fn jitter(&mut self) -> i64 {
        // xorshift, enough to scatter events around the dot
        self.seed ^= self.seed << 13;
        self.seed ^= self.seed >> 7;
        self.seed ^= self.seed << 17;
        (self.seed % 21) as i64 - 10
    }
}

impl EventStream for SyntheticEvents {
    fn next_event(&mut self) -> Result<Option<CdEvent>, CaptureError> {
        let phase = (self.t as f64 / 2_000_000.0) * std::f64::consts::TAU;
        let cx = self.width as f64 / 2.0 + phase.cos() * self.width as f64 / 3.0;
        let cy = self.height as f64 / 2.0 + phase.sin() * self.height as f64 / 3.0;
        let dx = self.jitter();
        let dy = self.jitter();
        let x = (cx as i64 + dx).clamp(0, self.width as i64 - 1) as u16;
        let y = (cy as i64 + dy).clamp(0, self.height as i64 - 1) as u16;

        let ev = CdEvent {
            x,
            y,
            polarity: dx >= 0,
            t: self.t,
        };
        self.t += self.step_us;
        Ok(Some(ev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<CdEvent>);

    impl EventStream for Scripted {
        fn next_event(&mut self) -> Result<Option<CdEvent>, CaptureError> {
            Ok(self.0.pop_front())
        }
    }

    fn ev(x: u16, y: u16, polarity: bool, t: u64) -> CdEvent {
        CdEvent { x, y, polarity, t }
    }

    fn pixel(frame: &Frame, x: usize, y: usize) -> [u8; 3] {
        let base = (y * frame.width as usize + x) * 3;
        [frame.data[base], frame.data[base + 1], frame.data[base + 2]]
    }

    #[test]
    fn test_render_draws_only_accumulation_tail() {
        let acc = EventAccumulator::new("event", 4, 4, 1_000, 200);
        let events = [ev(0, 0, true, 100), ev(1, 1, true, 850), ev(2, 2, false, 999)];
        let frame = acc.render(&events, 1_000);

        assert_eq!(pixel(&frame, 0, 0), BACKGROUND, "older than accumulation time");
        assert_eq!(pixel(&frame, 1, 1), ON_COLOR);
        assert_eq!(pixel(&frame, 2, 2), OFF_COLOR);
        assert_eq!(pixel(&frame, 3, 3), BACKGROUND);
    }

    #[test]
    fn test_windows_split_by_event_time() {
        let stream = Scripted(VecDeque::from(vec![
            ev(0, 0, true, 10),
            ev(1, 0, true, 990),
            ev(2, 0, true, 1_005), // second window
            ev(3, 0, true, 3_500), // fourth window, third is empty
        ]));
        let acc = EventAccumulator::new("event", 4, 1, 1_000, 1_000);
        let mut capture = WindowedCapture::new(Box::new(stream), acc);

        let w1 = capture.next_window().unwrap().unwrap();
        assert_eq!(pixel(&w1, 0, 0), ON_COLOR);
        assert_eq!(pixel(&w1, 1, 0), ON_COLOR);
        assert_eq!(pixel(&w1, 2, 0), BACKGROUND);

        let w2 = capture.next_window().unwrap().unwrap();
        assert_eq!(pixel(&w2, 2, 0), ON_COLOR);
        assert_eq!(pixel(&w2, 0, 0), BACKGROUND);

        let w3 = capture.next_window().unwrap().unwrap();
        assert!(w3.data.chunks(3).all(|p| p == BACKGROUND));

        let w4 = capture.next_window().unwrap().unwrap();
        assert_eq!(pixel(&w4, 3, 0), ON_COLOR);

        assert!(capture.next_window().unwrap().is_none());
        assert!(capture.next_window().unwrap().is_none());
    }

    #[test]
    fn test_csv_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");
        std::fs::write(&path, "x,y,p,t\n% comment\n1,2,1,100\n\n3,4,0,200\n").unwrap();

        let mut stream = CsvEvents::open(&path).unwrap();
        assert_eq!(stream.next_event().unwrap(), Some(ev(1, 2, true, 100)));
        assert_eq!(stream.next_event().unwrap(), Some(ev(3, 4, false, 200)));
        assert_eq!(stream.next_event().unwrap(), None);
    }

    #[test]
    fn test_csv_bad_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");
        std::fs::write(&path, "1,2,1,100\nbroken\n").unwrap();

        let mut stream = CsvEvents::open(&path).unwrap();
        assert!(stream.next_event().unwrap().is_some());
        match stream.next_event() {
            Err(CaptureError::Read(msg)) => assert!(msg.starts_with("line 2"), "{}", msg),
            other => panic!("expected read error, got {:?}", other),
        }
    }

    #[test]
    fn test_csv_fields_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.csv");
        // hash comments, padded fields, negative polarity, trailing blank line
        std::fs::write(
            &path,
            "# recorded by hand\n 5 , 6 , -1 , 300 \n7,8,1,400\n  \n70000,1,1,500\n",
        )
        .unwrap();

        let mut stream = CsvEvents::open(&path).unwrap();
        assert_eq!(stream.next_event().unwrap(), Some(ev(5, 6, false, 300)));
        assert_eq!(stream.next_event().unwrap(), Some(ev(7, 8, true, 400)));
        // x does not fit a sensor coordinate
        assert!(matches!(stream.next_event(), Err(CaptureError::Read(_))));
    }

    #[test]
    fn test_synthetic_events_are_ordered_and_in_bounds() {
        let mut stream = SyntheticEvents::new(32, 16, 1_000, 100);
        let mut last = 0;
        for _ in 0..500 {
            let ev = stream.next_event().unwrap().unwrap();
            assert!(ev.t >= last);
            assert!(ev.x < 32 && ev.y < 16);
            last = ev.t;
        }
    }
}
