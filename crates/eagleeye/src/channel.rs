//! Single-slot, latest-value handoff.
//!
//! A write always replaces any value the reader has not taken yet, so a slow
//! reader sees only the freshest item and memory stays bounded at one value.
//! Writers never block on the reader. The same primitive carries camera
//! frames into the hub and detection jobs/results between the hub and the
//! offloaded detection task.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::frame::Frame;

/// Writer half of a camera frame channel.
pub type FrameSender = SlotWriter<Frame>;
/// Reader half of a camera frame channel.
pub type FrameReceiver = SlotReader<Frame>;

/// Create a frame channel.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    latest()
}

struct Shared<T> {
    slot: Mutex<Option<T>>,
    writers: AtomicUsize,
    writes: AtomicU64,
    overwritten: AtomicU64,
    notify: Notify,
}

impl<T> Shared<T> {
    fn slot(&self) -> MutexGuard<'_, Option<T>> {
        // The slot holds plain data; a panic elsewhere cannot leave it half-written.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a latest-value slot.
pub fn latest<T>() -> (SlotWriter<T>, SlotReader<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(None),
        writers: AtomicUsize::new(1),
        writes: AtomicU64::new(0),
        overwritten: AtomicU64::new(0),
        notify: Notify::new(),
    });
    (
        SlotWriter {
            shared: shared.clone(),
        },
        SlotReader { shared },
    )
}

/// Writer half. Cloning adds a writer; the channel is closed once every
/// writer has been dropped.
pub struct SlotWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SlotWriter<T> {
    /// Store `value`, discarding any unread previous value.
    ///
    /// Returns `true` when an unread value was overwritten.
    pub fn publish(&self, value: T) -> bool {
        let replaced = self.shared.slot().replace(value).is_some();
        self.shared.writes.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.shared.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        replaced
    }
}

impl<T> Clone for SlotWriter<T> {
    fn clone(&self) -> Self {
        self.shared.writers.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for SlotWriter<T> {
    fn drop(&mut self) {
        if self.shared.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.notify.notify_one();
        }
    }
}

/// Reader half.
pub struct SlotReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SlotReader<T> {
    /// Take the pending value, if any. Never returns the same value twice.
    pub fn take(&self) -> Option<T> {
        self.shared.slot().take()
    }

    /// True once every writer is gone. A pending value may still be taken.
    pub fn is_closed(&self) -> bool {
        self.shared.writers.load(Ordering::Acquire) == 0
    }

    /// Wait for the next value. Returns `None` when the channel is closed and
    /// empty.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(value) = self.take() {
                return Some(value);
            }
            if self.is_closed() {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            writes: self.shared.writes.load(Ordering::Relaxed),
            overwritten: self.shared.overwritten.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }
}

/// Counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChannelStats {
    /// Values published since creation
    pub writes: u64,
    /// Values replaced before the reader took them
    pub overwritten: u64,
    /// Every writer has gone away
    pub closed: bool,
}
