//! Subscriber sets for the broadcast channels.
//!
//! Each WebSocket connection owns the receiving end of a small bounded queue
//! and registers the sending end here. The hub never awaits a subscriber: a
//! delivery is a `try_send`, and a subscriber whose queue is full (stalled
//! socket) or closed (connection gone) is removed on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Sending end of one connection's outbound queue.
#[derive(Debug)]
pub struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

impl<T> Subscriber<T> {
    /// Create a subscriber and the queue its connection drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `item` without waiting. False if the queue is full or closed.
    pub fn try_deliver(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }
}

/// The subscribers of one logical channel (a source, or detections).
#[derive(Debug)]
pub struct SubscriberRegistry<T> {
    channel: String,
    subscribers: Mutex<HashMap<u64, Subscriber<T>>>,
}

impl<T: Clone> SubscriberRegistry<T> {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Subscriber<T>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber. It receives every broadcast that starts after
    /// this returns.
    pub fn add(&self, subscriber: Subscriber<T>) -> u64 {
        let id = subscriber.id;
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(id, subscriber);
            subscribers.len()
        };
        log::info!("[{}] subscriber {} added ({} total)", self.channel, id, count);
        id
    }

    /// Unregister a subscriber. Removing an unknown id is a no-op.
    pub fn remove(&self, id: u64) -> bool {
        let (removed, count) = {
            let mut subscribers = self.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            log::info!("[{}] subscriber {} removed ({} total)", self.channel, id, count);
        }
        removed
    }

    /// Visit every subscriber under the registry lock. Subscribers for which
    /// `sink` returns `false` are removed before the lock is released.
    ///
    /// Returns the number of subscribers `sink` accepted.
    pub fn for_each<F>(&self, mut sink: F) -> usize
    where
        F: FnMut(&Subscriber<T>) -> bool,
    {
        let mut failed = Vec::new();
        let delivered = {
            let mut subscribers = self.lock();
            let mut delivered = 0;
            for (id, subscriber) in subscribers.iter() {
                if sink(subscriber) {
                    delivered += 1;
                } else {
                    failed.push(*id);
                }
            }
            for id in &failed {
                subscribers.remove(id);
            }
            delivered
        };
        for id in failed {
            log::warn!("[{}] subscriber {} dropped (stalled or disconnected)", self.channel, id);
        }
        delivered
    }

    /// Deliver `item` to every subscriber, dropping the ones that cannot take it.
    pub fn broadcast(&self, item: T) -> usize {
        self.for_each(|subscriber| subscriber.try_deliver(item.clone()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
