use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

/// What the service remembers about one tracked object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    /// Timestamp of the frame the object was first reported in. Never changes.
    pub first_seen: f64,
    /// Confidence of the most recent sighting
    #[serde(rename = "last_conf")]
    pub last_confidence: f32,
    pub class_name: String,
}

/// Snapshot of the store, keyed by track id.
pub type TrackHistory = BTreeMap<u64, TrackRecord>;

/// Persistent record of every object id ever reported by the tracker.
///
/// The hub loop is the only writer; HTTP handlers and new detection
/// subscribers read consistent copies through [`snapshot`](Self::snapshot).
/// Entries are never evicted.
#[derive(Debug, Default)]
pub struct TrackHistoryStore {
    tracks: RwLock<TrackHistory>,
}

impl TrackHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackHistory> {
        self.tracks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackHistory> {
        self.tracks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a sighting. A new id gets `first_seen = timestamp`; a known id
    /// only has its last confidence updated.
    ///
    /// Returns `true` if the id was new.
    pub fn upsert(&self, track_id: u64, confidence: f32, class_name: &str, timestamp: f64) -> bool {
        let mut tracks = self.write();
        match tracks.get_mut(&track_id) {
            Some(record) => {
                record.last_confidence = confidence;
                false
            }
            None => {
                tracks.insert(
                    track_id,
                    TrackRecord {
                        first_seen: timestamp,
                        last_confidence: confidence,
                        class_name: class_name.to_string(),
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, track_id: u64) -> Option<TrackRecord> {
        self.read().get(&track_id).cloned()
    }

    pub fn snapshot(&self) -> TrackHistory {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_set_once() {
        let store = TrackHistoryStore::new();
        assert!(store.upsert(7, 0.9, "Car", 0.0));
        assert!(!store.upsert(7, 0.4, "Car", 1.5));
        assert!(!store.upsert(7, 0.6, "Truck", 3.0));

        let record = store.get(7).unwrap();
        assert_eq!(record.first_seen, 0.0);
        assert_eq!(record.last_confidence, 0.6);
        // class is fixed at first sighting
        assert_eq!(record.class_name, "Car");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_last_confidence_is_latest() {
        let store = TrackHistoryStore::new();
        let confidences = [0.3, 0.8, 0.55, 0.1];
        for (i, c) in confidences.iter().enumerate() {
            store.upsert(1, *c, "Person", i as f64);
        }
        assert_eq!(store.get(1).unwrap().last_confidence, 0.1);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let store = TrackHistoryStore::new();
        store.upsert(7, 0.9, "Car", 0.0);
        store.upsert(12, 0.5, "Person", 2.5);

        let snapshot = store.snapshot();
        store.upsert(13, 0.5, "Bus", 3.0);
        assert_eq!(snapshot.len(), 2, "snapshot is a copy");

        let json = serde_json::to_value(&snapshot).unwrap();
        let car = &json["7"];
        assert_eq!(car["first_seen"].as_f64(), Some(0.0));
        assert!((car["last_conf"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(car["class_name"], "Car");
        assert_eq!(json["12"]["class_name"], "Person");
    }
}
