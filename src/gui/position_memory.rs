//! Adaptive position memory
//!
//! Per (application-signature, interaction-kind) record of screen coordinates
//! that previously produced a validated input. Remembered points bias element
//! scoring toward what worked before; points that keep failing validation are
//! evicted. A JSON snapshot keeps the learning across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain_types::{PositionMemoryCap, StaleFailureLimit};
use crate::gui::backend::Point;

/// Two coordinates within this distance are treated as the same spot
const MATCH_TOLERANCE_PX: f64 = 8.0;

/// One remembered coordinate with its track record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPoint {
    pub x: i32,
    pub y: i32,
    pub successes: u32,
    pub attempts: u32,
    pub consecutive_failures: u32,
    pub last_success: DateTime<Utc>,
}

impl MemoryPoint {
    fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }

    fn matches(&self, point: Point) -> bool {
        self.point().distance(point) <= MATCH_TOLERANCE_PX
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryStore {
    entries: HashMap<String, Vec<MemoryPoint>>,
}

/// Bounded adaptive memory of validated input coordinates
#[derive(Debug)]
pub struct PositionMemory {
    store: Mutex<MemoryStore>,
    cap: PositionMemoryCap,
    failure_limit: StaleFailureLimit,
    dirty: Mutex<bool>,
}

impl PositionMemory {
    /// Creates an empty memory with the given bounds
    #[must_use]
    pub fn new(cap: PositionMemoryCap, failure_limit: StaleFailureLimit) -> Self {
        Self {
            store: Mutex::new(MemoryStore::default()),
            cap,
            failure_limit,
            dirty: Mutex::new(false),
        }
    }

    /// Loads a snapshot if present; a missing or corrupt file starts empty
    #[must_use]
    pub fn load(path: &Path, cap: PositionMemoryCap, failure_limit: StaleFailureLimit) -> Self {
        let memory = Self::new(cap, failure_limit);
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<MemoryStore>(&text) {
                Ok(store) => {
                    *memory.store.lock().unwrap() = store;
                    debug!(path = %path.display(), "position memory loaded");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt position memory, starting empty");
                }
            },
            Err(_) => {}
        }
        memory
    }

    fn key(signature: &str, kind: &str) -> String {
        format!("{signature}::{kind}")
    }

    /// Records a validated input at `point`
    pub fn record_success(&self, signature: &str, kind: &str, point: Point) {
        let mut store = self.store.lock().unwrap();
        let points = store.entries.entry(Self::key(signature, kind)).or_default();
        if let Some(existing) = points.iter_mut().find(|p| p.matches(point)) {
            existing.successes += 1;
            existing.attempts += 1;
            existing.consecutive_failures = 0;
            existing.last_success = Utc::now();
        } else {
            points.push(MemoryPoint {
                x: point.x,
                y: point.y,
                successes: 1,
                attempts: 1,
                consecutive_failures: 0,
                last_success: Utc::now(),
            });
            // Evict the weakest entry once over the cap
            if points.len() > self.cap.as_usize() {
                if let Some((index, _)) = points
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| (p.successes, p.last_success))
                {
                    points.remove(index);
                }
            }
        }
        drop(store);
        *self.dirty.lock().unwrap() = true;
    }

    /// Records a failed validation at `point`; persistent failures evict it
    pub fn record_failure(&self, signature: &str, kind: &str, point: Point) {
        let mut store = self.store.lock().unwrap();
        let Some(points) = store.entries.get_mut(&Self::key(signature, kind)) else {
            return;
        };
        let limit = self.failure_limit.as_u32();
        let mut evicted = false;
        points.retain_mut(|p| {
            if p.matches(point) {
                p.attempts += 1;
                p.consecutive_failures += 1;
                if p.consecutive_failures >= limit {
                    evicted = true;
                    return false;
                }
            }
            true
        });
        drop(store);
        if evicted {
            debug!(signature, kind, x = point.x, y = point.y, "stale position evicted");
        }
        *self.dirty.lock().unwrap() = true;
    }

    /// Remembered points for a signature, strongest first
    #[must_use]
    pub fn remembered_points(&self, signature: &str, kind: &str) -> Vec<Point> {
        let store = self.store.lock().unwrap();
        let Some(points) = store.entries.get(&Self::key(signature, kind)) else {
            return Vec::new();
        };
        let mut sorted: Vec<&MemoryPoint> = points.iter().collect();
        sorted.sort_by(|a, b| b.successes.cmp(&a.successes));
        sorted.iter().map(|p| p.point()).collect()
    }

    /// Number of remembered points near `point`
    #[must_use]
    pub fn hits_near(&self, signature: &str, kind: &str, point: Point) -> usize {
        let store = self.store.lock().unwrap();
        store
            .entries
            .get(&Self::key(signature, kind))
            .map(|points| points.iter().filter(|p| p.matches(point)).count())
            .unwrap_or(0)
    }

    /// Total entries across signatures, for health reporting
    #[must_use]
    pub fn len(&self) -> usize {
        self.store
            .lock()
            .unwrap()
            .entries
            .values()
            .map(Vec::len)
            .sum()
    }

    /// True when nothing has been learned yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the snapshot when dirty; clean memories skip the write
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the file write fails.
    pub fn snapshot(&self, path: &Path) -> std::io::Result<bool> {
        {
            let mut dirty = self.dirty.lock().unwrap();
            if !*dirty {
                return Ok(false);
            }
            *dirty = false;
        }
        let json = {
            let store = self.store.lock().unwrap();
            serde_json::to_string_pretty(&*store)?
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp: PathBuf = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "position memory snapshot written");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> PositionMemory {
        PositionMemory::new(
            PositionMemoryCap::default(),
            StaleFailureLimit::default(),
        )
    }

    #[test]
    fn success_grows_memory_by_one_entry() {
        let memory = memory();
        memory.record_success("cursor", "chat_input", Point::new(500, 900));
        assert_eq!(memory.len(), 1);
        assert_eq!(
            memory.remembered_points("cursor", "chat_input"),
            vec![Point::new(500, 900)]
        );
    }

    #[test]
    fn nearby_successes_merge_into_one_point() {
        let memory = memory();
        memory.record_success("cursor", "chat_input", Point::new(500, 900));
        memory.record_success("cursor", "chat_input", Point::new(503, 898));
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.hits_near("cursor", "chat_input", Point::new(501, 899)), 1);
    }

    #[test]
    fn capacity_is_bounded_evicting_the_weakest() {
        let memory = PositionMemory::new(
            PositionMemoryCap::try_new(3).unwrap(),
            StaleFailureLimit::default(),
        );
        memory.record_success("app", "input", Point::new(0, 0));
        memory.record_success("app", "input", Point::new(0, 0));
        for i in 1..=3 {
            memory.record_success("app", "input", Point::new(i * 100, 0));
        }
        assert_eq!(memory.len(), 3);
        // The double-validated point survives
        assert_eq!(memory.hits_near("app", "input", Point::new(0, 0)), 1);
    }

    #[test]
    fn consecutive_failures_evict() {
        let memory = memory();
        let point = Point::new(400, 800);
        memory.record_success("app", "input", point);
        memory.record_failure("app", "input", point);
        memory.record_failure("app", "input", point);
        assert_eq!(memory.len(), 1, "two failures keep the point");
        memory.record_failure("app", "input", point);
        assert_eq!(memory.len(), 0, "third failure evicts");
    }

    #[test]
    fn a_success_resets_the_failure_streak() {
        let memory = memory();
        let point = Point::new(400, 800);
        memory.record_success("app", "input", point);
        memory.record_failure("app", "input", point);
        memory.record_failure("app", "input", point);
        memory.record_success("app", "input", point);
        memory.record_failure("app", "input", point);
        memory.record_failure("app", "input", point);
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn snapshot_round_trips_and_skips_clean_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let memory = memory();
        memory.record_success("cursor", "chat_input", Point::new(500, 900));

        assert!(memory.snapshot(&path).unwrap());
        // Clean memory skips the second write
        assert!(!memory.snapshot(&path).unwrap());

        let restored = PositionMemory::load(
            &path,
            PositionMemoryCap::default(),
            StaleFailureLimit::default(),
        );
        assert_eq!(
            restored.remembered_points("cursor", "chat_input"),
            vec![Point::new(500, 900)]
        );
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        std::fs::write(&path, "{not json").unwrap();
        let memory = PositionMemory::load(
            &path,
            PositionMemoryCap::default(),
            StaleFailureLimit::default(),
        );
        assert!(memory.is_empty());
    }
}
