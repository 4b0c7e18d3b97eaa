use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::channel::models::{ChannelName, StatsRecord};
use crate::error::{EngineError, Result};

pub struct StatsStore {
    path: PathBuf,
    records: Mutex<HashMap<ChannelName, StatsRecord>>,
    /// In-memory only, never persisted: feeds the `lastActivity` field of
    /// the manager's introspection surface. A restart starts this fresh.
    last_activity: Mutex<HashMap<ChannelName, DateTime<Utc>>>,
}

impl StatsStore {
    /// Reads `path` if present; a missing or unparsable file is treated as
    /// an empty store.
    pub fn load(path: PathBuf) -> Self {
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            path,
            records: Mutex::new(records),
            last_activity: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> StatsRecord {
        self.records
            .lock()
            .expect("stats lock poisoned")
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<ChannelName, StatsRecord> {
        self.records.lock().expect("stats lock poisoned").clone()
    }

    pub fn last_activity(&self, name: &str) -> Option<DateTime<Utc>> {
        self.last_activity
            .lock()
            .expect("last-activity lock poisoned")
            .get(name)
            .copied()
    }

    pub fn increment_processed(&self, name: &str) -> StatsRecord {
        self.touch_activity(name);
        self.mutate(name, |r| r.processed += 1)
    }

    pub fn increment_errors(&self, name: &str) -> StatsRecord {
        self.touch_activity(name);
        self.mutate(name, |r| r.errors += 1)
    }

    fn touch_activity(&self, name: &str) {
        self.last_activity
            .lock()
            .expect("last-activity lock poisoned")
            .insert(name.to_string(), Utc::now());
    }

    /// Replaces `name`'s record outright (updates are absolute, not
    /// deltas) and flushes.
    pub fn put(&self, name: &str, record: StatsRecord) {
        self.mutate(name, |r| *r = record);
    }

    fn mutate(&self, name: &str, f: impl FnOnce(&mut StatsRecord)) -> StatsRecord {
        let (updated, snapshot) = {
            let mut guard = self.records.lock().expect("stats lock poisoned");
            let entry = guard.entry(name.to_string()).or_default();
            f(entry);
            (*entry, guard.clone())
        };

        if let Err(err) = self.flush(&snapshot) {
            tracing::warn!(channel = name, error = %err, "stats persistence error; in-memory counters remain authoritative");
        }

        updated
    }

    fn flush(&self, snapshot: &HashMap<ChannelName, StatsRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&self.path, text).map_err(|source| EngineError::IoWrite {
            path: self.path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "localbridge-stats-test-{name}-{}.json",
            std::process::id()
        ))
    }

    #[test]
    fn missing_file_starts_empty() {
        let path = scratch_path("missing");
        let _ = fs::remove_file(&path);
        let store = StatsStore::load(path.clone());
        assert_eq!(store.get("X").processed, 0);
    }

    #[test]
    fn round_trips_through_disk() {
        let path = scratch_path("roundtrip");
        let _ = fs::remove_file(&path);

        let store = StatsStore::load(path.clone());
        store.increment_processed("A");
        store.increment_processed("A");
        store.increment_errors("A");

        let reloaded = StatsStore::load(path.clone());
        let rec = reloaded.get("A");
        assert_eq!(rec.processed, 2);
        assert_eq!(rec.errors, 1);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn last_activity_is_set_on_increment_but_not_persisted() {
        let path = scratch_path("activity");
        let _ = fs::remove_file(&path);

        let store = StatsStore::load(path.clone());
        assert!(store.last_activity("A").is_none());
        store.increment_processed("A");
        assert!(store.last_activity("A").is_some());

        let reloaded = StatsStore::load(path.clone());
        assert!(reloaded.last_activity("A").is_none());
        assert_eq!(reloaded.get("A").processed, 1);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn updates_are_absolute_not_deltas() {
        let path = scratch_path("absolute");
        let _ = fs::remove_file(&path);

        let store = StatsStore::load(path.clone());
        store.put("A", StatsRecord { processed: 5, errors: 1 });
        store.put("A", StatsRecord { processed: 5, errors: 1 });
        assert_eq!(store.get("A").processed, 5);

        fs::remove_file(&path).unwrap();
    }
}
