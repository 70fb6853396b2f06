//! C2 — File Tracker: per-store map `path -> TrackedFile`, answering "what
//! changed?" and "what disappeared?" (spec.md §4.2).
//!
//! Persisted as a single JSON snapshot per store, written via
//! write-to-temp + atomic rename (spec.md §6.2), guarded by one
//! `RwLock` per store — only the indexing pipeline (C9) takes the writer
//! lock; stats/list callers (C11, C12) only ever read.

use crate::error::CoreResult;
use crate::hash::hash_content;
use crate::types::{normalize_path, TrackedFile, TrackerSnapshot};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const SNAPSHOT_VERSION: u32 = 1;

/// Result of [`FileTracker::check_changes`].
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub unchanged: Vec<String>,
    pub changed: Vec<String>,
    pub new: Vec<String>,
}

/// Aggregate stats for a store (spec.md §4.2, Stats).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackerStats {
    pub tracked_files: usize,
    pub total_size: u64,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct FileTracker {
    path: PathBuf,
    files: RwLock<BTreeMap<String, TrackedFile>>,
}

impl FileTracker {
    /// Load an existing snapshot from `dir/tracker.json`, or start empty.
    pub fn load(dir: &Path) -> CoreResult<Self> {
        let path = dir.join("tracker.json");
        let files = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let snapshot: TrackerSnapshot = serde_json::from_str(&raw)?;
            snapshot.files
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, files: RwLock::new(files) })
    }

    fn persist(&self, files: &BTreeMap<String, TrackedFile>) -> CoreResult<()> {
        let snapshot = TrackerSnapshot { version: SNAPSHOT_VERSION, files: files.clone() };
        let body = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// `CheckChanges(store, [{path, content}]) -> {unchanged, changed, new}`.
    pub fn check_changes(&self, files: &[(String, &str)]) -> ChangeSet {
        let tracked = self.files.read().unwrap_or_else(|p| p.into_inner());
        let mut result = ChangeSet::default();
        for (path, content) in files {
            let path = normalize_path(path);
            match tracked.get(&path) {
                None => result.new.push(path),
                Some(existing) => {
                    if crate::hash::matches(content, &existing.hash) {
                        result.unchanged.push(path);
                    } else {
                        result.changed.push(path);
                    }
                }
            }
        }
        result
    }

    /// `Track(store, [{path, content, chunk_ids}])`: atomic per-store write
    /// overwriting each entry and bumping `indexed_at`.
    pub fn track(&self, entries: &[(String, &str, Vec<String>)]) -> CoreResult<()> {
        let mut guard = self.files.write().unwrap_or_else(|p| p.into_inner());
        let now = chrono::Utc::now();
        for (path, content, chunk_ids) in entries {
            let path = normalize_path(path);
            guard.insert(
                path.clone(),
                TrackedFile {
                    path,
                    hash: hash_content(content),
                    size: content.len() as u64,
                    indexed_at: now,
                    chunk_ids: chunk_ids.clone(),
                },
            );
        }
        self.persist(&guard)
    }

    /// `Untrack(store, path)` — remove one entry, returning whether it
    /// existed.
    pub fn untrack(&self, path: &str) -> CoreResult<bool> {
        let path = normalize_path(path);
        let mut guard = self.files.write().unwrap_or_else(|p| p.into_inner());
        let removed = guard.remove(&path).is_some();
        if removed {
            self.persist(&guard)?;
        }
        Ok(removed)
    }

    /// `UntrackByPrefix(store, prefix)` — remove all entries under `prefix`,
    /// returning the removed paths.
    pub fn untrack_by_prefix(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let prefix = normalize_path(prefix);
        let mut guard = self.files.write().unwrap_or_else(|p| p.into_inner());
        let removed: Vec<String> =
            guard.keys().filter(|p| p.starts_with(&prefix)).cloned().collect();
        for p in &removed {
            guard.remove(p);
        }
        if !removed.is_empty() {
            self.persist(&guard)?;
        }
        Ok(removed)
    }

    /// `FindDeleted(store, current_paths) -> removed[]`: set-difference
    /// `tracked \ current`.
    pub fn find_deleted(&self, current_paths: &[String]) -> Vec<String> {
        let current: std::collections::HashSet<String> =
            current_paths.iter().map(|p| normalize_path(p)).collect();
        let guard = self.files.read().unwrap_or_else(|p| p.into_inner());
        guard.keys().filter(|p| !current.contains(*p)).cloned().collect()
    }

    /// `List(store) -> []TrackedFile`.
    pub fn list(&self) -> Vec<TrackedFile> {
        let guard = self.files.read().unwrap_or_else(|p| p.into_inner());
        guard.values().cloned().collect()
    }

    pub fn get(&self, path: &str) -> Option<TrackedFile> {
        let path = normalize_path(path);
        let guard = self.files.read().unwrap_or_else(|p| p.into_inner());
        guard.get(&path).cloned()
    }

    /// `Stats(store) -> {tracked_files, total_size, last_updated}`.
    pub fn stats(&self) -> TrackerStats {
        let guard = self.files.read().unwrap_or_else(|p| p.into_inner());
        let total_size = guard.values().map(|f| f.size).sum();
        let last_updated = guard.values().map(|f| f.indexed_at).max();
        TrackerStats { tracked_files: guard.len(), total_size, last_updated }
    }

    /// Wipe all tracked entries (used by `Reindex`, spec.md §4.8).
    pub fn clear(&self) -> CoreResult<()> {
        let mut guard = self.files.write().unwrap_or_else(|p| p.into_inner());
        guard.clear();
        self.persist(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn check_changes_classifies_new_changed_unchanged() {
        let dir = tempdir().unwrap();
        let tracker = FileTracker::load(dir.path()).unwrap();
        tracker.track(&[("a.py".into(), "def f(): pass", vec!["d1".into()])]).unwrap();

        let changes = tracker.check_changes(&[
            ("a.py".into(), "def f(): pass"),
            ("a.py".into(), "def g(): pass"),
        ]);
        // first compare is unchanged, second (same path different content)
        // is classified independently per call entry
        assert_eq!(changes.unchanged, vec!["a.py".to_string()]);
        assert_eq!(changes.changed, vec!["a.py".to_string()]);

        let changes2 = tracker.check_changes(&[("b.py".into(), "x = 1")]);
        assert_eq!(changes2.new, vec!["b.py".to_string()]);
    }

    #[test]
    fn track_persists_and_survives_reload() {
        let dir = tempdir().unwrap();
        {
            let tracker = FileTracker::load(dir.path()).unwrap();
            tracker.track(&[("a.py".into(), "x = 1", vec!["d1".into()])]).unwrap();
        }
        let tracker2 = FileTracker::load(dir.path()).unwrap();
        let entry = tracker2.get("a.py").expect("should survive reload");
        assert_eq!(entry.chunk_ids, vec!["d1".to_string()]);
    }

    #[test]
    fn untrack_by_prefix_removes_matching_paths() {
        let dir = tempdir().unwrap();
        let tracker = FileTracker::load(dir.path()).unwrap();
        tracker
            .track(&[
                ("src/x.go".into(), "package main", vec![]),
                ("src/y.go".into(), "package main", vec![]),
                ("docs/z.md".into(), "# hi", vec![]),
            ])
            .unwrap();

        let removed = tracker.untrack_by_prefix("src/").unwrap();
        assert_eq!(removed.len(), 2);
        let remaining: Vec<String> = tracker.list().into_iter().map(|f| f.path).collect();
        assert_eq!(remaining, vec!["docs/z.md".to_string()]);
    }

    #[test]
    fn find_deleted_is_set_difference() {
        let dir = tempdir().unwrap();
        let tracker = FileTracker::load(dir.path()).unwrap();
        tracker
            .track(&[("a.py".into(), "1", vec![]), ("b.py".into(), "2", vec![])])
            .unwrap();
        let deleted = tracker.find_deleted(&["a.py".to_string()]);
        assert_eq!(deleted, vec!["b.py".to_string()]);
    }

    #[test]
    fn stats_reports_totals() {
        let dir = tempdir().unwrap();
        let tracker = FileTracker::load(dir.path()).unwrap();
        tracker
            .track(&[("a.py".into(), "12345", vec![]), ("b.py".into(), "1234567890", vec![])])
            .unwrap();
        let stats = tracker.stats();
        assert_eq!(stats.tracked_files, 2);
        assert_eq!(stats.total_size, 15);
        assert!(stats.last_updated.is_some());
    }
}
