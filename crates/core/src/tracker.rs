//! Dependency and sync-point tracker.
//!
//! The tracker owns the per-(mapping, direction) [`SyncPoint`] and the
//! mapping's dependency manifest entries. Sync points only move through
//! [`Tracker::commit_sync_point`], which refuses to overwrite a value that
//! changed after the caller read it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::queries::SwapOutcome;
use crate::db::Database;
use crate::errors::TrackerError;
use crate::models::{DependencyManifestEntry, Direction, SyncPoint};

/// Persistent state shared by every flow.
#[derive(Clone)]
pub struct Tracker {
    db: Arc<Database>,
}

impl Tracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The current sync point, or `None` before the first flow.
    pub fn get_sync_point(
        &self,
        mapping: &str,
        direction: Direction,
    ) -> Result<Option<SyncPoint>, TrackerError> {
        Ok(self.db.get_sync_point(mapping, direction)?)
    }

    /// Atomically replace the sync point read by the caller.
    ///
    /// `expected_generation` is the generation of the sync point the caller
    /// read (`None` if there was none). If another flow committed in the
    /// meantime the call fails with `ConcurrentModification` and nothing is
    /// written.
    pub fn commit_sync_point(
        &self,
        mapping: &str,
        direction: Direction,
        expected_generation: Option<i64>,
        source_sha: &str,
        target_sha: &str,
    ) -> Result<SyncPoint, TrackerError> {
        self.commit_sync_point_with_entries(
            mapping,
            direction,
            expected_generation,
            source_sha,
            target_sha,
            &[],
        )
    }

    /// [`commit_sync_point`](Self::commit_sync_point) that also records
    /// manifest entries. Either both are written or neither is.
    pub fn commit_sync_point_with_entries(
        &self,
        mapping: &str,
        direction: Direction,
        expected_generation: Option<i64>,
        source_sha: &str,
        target_sha: &str,
        entries: &[DependencyManifestEntry],
    ) -> Result<SyncPoint, TrackerError> {
        match self.db.swap_sync_point(
            mapping,
            direction,
            expected_generation,
            source_sha,
            target_sha,
            entries,
        )? {
            SwapOutcome::Swapped(sp) => {
                info!(
                    mapping,
                    %direction,
                    source_sha,
                    target_sha,
                    generation = sp.generation,
                    entries = entries.len(),
                    "sync point committed"
                );
                Ok(sp)
            }
            SwapOutcome::Stale { found } => {
                warn!(mapping, %direction, ?expected_generation, ?found, "sync point moved underneath flow");
                Err(TrackerError::ConcurrentModification {
                    mapping: mapping.to_string(),
                    direction: direction.to_string(),
                    expected: expected_generation,
                    found,
                })
            }
        }
    }

    /// Upsert entries keyed by package ID. Re-recording identical entries is
    /// a no-op.
    pub fn record_manifest_entries(
        &self,
        mapping: &str,
        entries: &[DependencyManifestEntry],
    ) -> Result<(), TrackerError> {
        if entries.is_empty() {
            return Ok(());
        }
        debug!(mapping, count = entries.len(), "recording manifest entries");
        self.db.upsert_manifest_entries(mapping, entries)?;
        Ok(())
    }

    pub fn manifest_entries(
        &self,
        mapping: &str,
    ) -> Result<Vec<DependencyManifestEntry>, TrackerError> {
        Ok(self.db.list_manifest_entries(mapping)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Tracker {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        Tracker::new(Arc::new(db))
    }

    #[test]
    fn test_commit_and_read() {
        let t = tracker();
        let sp = t
            .commit_sync_point("sdk", Direction::Forward, None, "src1", "vmr1")
            .unwrap();
        assert_eq!(sp.generation, 1);
        let read = t.get_sync_point("sdk", Direction::Forward).unwrap().unwrap();
        assert_eq!(read, sp);
    }

    #[test]
    fn test_stale_commit_rejected() {
        let t = tracker();
        let first = t.get_sync_point("sdk", Direction::Backward).unwrap();
        let second = t.get_sync_point("sdk", Direction::Backward).unwrap();

        t.commit_sync_point("sdk", Direction::Backward, first.map(|s| s.generation), "a", "b")
            .unwrap();
        let err = t
            .commit_sync_point("sdk", Direction::Backward, second.map(|s| s.generation), "c", "d")
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::ConcurrentModification { found: Some(1), expected: None, .. }
        ));
        let current = t.get_sync_point("sdk", Direction::Backward).unwrap().unwrap();
        assert_eq!(current.source_sha, "a");
    }

    #[test]
    fn test_stale_commit_leaves_entries_untouched() {
        let t = tracker();
        t.commit_sync_point("sdk", Direction::Forward, None, "a", "b").unwrap();
        let e = DependencyManifestEntry {
            package_id: "Acme.Tools".into(),
            version: "2.0.0".into(),
            sha: "f00".into(),
            repository_url: "https://example.com/tools".into(),
        };
        assert!(t
            .commit_sync_point_with_entries("sdk", Direction::Forward, None, "c", "d", &[e])
            .is_err());
        assert!(t.manifest_entries("sdk").unwrap().is_empty());
    }

    #[test]
    fn test_record_manifest_entries_idempotent() {
        let t = tracker();
        let e = DependencyManifestEntry {
            package_id: "Acme.Tools".into(),
            version: "2.0.0".into(),
            sha: "f00".into(),
            repository_url: "https://example.com/tools".into(),
        };
        t.record_manifest_entries("sdk", &[e.clone()]).unwrap();
        t.record_manifest_entries("sdk", &[e.clone()]).unwrap();
        assert_eq!(t.manifest_entries("sdk").unwrap(), vec![e]);
    }
}
