//! Per-mapping flow locks and per-cache fetch locks.
//!
//! Flows of the same mapping are serialized regardless of direction, so a
//! forward and a back flow can never interleave their sync point reads and
//! writes. Flows of different mappings never wait on each other, except
//! while two of them fetch into the same repository cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::errors::FlowError;
use crate::models::Direction;

use super::CancellationToken;

/// How often a waiting flow re-checks its cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Registry of per-mapping locks.
#[derive(Debug, Clone, Default)]
pub struct MappingLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Held for the whole duration of a flow; releases the mapping on drop.
#[derive(Debug)]
pub struct MappingLockGuard {
    mapping: String,
    direction: Direction,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl MappingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, mapping: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(mapping.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for the mapping's lock. Gives up with `Cancelled` if the token
    /// fires while waiting.
    pub async fn acquire(
        &self,
        mapping: &str,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> Result<MappingLockGuard, FlowError> {
        let lock = self.lock_for(mapping);
        let waiting_since = Instant::now();
        loop {
            cancel.check()?;
            if let Ok(guard) = tokio::time::timeout(CANCEL_POLL, lock.clone().lock_owned()).await {
                info!(
                    mapping,
                    %direction,
                    waited_ms = waiting_since.elapsed().as_millis() as u64,
                    "mapping lock acquired"
                );
                return Ok(MappingLockGuard {
                    mapping: mapping.to_string(),
                    direction,
                    acquired_at: Instant::now(),
                    _guard: guard,
                });
            }
        }
    }

    /// Take the lock only if it is free.
    pub fn try_acquire(&self, mapping: &str, direction: Direction) -> Option<MappingLockGuard> {
        let guard = self.lock_for(mapping).try_lock_owned().ok()?;
        Some(MappingLockGuard {
            mapping: mapping.to_string(),
            direction,
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }
}

impl MappingLockGuard {
    pub fn mapping(&self) -> &str {
        &self.mapping
    }
}

impl Drop for MappingLockGuard {
    fn drop(&mut self) {
        debug!(
            mapping = %self.mapping,
            direction = %self.direction,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "mapping lock released"
        );
    }
}

/// One blocking lock per repository cache directory.
#[derive(Debug, Clone, Default)]
pub struct CacheLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl CacheLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding the cache at `path`.
    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
