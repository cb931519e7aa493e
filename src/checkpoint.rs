//! Per-consumer resume positions.
//!
//! A checkpoint records the global position of the last event a named
//! consumer fully processed; on restart the consumer resumes strictly after
//! it. Absence means "never ran" and resumes from the start of the log.
//! Because delivery is at-least-once and handlers are idempotent by
//! contract, losing a checkpoint is safe (the consumer reprocesses) while
//! corrupting one silently would not be -- so the file store writes
//! temp-then-rename and treats unreadable files as absent, loudly.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// Persistent map from consumer name to last processed global position.
///
/// # Contract
///
/// * `None` from [`get_checkpoint`](Self::get_checkpoint) means the
///   consumer has never stored a position; it starts from the beginning.
/// * Positions are written by exactly one owner per consumer name; the
///   store does not arbitrate concurrent writers.
/// * Overwrites with any position are accepted -- operators rewind
///   consumers on purpose to rebuild read models.
/// * An empty consumer name is rejected with
///   [`CheckpointError::EmptyConsumerName`].
pub trait CheckpointStore: Send + Sync {
    /// Read the last processed position for `consumer`.
    fn get_checkpoint(
        &self,
        consumer: &str,
    ) -> impl Future<Output = Result<Option<u64>, CheckpointError>> + Send;

    /// Record `position` as the last processed position for `consumer`.
    fn store_checkpoint(
        &self,
        consumer: &str,
        position: u64,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;
}

pub(crate) fn validate_consumer_name(consumer: &str) -> Result<(), CheckpointError> {
    if consumer.is_empty() {
        return Err(CheckpointError::EmptyConsumerName);
    }
    Ok(())
}

/// On-disk checkpoint format: one small JSON file per consumer.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    position: u64,
}

/// [`CheckpointStore`] backed by one JSON file per consumer.
///
/// Writes go to a `.tmp` sibling and are renamed into place, so a crash
/// mid-write leaves the previous checkpoint intact. A file that exists but
/// does not parse is logged and read as absent: the consumer rebuilds,
/// which at-least-once delivery makes safe.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn checkpoint_path(&self, consumer: &str) -> PathBuf {
        self.dir.join(format!("{consumer}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn get_checkpoint(&self, consumer: &str) -> Result<Option<u64>, CheckpointError> {
        validate_consumer_name(consumer)?;
        let path = self.checkpoint_path(consumer);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::Io(e)),
        };
        match serde_json::from_slice::<CheckpointRecord>(&bytes) {
            Ok(record) => Ok(Some(record.position)),
            Err(error) => {
                tracing::warn!(
                    consumer,
                    path = %path.display(),
                    error = %error,
                    "corrupt checkpoint file, consumer will rebuild from the start"
                );
                Ok(None)
            }
        }
    }

    async fn store_checkpoint(&self, consumer: &str, position: u64) -> Result<(), CheckpointError> {
        validate_consumer_name(consumer)?;
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec_pretty(&CheckpointRecord { position })
            .map_err(CheckpointError::Codec)?;
        let path = self.checkpoint_path(consumer);
        let tmp = self.dir.join(format!("{consumer}.json.tmp"));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// [`CheckpointStore`] backed by a shared in-memory map.
///
/// For tests and consumers that are rebuilt on every start. `Clone` shares
/// the map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    positions: Arc<Mutex<HashMap<String, u64>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_checkpoint(&self, consumer: &str) -> Result<Option<u64>, CheckpointError> {
        validate_consumer_name(consumer)?;
        let positions = self
            .positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(positions.get(consumer).copied())
    }

    async fn store_checkpoint(&self, consumer: &str, position: u64) -> Result<(), CheckpointError> {
        validate_consumer_name(consumer)?;
        let mut positions = self
            .positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        positions.insert(consumer.to_owned(), position);
        Ok(())
    }
}
