//! Durable per-task completion records.
//!
//! Records live in a sled tree keyed by task id. Each record carries a fingerprint of the
//! task's declared inputs and outputs, so deciding whether a task can be skipped is a
//! comparison between the stored record and the current file metadata.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::debug;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::config::defs::PipelineError;
use crate::pipelines::graph::TaskStatus;

const CHECKPOINT_TREE: &str = "checkpoints";

/// Size and modification time of one declared path at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub path: String,
    pub len: u64,
    /// Nanoseconds since the epoch; `None` when the path does not exist.
    pub mtime_nanos: Option<u64>,
}

impl FileStamp {
    pub fn of(path: &Path) -> FileStamp {
        let meta = std::fs::metadata(path).ok();
        let mtime_nanos = meta
            .as_ref()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64);
        FileStamp {
            path: path.to_string_lossy().into_owned(),
            len: meta.map(|m| m.len()).unwrap_or(0),
            mtime_nanos,
        }
    }

    pub fn exists(&self) -> bool {
        self.mtime_nanos.is_some()
    }
}

pub fn fingerprint(paths: &[PathBuf]) -> Vec<FileStamp> {
    paths.iter().map(|p| FileStamp::of(p)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub status: TaskStatus,
    pub inputs: Vec<FileStamp>,
    pub outputs: Vec<FileStamp>,
    /// Unix seconds at which the record was written.
    pub timestamp: i64,
}

impl CheckpointRecord {
    pub fn new(status: TaskStatus, inputs: Vec<FileStamp>, outputs: Vec<FileStamp>) -> Self {
        CheckpointRecord {
            status,
            inputs,
            outputs,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(String),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

/// Decides whether a stored record still vouches for the current files.
///
/// # Arguments
///
/// * `record` - Stored record for the task, if any.
/// * `inputs` - Current fingerprint of the declared inputs.
/// * `outputs` - Current fingerprint of the declared outputs.
///
/// # Returns
///
/// `Freshness::Fresh` only when the record is complete, every output exists unchanged, the
/// inputs are unchanged, and no input is newer than the oldest output.
pub fn freshness(record: Option<&CheckpointRecord>, inputs: &[FileStamp], outputs: &[FileStamp]) -> Freshness {
    let Some(record) = record else {
        return Freshness::Stale("no checkpoint".to_string());
    };
    if record.status != TaskStatus::Complete {
        return Freshness::Stale(format!("last recorded status {}", record.status.as_str()));
    }
    if let Some(missing) = outputs.iter().find(|o| !o.exists()) {
        return Freshness::Stale(format!("output {} missing", missing.path));
    }
    if record.outputs != outputs {
        return Freshness::Stale("outputs changed since checkpoint".to_string());
    }
    if record.inputs != inputs {
        return Freshness::Stale("inputs changed since checkpoint".to_string());
    }
    let newest_input = inputs.iter().filter_map(|i| i.mtime_nanos).max();
    let oldest_output = outputs.iter().filter_map(|o| o.mtime_nanos).min();
    if let (Some(input), Some(output)) = (newest_input, oldest_output) {
        if input > output {
            return Freshness::Stale("an input is newer than an output".to_string());
        }
    }
    Freshness::Fresh
}

#[derive(Clone)]
pub struct CheckpointStore {
    db: Db,
    tree: Tree,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// In-memory store, discarded on drop.
    pub fn temporary() -> Result<Self, PipelineError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, PipelineError> {
        let tree = db.open_tree(CHECKPOINT_TREE)?;
        Ok(CheckpointStore { db, tree })
    }

    pub fn get(&self, task_id: &str) -> Result<Option<CheckpointRecord>, PipelineError> {
        let Some(bytes) = self.tree.get(task_id.as_bytes())? else {
            return Ok(None);
        };
        let config = bincode::config::standard();
        match bincode::serde::decode_from_slice::<CheckpointRecord, _>(&bytes, config) {
            Ok((record, _)) => Ok(Some(record)),
            Err(e) => {
                // unreadable records are treated as absent; the task reruns
                debug!("Discarding undecodable checkpoint for {}: {}", task_id, e);
                Ok(None)
            }
        }
    }

    /// Writes and flushes the record. Returns only once it is durable.
    pub async fn put(&self, task_id: &str, record: &CheckpointRecord) -> Result<(), PipelineError> {
        let config = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(record, config)
            .map_err(|e| PipelineError::Checkpoint(format!("Cannot encode checkpoint for {}: {}", task_id, e)))?;
        self.tree.insert(task_id.as_bytes(), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    pub async fn remove(&self, task_id: &str) -> Result<(), PipelineError> {
        if self.tree.remove(task_id.as_bytes())?.is_some() {
            self.db.flush_async().await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
