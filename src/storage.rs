//! Persistence handoff for finished records.
//!
//! Storage is a collaborator, not part of generation: a record whose
//! generation succeeded but whose persistence failed keeps its success
//! status with `storage_failed` set, and can be re-persisted later without
//! re-running any model call.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StorageError;
use crate::scheduler::GenerationRecord;

/// Destination for terminal generation records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one record. Must be safe to call again for the same record
    /// when storage is retried.
    async fn persist(&self, record: &GenerationRecord) -> Result<(), StorageError>;
}

/// In-memory sink, used in tests and as a buffer for embedders that export
/// in bulk.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<GenerationRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records persisted so far.
    pub fn records(&self) -> Vec<GenerationRecord> {
        self.records.lock().expect("memory sink lock").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("memory sink lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn persist(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        let mut records = self.records.lock().expect("memory sink lock");
        // A retried persist replaces the earlier copy instead of appending.
        records.retain(|r| r.item_id != record.item_id);
        records.push(record.clone());
        Ok(())
    }
}

/// Append-only JSONL file sink, one record per line.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn persist(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        let line = serde_json::to_string(record)
            .map_err(|e| StorageError::PersistFailed(e.to_string()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::PersistFailed(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::PersistFailed(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| StorageError::PersistFailed(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StorageError::PersistFailed(e.to_string()))?;

        debug!(item_id = %record.item_id, path = %self.path.display(), "Record persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ResultStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_sink_replaces_on_repersist() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();

        let mut record = GenerationRecord::new(id, ResultStatus::Success);
        record.storage_failed = true;
        sink.persist(&record).await.expect("persist");

        record.storage_failed = false;
        sink.persist(&record).await.expect("repersist");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].storage_failed);
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("genforge-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.expect("mkdir");
        let path = dir.join("records.jsonl");
        let sink = JsonlSink::new(&path);

        sink.persist(&GenerationRecord::new(Uuid::new_v4(), ResultStatus::Success))
            .await
            .expect("persist");
        sink.persist(&GenerationRecord::new(Uuid::new_v4(), ResultStatus::Error))
            .await
            .expect("persist");

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            serde_json::from_str::<serde_json::Value>(line).expect("valid json line");
        }

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }
}
