use redb::{Database, ReadableTable, TableDefinition};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
}

/// Lifecycle state of a work item.
///
/// A key maps to exactly one state at a time. Transitions are monotonic
/// except Failed->Pending (retry) and InFlight->Pending (lease reclaim).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize,
    SerdeDeserialize,
)]
pub enum ItemState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Persisted tuple for one admitted work item.
///
/// `seq` is the admission sequence number; it makes the FIFO tie-break among
/// equal priorities stable across restarts. Records are never physically
/// deleted except by [`RecordStore::reset`].
#[derive(Debug, Clone, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct FrontierRecord {
    pub key: String,
    pub payload: String,
    pub state: ItemState,
    pub priority: f64,
    pub attempts: u32,
    pub enqueued_at: u64,
    pub seq: u64,
}

impl FrontierRecord {
    pub fn new(key: String, payload: String, priority: f64, seq: u64) -> Self {
        let enqueued_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            key,
            payload,
            state: ItemState::Pending,
            priority,
            attempts: 0,
            enqueued_at,
            seq,
        }
    }
}

/// Per-state record tally, used by the drain report and inspection tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, SerdeSerialize)]
pub struct StateCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

impl std::fmt::Display for StateCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pending, {} in-flight, {} done, {} failed",
            self.pending, self.in_flight, self.done, self.failed
        )
    }
}

/// Durable record store backed by redb so the frontier survives restarts.
///
/// Each `put` commits its own write transaction; redb makes the commit
/// durable before returning, so a crash never yields a torn record - a key
/// either holds the previous value or the new one. Reads after `put` in the
/// same process are immediately consistent.
pub struct RecordStore {
    db: Arc<Database>,
}

impl RecordStore {
    const RECORDS: TableDefinition<'static, &'static str, &'static [u8]> =
        TableDefinition::new("records");

    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_path)?;

        let db_path = data_path.join("frontier.redb");
        let db = Database::create(&db_path)?;

        // Open the table once so the database creates it before use.
        let write_txn = db.begin_write()?;
        {
            let _records = write_txn.open_table(Self::RECORDS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert or overwrite the record for its key.
    pub fn put(&self, record: &FrontierRecord) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(Self::RECORDS)?;
            let serialized = rkyv::to_bytes::<_, 2048>(record)
                .map_err(|e| StoreError::Serialization(format!("Serialize failed: {}", e)))?;
            table.insert(record.key.as_str(), serialized.as_ref())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<FrontierRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::RECORDS)?;

        if let Some(bytes) = table.get(key)? {
            let mut aligned = AlignedVec::new();
            aligned.extend_from_slice(bytes.value());
            let record: FrontierRecord = unsafe { rkyv::from_bytes_unchecked(&aligned) }
                .map_err(|e| StoreError::Serialization(format!("Deserialize failed: {}", e)))?;
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::RECORDS)?;
        Ok(table.get(key)?.is_some())
    }

    /// Load every record. Used at startup to rebuild the in-memory indices
    /// and by inspection tooling; not part of the hot path.
    pub fn scan(&self) -> Result<Vec<FrontierRecord>, StoreError> {
        let mut records = Vec::new();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::RECORDS)?;

        for result in table.iter()? {
            let (_key, value) = result?;
            let mut aligned = AlignedVec::new();
            aligned.extend_from_slice(value.value());
            let record: FrontierRecord = unsafe { rkyv::from_bytes_unchecked(&aligned) }
                .map_err(|e| StoreError::Serialization(format!("Deserialize failed: {}", e)))?;
            records.push(record);
        }

        Ok(records)
    }

    pub fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        let mut counts = StateCounts::default();
        for record in self.scan()? {
            match record.state {
                ItemState::Pending => counts.pending += 1,
                ItemState::InFlight => counts.in_flight += 1,
                ItemState::Done => counts.done += 1,
                ItemState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Durability checkpoint. redb commits each write transaction durably
    /// before `put` returns, so committed records already survive a crash;
    /// this exists to mark that contract at call sites.
    pub fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Explicit compaction/reset: drop every record. The only way records
    /// are physically deleted.
    pub fn reset(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(Self::RECORDS)?;
        {
            let _records = write_txn.open_table(Self::RECORDS)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Dump every record as one JSON object per line so an operator can
    /// inspect keys, states, and priorities without the in-process API.
    pub fn export_jsonl<P: AsRef<Path>>(&self, output_path: P) -> Result<usize, StoreError> {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(output_path)?;

        let records = self.scan()?;
        for record in &records {
            let json = serde_json::to_string(record)?;
            writeln!(file, "{}", json)?;
        }

        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(key: &str, priority: f64, seq: u64) -> FrontierRecord {
        FrontierRecord::new(
            key.to_string(),
            format!("https://test.local/{}", key),
            priority,
            seq,
        )
    }

    #[test]
    fn test_store_creation() {
        let dir = TempDir::new().unwrap();
        let _store = RecordStore::open(dir.path()).unwrap();
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        let rec = record("k1", 50.0, 0);
        store.put(&rec).unwrap();

        // Immediately consistent: get after put sees the record.
        let loaded = store.get("k1").unwrap().unwrap();
        assert_eq!(loaded.key, "k1");
        assert_eq!(loaded.payload, "https://test.local/k1");
        assert_eq!(loaded.state, ItemState::Pending);
        assert_eq!(loaded.attempts, 0);

        assert!(store.contains("k1").unwrap());
        assert!(!store.contains("k2").unwrap());
    }

    #[test]
    fn test_put_overwrites_state() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        let mut rec = record("k1", 50.0, 0);
        store.put(&rec).unwrap();

        rec.state = ItemState::Done;
        rec.attempts = 2;
        store.put(&rec).unwrap();

        let loaded = store.get("k1").unwrap().unwrap();
        assert_eq!(loaded.state, ItemState::Done);
        assert_eq!(loaded.attempts, 2);
    }

    #[test]
    fn test_scan_and_count() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        let mut done = record("a", 1.0, 0);
        done.state = ItemState::Done;
        store.put(&done).unwrap();
        store.put(&record("b", 2.0, 1)).unwrap();
        store.put(&record("c", 3.0, 2)).unwrap();

        assert_eq!(store.scan().unwrap().len(), 3);

        let counts = store.count_by_state().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.done, 1);
        assert_eq!(counts.in_flight, 0);
        assert_eq!(counts.failed, 0);
    }

    #[test]
    fn test_reset_clears_records() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        store.put(&record("a", 1.0, 0)).unwrap();
        store.reset().unwrap();

        assert!(!store.contains("a").unwrap());
        assert!(store.scan().unwrap().is_empty());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RecordStore::open(dir.path()).unwrap();
            store.put(&record("a", 1.0, 0)).unwrap();
            store.flush().unwrap();
        }

        let store = RecordStore::open(dir.path()).unwrap();
        let loaded = store.get("a").unwrap().unwrap();
        assert_eq!(loaded.priority, 1.0);
    }

    #[test]
    fn test_export_jsonl() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        store.put(&record("a", 1.0, 0)).unwrap();
        store.put(&record("b", 2.0, 1)).unwrap();

        let out = dir.path().join("records.jsonl");
        let written = store.export_jsonl(&out).unwrap();
        assert_eq!(written, 2);

        let contents = std::fs::read_to_string(&out).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"state\":\"Pending\""));
    }
}
