//! Replicated state machine
//!
//! Applies committed log entries to the key/value [`Store`] and produces
//! gzip-compressed point-in-time snapshots of it.

mod store;

pub use store::Store;

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::wal::LogEntry;

pub const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    Get { key: String },
}

/// A client command travelling through relay and the leader's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineOperation {
    pub request_id: String,
    pub request_origin: String,
    pub command: Command,
}

impl StateMachineOperation {
    pub fn new(request_origin: impl Into<String>, command: Command) -> Self {
        StateMachineOperation {
            request_id: uuid::Uuid::new_v4().to_string(),
            request_origin: request_origin.into(),
            command,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineResponse {
    pub request_id: String,
    pub request_origin: String,
    pub success: bool,
    pub value: Option<String>,
}

impl StateMachineResponse {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// An applied entry paired with the response it produced.
#[derive(Debug, Clone)]
pub struct Applied {
    pub index: u64,
    pub response: StateMachineResponse,
}

pub struct StateMachine {
    dir: PathBuf,
    db_file: String,
    store: Store,
}

impl StateMachine {
    pub fn open<P: AsRef<Path>>(dir: P, db_file: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(SNAPSHOT_DIR))?;
        let store = Store::open(dir.join(db_file))?;
        Ok(StateMachine {
            dir,
            db_file: db_file.to_string(),
            store,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn last_applied(&self) -> u64 {
        self.store.last_applied()
    }

    fn execute(&mut self, op: &StateMachineOperation) -> StateMachineResponse {
        if let Some(previous) = self.store.response_for(&op.request_id) {
            log::debug!("request {} already applied, reusing response", op.request_id);
            return previous.clone();
        }

        let (success, value) = match &op.command {
            Command::Put { key, value } => {
                self.store.put(key.clone(), value.clone());
                (true, Some(value.clone()))
            }
            Command::Delete { key } => {
                let removed = self.store.delete(key);
                (removed.is_some(), removed)
            }
            Command::Get { key } => {
                let value = self.store.get(key).cloned();
                (value.is_some(), value)
            }
        };

        let response = StateMachineResponse {
            request_id: op.request_id.clone(),
            request_origin: op.request_origin.clone(),
            success,
            value,
        };
        self.store.remember_response(response.clone());
        response
    }

    /// Applies entries in index order and commits them as one batch.
    /// Entries at or below `last_applied` are skipped; empty commands are
    /// leader no-ops and produce no response.
    pub fn apply_entries(&mut self, entries: &[LogEntry]) -> Result<Vec<Applied>> {
        let mut applied = Vec::new();
        for entry in entries {
            if entry.index <= self.store.last_applied() {
                continue;
            }
            if !entry.command.is_empty() {
                match StateMachineOperation::decode(&entry.command) {
                    Ok(op) => applied.push(Applied {
                        index: entry.index,
                        response: self.execute(&op),
                    }),
                    Err(e) => {
                        log::error!("failed to decode command at index {}: {}", entry.index, e);
                    }
                }
            }
            self.store.set_last_applied(entry.index);
        }
        self.store.commit()?;
        Ok(applied)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_DIR)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.snapshot_dir()
            .join(format!("{}_{}", self.db_file, uuid::Uuid::new_v4()))
    }

    /// Writes a gzip copy of the committed store and returns its path.
    pub fn snapshot(&mut self) -> Result<PathBuf> {
        self.store.commit()?;
        let path = self.snapshot_path();

        let mut source = BufReader::new(File::open(self.store.path())?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&path)?), Compression::default());
        io::copy(&mut source, &mut encoder)?;
        let writer = encoder.finish()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        log::info!(
            "snapshot {:?} taken at index {}",
            path,
            self.store.last_applied()
        );
        Ok(path)
    }

    /// Persists snapshot bytes received from the leader so they can be
    /// replayed.
    pub fn save_received_snapshot(&self, data: &[u8]) -> Result<PathBuf> {
        let path = self.snapshot_path();
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Replaces the store with the contents of a snapshot file. The current
    /// store is dropped, its file overwritten and then reopened.
    pub fn replay(&mut self, snapshot_path: &Path) -> Result<()> {
        let db_path = self.store.path().to_path_buf();
        let temp_path = db_path.with_extension("restore");

        let mut decoder = GzDecoder::new(BufReader::new(File::open(snapshot_path)?));
        {
            let mut target = BufWriter::new(File::create(&temp_path)?);
            io::copy(&mut decoder, &mut target)?;
            target.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        // validate before swapping the live file
        Store::open(&temp_path)?;
        fs::rename(&temp_path, &db_path)?;
        self.store = Store::open(&db_path)?;

        log::info!(
            "replayed snapshot {:?}, last applied is now {}",
            snapshot_path,
            self.store.last_applied()
        );
        Ok(())
    }

    /// Deletes every snapshot file except `keep`.
    pub fn prune_snapshots(&self, keep: &Path) -> Result<()> {
        for entry in fs::read_dir(self.snapshot_dir())? {
            let path = entry?.path();
            if path != keep {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(origin: &str, key: &str, value: &str) -> StateMachineOperation {
        StateMachineOperation::new(
            origin,
            Command::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
        )
    }

    fn entry(index: u64, op: &StateMachineOperation) -> LogEntry {
        LogEntry::new(index, 1, op.encode().unwrap())
    }

    #[test]
    fn applies_commands_in_order() {
        let dir = tempdir().unwrap();
        let mut sm = StateMachine::open(dir.path(), "replica.db").unwrap();

        let set = put("node1", "k", "1");
        let get = StateMachineOperation::new("node2", Command::Get { key: "k".to_string() });
        let delete = StateMachineOperation::new("node1", Command::Delete { key: "k".to_string() });

        let applied = sm
            .apply_entries(&[entry(1, &set), entry(2, &get), entry(3, &delete)])
            .unwrap();

        assert_eq!(applied.len(), 3);
        assert_eq!(applied[1].response.value.as_deref(), Some("1"));
        assert_eq!(applied[1].response.request_origin, "node2");
        assert!(applied[2].response.success);
        assert!(sm.store().get("k").is_none());
        assert_eq!(sm.last_applied(), 3);
    }

    #[test]
    fn skips_already_applied_and_noop_entries() {
        let dir = tempdir().unwrap();
        let mut sm = StateMachine::open(dir.path(), "replica.db").unwrap();
        let op = put("node1", "k", "1");

        sm.apply_entries(&[LogEntry::new(1, 1, ""), entry(2, &op)])
            .unwrap();
        let again = sm.apply_entries(&[entry(2, &op)]).unwrap();

        assert!(again.is_empty());
        assert_eq!(sm.last_applied(), 2);
    }

    #[test]
    fn duplicate_request_is_applied_once() {
        let dir = tempdir().unwrap();
        let mut sm = StateMachine::open(dir.path(), "replica.db").unwrap();

        let first = put("node1", "k", "1");
        let overwrite = put("node1", "k", "2");
        let mut retried = first.clone();
        retried.command = Command::Put {
            key: "k".to_string(),
            value: "stale".to_string(),
        };

        let applied = sm
            .apply_entries(&[entry(1, &first), entry(2, &overwrite), entry(3, &retried)])
            .unwrap();

        assert_eq!(applied.len(), 3);
        assert_eq!(applied[2].response, applied[0].response);
        assert_eq!(sm.store().get("k").map(String::as_str), Some("2"));
    }

    #[test]
    fn snapshot_round_trip_restores_content() {
        let dir = tempdir().unwrap();
        let mut sm = StateMachine::open(dir.path(), "replica.db").unwrap();
        sm.apply_entries(&[entry(1, &put("node1", "a", "1")), entry(2, &put("node1", "b", "2"))])
            .unwrap();

        let snapshot = sm.snapshot().unwrap();
        let name = snapshot.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("replica.db_"));

        sm.apply_entries(&[entry(3, &put("node1", "a", "changed"))])
            .unwrap();
        sm.replay(&snapshot).unwrap();

        assert_eq!(sm.last_applied(), 2);
        assert_eq!(sm.store().get("a").map(String::as_str), Some("1"));
        assert_eq!(sm.store().get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn received_snapshot_replays_on_other_node() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let mut leader = StateMachine::open(leader_dir.path(), "replica.db").unwrap();
        let mut follower = StateMachine::open(follower_dir.path(), "replica.db").unwrap();

        leader
            .apply_entries(&[entry(1, &put("node1", "x", "42"))])
            .unwrap();
        let bytes = fs::read(leader.snapshot().unwrap()).unwrap();

        let path = follower.save_received_snapshot(&bytes).unwrap();
        follower.replay(&path).unwrap();
        follower.prune_snapshots(&path).unwrap();

        assert_eq!(follower.last_applied(), 1);
        assert_eq!(follower.store().get("x").map(String::as_str), Some("42"));
        assert_eq!(fs::read_dir(follower.snapshot_dir()).unwrap().count(), 1);
    }

    #[test]
    fn operation_wire_format() {
        let op = put("node2", "k", "v");
        let encoded = op.encode().unwrap();
        assert!(encoded.contains(r#""action":"put""#));
        assert_eq!(StateMachineOperation::decode(&encoded).unwrap(), op);
    }
}
