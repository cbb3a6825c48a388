//! Write-ahead log
//!
//! Entries are kept in memory for the retained window and mirrored into
//! segment files on disk. Everything at or below `snapshot_index` has been
//! folded into a state machine snapshot and can no longer be read here.

mod segment;

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use segment::Segment;

const SEGMENT_CAPACITY: u64 = 4096; // entries per segment file
const META_FILE: &str = "wal.meta";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: String,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: impl Into<String>) -> Self {
        LogEntry {
            index,
            term,
            command: command.into(),
        }
    }
}

/// Durable bookkeeping stored next to the segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalMeta {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
}

pub struct Wal {
    dir: PathBuf,
    segments: BTreeMap<u64, Segment>,
    entries: VecDeque<LogEntry>,
    meta: WalMeta,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta_path = dir.join(META_FILE);
        let meta: WalMeta = if meta_path.exists() {
            bincode::deserialize(&fs::read(&meta_path)?)?
        } else {
            WalMeta::default()
        };

        let mut segment_files: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let start = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix("segment_")?
                    .strip_suffix(".log")?
                    .parse::<u64>()
                    .ok()?;
                Some((start, path))
            })
            .collect();
        segment_files.sort_by_key(|(start, _)| *start);

        let mut wal = Wal {
            dir,
            segments: BTreeMap::new(),
            entries: VecDeque::new(),
            meta,
        };

        for (start, path) in segment_files {
            let mut segment = Segment::new(&path, start)?;
            let obsolete = segment.get_end_index() <= wal.meta.snapshot_index
                || start > wal.latest_index() + 1;
            if obsolete {
                if start > wal.latest_index() + 1 {
                    log::warn!("wal segment {:?} is not contiguous, discarding", path);
                }
                segment.clear()?;
                continue;
            }
            for index in start..=segment.get_end_index() {
                let entry: LogEntry = bincode::deserialize(&segment.read_entry(index)?)?;
                if entry.index == wal.latest_index() + 1 {
                    wal.entries.push_back(entry);
                }
            }
            wal.segments.insert(start, segment);
        }

        log::info!(
            "wal opened: snapshot index {}, latest index {}",
            wal.meta.snapshot_index,
            wal.latest_index()
        );
        Ok(wal)
    }

    fn persist_meta(&self) -> Result<()> {
        let bytes = bincode::serialize(&self.meta)?;
        let temp_path = self.dir.join("wal.meta.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.dir.join(META_FILE))?;
        Ok(())
    }

    pub fn meta(&self) -> &WalMeta {
        &self.meta
    }

    /// Durably records the local term and vote.
    pub fn save_hard_state(&mut self, term: u64, voted_for: Option<String>) -> Result<()> {
        if self.meta.current_term == term && self.meta.voted_for == voted_for {
            return Ok(());
        }
        self.meta.current_term = term;
        self.meta.voted_for = voted_for;
        self.persist_meta()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.meta.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.meta.snapshot_term
    }

    /// First index still readable from the log.
    pub fn earliest_index(&self) -> u64 {
        self.meta.snapshot_index + 1
    }

    pub fn latest_index(&self) -> u64 {
        self.meta.snapshot_index + self.entries.len() as u64
    }

    pub fn latest_term(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.meta.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.meta.snapshot_index {
            return None;
        }
        self.entries
            .get((index - self.meta.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 and the snapshot boundary are
    /// answered from bookkeeping. `None` when compacted away or not present.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.meta.snapshot_index {
            return Some(self.meta.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: u64, max: usize) -> Result<Vec<LogEntry>> {
        if start <= self.meta.snapshot_index {
            return Err(Error::Compacted(start));
        }
        let offset = (start - self.meta.snapshot_index - 1) as usize;
        Ok(self.entries.iter().skip(offset).take(max).cloned().collect())
    }

    /// Entries in `[start, end]`, used by the apply loop.
    pub fn range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>> {
        if end < start {
            return Ok(Vec::new());
        }
        self.entries_from(start, (end - start + 1) as usize)
    }

    fn segment_for_append(&mut self, index: u64) -> Result<&mut Segment> {
        let reuse = match self.segments.iter().next_back() {
            Some((_, segment)) => {
                segment.get_end_index() + 1 == index && segment.len() < SEGMENT_CAPACITY
            }
            None => false,
        };
        if !reuse {
            let path = self.dir.join(format!("segment_{}.log", index));
            let segment = Segment::new(path, index)?;
            self.segments.insert(index, segment);
        }
        let (_, segment) = self
            .segments
            .iter_mut()
            .next_back()
            .ok_or_else(|| Error::Config("wal has no writable segment".to_string()))?;
        Ok(segment)
    }

    /// Appends entries that must directly follow the current last index.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        for entry in entries {
            let expected = self.latest_index() + 1;
            if entry.index != expected {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("wal append out of order: got {}, expected {}", entry.index, expected),
                )));
            }
            let bytes = bincode::serialize(&entry)?;
            self.segment_for_append(entry.index)?.append(&[bytes])?;
            self.entries.push_back(entry);
        }
        Ok(())
    }

    /// Appends a new command under `term` and returns its index.
    pub fn append_command(&mut self, term: u64, command: String) -> Result<u64> {
        let index = self.latest_index() + 1;
        self.append(vec![LogEntry::new(index, term, command)])?;
        Ok(index)
    }

    /// Removes every entry at or after `index`.
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index <= self.meta.snapshot_index {
            return Err(Error::Compacted(index));
        }
        if index > self.latest_index() {
            return Ok(());
        }
        self.entries
            .truncate((index - self.meta.snapshot_index - 1) as usize);

        let doomed: Vec<u64> = self.segments.range(index..).map(|(s, _)| *s).collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.clear()?;
            }
        }
        if let Some((_, segment)) = self.segments.range_mut(..index).next_back() {
            segment.truncate_after(index - 1)?;
        }
        Ok(())
    }

    /// Drops entries up to and including `index`, remembering its term as
    /// the new snapshot boundary.
    pub fn compact_until(&mut self, index: u64) -> Result<()> {
        if index <= self.meta.snapshot_index {
            return Ok(());
        }
        let term = self.term_at(index).ok_or(Error::Compacted(index))?;
        let drop_count = (index - self.meta.snapshot_index) as usize;
        self.entries.drain(..drop_count);
        self.meta.snapshot_index = index;
        self.meta.snapshot_term = term;
        self.persist_meta()?;

        let doomed: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.get_end_index() <= index)
            .map(|(start, _)| *start)
            .collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.clear()?;
            }
        }
        Ok(())
    }

    /// Discards the whole log and restarts it right after a snapshot
    /// boundary received from the leader.
    pub fn reset_to(&mut self, index: u64, term: u64) -> Result<()> {
        self.entries.clear();
        let starts: Vec<u64> = self.segments.keys().cloned().collect();
        for start in starts {
            if let Some(segment) = self.segments.remove(&start) {
                segment.clear()?;
            }
        }
        self.meta.snapshot_index = index;
        self.meta.snapshot_term = term;
        self.persist_meta()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fill(wal: &mut Wal, term: u64, count: u64) {
        for i in 0..count {
            wal.append_command(term, format!("cmd-{}", i)).unwrap();
        }
    }

    #[test]
    fn empty_wal_bookkeeping() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.earliest_index(), 1);
        assert_eq!(wal.latest_index(), 0);
        assert_eq!(wal.latest_term(), 0);
        assert_eq!(wal.term_at(0), Some(0));
        assert_eq!(wal.term_at(1), None);
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        fill(&mut wal, 1, 3);
        fill(&mut wal, 2, 2);

        assert_eq!(wal.latest_index(), 5);
        assert_eq!(wal.latest_term(), 2);
        assert_eq!(wal.term_at(3), Some(1));
        assert_eq!(wal.get(4).unwrap().command, "cmd-0");

        let entries = wal.entries_from(2, 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[1].index, 3);
    }

    #[test]
    fn rejects_out_of_order_append() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        assert!(wal.append(vec![LogEntry::new(2, 1, "gap")]).is_err());
        assert_eq!(wal.latest_index(), 0);
    }

    #[test]
    fn truncate_removes_suffix() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        fill(&mut wal, 1, 5);

        wal.truncate_from(3).unwrap();
        assert_eq!(wal.latest_index(), 2);
        assert!(wal.get(3).is_none());

        wal.append_command(2, "new".to_string()).unwrap();
        assert_eq!(wal.term_at(3), Some(2));
    }

    #[test]
    fn survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut wal = Wal::open(dir.path()).unwrap();
            fill(&mut wal, 1, 4);
            wal.truncate_from(4).unwrap();
            wal.save_hard_state(3, Some("node2".to_string())).unwrap();
        }

        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.latest_index(), 3);
        assert_eq!(wal.meta().current_term, 3);
        assert_eq!(wal.meta().voted_for.as_deref(), Some("node2"));
    }

    #[test]
    fn compaction_moves_earliest_index() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        fill(&mut wal, 1, 10);

        wal.compact_until(6).unwrap();
        assert_eq!(wal.earliest_index(), 7);
        assert_eq!(wal.latest_index(), 10);
        assert_eq!(wal.term_at(6), Some(1));
        assert_eq!(wal.term_at(5), None);
        assert!(matches!(wal.entries_from(5, 1), Err(Error::Compacted(5))));
        assert_eq!(wal.entries_from(7, 10).unwrap().len(), 4);

        drop(wal);
        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.earliest_index(), 7);
        assert_eq!(wal.latest_index(), 10);
        assert_eq!(wal.get(7).unwrap().command, "cmd-6");
    }

    #[test]
    fn reset_restarts_after_snapshot_boundary() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        fill(&mut wal, 1, 3);

        wal.reset_to(100, 4).unwrap();
        assert_eq!(wal.latest_index(), 100);
        assert_eq!(wal.latest_term(), 4);
        assert_eq!(wal.earliest_index(), 101);

        wal.append(vec![LogEntry::new(101, 5, "after")]).unwrap();
        drop(wal);

        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.latest_index(), 101);
        assert_eq!(wal.term_at(100), Some(4));
        assert_eq!(wal.term_at(101), Some(5));
    }
}
