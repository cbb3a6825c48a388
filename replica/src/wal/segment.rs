use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 16; // 8 bytes for start_index + 8 bytes for end_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

/// One file of the write-ahead log holding a contiguous run of entries
/// starting at `start_index`.
#[derive(Debug)]
pub struct Segment {
    file: File,
    start_index: u64,
    end_index: u64,
    path: PathBuf,
    entry_positions: BTreeMap<u64, u64>, // index -> file position
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    start_index: u64,
    end_index: u64,
}

impl Segment {
    pub fn new<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            start_index,
            end_index: start_index - 1,
            path: path.as_ref().to_path_buf(),
            entry_positions: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_entry_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            start_index: self.start_index,
            end_index: self.end_index,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.start_index = header.start_index;
        self.end_index = header.end_index;
        Ok(())
    }

    fn write_entry_header(&mut self, size: u64) -> io::Result<()> {
        self.file.write_all(&size.to_le_bytes())?;
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    /// Scans the file body; a torn trailing record left by a crash is cut off.
    fn rebuild_entry_positions(&mut self) -> io::Result<()> {
        self.entry_positions.clear();
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + ENTRY_HEADER_SIZE <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            if pos + ENTRY_HEADER_SIZE + entry_size > len {
                break;
            }
            let entry_index = self.start_index + (self.entry_positions.len() as u64);
            self.entry_positions.insert(entry_index, pos);
            pos += ENTRY_HEADER_SIZE + entry_size;
        }

        if pos < len {
            log::warn!(
                "segment {:?} has a torn tail at {}, truncating",
                self.path,
                pos
            );
            self.file.set_len(pos)?;
        }
        self.end_index = self.start_index + self.entry_positions.len() as u64 - 1;
        self.write_header()?;
        Ok(())
    }

    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;

        for entry in entries {
            let entry_size = entry.len() as u64;
            self.write_entry_header(entry_size)?;
            self.file.write_all(entry)?;

            let entry_index = self.end_index + 1;
            self.entry_positions.insert(entry_index, pos);
            self.end_index = entry_index;
            pos += ENTRY_HEADER_SIZE + entry_size;
        }

        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.start_index || index > self.end_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let pos = *self.entry_positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Entry position not found")
        })?;

        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Keeps entries up to and including `index`, dropping the rest.
    pub fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        if index >= self.end_index {
            return Ok(());
        }

        let cut = match self.entry_positions.get(&(index + 1)) {
            Some(pos) => *pos,
            None => HEADER_SIZE,
        };
        self.file.set_len(cut)?;
        let _ = self.entry_positions.split_off(&(index + 1));
        self.end_index = index.max(self.start_index - 1);
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Deletes the backing file.
    pub fn clear(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub fn get_start_index(&self) -> u64 {
        self.start_index
    }

    pub fn get_end_index(&self) -> u64 {
        self.end_index
    }

    pub fn len(&self) -> u64 {
        self.end_index + 1 - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn entries(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|i| i.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_segment_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let segment = Segment::new(temp_file.path(), 1).unwrap();

        assert_eq!(segment.get_start_index(), 1);
        assert_eq!(segment.get_end_index(), 0);
        assert!(segment.is_empty());
    }

    #[test]
    fn test_segment_append() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::new(temp_file.path(), 1).unwrap();

        segment
            .append(&entries(&["first entry", "second entry"]))
            .unwrap();

        assert_eq!(segment.get_end_index(), 2);
        assert_eq!(segment.len(), 2);
        assert!(!segment.is_empty());

        assert_eq!(segment.read_entry(1).unwrap(), b"first entry");
        assert_eq!(segment.read_entry(2).unwrap(), b"second entry");
    }

    #[test]
    fn test_segment_truncate() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::new(temp_file.path(), 1).unwrap();

        segment
            .append(&entries(&["first entry", "second entry", "third entry"]))
            .unwrap();

        segment.truncate_after(2).unwrap();
        assert_eq!(segment.get_end_index(), 2);

        assert_eq!(segment.read_entry(1).unwrap(), b"first entry");
        assert_eq!(segment.read_entry(2).unwrap(), b"second entry");
        assert!(segment.read_entry(3).is_err());

        // appends continue right after the cut
        segment.append(&entries(&["replacement"])).unwrap();
        assert_eq!(segment.read_entry(3).unwrap(), b"replacement");
    }

    #[test]
    fn test_segment_truncate_everything() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::new(temp_file.path(), 5).unwrap();
        segment.append(&entries(&["a", "b"])).unwrap();

        segment.truncate_after(4).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.get_end_index(), 4);
    }

    #[test]
    fn test_segment_reopen() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let mut segment = Segment::new(temp_file.path(), 10).unwrap();
            segment.append(&entries(&["ten", "eleven"])).unwrap();
        }

        let mut segment = Segment::new(temp_file.path(), 10).unwrap();
        assert_eq!(segment.get_start_index(), 10);
        assert_eq!(segment.get_end_index(), 11);
        assert_eq!(segment.read_entry(11).unwrap(), b"eleven");
    }

    #[test]
    fn test_segment_reopen_drops_torn_tail() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let mut segment = Segment::new(temp_file.path(), 1).unwrap();
            segment.append(&entries(&["whole"])).unwrap();
        }
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(temp_file.path())
                .unwrap();
            // length prefix promising more bytes than follow
            file.write_all(&100u64.to_le_bytes()).unwrap();
            file.write_all(b"part").unwrap();
        }

        let mut segment = Segment::new(temp_file.path(), 1).unwrap();
        assert_eq!(segment.get_end_index(), 1);
        assert_eq!(segment.read_entry(1).unwrap(), b"whole");
    }
}
