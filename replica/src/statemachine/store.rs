use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StateMachineResponse;
use crate::error::Result;

const MAX_REMEMBERED_RESPONSES: usize = 10_000;

/// Everything the store keeps on disk, written as one bincode image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoreImage {
    data: BTreeMap<String, String>,
    last_applied: u64,
    responses: HashMap<String, StateMachineResponse>,
    response_order: VecDeque<String>,
}

/// Key/value store backing the state machine. Changes are staged in
/// memory and made durable by `commit`, which replaces the file atomically.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    image: StoreImage,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let image = if path.exists() {
            bincode::deserialize(&fs::read(&path)?)?
        } else {
            StoreImage::default()
        };
        Ok(Store { path, image })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.image.data.get(key)
    }

    pub fn put(&mut self, key: String, value: String) -> Option<String> {
        self.image.data.insert(key, value)
    }

    pub fn delete(&mut self, key: &str) -> Option<String> {
        self.image.data.remove(key)
    }

    pub fn last_applied(&self) -> u64 {
        self.image.last_applied
    }

    pub fn set_last_applied(&mut self, index: u64) {
        self.image.last_applied = index;
    }

    pub fn response_for(&self, request_id: &str) -> Option<&StateMachineResponse> {
        self.image.responses.get(request_id)
    }

    /// Remembers the response of an applied request, evicting the oldest
    /// once the table is full.
    pub fn remember_response(&mut self, response: StateMachineResponse) {
        let id = response.request_id.clone();
        if self.image.responses.insert(id.clone(), response).is_none() {
            self.image.response_order.push_back(id);
        }
        while self.image.response_order.len() > MAX_REMEMBERED_RESPONSES {
            if let Some(oldest) = self.image.response_order.pop_front() {
                self.image.responses.remove(&oldest);
            }
        }
    }

    pub fn commit(&self) -> Result<()> {
        let bytes = bincode::serialize(&self.image)?;
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn committed_changes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.db");
        {
            let mut store = Store::open(&path).unwrap();
            store.put("k1".to_string(), "v1".to_string());
            store.put("k2".to_string(), "v2".to_string());
            store.delete("k2");
            store.set_last_applied(7);
            store.commit().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get("k1").map(String::as_str), Some("v1"));
        assert!(store.get("k2").is_none());
        assert_eq!(store.last_applied(), 7);
    }

    #[test]
    fn uncommitted_changes_are_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.db");
        {
            let mut store = Store::open(&path).unwrap();
            store.put("k1".to_string(), "v1".to_string());
        }
        let store = Store::open(&path).unwrap();
        assert!(store.get("k1").is_none());
    }

    #[test]
    fn response_table_is_bounded() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path().join("replica.db")).unwrap();
        for i in 0..(MAX_REMEMBERED_RESPONSES + 5) {
            store.remember_response(StateMachineResponse {
                request_id: format!("req-{}", i),
                request_origin: "node1".to_string(),
                success: true,
                value: None,
            });
        }
        assert!(store.response_for("req-0").is_none());
        assert!(store.response_for("req-4").is_none());
        assert!(store.response_for("req-5").is_some());
        assert!(store
            .response_for(&format!("req-{}", MAX_REMEMBERED_RESPONSES + 4))
            .is_some());
    }
}
