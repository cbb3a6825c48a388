//! Consensus RPC messages and their protobuf conversions
//!
//! The engine works with these unsigned, owned types; the gRPC layer maps
//! them onto the `int64` wire fields.

use super::pb;
use crate::wal::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicates log entries; with no entries it is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntryRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntryResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

// Wire fields are signed; negative values never come from a well-behaved
// peer and are clamped to zero.
fn to_u64(v: i64) -> u64 {
    v.max(0) as u64
}

fn to_i64(v: u64) -> i64 {
    v.min(i64::MAX as u64) as i64
}

impl From<&LogEntry> for pb::LogEntry {
    fn from(e: &LogEntry) -> Self {
        pb::LogEntry {
            index: to_i64(e.index),
            term: to_i64(e.term),
            command: e.command.clone(),
        }
    }
}

impl From<pb::LogEntry> for LogEntry {
    fn from(e: pb::LogEntry) -> Self {
        LogEntry::new(to_u64(e.index), to_u64(e.term), e.command)
    }
}

impl From<VoteRequest> for pb::RequestVoteRequest {
    fn from(r: VoteRequest) -> Self {
        pb::RequestVoteRequest {
            term: to_i64(r.term),
            candidate_id: r.candidate_id,
            last_log_index: to_i64(r.last_log_index),
            last_log_term: to_i64(r.last_log_term),
        }
    }
}

impl From<pb::RequestVoteRequest> for VoteRequest {
    fn from(r: pb::RequestVoteRequest) -> Self {
        VoteRequest {
            term: to_u64(r.term),
            candidate_id: r.candidate_id,
            last_log_index: to_u64(r.last_log_index),
            last_log_term: to_u64(r.last_log_term),
        }
    }
}

impl From<VoteResponse> for pb::RequestVoteResponse {
    fn from(r: VoteResponse) -> Self {
        pb::RequestVoteResponse {
            term: to_i64(r.term),
            vote_granted: r.vote_granted,
        }
    }
}

impl From<pb::RequestVoteResponse> for VoteResponse {
    fn from(r: pb::RequestVoteResponse) -> Self {
        VoteResponse {
            term: to_u64(r.term),
            vote_granted: r.vote_granted,
        }
    }
}

impl From<AppendEntryRequest> for pb::AppendEntryRequest {
    fn from(r: AppendEntryRequest) -> Self {
        pb::AppendEntryRequest {
            term: to_i64(r.term),
            leader_id: r.leader_id,
            prev_log_index: to_i64(r.prev_log_index),
            prev_log_term: to_i64(r.prev_log_term),
            entries: r.entries.iter().map(pb::LogEntry::from).collect(),
            leader_commit_index: to_i64(r.leader_commit_index),
        }
    }
}

impl From<pb::AppendEntryRequest> for AppendEntryRequest {
    fn from(r: pb::AppendEntryRequest) -> Self {
        AppendEntryRequest {
            term: to_u64(r.term),
            leader_id: r.leader_id,
            prev_log_index: to_u64(r.prev_log_index),
            prev_log_term: to_u64(r.prev_log_term),
            entries: r.entries.into_iter().map(LogEntry::from).collect(),
            leader_commit_index: to_u64(r.leader_commit_index),
        }
    }
}

impl From<AppendEntryResponse> for pb::AppendEntryResponse {
    fn from(r: AppendEntryResponse) -> Self {
        pb::AppendEntryResponse {
            term: to_i64(r.term),
            success: r.success,
        }
    }
}

impl From<pb::AppendEntryResponse> for AppendEntryResponse {
    fn from(r: pb::AppendEntryResponse) -> Self {
        AppendEntryResponse {
            term: to_u64(r.term),
            success: r.success,
        }
    }
}

impl From<InstallSnapshotResponse> for pb::InstallSnapshotResponse {
    fn from(r: InstallSnapshotResponse) -> Self {
        pb::InstallSnapshotResponse {
            term: to_i64(r.term),
            success: r.success,
        }
    }
}

impl From<pb::InstallSnapshotResponse> for InstallSnapshotResponse {
    fn from(r: pb::InstallSnapshotResponse) -> Self {
        InstallSnapshotResponse {
            term: to_u64(r.term),
            success: r.success,
        }
    }
}

impl InstallSnapshotRequest {
    /// Splits the request into stream chunks; only the first carries the
    /// header fields.
    pub fn into_chunks(self, chunk_size: usize) -> Vec<pb::SnapshotChunk> {
        let header = pb::SnapshotChunk {
            term: to_i64(self.term),
            leader_id: self.leader_id,
            last_included_index: to_i64(self.last_included_index),
            last_included_term: to_i64(self.last_included_term),
            data: Vec::new(),
        };
        let mut chunks: Vec<pb::SnapshotChunk> = self
            .data
            .chunks(chunk_size.max(1))
            .map(|data| pb::SnapshotChunk {
                data: data.to_vec(),
                ..Default::default()
            })
            .collect();
        match chunks.first_mut() {
            Some(first) => {
                let data = std::mem::take(&mut first.data);
                *first = pb::SnapshotChunk { data, ..header };
            }
            None => chunks.push(header),
        }
        chunks
    }

    /// Reassembles a request from its chunks.
    pub fn from_chunks<I: IntoIterator<Item = pb::SnapshotChunk>>(chunks: I) -> Option<Self> {
        let mut chunks = chunks.into_iter();
        let first = chunks.next()?;
        let mut request = InstallSnapshotRequest {
            term: to_u64(first.term),
            leader_id: first.leader_id,
            last_included_index: to_u64(first.last_included_index),
            last_included_term: to_u64(first.last_included_term),
            data: first.data,
        };
        for chunk in chunks {
            request.data.extend_from_slice(&chunk.data);
        }
        Some(request)
    }
}
