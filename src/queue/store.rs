//! Offline queue backed by a single JSON document
//!
//! File layout (`~/.priority-living/offline_queue.json`):
//! ```text
//! {
//!   "next_seq": 42,
//!   "entries": [ { "seq": 40, "id": "...", "endpoint": "...", ... }, ... ]
//! }
//! ```
//! The whole document is rewritten atomically after every mutation.

use crate::error::{Error, Result};
use crate::persist;
use crate::transport::{ApiRequest, Method};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Default capacity of the offline queue
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// One buffered outbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Assigned at enqueue time, strictly increasing, never reused
    pub seq: u64,
    #[serde(flatten)]
    pub request: ApiRequest,
    pub queued_at: DateTime<Utc>,
    /// Failed replay attempts so far
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueDocument {
    next_seq: u64,
    entries: Vec<QueuedRequest>,
}

/// Entry written by older bridge versions (bare array, no sequence numbers)
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    endpoint: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    method: Method,
    #[serde(default)]
    queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredQueue {
    Current(QueueDocument),
    Legacy(Vec<LegacyEntry>),
}

/// Durable, bounded, FIFO store of requests awaiting delivery
#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    /// Ascending by `seq`
    entries: VecDeque<QueuedRequest>,
    next_seq: u64,
    capacity: usize,
}

impl OfflineQueue {
    /// Load the queue at `path`. A missing file is an empty queue; an
    /// unreadable one is an error so local state is never silently dropped.
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let capacity = capacity.max(1);

        let stored: Option<StoredQueue> = persist::read_json(&path).map_err(|e| {
            Error::QueueCorrupt {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;

        let (mut entries, next_seq) = match stored {
            None => (VecDeque::new(), 1),
            Some(StoredQueue::Current(doc)) => {
                let mut entries: Vec<QueuedRequest> = doc.entries;
                entries.sort_by_key(|e| e.seq);
                let max_seq = entries.last().map(|e| e.seq).unwrap_or(0);
                (entries.into(), doc.next_seq.max(max_seq + 1))
            }
            Some(StoredQueue::Legacy(legacy)) => {
                tracing::info!(
                    path = %path.display(),
                    count = legacy.len(),
                    "Upgrading legacy offline queue"
                );
                let entries: VecDeque<QueuedRequest> = legacy
                    .into_iter()
                    .enumerate()
                    .map(|(i, e)| QueuedRequest {
                        seq: i as u64 + 1,
                        request: ApiRequest::new(e.endpoint, e.method, e.data),
                        queued_at: e.queued_at.unwrap_or_else(Utc::now),
                        retry_count: 0,
                    })
                    .collect();
                let next = entries.len() as u64 + 1;
                (entries, next)
            }
        };

        let mut evicted = 0;
        while entries.len() > capacity {
            entries.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            tracing::warn!(evicted, capacity, "Offline queue over capacity on load, dropped oldest");
        }

        tracing::debug!(path = %path.display(), pending = entries.len(), "Offline queue loaded");

        Ok(Self {
            path,
            entries,
            next_seq,
            capacity,
        })
    }

    /// Append a request with a fresh sequence number, evicting the oldest
    /// entry first when full. Never fails; a failed write is logged and
    /// retried on the next mutation.
    pub fn enqueue(&mut self, request: ApiRequest) -> u64 {
        while self.entries.len() >= self.capacity {
            if let Some(dropped) = self.entries.pop_front() {
                tracing::warn!(
                    seq = dropped.seq,
                    endpoint = %dropped.request.endpoint,
                    "Offline queue full, dropped oldest entry"
                );
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::debug!(
            seq,
            endpoint = %request.endpoint,
            pending = self.entries.len() + 1,
            "Queued request for later delivery"
        );
        self.entries.push_back(QueuedRequest {
            seq,
            request,
            queued_at: Utc::now(),
            retry_count: 0,
        });
        self.flush();
        seq
    }

    /// Queued entries, oldest first. Does not consume the store.
    pub fn peek_all(&self) -> impl Iterator<Item = &QueuedRequest> + '_ {
        self.entries.iter()
    }

    /// Delete one entry. Returns whether anything was removed; removing an
    /// absent entry is a no-op.
    pub fn remove(&mut self, seq: u64) -> bool {
        match self.entries.iter().position(|e| e.seq == seq) {
            Some(index) => {
                self.entries.remove(index);
                self.flush();
                true
            }
            None => false,
        }
    }

    /// Record a failed replay attempt of one entry
    pub fn mark_retry(&mut self, seq: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.seq == seq) {
            entry.retry_count = entry.retry_count.saturating_add(1);
            self.flush();
        }
    }

    /// Drop every entry. Sequence numbers keep counting up.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.flush();
        count
    }

    /// Atomically write the queue to its file
    pub fn persist(&self) -> Result<()> {
        let doc = QueueDocument {
            next_seq: self.next_seq,
            entries: self.entries.iter().cloned().collect(),
        };
        persist::write_json_atomic(&self.path, &doc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) {
        if let Err(e) = self.persist() {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist offline queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_queue(capacity: usize) -> (OfflineQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::load(dir.path().join("offline_queue.json"), capacity).unwrap();
        (queue, dir)
    }

    fn report(n: u32) -> ApiRequest {
        ApiRequest::post("agent-task-result", serde_json::json!({ "task_id": n }))
    }

    fn seqs(queue: &OfflineQueue) -> Vec<u64> {
        queue.peek_all().map(|e| e.seq).collect()
    }

    #[test]
    fn test_enqueue_assigns_increasing_seq() {
        let (mut queue, _dir) = make_queue(DEFAULT_MAX_ENTRIES);
        let a = queue.enqueue(report(1));
        let b = queue.enqueue(report(2));
        let c = queue.enqueue(report(3));
        assert!(a < b && b < c);
        assert_eq!(seqs(&queue), vec![a, b, c]);
    }

    #[test]
    fn test_capacity_evicts_smallest_seq() {
        let (mut queue, _dir) = make_queue(DEFAULT_MAX_ENTRIES);
        for i in 0..DEFAULT_MAX_ENTRIES as u32 {
            queue.enqueue(report(i));
        }
        assert_eq!(queue.len(), 500);
        let oldest = queue.peek_all().next().unwrap().seq;

        let newest = queue.enqueue(report(9999));
        assert_eq!(queue.len(), 500);
        assert!(queue.peek_all().all(|e| e.seq != oldest));
        assert_eq!(queue.peek_all().last().unwrap().seq, newest);
        assert_eq!(queue.peek_all().next().unwrap().seq, oldest + 1);
    }

    #[test]
    fn test_never_exceeds_capacity_for_any_sequence() {
        let (mut queue, _dir) = make_queue(7);
        for i in 0..40 {
            queue.enqueue(report(i));
            if i % 5 == 0 {
                let first = queue.peek_all().next().unwrap().seq;
                queue.remove(first);
            }
            assert!(queue.len() <= 7);
            let s = seqs(&queue);
            assert!(s.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (mut queue, _dir) = make_queue(DEFAULT_MAX_ENTRIES);
        let a = queue.enqueue(report(1));
        let b = queue.enqueue(report(2));

        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        assert_eq!(seqs(&queue), vec![b]);
        assert!(!queue.remove(12345));
    }

    #[test]
    fn test_peek_all_is_restartable() {
        let (mut queue, _dir) = make_queue(DEFAULT_MAX_ENTRIES);
        queue.enqueue(report(1));
        queue.enqueue(report(2));

        let first: Vec<u64> = seqs(&queue);
        let second: Vec<u64> = seqs(&queue);
        assert_eq!(first, second);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_seq_not_reused_after_removal_or_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline_queue.json");

        let last = {
            let mut queue = OfflineQueue::load(&path, 10).unwrap();
            let a = queue.enqueue(report(1));
            let b = queue.enqueue(report(2));
            queue.remove(a);
            queue.remove(b);
            b
        };

        let mut queue = OfflineQueue::load(&path, 10).unwrap();
        assert!(queue.is_empty());
        let next = queue.enqueue(report(3));
        assert!(next > last);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline_queue.json");

        let before: Vec<QueuedRequest> = {
            let mut queue = OfflineQueue::load(&path, 10).unwrap();
            queue.enqueue(report(1));
            let second = queue.enqueue(report(2));
            queue.enqueue(report(3));
            queue.mark_retry(second);
            queue.peek_all().cloned().collect()
        };

        let queue = OfflineQueue::load(&path, 10).unwrap();
        let after: Vec<QueuedRequest> = queue.peek_all().cloned().collect();
        assert_eq!(before, after);
        assert_eq!(after[1].retry_count, 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline_queue.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = OfflineQueue::load(&path, 10).unwrap_err();
        assert!(matches!(err, Error::QueueCorrupt { .. }));
        // The file is left for the operator to inspect
        assert!(path.exists());
    }

    #[test]
    fn test_loads_legacy_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline_queue.json");
        std::fs::write(
            &path,
            r#"[
                {"endpoint": "agent-task-result", "data": {"task_id": "a"}, "method": "POST",
                 "queued_at": "2025-01-02T03:04:05.000000+00:00"},
                {"endpoint": "agent-task-result", "data": {"task_id": "b"}, "method": "POST",
                 "queued_at": "2025-01-02T03:04:06.000000+00:00"}
            ]"#,
        )
        .unwrap();

        let mut queue = OfflineQueue::load(&path, 10).unwrap();
        let entries: Vec<&QueuedRequest> = queue.peek_all().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].request.payload["task_id"], "a");
        assert_eq!(entries[1].request.payload["task_id"], "b");

        assert_eq!(queue.enqueue(report(3)), 3);
    }

    #[test]
    fn test_load_trims_to_capacity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline_queue.json");
        {
            let mut queue = OfflineQueue::load(&path, 10).unwrap();
            for i in 0..6 {
                queue.enqueue(report(i));
            }
        }

        let queue = OfflineQueue::load(&path, 4).unwrap();
        assert_eq!(seqs(&queue), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_clear_keeps_counting() {
        let (mut queue, _dir) = make_queue(10);
        queue.enqueue(report(1));
        queue.enqueue(report(2));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(report(3)), 3);
    }
}
