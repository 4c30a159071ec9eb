//! Bucketed index: file identifier → [`FileQueues`], split into independent
//! lock domains so admissions to different files proceed in parallel.

use crate::aggregation::InsertOutcome;
use crate::error::{Error, Result};
use crate::file_queues::{FileQueues, FileSnapshot, PendingCounters};
use crate::request::{Direction, DispatchRecord, Request, RequestNode};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// One lock domain: a collision list kept sorted by file identifier.
#[derive(Default)]
pub struct Bucket {
    pub files: Vec<FileQueues>,
    /// Real requests pending in this bucket's queues.
    pub pending: usize,
}

impl Bucket {
    fn search(&self, file_id: &str) -> std::result::Result<usize, usize> {
        self.files.binary_search_by(|f| (*f.file_id).cmp(file_id))
    }

    pub fn position(&self, file_id: &str) -> Option<usize> {
        self.search(file_id).ok()
    }

    pub fn find(&self, file_id: &str) -> Option<&FileQueues> {
        self.search(file_id).ok().map(|i| &self.files[i])
    }

    pub fn find_mut(&mut self, file_id: &str) -> Option<&mut FileQueues> {
        match self.search(file_id) {
            Ok(i) => Some(&mut self.files[i]),
            Err(_) => None,
        }
    }

    pub fn find_or_create(&mut self, file_id: &Arc<str>) -> &mut FileQueues {
        let idx = match self.search(file_id) {
            Ok(i) => i,
            Err(i) => {
                self.files.insert(i, FileQueues::new(Arc::clone(file_id)));
                i
            }
        };
        &mut self.files[idx]
    }

    /// Adds a pending entry. Caller holds this bucket's lock.
    pub fn add(
        &mut self,
        node: RequestNode,
        max_aggregation: usize,
        now: u64,
        counters: &PendingCounters,
    ) -> InsertOutcome {
        let n = node.count();
        let file_id = Arc::clone(node.file_id());
        let outcome = self
            .find_or_create(&file_id)
            .insert(node, max_aggregation, now, counters);
        self.pending += n;
        outcome
    }

    /// Detaches pending entry `idx` of `files[file_idx]`'s `direction` queue.
    pub fn take_entry(
        &mut self,
        file_idx: usize,
        direction: Direction,
        idx: usize,
        counters: &PendingCounters,
    ) -> RequestNode {
        let node = self.files[file_idx].take_entry(direction, idx, counters);
        self.pending -= node.count();
        node
    }

    /// Removes a pending (sub-)request matched exactly.
    pub fn remove(
        &mut self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
        counters: &PendingCounters,
    ) -> Result<Request> {
        let removed = self
            .find_mut(file_id)
            .and_then(|fq| fq.cancel_pending(direction, offset, length, counters))
            .ok_or_else(|| Error::not_found(file_id, direction, offset, length))?;
        self.pending -= 1;
        Ok(removed)
    }

    /// Removes a dispatched request matched exactly.
    pub fn remove_dispatched(
        &mut self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Result<DispatchRecord> {
        self.find_mut(file_id)
            .and_then(|fq| fq.take_dispatched(direction, offset, length))
            .ok_or_else(|| Error::not_found(file_id, direction, offset, length))
    }

    /// Moves every pending entry out for migration. Global counters are
    /// untouched: the requests stay pending, only their index changes.
    pub fn drain(&mut self) -> Vec<RequestNode> {
        self.pending = 0;
        self.files
            .iter_mut()
            .flat_map(|fq| fq.drain_pending())
            .collect()
    }

    /// Re-inserts an entry moved in by migration.
    pub fn adopt(&mut self, node: RequestNode, max_aggregation: usize) -> InsertOutcome {
        let n = node.count();
        let file_id = Arc::clone(node.file_id());
        let outcome = self.find_or_create(&file_id).adopt(node, max_aggregation);
        self.pending += n;
        outcome
    }
}

pub struct BucketedIndex {
    buckets: Vec<Mutex<Bucket>>,
}

impl BucketedIndex {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            buckets: (0..bucket_count).map(|_| Mutex::new(Bucket::default())).collect(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Stable bucket of a file identifier.
    pub fn bucket_of(&self, file_id: &str) -> usize {
        crc32fast::hash(file_id.as_bytes()) as usize % self.buckets.len()
    }

    pub fn lock(&self, bucket: usize) -> MutexGuard<'_, Bucket> {
        self.buckets[bucket].lock()
    }

    /// Non-blocking variant for policies that skip a busy bucket.
    pub fn try_lock(&self, bucket: usize) -> Option<MutexGuard<'_, Bucket>> {
        self.buckets[bucket].try_lock()
    }

    /// Every bucket, acquired in ascending order.
    pub fn lock_all(&self) -> Vec<MutexGuard<'_, Bucket>> {
        self.buckets.iter().map(|b| b.lock()).collect()
    }

    pub fn add(
        &self,
        node: RequestNode,
        max_aggregation: usize,
        now: u64,
        counters: &PendingCounters,
    ) -> InsertOutcome {
        let bucket = self.bucket_of(node.file_id());
        self.lock(bucket).add(node, max_aggregation, now, counters)
    }

    pub fn remove(
        &self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
        counters: &PendingCounters,
    ) -> Result<Request> {
        let bucket = self.bucket_of(file_id);
        self.lock(bucket)
            .remove(file_id, direction, offset, length, counters)
    }

    pub fn pending_entries(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| {
                b.lock()
                    .files
                    .iter()
                    .map(|f| f.queues.iter().map(|q| q.entries.len()).sum::<usize>())
                    .sum::<usize>()
            })
            .sum()
    }

    /// `(file, direction, offset, length, count)` of every pending entry.
    pub fn snapshot(&self) -> Vec<(String, Direction, u64, u64, usize)> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for fq in &bucket.files {
                for direction in Direction::ALL {
                    for node in &fq.queue(direction).entries {
                        out.push((
                            fq.file_id.to_string(),
                            direction,
                            node.offset(),
                            node.length(),
                            node.count(),
                        ));
                    }
                }
            }
        }
        out.sort();
        out
    }

    pub fn file_snapshots(&self) -> Vec<FileSnapshot> {
        let mut out: Vec<FileSnapshot> = self
            .buckets
            .iter()
            .flat_map(|b| b.lock().files.iter().map(|f| f.snapshot()).collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        out
    }

    pub fn reset_stats(&self) {
        for bucket in &self.buckets {
            for fq in bucket.lock().files.iter_mut() {
                fq.reset_stats();
            }
        }
    }

    /// Smallest remaining cooldown across all files.
    pub fn smallest_cooldown(&self, now: u64) -> Option<u64> {
        self.buckets
            .iter()
            .filter_map(|b| {
                b.lock()
                    .files
                    .iter_mut()
                    .filter(|f| f.pending_requests() > 0)
                    .filter_map(|f| f.cooldown_remaining(now))
                    .min()
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::test_request;

    #[test]
    fn test_bucket_assignment_is_stable() {
        let index = BucketedIndex::new(64);
        let b = index.bucket_of("some/file");
        for _ in 0..10 {
            assert_eq!(index.bucket_of("some/file"), b);
        }
        assert!(b < 64);
    }

    #[test]
    fn test_collision_list_sorted() {
        let counters = PendingCounters::new();
        let index = BucketedIndex::new(1);
        for name in ["c", "a", "b"] {
            index.add(test_request(name, Direction::Read, 0, 10).into(), 16, 0, &counters);
        }
        let bucket = index.lock(0);
        let names: Vec<&str> = bucket.files.iter().map(|f| &*f.file_id).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(bucket.pending, 3);
        drop(bucket);
        assert_eq!(counters.files(), 3);
    }

    #[test]
    fn test_add_remove_counters() {
        let counters = PendingCounters::new();
        let index = BucketedIndex::new(8);
        index.add(test_request("f", Direction::Read, 0, 100).into(), 16, 0, &counters);
        index.add(test_request("f", Direction::Read, 100, 100).into(), 16, 0, &counters);
        assert_eq!(counters.requests(), 2);
        assert_eq!(index.pending_entries(), 1);

        index.remove("f", Direction::Read, 0, 100, &counters).unwrap();
        index.remove("f", Direction::Read, 100, 100, &counters).unwrap();
        assert_eq!(counters.requests(), 0);
        assert_eq!(counters.files(), 0);

        let err = index.remove("f", Direction::Read, 0, 100, &counters).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_try_lock_skips_busy_bucket() {
        let index = BucketedIndex::new(2);
        let held = index.lock(1);
        assert!(index.try_lock(1).is_none());
        assert!(index.try_lock(0).is_some());
        drop(held);
        assert!(index.try_lock(1).is_some());
    }

    #[test]
    fn test_drain_and_adopt() {
        let counters = PendingCounters::new();
        let index = BucketedIndex::new(4);
        index.add(test_request("f", Direction::Write, 0, 10).into(), 16, 0, &counters);
        index.add(test_request("g", Direction::Write, 0, 10).into(), 16, 0, &counters);

        let mut drained = Vec::new();
        for mut bucket in index.lock_all() {
            drained.extend(bucket.drain());
        }
        assert_eq!(drained.len(), 2);
        assert_eq!(index.pending_entries(), 0);
        assert_eq!(counters.requests(), 2);

        for node in drained {
            let b = index.bucket_of(node.file_id());
            index.lock(b).adopt(node, 16);
        }
        assert_eq!(index.pending_entries(), 2);
    }
}
