//! The relation's key/value store and its cursor table.
//!
//! Keys are ordered bytes; scans hand out batches and remember their
//! position per cursor id, so a backend can interleave pulls on several
//! cursors. Pure in-memory state with a pure dispatch function, which is
//! what makes the socket loop around it trivial to test.

use crate::protocol::{WorkerRequest, WorkerResponse};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tracing::debug;

/// Saved position of one scan.
struct CursorState {
    /// Next key to return, exclusive of what was already handed out.
    next: Bound<Vec<u8>>,
    /// Upper bound of the scan, exclusive. `Unbounded` for full scans.
    end: Bound<Vec<u8>>,
}

#[derive(Default)]
pub struct RelationStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    cursors: HashMap<u64, CursorState>,
    opened: bool,
}

impl RelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self) {
        self.opened = true;
    }

    pub fn close(&mut self) {
        // Cursors do not survive a close; the data does.
        self.cursors.clear();
        self.opened = false;
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    /// Returns whether the key existed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn load(&mut self, pairs: Vec<(Vec<u8>, Vec<u8>)>) {
        self.entries.extend(pairs);
    }

    /// Pull up to `limit` pairs for a full-scan cursor, creating its
    /// state on first use. Returns `done = true` when the scan is
    /// exhausted, at which point the cursor state is dropped.
    pub fn read_batch(&mut self, cursor: u64, limit: u32) -> (Vec<(Vec<u8>, Vec<u8>)>, bool) {
        self.cursors.entry(cursor).or_insert(CursorState {
            next: Bound::Unbounded,
            end: Bound::Unbounded,
        });
        self.pull(cursor, limit)
    }

    pub fn close_cursor(&mut self, cursor: u64) {
        self.cursors.remove(&cursor);
    }

    /// Pull up to `limit` pairs for a bounded cursor, creating its state
    /// from `[start, end)` on first use. Later pulls for the same cursor
    /// resume where the previous batch stopped; the bounds arguments are
    /// only read on the first pull.
    pub fn range_query(
        &mut self,
        cursor: u64,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        limit: u32,
    ) -> (Vec<(Vec<u8>, Vec<u8>)>, bool) {
        self.cursors.entry(cursor).or_insert_with(|| CursorState {
            next: start.map_or(Bound::Unbounded, Bound::Included),
            end: end.map_or(Bound::Unbounded, Bound::Excluded),
        });
        self.pull(cursor, limit)
    }

    pub fn clear_range_query(&mut self, cursor: u64) {
        self.cursors.remove(&cursor);
    }

    fn pull(&mut self, cursor: u64, limit: u32) -> (Vec<(Vec<u8>, Vec<u8>)>, bool) {
        if limit == 0 {
            // A zero-limit pull ends the scan; its state must not leak.
            self.cursors.remove(&cursor);
            return (Vec::new(), true);
        }
        let Some(state) = self.cursors.get(&cursor) else {
            return (Vec::new(), true);
        };

        let mut pairs = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;
        for (key, value) in self
            .entries
            .range::<Vec<u8>, _>((state.next.clone(), state.end.clone()))
            .take(limit as usize)
        {
            last_key = Some(key.clone());
            pairs.push((key.clone(), value.clone()));
        }

        let done = pairs.len() < limit as usize;
        if done {
            self.cursors.remove(&cursor);
        } else if let Some(last) = last_key {
            if let Some(state) = self.cursors.get_mut(&cursor) {
                state.next = Bound::Excluded(last);
            }
        }
        (pairs, done)
    }

    /// Apply one wire request to the store.
    pub fn apply(&mut self, request: WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::Open { .. } => {
                self.open();
                WorkerResponse::Ok
            }
            WorkerRequest::Close => {
                self.close();
                WorkerResponse::Ok
            }
            WorkerRequest::Count => WorkerResponse::Count(self.count()),
            WorkerRequest::Put { key, value } => {
                self.put(key, value);
                WorkerResponse::Ok
            }
            WorkerRequest::Get { key } => WorkerResponse::Value(self.get(&key)),
            WorkerRequest::Delete { key } => WorkerResponse::Bool(self.delete(&key)),
            WorkerRequest::Load { pairs } => {
                debug!(count = pairs.len(), "Bulk load");
                self.load(pairs);
                WorkerResponse::Ok
            }
            WorkerRequest::ReadBatch { cursor, limit } => {
                let (pairs, done) = self.read_batch(cursor, limit);
                WorkerResponse::Batch { pairs, done }
            }
            WorkerRequest::CloseCursor { cursor } => {
                self.close_cursor(cursor);
                WorkerResponse::Ok
            }
            WorkerRequest::RangeQuery {
                cursor,
                start,
                end,
                limit,
            } => {
                let (pairs, done) = self.range_query(cursor, start, end, limit);
                WorkerResponse::Batch { pairs, done }
            }
            WorkerRequest::ClearRangeQuery { cursor } => {
                self.clear_range_query(cursor);
                WorkerResponse::Ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(n: u8) -> RelationStore {
        let mut store = RelationStore::new();
        for i in 0..n {
            store.put(vec![i], vec![i, i]);
        }
        store
    }

    #[test]
    fn put_get_delete_count() {
        let mut store = RelationStore::new();
        assert_eq!(store.count(), 0);

        store.put(b"a".to_vec(), b"1".to_vec());
        store.put(b"a".to_vec(), b"2".to_vec());
        assert_eq!(store.count(), 1, "put overwrites");
        assert_eq!(store.get(b"a"), Some(b"2".to_vec()));
        assert_eq!(store.get(b"b"), None);

        assert!(store.delete(b"a"));
        assert!(!store.delete(b"a"), "second delete reports absence");
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn full_scan_in_batches() {
        let mut store = seeded(5);

        let (batch, done) = store.read_batch(1, 2);
        assert_eq!(batch, vec![(vec![0], vec![0, 0]), (vec![1], vec![1, 1])]);
        assert!(!done);

        let (batch, done) = store.read_batch(1, 2);
        assert_eq!(batch, vec![(vec![2], vec![2, 2]), (vec![3], vec![3, 3])]);
        assert!(!done);

        // Final short batch ends the scan and drops the cursor.
        let (batch, done) = store.read_batch(1, 2);
        assert_eq!(batch, vec![(vec![4], vec![4, 4])]);
        assert!(done);

        // Reusing the id starts a fresh scan.
        let (batch, _) = store.read_batch(1, 10);
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn interleaved_cursors_keep_separate_positions() {
        let mut store = seeded(4);

        let (a1, _) = store.read_batch(1, 2);
        let (b1, _) = store.read_batch(2, 3);
        let (a2, _) = store.read_batch(1, 2);

        assert_eq!(a1[0].0, vec![0]);
        assert_eq!(b1[0].0, vec![0]);
        assert_eq!(a2[0].0, vec![2], "cursor 1 resumes after its own batch");
    }

    #[test]
    fn range_is_half_open_and_resumable() {
        let mut store = seeded(6);

        let (batch, done) = store.range_query(7, Some(vec![1]), Some(vec![4]), 2);
        assert_eq!(batch, vec![(vec![1], vec![1, 1]), (vec![2], vec![2, 2])]);
        assert!(!done);

        // Bounds are only read on the first pull.
        let (batch, done) = store.range_query(7, None, None, 10);
        assert_eq!(batch, vec![(vec![3], vec![3, 3])]);
        assert!(done, "end bound is exclusive");
    }

    #[test]
    fn zero_limit_pull_ends_the_scan() {
        let mut store = seeded(3);

        let (batch, done) = store.read_batch(1, 0);
        assert!(batch.is_empty());
        assert!(done);

        // The cursor id is free again and starts a fresh scan.
        let (batch, done) = store.read_batch(1, 10);
        assert_eq!(batch.len(), 3);
        assert!(done);

        // Same for an in-progress range cursor.
        store.range_query(7, Some(vec![1]), None, 1);
        let (batch, done) = store.range_query(7, None, None, 0);
        assert!(batch.is_empty());
        assert!(done);
    }

    #[test]
    fn clearing_a_cursor_forgets_its_position() {
        let mut store = seeded(4);
        store.range_query(7, Some(vec![2]), None, 1);
        store.clear_range_query(7);

        let (batch, _) = store.range_query(7, None, None, 1);
        assert_eq!(batch[0].0, vec![0], "a cleared cursor starts over");
    }

    #[test]
    fn close_drops_cursors_but_keeps_data() {
        let mut store = seeded(3);
        store.read_batch(1, 1);
        store.close();
        assert_eq!(store.count(), 3);

        store.open();
        let (batch, _) = store.read_batch(1, 1);
        assert_eq!(batch[0].0, vec![0]);
    }

    #[test]
    fn apply_routes_every_operation() {
        let mut store = RelationStore::new();
        assert!(matches!(
            store.apply(WorkerRequest::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec()
            }),
            WorkerResponse::Ok
        ));
        assert!(matches!(
            store.apply(WorkerRequest::Get { key: b"k".to_vec() }),
            WorkerResponse::Value(Some(_))
        ));
        assert!(matches!(
            store.apply(WorkerRequest::Count),
            WorkerResponse::Count(1)
        ));
        assert!(matches!(
            store.apply(WorkerRequest::Delete { key: b"k".to_vec() }),
            WorkerResponse::Bool(true)
        ));
    }
}
