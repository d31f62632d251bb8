//! The worker registry: (database, relation) identity to live worker
//! process record.
//!
//! Owned exclusively by the manager's dispatch loop. Single-threaded by
//! construction, so no internal locking; at most one live worker per
//! identity at any time.

use crate::identity::WorkerIdentity;
use crate::protocol::WorkerInfo;
use std::collections::HashMap;
use std::time::Instant;

/// A live worker's process record. Never leaves the manager process;
/// backends only ever see the pid.
pub struct WorkerRecord<H> {
    pub identity: WorkerIdentity,
    pub pid: u32,
    pub handle: H,
    pub started_at: Instant,
}

enum Slot<H> {
    /// Claimed by an in-progress spawn; filled or released before the
    /// dispatch loop moves to the next request.
    Reserved,
    Live(WorkerRecord<H>),
}

/// Result of `find_or_reserve`.
#[derive(Debug, PartialEq, Eq)]
pub enum FindOrReserve {
    /// A live worker already exists; no second spawn may happen.
    Existing { pid: u32 },
    /// An empty slot was reserved for the caller to fill after a
    /// successful spawn (or release on failure).
    Reserved,
}

pub struct WorkerRegistry<H> {
    entries: HashMap<WorkerIdentity, Slot<H>>,
}

impl<H> WorkerRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Exact-match lookup; reserves an empty slot when absent.
    pub fn find_or_reserve(&mut self, identity: WorkerIdentity) -> FindOrReserve {
        match self.entries.get(&identity) {
            Some(Slot::Live(record)) => FindOrReserve::Existing { pid: record.pid },
            Some(Slot::Reserved) => FindOrReserve::Reserved,
            None => {
                self.entries.insert(identity, Slot::Reserved);
                FindOrReserve::Reserved
            }
        }
    }

    /// Fill a reservation after a successful spawn.
    pub fn fill(&mut self, identity: WorkerIdentity, pid: u32, handle: H) {
        self.entries.insert(
            identity,
            Slot::Live(WorkerRecord {
                identity,
                pid,
                handle,
                started_at: Instant::now(),
            }),
        );
    }

    /// Abandon a reservation after a failed spawn. Live entries are left
    /// untouched.
    pub fn release(&mut self, identity: &WorkerIdentity) {
        if matches!(self.entries.get(identity), Some(Slot::Reserved)) {
            self.entries.remove(identity);
        }
    }

    /// Remove and return the live record, or `None` (absence is a no-op
    /// for callers, not an error). A reservation is not a live worker
    /// and stays in the map untouched.
    pub fn remove(&mut self, identity: &WorkerIdentity) -> Option<WorkerRecord<H>> {
        if !matches!(self.entries.get(identity), Some(Slot::Live(_))) {
            return None;
        }
        match self.entries.remove(identity) {
            Some(Slot::Live(record)) => Some(record),
            _ => None,
        }
    }

    /// Snapshot of every live identity in a database. Taking a snapshot
    /// up front makes removal during the subsequent sweep safe: every
    /// entry is visited exactly once, none skipped or duplicated.
    pub fn identities_in_database(&self, database_id: u32) -> Vec<WorkerIdentity> {
        self.entries
            .iter()
            .filter_map(|(identity, slot)| match slot {
                Slot::Live(_) if identity.database_id == database_id => Some(*identity),
                _ => None,
            })
            .collect()
    }

    /// Remove and return every live record (shutdown sweep).
    pub fn drain(&mut self) -> Vec<WorkerRecord<H>> {
        self.entries
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Live(record) => Some(record),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status snapshot for the `ListWorkers` surface.
    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.entries
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(record) => Some(WorkerInfo {
                    identity: record.identity,
                    pid: record.pid,
                    uptime_secs: record.started_at.elapsed().as_secs(),
                }),
                Slot::Reserved => None,
            })
            .collect()
    }
}

impl<H> Default for WorkerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
