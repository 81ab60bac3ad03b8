//! Expiring cache of per-device status snapshots

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::snapshot::Snapshot;

/// Device id keyed snapshot cache. Implementations must never fail.
///
/// Every device carries a generation that `delete` advances. A snapshot
/// built from reads taken after `generation` returned `g` may only be
/// stored through `set_if_current(.., g, ..)`, so a build that overlapped
/// an invalidation never lands in the cache.
pub trait StatusCache: Send + Sync {
    fn get(&self, device_id: &str) -> Option<Arc<Snapshot>>;
    fn set(&self, device_id: &str, snapshot: Arc<Snapshot>);
    fn delete(&self, device_id: &str);
    fn generation(&self, device_id: &str) -> u64;
    /// Store unless the device was invalidated since `generation` was read
    fn set_if_current(&self, device_id: &str, generation: u64, snapshot: Arc<Snapshot>) -> bool;
    fn ttl(&self) -> Duration;
    /// Drop expired entries, returning how many were removed
    fn purge_expired(&self) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    snapshot: Arc<Snapshot>,
    expires_at: Instant,
}

/// Per-device state. Slots outlive their entries so the generation is
/// never reset while a build may still be running.
#[derive(Default)]
struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

/// In-process cache with a fixed time to live
pub struct TtlStatusCache {
    slots: DashMap<String, Slot>,
    ttl: Duration,
}

impl TtlStatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    fn entry(&self, snapshot: Arc<Snapshot>) -> Entry {
        Entry {
            snapshot,
            expires_at: Instant::now() + self.ttl,
        }
    }
}

impl StatusCache for TtlStatusCache {
    fn get(&self, device_id: &str) -> Option<Arc<Snapshot>> {
        let now = Instant::now();
        let mut slot = self.slots.get_mut(device_id)?;

        match &slot.entry {
            Some(entry) if entry.expires_at > now => Some(entry.snapshot.clone()),
            Some(_) => {
                slot.entry = None;
                None
            }
            None => None,
        }
    }

    fn set(&self, device_id: &str, snapshot: Arc<Snapshot>) {
        let entry = self.entry(snapshot);
        self.slots.entry(device_id.to_string()).or_default().entry = Some(entry);
    }

    fn delete(&self, device_id: &str) {
        let mut slot = self.slots.entry(device_id.to_string()).or_default();
        slot.generation += 1;
        slot.entry = None;
    }

    fn generation(&self, device_id: &str) -> u64 {
        self.slots
            .get(device_id)
            .map(|slot| slot.generation)
            .unwrap_or_default()
    }

    fn set_if_current(&self, device_id: &str, generation: u64, snapshot: Arc<Snapshot>) -> bool {
        let mut slot = self.slots.entry(device_id.to_string()).or_default();
        if slot.generation != generation {
            return false;
        }
        slot.entry = Some(self.entry(snapshot));
        true
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for mut slot in self.slots.iter_mut() {
            if slot.entry.as_ref().is_some_and(|e| e.expires_at <= now) {
                slot.entry = None;
                purged += 1;
            }
        }
        purged
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }
}
