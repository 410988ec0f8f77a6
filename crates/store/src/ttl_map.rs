//! Per-index staging: entries grouped by `(hash, 5 s time slot)` accumulate
//! trace ids until a size trigger or a TTL sweep hands the group downstream.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracevault_core::ids::TraceId;

use crate::index::IndexEntry;

const SLOT_SECONDS: i64 = 5;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) type EvictFn = Box<dyn Fn(IndexEntry, Vec<TraceId>) + Send + Sync>;

pub(crate) struct IndexTtlMap {
    inner: Arc<Inner>,
}

struct Inner {
    max_traces: usize,
    max_ttl: Duration,
    evict: EvictFn,
    entries: Mutex<HashMap<MapKey, Staged>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MapKey {
    hash: u64,
    slot: i64,
}

struct Staged {
    entry: IndexEntry,
    trace_ids: Vec<TraceId>,
    last_access: Instant,
}

impl IndexTtlMap {
    /// Spawns the 1 Hz sweeper; must run inside a tokio runtime. The sweeper
    /// exits once the map is dropped.
    pub(crate) fn new(max_traces: usize, max_ttl: Duration, evict: EvictFn) -> Self {
        assert!(max_traces > 0, "max_traces must be positive");
        assert!(!max_ttl.is_zero(), "max_ttl must be positive");
        let inner = Arc::new(Inner {
            max_traces,
            max_ttl,
            evict,
            entries: Mutex::new(HashMap::new()),
        });
        tokio::spawn(sweep(Arc::downgrade(&inner)));
        Self { inner }
    }

    pub(crate) fn add(&self, entry: IndexEntry, trace_id: TraceId) {
        let secs = entry.timestamp().timestamp();
        let key = MapKey {
            hash: entry.hash(),
            slot: secs - secs.rem_euclid(SLOT_SECONDS),
        };

        let flushed = {
            let mut entries = self.inner.entries.lock();
            let staged = entries.entry(key).or_insert_with(|| Staged {
                entry,
                trace_ids: Vec::with_capacity(self.inner.max_traces),
                last_access: Instant::now(),
            });
            staged.trace_ids.push(trace_id);
            staged.last_access = Instant::now();
            if staged.trace_ids.len() >= self.inner.max_traces {
                entries.remove(&key)
            } else {
                None
            }
        };

        if let Some(staged) = flushed {
            (self.inner.evict)(staged.entry, staged.trace_ids);
        }
    }

    #[cfg(test)]
    fn staged_groups(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

async fn sweep(inner: Weak<Inner>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        let now = Instant::now();
        let expired: Vec<Staged> = {
            let mut entries = inner.entries.lock();
            let keys: Vec<MapKey> = entries
                .iter()
                .filter(|(_, v)| now.duration_since(v.last_access) >= inner.max_ttl)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter().filter_map(|k| entries.remove(&k)).collect()
        };
        for staged in expired {
            (inner.evict)(staged.entry, staged.trace_ids);
        }
    }
}
