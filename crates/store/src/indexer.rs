//! Span fan-out into the four secondary indices.
//!
//! One input channel feeds a dispatch task; each index table owns a staging
//! map and a batch queue whose sink performs the per-partition bulk upserts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use duckdb::params;
use rand::Rng;
use tokio::sync::mpsc;
use tracevault_core::ids::TraceId;
use tracevault_core::model::{KeyValue, Span};
use tracevault_core::{Result, VaultError};
use tracing::warn;

use crate::batch::{BatchQueue, BatchQueueOptions, BatchSink};
use crate::db::{in_transaction, store_err, SessionPool};
use crate::dbmodel::trace_ids_to_bytes;
use crate::hash::NUM_INDEX_BUCKETS;
use crate::index::IndexEntry;
use crate::metrics::{record_dropped, WriteMetrics};
use crate::partition::{partition_from_time, PartitionKey};
use crate::schema;
use crate::ttl_map::IndexTtlMap;

/// Tag keys that never land in the tag index.
const TAG_STOP_LIST: [&str; 3] = ["sampler.type", "sampler.param", "internal.span.format"];

#[derive(Debug, Clone)]
pub(crate) struct IndexerOptions {
    pub buffer_size: usize,
    pub max_traces: usize,
    pub max_ttl: Duration,
    pub batch: BatchQueueOptions,
}

pub(crate) struct Indexer {
    tx: mpsc::Sender<Span>,
}

impl Indexer {
    pub(crate) fn start(pool: Arc<SessionPool>, opts: IndexerOptions) -> Self {
        let tag = IndexTable::start(pool.clone(), schema::TBL_IDX_TAG, &opts);
        let svc = IndexTable::start(pool.clone(), schema::TBL_IDX_SERVICE_NAME, &opts);
        let op = IndexTable::start(pool.clone(), schema::TBL_IDX_SERVICE_OP, &opts);
        let duration = IndexTable::start(pool, schema::TBL_IDX_DURATION, &opts);

        let (tx, rx) = mpsc::channel(opts.buffer_size.max(1));
        tokio::spawn(dispatch(rx, tag, svc, op, duration));
        Self { tx }
    }

    /// Non-blocking submit; a full buffer counts the span as dropped.
    pub(crate) fn add(&self, span: Span) -> Result<()> {
        match self.tx.try_send(span) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_dropped("indexer");
                Err(VaultError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VaultError::Store("indexer closed".into()))
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Span>,
    tag: IndexTable,
    svc: IndexTable,
    op: IndexTable,
    duration: IndexTable,
) {
    while let Some(span) = rx.recv().await {
        let trace_id = span.trace_id;
        for kv in span.tags.iter().chain(span.process.tags.iter()) {
            if should_index_tag(kv) {
                tag.map.add(IndexEntry::tag(&span, kv), trace_id);
            }
        }
        svc.map.add(IndexEntry::service_name(&span), trace_id);
        op.map.add(IndexEntry::service_operation(&span), trace_id);
        if !span.operation_name.is_empty() {
            let named = IndexEntry::duration(&span, &span.operation_name);
            duration.map.add(named, trace_id);
        }
        duration.map.add(IndexEntry::duration(&span, ""), trace_id);
    }
}

fn should_index_tag(kv: &KeyValue) -> bool {
    !kv.is_binary() && !TAG_STOP_LIST.contains(&kv.key.as_str())
}

struct IndexTable {
    map: IndexTtlMap,
}

impl IndexTable {
    fn start(pool: Arc<SessionPool>, table: &'static str, opts: &IndexerOptions) -> Self {
        let writer = Arc::new(IndexWriter {
            pool,
            table,
            metrics: WriteMetrics::new(table),
        });
        let queue = BatchQueue::start(table, opts.batch, writer);
        let map = IndexTtlMap::new(
            opts.max_traces,
            opts.max_ttl,
            Box::new(move |entry, trace_ids| {
                if trace_ids.is_empty() {
                    return;
                }
                match queue.add(StagedIndex { entry, trace_ids }) {
                    Ok(()) | Err(VaultError::Overflow) => {}
                    Err(e) => warn!(table, error = %e, "index batch submit failed"),
                }
            }),
        );
        Self { map }
    }
}

pub(crate) struct StagedIndex {
    entry: IndexEntry,
    trace_ids: Vec<TraceId>,
}

struct IndexWriter {
    pool: Arc<SessionPool>,
    table: &'static str,
    metrics: WriteMetrics,
}

impl BatchSink<StagedIndex> for IndexWriter {
    fn write_items(&self, items: Vec<StagedIndex>) {
        let mut parts: HashMap<PartitionKey, Vec<StagedIndex>> = HashMap::new();
        for item in items {
            parts
                .entry(partition_from_time(item.entry.timestamp()))
                .or_default()
                .push(item);
        }
        for (part, staged) in parts {
            self.write_partition(&part, staged);
        }
    }
}

impl IndexWriter {
    fn write_partition(&self, part: &PartitionKey, items: Vec<StagedIndex>) {
        let full = self.pool.folder().partition_table(self.table, part);
        let sql = schema::upsert_index(self.table, &full);
        let mut buckets = BucketRr::new(NUM_INDEX_BUCKETS);
        let mut rng = rand::thread_rng();

        let rows: Vec<_> = items
            .into_iter()
            .map(|item| {
                let row = item.entry.row(buckets.next());
                let uniq: u32 = rng.gen();
                (row, uniq, trace_ids_to_bytes(&item.trace_ids))
            })
            .collect();
        let count = rows.len();

        let started = Instant::now();
        let res = self.pool.do_with(true, |conn| {
            in_transaction(conn, |tx| {
                let mut stmt = tx
                    .prepare(&sql)
                    .map_err(|e| store_err("prepare index upsert", e))?;
                for (row, uniq, blob) in &rows {
                    match self.table {
                        schema::TBL_IDX_DURATION => stmt.execute(params![
                            row.idx_hash,
                            row.duration.unwrap_or(0),
                            row.rev_start_time,
                            uniq,
                            blob
                        ]),
                        schema::TBL_IDX_TAG => stmt.execute(params![
                            row.idx_hash,
                            row.rev_start_time,
                            row.op_hash.unwrap_or(0),
                            uniq,
                            blob
                        ]),
                        _ => stmt.execute(params![
                            row.idx_hash,
                            row.rev_start_time,
                            uniq,
                            blob
                        ]),
                    }
                    .map_err(|e| store_err("index upsert", e))?;
                }
                Ok(())
            })
        });

        self.metrics.emit(res.as_ref().err(), started.elapsed(), count);
        if let Err(e) = res {
            warn!(table = self.table, error = %e, "index write failed");
        }
    }
}

/// Round-robin bucket assignment starting at a random offset so concurrent
/// writers do not pile onto the same bucket.
struct BucketRr {
    max: u8,
    cur: u8,
}

impl BucketRr {
    fn new(max: u8) -> Self {
        Self {
            max,
            cur: rand::thread_rng().gen_range(0..max),
        }
    }

    fn next(&mut self) -> u8 {
        let v = self.cur;
        self.cur = (self.cur + 1) % self.max;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rr_wraps() {
        let mut rr = BucketRr::new(3);
        let first = rr.next();
        let second = rr.next();
        let third = rr.next();
        let fourth = rr.next();
        assert_eq!(first, fourth);
        assert_ne!(first, second);
        assert_ne!(second, third);
    }

    #[test]
    fn stop_list_and_binary_tags_skipped() {
        assert!(!should_index_tag(&KeyValue::string("sampler.type", "const")));
        assert!(!should_index_tag(&KeyValue::binary("payload", vec![1])));
        assert!(should_index_tag(&KeyValue::string("http.status_code", "200")));
    }
}
