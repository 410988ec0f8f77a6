//! Span ingest: filters, the span batch queue, the indexer hand-off and the
//! service/operation name catalog.
//!
//! Write failures past the filters are deliberately invisible to the caller;
//! only catalog upserts surface errors. Everything else is observable through
//! metrics alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use duckdb::params;
use tokio::task;
use tracevault_core::config::Config;
use tracevault_core::model::Span;
use tracevault_core::{Result, VaultError};
use tracing::warn;

use crate::batch::{BatchQueue, BatchQueueOptions, BatchSink};
use crate::db::{in_transaction, store_err, SessionPool};
use crate::dbmodel::SpanRow;
use crate::indexer::{Indexer, IndexerOptions};
use crate::metrics::{record_invalid_span, WriteMetrics};
use crate::partition::{partition_from_time, PartitionKey};
use crate::schema;

#[derive(Debug, Clone)]
pub struct SpanWriterOptions {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub batch_workers: usize,
    pub indexer_buffer_size: usize,
    pub indexer_max_traces: usize,
    pub indexer_max_ttl: Duration,
    /// Spans older than this are counted and dropped; zero disables the check.
    pub max_span_age: Duration,
    pub name_cache_size: u64,
    /// Archive mode writes the static long-retention table and skips indexing.
    pub archive: bool,
}

impl SpanWriterOptions {
    pub fn from_config(cfg: &Config, archive: bool) -> Self {
        Self {
            buffer_size: cfg.writer_buffer_size,
            batch_size: cfg.writer_batch_size,
            batch_workers: cfg.writer_batch_workers,
            indexer_buffer_size: cfg.indexer_buffer_size,
            indexer_max_traces: cfg.indexer_max_traces,
            indexer_max_ttl: cfg.indexer_max_ttl,
            max_span_age: cfg.writer_max_span_age,
            name_cache_size: cfg.writer_name_cache_size,
            archive,
        }
    }
}

pub struct SpanWriter {
    pool: Arc<SessionPool>,
    opts: SpanWriterOptions,
    span_queue: BatchQueue<Span>,
    indexer: Option<Indexer>,
    name_cache: moka::sync::Cache<String, ()>,
}

impl SpanWriter {
    /// Spawns the pipeline tasks; must be called inside a tokio runtime.
    pub fn new(pool: Arc<SessionPool>, opts: SpanWriterOptions) -> Self {
        let batch = BatchQueueOptions {
            buffer_size: opts.buffer_size,
            batch_size: opts.batch_size,
            workers: opts.batch_workers,
        };
        let span_queue = if opts.archive {
            BatchQueue::start(
                "archive",
                batch,
                Arc::new(ArchiveSink {
                    pool: pool.clone(),
                    metrics: WriteMetrics::new(schema::TBL_ARCHIVE),
                }),
            )
        } else {
            BatchQueue::start(
                "spans",
                batch,
                Arc::new(PartitionedSink {
                    pool: pool.clone(),
                    metrics: WriteMetrics::new(schema::TBL_TRACES),
                }),
            )
        };
        let indexer = (!opts.archive).then(|| {
            Indexer::start(
                pool.clone(),
                IndexerOptions {
                    buffer_size: opts.indexer_buffer_size,
                    max_traces: opts.indexer_max_traces,
                    max_ttl: opts.indexer_max_ttl,
                    batch,
                },
            )
        });
        let name_cache = moka::sync::Cache::new(opts.name_cache_size.max(1));
        Self {
            pool,
            opts,
            span_queue,
            indexer,
            name_cache,
        }
    }

    /// Accept a span for buffering. Success does not imply durability: stale
    /// or zero-time spans are counted and dropped, and a full queue drops
    /// silently. Only catalog upserts can fail the call.
    pub fn write_span(&self, span: &Span) -> Result<()> {
        if !self.opts.max_span_age.is_zero() {
            let age = (chrono::Utc::now() - span.start_time)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > self.opts.max_span_age {
                record_invalid_span(span.service_name(), &span.operation_name);
                return Ok(());
            }
        }
        if span.start_time.timestamp_nanos_opt().unwrap_or(0) == 0 {
            record_invalid_span(span.service_name(), &span.operation_name);
            return Ok(());
        }

        match self.span_queue.add(span.clone()) {
            Ok(()) | Err(VaultError::Overflow) => {}
            Err(e) => return Err(e),
        }

        if let Some(indexer) = &self.indexer {
            let _ = indexer.add(span.clone());
        }

        self.save_service_and_operation(span)
    }

    /// Async convenience wrapper; the catalog upsert is a blocking call.
    pub async fn write_span_async(self: &Arc<Self>, span: Span) -> Result<()> {
        let writer = self.clone();
        task::spawn_blocking(move || writer.write_span(&span))
            .await
            .map_err(|e| VaultError::Store(format!("write task: {e}")))?
    }

    fn save_service_and_operation(&self, span: &Span) -> Result<()> {
        let service = span.service_name().to_string();
        if self.name_cache.get(&service).is_none() {
            let folder = self.pool.folder();
            let sql = schema::upsert_service_name(folder);
            self.pool.do_with(true, |conn| {
                conn.execute(&sql, params![service])
                    .map_err(|e| store_err("service name upsert", e))
                    .map(|_| ())
            })?;
            self.name_cache.insert(service.clone(), ());
        }

        if span.operation_name.is_empty() {
            return Ok(());
        }
        let kind = span.span_kind().to_string();
        let key = format!("{service}-{}-{kind}", span.operation_name);
        if self.name_cache.get(&key).is_none() {
            let folder = self.pool.folder();
            let sql = schema::upsert_operation_name(folder);
            self.pool.do_with(true, |conn| {
                conn.execute(&sql, params![service, kind, span.operation_name])
                    .map_err(|e| store_err("operation name upsert", e))
                    .map(|_| ())
            })?;
            self.name_cache.insert(key, ());
        }
        Ok(())
    }
}

/// Sink for the partitioned `traces` tables: groups each batch by partition
/// key and bulk-upserts per partition.
struct PartitionedSink {
    pool: Arc<SessionPool>,
    metrics: WriteMetrics,
}

impl BatchSink<Span> for PartitionedSink {
    fn write_items(&self, items: Vec<Span>) {
        let mut parts: HashMap<PartitionKey, Vec<Span>> = HashMap::new();
        for span in items {
            parts
                .entry(partition_from_time(span.start_time))
                .or_default()
                .push(span);
        }
        for (part, spans) in parts {
            let full = self.pool.folder().partition_table(schema::TBL_TRACES, &part);
            if let Err(e) = upload_spans(&self.pool, &self.metrics, &full, &spans) {
                warn!(partition = %part.suffix(), error = %e, "span batch write failed");
            }
        }
    }
}

/// Sink for archive mode: everything goes into the static `archive` table.
struct ArchiveSink {
    pool: Arc<SessionPool>,
    metrics: WriteMetrics,
}

impl BatchSink<Span> for ArchiveSink {
    fn write_items(&self, items: Vec<Span>) {
        let full = self.pool.folder().table(schema::TBL_ARCHIVE);
        if let Err(e) = upload_spans(&self.pool, &self.metrics, &full, &items) {
            warn!(error = %e, "archive batch write failed");
        }
    }
}

fn upload_spans(
    pool: &SessionPool,
    metrics: &WriteMetrics,
    full_table: &str,
    spans: &[Span],
) -> Result<()> {
    let rows: Vec<SpanRow> = spans
        .iter()
        .filter_map(|span| match SpanRow::from_domain(span) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(trace_id = %span.trace_id, error = %e, "span encode failed");
                None
            }
        })
        .collect();
    let sql = schema::upsert_span(full_table);

    let started = Instant::now();
    let res = pool.do_with(true, |conn| {
        in_transaction(conn, |tx| {
            let mut stmt = tx
                .prepare(&sql)
                .map_err(|e| store_err("prepare span upsert", e))?;
            for row in &rows {
                stmt.execute(params![
                    row.trace_id_low,
                    row.trace_id_high,
                    row.span_id,
                    row.operation_name,
                    row.flags,
                    row.start_time,
                    row.duration,
                    row.extra
                ])
                .map_err(|e| store_err("span upsert", e))?;
            }
            Ok(())
        })
    });
    metrics.emit(res.as_ref().err(), started.elapsed(), rows.len());
    res
}
