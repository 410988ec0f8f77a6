//! Query resolution against the secondary indices: validation, partition
//! selection, bucket/partition fan-out, multi-tag intersection and trace
//! reconstruction from paginated row reads.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duckdb::types::Value;
use duckdb::{params, params_from_iter};
use futures::future::try_join_all;
use futures::StreamExt;
use tokio::task;
use tracevault_core::config::Config;
use tracevault_core::ids::TraceId;
use tracevault_core::model::{Span, Trace};
use tracevault_core::query::{Operation, OperationQuery, TraceQuery};
use tracevault_core::{Result, VaultError};
use tracing::warn;

use crate::db::{store_err, SessionPool};
use crate::dbmodel::{
    intersect_trace_ids, trace_ids_from_bytes, IndexResult, SpanRow, UniqueTraceIds,
};
use crate::hash::{hash_bucket_data, hash_data, NUM_INDEX_BUCKETS};
use crate::partition::{intersect_partitions, make_partition_list, PartitionKey};
use crate::{queries, schema};

const DEFAULT_NUM_TRACES: usize = 100;
/// Rows from one index frequently repeat the same trace; over-fetch so the
/// post-dedup result can still satisfy the requested limit.
const LIMIT_MULTIPLE: usize = 3;
const PAGE_SIZE: i64 = 1000;
const PARTS_CACHE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_DURATION_MAX_NANOS: i64 = 24 * 3600 * 1_000_000_000;

#[derive(Debug, Clone)]
pub struct SpanReaderOptions {
    pub read_timeout: Duration,
    pub query_parallel: usize,
    pub op_limit: u64,
    pub svc_limit: u64,
    pub query_cache_size: u64,
    /// Archive mode reads single traces from the static archive table.
    pub archive: bool,
}

impl SpanReaderOptions {
    pub fn from_config(cfg: &Config, archive: bool) -> Self {
        Self {
            read_timeout: cfg.read_timeout,
            query_parallel: cfg.read_query_parallel,
            op_limit: cfg.read_op_limit,
            svc_limit: cfg.read_svc_limit,
            query_cache_size: cfg.query_cache_size,
            archive,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum IndexKind {
    Service,
    ServiceOp,
    Duration,
    Tag,
    TagOp,
}

impl IndexKind {
    fn name(self) -> &'static str {
        match self {
            Self::Service => "by_service",
            Self::ServiceOp => "by_service_op",
            Self::Duration => "by_duration",
            Self::Tag => "by_tag",
            Self::TagOp => "by_tag_op",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ProbeExtra {
    None,
    Duration { min: i64, max: i64 },
    OpHash(u64),
}

pub struct SpanReader {
    pool: Arc<SessionPool>,
    opts: SpanReaderOptions,
    parts_cache: moka::sync::Cache<(), Arc<Vec<PartitionKey>>>,
    query_cache: moka::sync::Cache<(&'static str, String), Arc<String>>,
}

impl SpanReader {
    pub fn new(pool: Arc<SessionPool>, opts: SpanReaderOptions) -> Self {
        let parts_cache = moka::sync::Cache::builder()
            .max_capacity(1)
            .time_to_live(PARTS_CACHE_TTL)
            .build();
        let query_cache = moka::sync::Cache::new(opts.query_cache_size.max(1));
        Self {
            pool,
            opts,
            parts_cache,
            query_cache,
        }
    }

    pub async fn get_services(&self) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let sql = queries::services(pool.folder());
        let limit = self.opts.svc_limit;
        self.with_timeout(run_blocking(move || {
            pool.do_with(true, |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| store_err("prepare services", e))?;
                let rows = stmt
                    .query_map(params![limit], |row| row.get::<_, String>(0))
                    .map_err(|e| store_err("query services", e))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| store_err("scan services", e))
            })
        }))
        .await
    }

    pub async fn get_operations(&self, query: OperationQuery) -> Result<Vec<Operation>> {
        let pool = self.pool.clone();
        let limit = self.opts.op_limit;
        let sql = match query.span_kind {
            Some(_) => queries::operations_with_kind(pool.folder()),
            None => queries::operations(pool.folder()),
        };
        self.with_timeout(run_blocking(move || {
            pool.do_with(true, |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| store_err("prepare operations", e))?;
                let mut args = vec![Value::Text(query.service_name.clone())];
                if let Some(kind) = &query.span_kind {
                    args.push(Value::Text(kind.clone()));
                }
                args.push(Value::UBigInt(limit));
                let rows = stmt
                    .query_map(params_from_iter(args.iter()), |row| {
                        Ok(Operation {
                            name: row.get::<_, String>(0)?,
                            span_kind: row.get::<_, String>(1)?,
                        })
                    })
                    .map_err(|e| store_err("query operations", e))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| store_err("scan operations", e))
            })
        }))
        .await
    }

    pub async fn get_trace(&self, trace_id: TraceId) -> Result<Trace> {
        self.with_timeout(async {
            if self.opts.archive {
                return self.read_archive_trace(trace_id).await;
            }
            // A store with no active partitions cannot hold the trace; a
            // single-trace lookup reports that as not-found, never as the
            // search-path unavailable signal.
            let parts = match self.partition_list().await {
                Ok(parts) => parts,
                Err(VaultError::NoPartitions) => return Err(VaultError::NotFound("trace")),
                Err(e) => return Err(e),
            };
            self.read_trace_from_partitions(&parts, trace_id).await
        })
        .await
    }

    pub async fn find_trace_ids(&self, query: &TraceQuery) -> Result<Vec<TraceId>> {
        let query = prepare_query(query)?;
        self.with_timeout(async {
            let ids = self.find_ids(&query).await?;
            let mut list = ids.into_list();
            list.truncate(query.num_traces);
            Ok(list)
        })
        .await
    }

    pub async fn find_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>> {
        let query = prepare_query(query)?;
        self.with_timeout(async {
            let ids = self.find_ids(&query).await?;
            let mut id_list = ids.into_list();
            id_list.truncate(query.num_traces);

            let (time_min, time_max) = time_bounds(&query);
            let active = self.partition_list().await?;
            let parts = intersect_partitions(&make_partition_list(time_min, time_max), &active);
            if parts.is_empty() {
                return Err(VaultError::NoPartitions);
            }

            let parts = &parts;
            let fetched: Vec<(TraceId, Result<Trace>)> = futures::stream::iter(id_list)
                .map(|id| async move {
                    (id, self.read_trace_from_partitions(parts, id).await)
                })
                .buffer_unordered(self.opts.query_parallel.max(1))
                .collect()
                .await;

            let mut traces = Vec::with_capacity(fetched.len());
            for (id, res) in fetched {
                match res {
                    Ok(trace) => traces.push(trace),
                    Err(e) => warn!(trace_id = %id, error = %e, "trace read failed"),
                }
            }
            Ok(traces)
        })
        .await
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.opts.read_timeout, fut)
            .await
            .map_err(|_| VaultError::Store("read timed out".into()))?
    }

    /// Plan dispatch in priority order: duration, tags, service+operation,
    /// service.
    async fn find_ids(&self, q: &TraceQuery) -> Result<UniqueTraceIds> {
        if q.duration_min.is_some() || q.duration_max.is_some() {
            return self.query_by_duration(q).await;
        }
        if !q.tags.is_empty() {
            return self.query_by_tags(q).await;
        }
        if !q.operation_name.is_empty() {
            return self.query_by_service_and_operation(q).await;
        }
        self.query_by_service(q).await
    }

    async fn query_by_service(&self, q: &TraceQuery) -> Result<UniqueTraceIds> {
        let hashes = (0..NUM_INDEX_BUCKETS)
            .map(|b| hash_bucket_data(b, &[&q.service_name]))
            .collect();
        let rows = self
            .query_parallel(q, IndexKind::Service, hashes, ProbeExtra::None)
            .await?;
        Ok(process_rows(rows))
    }

    async fn query_by_service_and_operation(&self, q: &TraceQuery) -> Result<UniqueTraceIds> {
        let hashes = vec![hash_data(&[&q.service_name, &q.operation_name])];
        let rows = self
            .query_parallel(q, IndexKind::ServiceOp, hashes, ProbeExtra::None)
            .await?;
        Ok(process_rows(rows))
    }

    async fn query_by_duration(&self, q: &TraceQuery) -> Result<UniqueTraceIds> {
        let min = q.duration_min.map(duration_nanos).unwrap_or(0);
        let max = q
            .duration_max
            .map(duration_nanos)
            .unwrap_or(DEFAULT_DURATION_MAX_NANOS);
        let hashes = (0..NUM_INDEX_BUCKETS)
            .map(|b| hash_bucket_data(b, &[&q.service_name, &q.operation_name]))
            .collect();
        let rows = self
            .query_parallel(q, IndexKind::Duration, hashes, ProbeExtra::Duration { min, max })
            .await?;
        Ok(process_rows(rows))
    }

    /// One fan-out per `(key, value)` pair; a trace must match every tag.
    async fn query_by_tags(&self, q: &TraceQuery) -> Result<UniqueTraceIds> {
        let (kind, extra) = if q.operation_name.is_empty() {
            (IndexKind::Tag, ProbeExtra::None)
        } else {
            (
                IndexKind::TagOp,
                ProbeExtra::OpHash(hash_data(&[&q.operation_name])),
            )
        };
        let mut results = Vec::with_capacity(q.tags.len());
        for (key, value) in &q.tags {
            let hashes = (0..NUM_INDEX_BUCKETS)
                .map(|b| hash_bucket_data(b, &[&q.service_name, key, value]))
                .collect();
            let rows = self.query_parallel(q, kind, hashes, extra).await?;
            results.push(process_rows(rows));
        }
        Ok(intersect_trace_ids(&results))
    }

    /// Dispatch one probe per `(hash, partition)` pair; the first failure
    /// short-circuits the join and abandons the siblings.
    async fn query_parallel(
        &self,
        q: &TraceQuery,
        kind: IndexKind,
        hashes: Vec<u64>,
        extra: ProbeExtra,
    ) -> Result<Vec<IndexResult>> {
        let (time_min, time_max) = time_bounds(q);
        let active = self.partition_list().await?;
        let parts = intersect_partitions(&make_partition_list(time_min, time_max), &active);
        if parts.is_empty() {
            return Err(VaultError::NoPartitions);
        }

        let limit = (q.num_traces * LIMIT_MULTIPLE) as i64;
        let mut probes = Vec::with_capacity(parts.len() * hashes.len());
        for part in &parts {
            let (part_begin, part_end) = part.time_span()?;
            let lo = time_min.max(part_begin);
            let hi = time_max.min(part_end);
            let sql = self.probe_sql(kind, part);
            for &hash in &hashes {
                let pool = self.pool.clone();
                let sql = sql.clone();
                let lo_nanos = lo.timestamp_nanos_opt().unwrap_or(0);
                let hi_nanos = hi.timestamp_nanos_opt().unwrap_or(0);
                probes.push(run_blocking(move || {
                    exec_index_probe(&pool, &sql, hash, lo_nanos, hi_nanos, extra, limit)
                }));
            }
        }

        let results = try_join_all(probes).await?;
        Ok(results.into_iter().flatten().collect())
    }

    fn probe_sql(&self, kind: IndexKind, part: &PartitionKey) -> Arc<String> {
        let key = (kind.name(), part.suffix());
        if let Some(sql) = self.query_cache.get(&key) {
            return sql;
        }
        let folder = self.pool.folder();
        let sql = Arc::new(match kind {
            IndexKind::Service => queries::by_service_name(folder, part),
            IndexKind::ServiceOp => queries::by_service_and_operation(folder, part),
            IndexKind::Duration => queries::by_duration(folder, part),
            IndexKind::Tag => queries::by_tag(folder, part),
            IndexKind::TagOp => queries::by_tag_and_operation(folder, part),
        });
        self.query_cache.insert(key, sql.clone());
        sql
    }

    /// Active partitions, refreshed through a short-lived cache; the write
    /// path tolerates the staleness.
    async fn partition_list(&self) -> Result<Arc<Vec<PartitionKey>>> {
        if let Some(parts) = self.parts_cache.get(&()) {
            return Ok(parts);
        }
        let pool = self.pool.clone();
        let parts = run_blocking(move || query_partition_list(&pool)).await?;
        let parts = Arc::new(parts);
        self.parts_cache.insert((), parts.clone());
        Ok(parts)
    }

    async fn read_trace_from_partitions(
        &self,
        parts: &[PartitionKey],
        trace_id: TraceId,
    ) -> Result<Trace> {
        let mut fetches = Vec::with_capacity(parts.len());
        for part in parts {
            let pool = self.pool.clone();
            let count_sql = queries::span_count(pool.folder(), part);
            let page_sql = queries::by_trace_id(pool.folder(), part);
            fetches.push(run_blocking(move || {
                spans_for_trace(&pool, &count_sql, &page_sql, trace_id)
            }));
        }
        let spans: Vec<Span> = try_join_all(fetches).await?.into_iter().flatten().collect();
        if spans.is_empty() {
            return Err(VaultError::NotFound("trace"));
        }
        Ok(Trace { spans })
    }

    async fn read_archive_trace(&self, trace_id: TraceId) -> Result<Trace> {
        let pool = self.pool.clone();
        let count_sql = queries::span_count_archive(pool.folder());
        let page_sql = queries::by_trace_id_archive(pool.folder());
        let spans =
            run_blocking(move || spans_for_trace(&pool, &count_sql, &page_sql, trace_id)).await?;
        if spans.is_empty() {
            return Err(VaultError::NotFound("trace"));
        }
        Ok(Trace { spans })
    }
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Store(format!("query task: {e}")))?
}

fn query_partition_list(pool: &SessionPool) -> Result<Vec<PartitionKey>> {
    let sql = schema::select_active_partitions(pool.folder());
    let parts = pool.do_with(true, |conn| {
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| store_err("prepare partitions", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PartitionKey {
                    date: row.get::<_, String>(0)?,
                    num: row.get::<_, u8>(1)?,
                    is_active: row.get::<_, bool>(2)?,
                })
            })
            .map_err(|e| store_err("query partitions", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| store_err("scan partitions", e))
    })?;
    if parts.is_empty() {
        return Err(VaultError::NoPartitions);
    }
    Ok(parts)
}

fn exec_index_probe(
    pool: &SessionPool,
    sql: &str,
    hash: u64,
    time_min_nanos: i64,
    time_max_nanos: i64,
    extra: ProbeExtra,
    limit: i64,
) -> Result<Vec<IndexResult>> {
    pool.do_with(true, |conn| {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| store_err("prepare index probe", e))?;
        let mut args = vec![
            Value::UBigInt(hash),
            Value::BigInt(-time_max_nanos),
            Value::BigInt(-time_min_nanos),
        ];
        match extra {
            ProbeExtra::None => {}
            ProbeExtra::Duration { min, max } => {
                args.push(Value::BigInt(min));
                args.push(Value::BigInt(max));
            }
            ProbeExtra::OpHash(op_hash) => args.push(Value::UBigInt(op_hash)),
        }
        args.push(Value::BigInt(limit));

        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| store_err("index probe", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (blob, rev_ts) = row.map_err(|e| store_err("scan index row", e))?;
            out.push(IndexResult {
                ids: trace_ids_from_bytes(&blob)?,
                rev_ts,
            });
        }
        Ok(out)
    })
}

fn spans_for_trace(
    pool: &SessionPool,
    count_sql: &str,
    page_sql: &str,
    trace_id: TraceId,
) -> Result<Vec<Span>> {
    pool.do_with(true, |conn| {
        let count: i64 = conn
            .query_row(count_sql, params![trace_id.high, trace_id.low], |row| {
                row.get(0)
            })
            .map_err(|e| store_err("span count", e))?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = conn
            .prepare(page_sql)
            .map_err(|e| store_err("prepare trace read", e))?;
        let mut spans = Vec::with_capacity(count as usize);
        for page in 0..(count / PAGE_SIZE + 1) {
            let rows = stmt
                .query_map(
                    params![trace_id.high, trace_id.low, PAGE_SIZE, page * PAGE_SIZE],
                    |row| {
                        Ok(SpanRow {
                            trace_id_low: row.get(0)?,
                            trace_id_high: row.get(1)?,
                            span_id: row.get(2)?,
                            operation_name: row.get(3)?,
                            flags: row.get(4)?,
                            start_time: row.get(5)?,
                            duration: row.get(6)?,
                            extra: row.get(7)?,
                        })
                    },
                )
                .map_err(|e| store_err("trace read", e))?;
            for row in rows {
                let row = row.map_err(|e| store_err("scan span row", e))?;
                spans.push(row.to_domain()?);
            }
        }
        Ok(spans)
    })
}

/// Aggregate probe rows: ascending `rev_start_time` is descending start time,
/// so traces come out newest first, deduplicated in that order.
fn process_rows(mut rows: Vec<IndexResult>) -> UniqueTraceIds {
    rows.sort_by_key(|r| r.rev_ts);
    let mut ids = UniqueTraceIds::new();
    for row in rows {
        for id in row.ids {
            ids.add(id);
        }
    }
    ids
}

fn prepare_query(query: &TraceQuery) -> Result<TraceQuery> {
    validate_query(query)?;
    let mut query = query.clone();
    if query.num_traces == 0 {
        query.num_traces = DEFAULT_NUM_TRACES;
    }
    Ok(query)
}

fn validate_query(q: &TraceQuery) -> Result<()> {
    if q.service_name.is_empty() && !q.tags.is_empty() {
        return Err(VaultError::InvalidArgument(
            "service name must be set".into(),
        ));
    }
    if q.start_time_min.is_none() || q.start_time_max.is_none() {
        return Err(VaultError::InvalidArgument(
            "start and end time must be set".into(),
        ));
    }
    let (min, max) = time_bounds(q);
    if max < min {
        return Err(VaultError::InvalidArgument(
            "start time minimum is above maximum".into(),
        ));
    }
    if let (Some(dmin), Some(dmax)) = (q.duration_min, q.duration_max) {
        if dmin > dmax {
            return Err(VaultError::InvalidArgument(
                "duration minimum is above maximum".into(),
            ));
        }
    }
    if (q.duration_min.is_some() || q.duration_max.is_some()) && !q.tags.is_empty() {
        return Err(VaultError::InvalidArgument(
            "cannot query for duration and tags simultaneously".into(),
        ));
    }
    Ok(())
}

fn time_bounds(q: &TraceQuery) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        q.start_time_min.unwrap_or_default(),
        q.start_time_max.unwrap_or_default(),
    )
}

fn duration_nanos(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_query() -> TraceQuery {
        TraceQuery {
            service_name: "svc".into(),
            start_time_min: Some(Utc::now() - chrono::Duration::hours(1)),
            start_time_max: Some(Utc::now()),
            ..TraceQuery::default()
        }
    }

    #[test]
    fn missing_time_range_is_invalid() {
        let q = TraceQuery {
            service_name: "svc".into(),
            ..TraceQuery::default()
        };
        assert!(matches!(
            validate_query(&q),
            Err(VaultError::InvalidArgument(_))
        ));
    }

    #[test]
    fn inverted_time_range_is_invalid() {
        let mut q = base_query();
        std::mem::swap(&mut q.start_time_min, &mut q.start_time_max);
        assert!(validate_query(&q).is_err());
    }

    #[test]
    fn tags_require_service() {
        let mut q = base_query();
        q.service_name.clear();
        q.tags.insert("k".into(), "v".into());
        assert!(validate_query(&q).is_err());
    }

    #[test]
    fn duration_and_tags_are_mutually_exclusive() {
        let mut q = base_query();
        q.tags.insert("k".into(), "v".into());
        q.duration_min = Some(Duration::from_secs(1));
        assert!(validate_query(&q).is_err());
    }

    #[test]
    fn inverted_duration_is_invalid() {
        let mut q = base_query();
        q.duration_min = Some(Duration::from_secs(2));
        q.duration_max = Some(Duration::from_secs(1));
        assert!(validate_query(&q).is_err());
    }

    #[test]
    fn zero_num_traces_defaults_to_100() {
        let q = prepare_query(&base_query()).unwrap();
        assert_eq!(q.num_traces, DEFAULT_NUM_TRACES);
        let mut explicit = base_query();
        explicit.num_traces = 7;
        assert_eq!(prepare_query(&explicit).unwrap().num_traces, 7);
    }

    #[test]
    fn rows_merge_newest_first() {
        let rows = vec![
            IndexResult {
                ids: vec![TraceId::new(0, 1)],
                rev_ts: -100,
            },
            IndexResult {
                ids: vec![TraceId::new(0, 2), TraceId::new(0, 1)],
                rev_ts: -200,
            },
        ];
        let ids = process_rows(rows);
        // rev -200 is the newer start time and must come first.
        assert_eq!(
            ids.as_slice(),
            &[TraceId::new(0, 2), TraceId::new(0, 1)]
        );
    }
}
