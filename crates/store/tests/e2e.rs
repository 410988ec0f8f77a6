//! Write-then-read scenarios over an in-memory store: the pipeline flushes
//! through the batch queues and staging maps, the reader resolves against the
//! secondary indices.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracevault_core::config::Config;
use tracevault_core::ids::TraceId;
use tracevault_core::model::KeyValue;
use tracevault_core::query::{OperationQuery, TraceQuery};
use tracevault_core::VaultError;
use tracevault_store::reader::{SpanReader, SpanReaderOptions};
use tracevault_store::writer::{SpanWriter, SpanWriterOptions};
use tracevault_store::{SessionPool, Watcher, WatcherOptions};
use tracevault_testkit::{complex_span, span};

const FLUSH_WAIT: Duration = Duration::from_secs(2);

struct Fixture {
    pool: Arc<SessionPool>,
}

impl Fixture {
    fn new() -> Self {
        let pool = SessionPool::open_in_memory("jaeger", 4).unwrap();
        let watcher = Watcher::new(
            pool.clone(),
            WatcherOptions {
                expiration: Duration::from_secs(7 * 24 * 3600),
                lookahead: Duration::from_secs(4 * 3600),
            },
        );
        watcher.run_once().unwrap();
        Self { pool }
    }

    fn writer(&self, max_span_age: Duration, archive: bool) -> SpanWriter {
        SpanWriter::new(
            self.pool.clone(),
            SpanWriterOptions {
                buffer_size: 100,
                batch_size: 1,
                batch_workers: 1,
                indexer_buffer_size: 100,
                indexer_max_traces: 1,
                indexer_max_ttl: Duration::from_secs(1),
                max_span_age,
                name_cache_size: 256,
                archive,
            },
        )
    }

    fn reader(&self, archive: bool) -> SpanReader {
        SpanReader::new(
            self.pool.clone(),
            SpanReaderOptions {
                read_timeout: Duration::from_secs(10),
                query_parallel: 8,
                op_limit: 100,
                svc_limit: 100,
                query_cache_size: 50,
                archive,
            },
        )
    }
}

fn window(query: &mut TraceQuery, back_hours: i64, forward_hours: i64) {
    query.start_time_min = Some(Utc::now() - chrono::Duration::hours(back_hours));
    query.start_time_max = Some(Utc::now() + chrono::Duration::hours(forward_hours));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn complex_span_round_trips_through_store() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, false);
    let reader = fx.reader(false);

    let input = complex_span(Utc::now());
    writer.write_span(&input).unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let trace = reader.get_trace(input.trace_id).await.unwrap();
    assert_eq!(trace.spans.len(), 1);
    assert_eq!(trace.spans[0], input);
    assert_eq!(trace.spans[0].start_time, input.start_time);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn find_trace_ids_by_service() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, false);
    let reader = fx.reader(false);

    let now = Utc::now();
    let one_sec = Duration::from_secs(1);
    let t1 = TraceId::new(1, 42);
    let t2 = TraceId::new(1, 43);
    writer
        .write_span(&span(t1, 42, "svc1", "this-stuff", now, one_sec, vec![]))
        .unwrap();
    writer
        .write_span(&span(t2, 1, "svc1", "that-stuff", now, one_sec, vec![]))
        .unwrap();
    writer
        .write_span(&span(
            TraceId::new(9, 9),
            1,
            "svc2",
            "this-stuff",
            now,
            one_sec,
            vec![],
        ))
        .unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let mut query = TraceQuery {
        service_name: "svc1".into(),
        ..TraceQuery::default()
    };
    window(&mut query, 1, 1);
    let ids = reader.find_trace_ids(&query).await.unwrap();
    assert_eq!(
        ids.iter().copied().collect::<HashSet<_>>(),
        HashSet::from([t1, t2])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn find_traces_by_duration_picks_the_slow_one() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, false);
    let reader = fx.reader(false);

    let now = Utc::now();
    writer
        .write_span(&span(
            TraceId::new(5, 1),
            1,
            "svc2",
            "this-stuff",
            now,
            Duration::from_millis(500),
            vec![KeyValue::int64("http.status_code", 200)],
        ))
        .unwrap();
    writer
        .write_span(&span(
            TraceId::new(5, 2),
            1,
            "svc2",
            "this-stuff",
            now,
            Duration::from_secs(1),
            vec![KeyValue::int64("http.status_code", 200)],
        ))
        .unwrap();
    writer
        .write_span(&span(
            TraceId::new(5, 3),
            1,
            "svc2",
            "that-stuff",
            now + chrono::Duration::hours(2),
            Duration::from_millis(10_001),
            vec![KeyValue::int64("http.status_code", 504)],
        ))
        .unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let mut query = TraceQuery {
        service_name: "svc2".into(),
        duration_min: Some(Duration::from_secs(9)),
        duration_max: Some(Duration::from_secs(12)),
        ..TraceQuery::default()
    };
    window(&mut query, 1, 3);
    let traces = reader.find_traces(&query).await.unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].spans[0].trace_id, TraceId::new(5, 3));
    assert_eq!(traces[0].spans[0].duration, Duration::from_millis(10_001));
    assert_eq!(traces[0].spans[0].tags[0].value_string(), "504");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn find_trace_ids_by_tag() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, false);
    let reader = fx.reader(false);

    let now = Utc::now();
    let tagged = TraceId::new(7, 1);
    writer
        .write_span(&span(
            tagged,
            1,
            "svc1",
            "this-stuff",
            now,
            Duration::from_secs(1),
            vec![KeyValue::string("some_tag", "some_value")],
        ))
        .unwrap();
    writer
        .write_span(&span(
            TraceId::new(7, 2),
            1,
            "svc1",
            "this-stuff",
            now,
            Duration::from_secs(1),
            vec![KeyValue::string("other_tag", "other_value")],
        ))
        .unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let mut query = TraceQuery {
        service_name: "svc1".into(),
        ..TraceQuery::default()
    };
    query.tags.insert("some_tag".into(), "some_value".into());
    window(&mut query, 1, 1);
    assert_eq!(reader.find_trace_ids(&query).await.unwrap(), vec![tagged]);

    // Same tag constrained to the operation: the op_hash column narrows it.
    query.operation_name = "this-stuff".into();
    assert_eq!(reader.find_trace_ids(&query).await.unwrap(), vec![tagged]);
    query.operation_name = "unknown-op".into();
    assert!(reader.find_trace_ids(&query).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tag_search_by_operation_sees_grouped_spans() {
    let fx = Fixture::new();
    // A large size trigger forces same-slot entries through the staging
    // groups together; flush rides the TTL sweep instead.
    let writer = SpanWriter::new(
        fx.pool.clone(),
        SpanWriterOptions {
            buffer_size: 100,
            batch_size: 1,
            batch_workers: 1,
            indexer_buffer_size: 100,
            indexer_max_traces: 100,
            indexer_max_ttl: Duration::from_millis(500),
            max_span_age: Duration::ZERO,
            name_cache_size: 256,
            archive: false,
        },
    );
    let reader = fx.reader(false);

    // Same service and tag, different operations, one 5 s slot.
    let now = Utc::now();
    let first = TraceId::new(23, 1);
    let second = TraceId::new(23, 2);
    let kv = KeyValue::string("some_tag", "some_value");
    writer
        .write_span(&span(
            first,
            1,
            "svc1",
            "op-a",
            now,
            Duration::from_secs(1),
            vec![kv.clone()],
        ))
        .unwrap();
    writer
        .write_span(&span(
            second,
            1,
            "svc1",
            "op-b",
            now,
            Duration::from_secs(1),
            vec![kv],
        ))
        .unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let mut query = TraceQuery {
        service_name: "svc1".into(),
        ..TraceQuery::default()
    };
    query.tags.insert("some_tag".into(), "some_value".into());
    window(&mut query, 1, 1);

    // The plain tag search sees both traces.
    let all = reader.find_trace_ids(&query).await.unwrap();
    assert_eq!(
        all.iter().copied().collect::<HashSet<_>>(),
        HashSet::from([first, second])
    );

    // Constrained to either operation, each trace stays reachable.
    query.operation_name = "op-a".into();
    assert_eq!(reader.find_trace_ids(&query).await.unwrap(), vec![first]);
    query.operation_name = "op-b".into();
    assert_eq!(reader.find_trace_ids(&query).await.unwrap(), vec![second]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_trace_without_active_partitions_is_not_found() {
    // Static tables only, no partitions: a single-trace lookup reports
    // not-found rather than the search-path unavailable error.
    let pool = SessionPool::open_in_memory("jaeger", 2).unwrap();
    pool.do_with(false, |conn| {
        conn.execute_batch(
            "CREATE TABLE \"jaeger\".\"partitions\" (\
             part_date TEXT NOT NULL, part_num UTINYINT NOT NULL, \
             is_active BOOLEAN NOT NULL, PRIMARY KEY (part_date, part_num))",
        )
        .map_err(|e| VaultError::Store(e.to_string()))
    })
    .unwrap();

    let reader = SpanReader::new(
        pool,
        SpanReaderOptions {
            read_timeout: Duration::from_secs(10),
            query_parallel: 8,
            op_limit: 100,
            svc_limit: 100,
            query_cache_size: 50,
            archive: false,
        },
    );
    let err = reader.get_trace(TraceId::new(1, 1)).await.unwrap_err();
    assert!(matches!(err, VaultError::NotFound(_)));

    // The search path keeps its own unavailable signal.
    let mut query = TraceQuery {
        service_name: "svc1".into(),
        ..TraceQuery::default()
    };
    window(&mut query, 1, 1);
    let err = reader.find_trace_ids(&query).await.unwrap_err();
    assert!(matches!(err, VaultError::NoPartitions));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_spans_are_dropped_quietly() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::from_secs(3600), false);
    let reader = fx.reader(false);

    let stale = TraceId::new(11, 1);
    writer
        .write_span(&span(
            stale,
            1,
            "svc1",
            "this-stuff",
            Utc::now() - chrono::Duration::hours(2),
            Duration::from_secs(1),
            vec![],
        ))
        .unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let err = reader.get_trace(stale).await.unwrap_err();
    assert!(matches!(err, VaultError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn services_and_operations_are_cataloged() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, false);
    let reader = fx.reader(false);

    let now = Utc::now();
    let one_sec = Duration::from_secs(1);
    writer
        .write_span(&span(
            TraceId::new(3, 1),
            1,
            "svc1",
            "this-stuff",
            now,
            one_sec,
            vec![KeyValue::string("span.kind", "server")],
        ))
        .unwrap();
    writer
        .write_span(&span(
            TraceId::new(3, 2),
            1,
            "svc1",
            "that-stuff",
            now,
            one_sec,
            vec![],
        ))
        .unwrap();
    writer
        .write_span(&span(TraceId::new(3, 3), 1, "svc2", "", now, one_sec, vec![]))
        .unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let services = reader.get_services().await.unwrap();
    assert!(services.contains(&"svc1".to_string()));
    assert!(services.contains(&"svc2".to_string()));

    let ops = reader
        .get_operations(OperationQuery {
            service_name: "svc1".into(),
            span_kind: None,
        })
        .await
        .unwrap();
    let names: HashSet<String> = ops.iter().map(|o| o.name.clone()).collect();
    assert_eq!(
        names,
        HashSet::from(["this-stuff".to_string(), "that-stuff".to_string()])
    );

    let server_ops = reader
        .get_operations(OperationQuery {
            service_name: "svc1".into(),
            span_kind: Some("server".into()),
        })
        .await
        .unwrap();
    assert_eq!(server_ops.len(), 1);
    assert_eq!(server_ops[0].name, "this-stuff");
    assert_eq!(server_ops[0].span_kind, "server");

    // An empty operation name never lands in the catalog.
    let svc2_ops = reader
        .get_operations(OperationQuery {
            service_name: "svc2".into(),
            span_kind: None,
        })
        .await
        .unwrap();
    assert!(svc2_ops.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archive_pair_bypasses_partitions() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, true);
    let reader = fx.reader(true);

    let input = complex_span(Utc::now() - chrono::Duration::days(90));
    writer.write_span(&input).unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let trace = reader.get_trace(input.trace_id).await.unwrap();
    assert_eq!(trace.spans.len(), 1);
    assert_eq!(trace.spans[0], input);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queries_without_matching_partitions_fail() {
    let fx = Fixture::new();
    let reader = fx.reader(false);

    let mut query = TraceQuery {
        service_name: "svc1".into(),
        ..TraceQuery::default()
    };
    // Window entirely before any created partition.
    query.start_time_min = Some(Utc::now() - chrono::Duration::days(400));
    query.start_time_max = Some(Utc::now() - chrono::Duration::days(399));
    let err = reader.find_trace_ids(&query).await.unwrap_err();
    assert!(matches!(err, VaultError::NoPartitions));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_index_table_references_the_trace() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, false);

    let input = span(
        TraceId::new(21, 1),
        1,
        "svc1",
        "this-stuff",
        Utc::now(),
        Duration::from_secs(1),
        vec![KeyValue::string("some_tag", "some_value")],
    );
    writer.write_span(&input).unwrap();
    tokio::time::sleep(FLUSH_WAIT).await;

    let part = tracevault_store::partition::partition_from_time(input.start_time);
    let folder = fx.pool.folder().clone();
    let needle = tracevault_store::dbmodel::trace_id_to_bytes(&input.trace_id);
    for table in [
        "idx_service_name",
        "idx_service_op",
        "idx_duration",
        "idx_tag_v2",
    ] {
        let sql = format!(
            "SELECT trace_ids FROM {} ",
            folder.partition_table(table, &part)
        );
        let blobs = fx
            .pool
            .do_with(true, |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| VaultError::Store(e.to_string()))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, Vec<u8>>(0))
                    .map_err(|e| VaultError::Store(e.to_string()))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| VaultError::Store(e.to_string()))
            })
            .unwrap();
        assert!(
            blobs
                .iter()
                .any(|b| b.chunks(16).any(|chunk| chunk == needle)),
            "table {table} has no entry for the trace"
        );
        assert!(blobs.iter().all(|b| b.len() % 16 == 0));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catalog_rows_stay_unique() {
    let fx = Fixture::new();
    let writer = fx.writer(Duration::ZERO, false);

    let now = Utc::now();
    for i in 0..5 {
        writer
            .write_span(&span(
                TraceId::new(13, i),
                i,
                "svc1",
                "this-stuff",
                now,
                Duration::from_secs(1),
                vec![],
            ))
            .unwrap();
    }
    tokio::time::sleep(FLUSH_WAIT).await;

    let folder = fx.pool.folder().clone();
    let count = |table: &str| {
        let sql = format!("SELECT COUNT(*) FROM {}", folder.table(table));
        fx.pool
            .do_with(true, |conn| {
                conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                    .map_err(|e| VaultError::Store(e.to_string()))
            })
            .unwrap()
    };
    assert_eq!(count("service_names"), 1);
    assert_eq!(count("operation_names_v2"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_backed_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        db_path: dir.path().join("vault.duckdb"),
        folder: "jaeger".into(),
        pool_size: 2,
        ..Config::default()
    };
    let storage = tracevault_store::Storage::open(&cfg).unwrap();
    storage
        .watcher(WatcherOptions {
            expiration: cfg.watcher_age,
            lookahead: Duration::from_secs(3600),
        })
        .run_once()
        .unwrap();

    let input = complex_span(Utc::now());
    storage.span_writer().write_span(&input).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let trace = storage.span_reader().get_trace(input.trace_id).await.unwrap();
    assert_eq!(trace.spans[0], input);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storage_wires_default_pipeline() {
    let cfg = Config::default();
    let pool = SessionPool::open_in_memory("jaeger", 4).unwrap();
    let storage = tracevault_store::Storage::with_pool(pool, &cfg);
    storage
        .watcher(WatcherOptions {
            expiration: cfg.watcher_age,
            lookahead: Duration::from_secs(3600),
        })
        .run_once()
        .unwrap();

    let input = complex_span(Utc::now());
    storage.span_writer().write_span(&input).unwrap();
    // Default batch size is 100, so this flush rides the one-second timer.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let trace = storage.span_reader().get_trace(input.trace_id).await.unwrap();
    assert_eq!(trace.spans[0], input);
}
