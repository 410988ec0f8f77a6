use std::time::Duration;

use chrono::{DateTime, Utc};
use tracevault_core::ids::TraceId;
use tracevault_core::model::{KeyValue, Process, RefKind, Span, SpanLog, SpanRef};

/// Minimal span with the fields the pipeline actually routes on.
pub fn span(
    trace_id: TraceId,
    span_id: u64,
    service: &str,
    operation: &str,
    start_time: DateTime<Utc>,
    duration: Duration,
    tags: Vec<KeyValue>,
) -> Span {
    Span {
        trace_id,
        span_id,
        operation_name: operation.to_string(),
        flags: 0,
        start_time,
        duration,
        process: Process::new(service, vec![]),
        tags,
        logs: vec![],
        references: vec![],
    }
}

/// Span exercising every field of the extra blob: process tags, span tags,
/// references and multi-field logs.
pub fn complex_span(start_time: DateTime<Utc>) -> Span {
    Span {
        trace_id: TraceId::new(1, 42),
        span_id: 42,
        operation_name: "this-stuff".to_string(),
        flags: 1,
        start_time,
        duration: Duration::from_secs(1),
        process: Process::new(
            "svc1",
            vec![KeyValue::string("k", "v"), KeyValue::int64("k2", 1)],
        ),
        tags: vec![KeyValue::string("kk", "vv"), KeyValue::int64("a", 1)],
        logs: vec![
            SpanLog {
                timestamp: start_time,
                fields: vec![KeyValue::string("log", "record")],
            },
            SpanLog {
                timestamp: start_time,
                fields: vec![KeyValue::string("log2", "record2")],
            },
        ],
        references: vec![SpanRef {
            trace_id: TraceId::new(42, 0),
            span_id: 1,
            kind: RefKind::ChildOf,
        }],
    }
}
