//! The closed set of secondary-index kinds and their row derivation.

use chrono::{DateTime, Utc};
use tracevault_core::model::{KeyValue, Span};

use crate::hash::{hash_bucket_data, hash_data, hash_raw};

/// One index entry staged for a bulk upsert. Each variant knows its grouping
/// hash, its timestamp (for partition routing) and the columns it writes for
/// a given bucket.
#[derive(Debug, Clone)]
pub enum IndexEntry {
    ServiceName {
        service: String,
        start_time: DateTime<Utc>,
    },
    ServiceOperation {
        service: String,
        operation: String,
        start_time: DateTime<Utc>,
    },
    Duration {
        service: String,
        operation: String,
        duration: i64,
        start_time: DateTime<Utc>,
    },
    Tag {
        service: String,
        operation: String,
        key: String,
        value: String,
        start_time: DateTime<Utc>,
    },
}

/// Columns of one index row; `duration` and `op_hash` are populated only by
/// the kinds whose tables carry them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub idx_hash: u64,
    pub rev_start_time: i64,
    pub duration: Option<i64>,
    pub op_hash: Option<u64>,
}

impl IndexEntry {
    pub fn service_name(span: &Span) -> Self {
        Self::ServiceName {
            service: span.service_name().to_string(),
            start_time: span.start_time,
        }
    }

    pub fn service_operation(span: &Span) -> Self {
        Self::ServiceOperation {
            service: span.service_name().to_string(),
            operation: span.operation_name.clone(),
            start_time: span.start_time,
        }
    }

    pub fn duration(span: &Span, operation: &str) -> Self {
        Self::Duration {
            service: span.service_name().to_string(),
            operation: operation.to_string(),
            duration: quantize_duration(span.duration),
            start_time: span.start_time,
        }
    }

    pub fn tag(span: &Span, kv: &KeyValue) -> Self {
        Self::Tag {
            service: span.service_name().to_string(),
            operation: span.operation_name.clone(),
            key: kv.key.clone(),
            value: kv.value_string(),
            start_time: span.start_time,
        }
    }

    /// Grouping hash for the staging map. Not necessarily the stored
    /// `idx_hash`: bucketed kinds add the bucket byte only at row time.
    pub fn hash(&self) -> u64 {
        match self {
            Self::ServiceName { service, .. } => hash_data(&[service]),
            Self::ServiceOperation {
                service, operation, ..
            } => hash_data(&[service, operation]),
            Self::Duration {
                service,
                operation,
                duration,
                ..
            } => {
                let mut buf = Vec::with_capacity(service.len() + operation.len() + 8);
                buf.extend_from_slice(service.as_bytes());
                buf.extend_from_slice(operation.as_bytes());
                buf.extend_from_slice(&duration.to_be_bytes());
                hash_raw(&buf)
            }
            // Operation is part of the grouping key so one staged group never
            // mixes spans whose rows need different op_hash values; the
            // stored idx_hash still hashes service/key/value only.
            Self::Tag {
                service,
                operation,
                key,
                value,
                ..
            } => hash_data(&[service, operation, key, value]),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ServiceName { start_time, .. }
            | Self::ServiceOperation { start_time, .. }
            | Self::Duration { start_time, .. }
            | Self::Tag { start_time, .. } => *start_time,
        }
    }

    pub fn row(&self, bucket: u8) -> IndexRow {
        let rev_start_time = -self.timestamp().timestamp_nanos_opt().unwrap_or(0);
        match self {
            Self::ServiceName { service, .. } => IndexRow {
                idx_hash: hash_bucket_data(bucket, &[service]),
                rev_start_time,
                duration: None,
                op_hash: None,
            },
            // The service+operation hash is the shard by itself, no bucket.
            Self::ServiceOperation {
                service, operation, ..
            } => IndexRow {
                idx_hash: hash_data(&[service, operation]),
                rev_start_time,
                duration: None,
                op_hash: None,
            },
            Self::Duration {
                service,
                operation,
                duration,
                ..
            } => IndexRow {
                idx_hash: hash_bucket_data(bucket, &[service, operation]),
                rev_start_time,
                duration: Some(*duration),
                op_hash: None,
            },
            Self::Tag {
                service,
                operation,
                key,
                value,
                ..
            } => IndexRow {
                idx_hash: hash_bucket_data(bucket, &[service, key, value]),
                rev_start_time,
                duration: None,
                op_hash: Some(hash_data(&[operation])),
            },
        }
    }
}

/// Quantize a span duration for the duration index: 10 ms buckets under
/// 100 ms, 100 ms buckets under 1 s, half-second buckets above.
pub fn quantize_duration(d: std::time::Duration) -> i64 {
    const MS: i64 = 1_000_000;
    const SEC: i64 = 1_000 * MS;
    let nanos = d.as_nanos().min(i64::MAX as u128) as i64;
    let step = if nanos < 100 * MS {
        10 * MS
    } else if nanos < SEC {
        100 * MS
    } else {
        SEC / 2
    };
    nanos - nanos % step
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracevault_core::ids::TraceId;
    use tracevault_core::model::Process;

    fn span() -> Span {
        Span {
            trace_id: TraceId::new(1, 2),
            span_id: 7,
            operation_name: "op".into(),
            flags: 0,
            start_time: Utc::now(),
            duration: Duration::from_millis(230),
            process: Process::new("svc", vec![]),
            tags: vec![],
            logs: vec![],
            references: vec![],
        }
    }

    #[test]
    fn quantization_ladder() {
        assert_eq!(
            quantize_duration(Duration::from_millis(37)),
            30 * 1_000_000
        );
        assert_eq!(
            quantize_duration(Duration::from_millis(230)),
            200 * 1_000_000
        );
        assert_eq!(
            quantize_duration(Duration::from_millis(10_001)),
            10_000 * 1_000_000
        );
        assert_eq!(quantize_duration(Duration::from_secs(1)), 1_000_000_000);
    }

    #[test]
    fn service_operation_ignores_bucket() {
        let entry = IndexEntry::service_operation(&span());
        assert_eq!(entry.row(0).idx_hash, entry.row(9).idx_hash);
    }

    #[test]
    fn service_name_buckets_spread() {
        let entry = IndexEntry::service_name(&span());
        assert_ne!(entry.row(0).idx_hash, entry.row(1).idx_hash);
    }

    #[test]
    fn tag_groups_split_by_operation() {
        let mut a = span();
        a.operation_name = "op-a".into();
        let mut b = span();
        b.operation_name = "op-b".into();
        let kv = KeyValue::string("k", "v");
        let entry_a = IndexEntry::tag(&a, &kv);
        let entry_b = IndexEntry::tag(&b, &kv);
        // Distinct staging groups, but the same stored index hash.
        assert_ne!(entry_a.hash(), entry_b.hash());
        assert_eq!(entry_a.row(2).idx_hash, entry_b.row(2).idx_hash);
        assert_ne!(entry_a.row(2).op_hash, entry_b.row(2).op_hash);
    }

    #[test]
    fn tag_rows_carry_op_hash() {
        let s = span();
        let entry = IndexEntry::tag(&s, &KeyValue::string("k", "v"));
        let row = entry.row(3);
        assert_eq!(row.op_hash, Some(hash_data(&["op"])));
        assert_eq!(row.idx_hash, hash_bucket_data(3, &["svc", "k", "v"]));
        assert_eq!(
            row.rev_start_time,
            -s.start_time.timestamp_nanos_opt().unwrap()
        );
    }

    #[test]
    fn duration_rows_quantize() {
        let entry = IndexEntry::duration(&span(), "op");
        assert_eq!(entry.row(0).duration, Some(200 * 1_000_000));
    }
}
