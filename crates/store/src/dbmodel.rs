//! Row-level span representation and the codecs between domain spans and
//! stored columns.
//!
//! Primary columns are stored typed; everything else (process, tags, logs,
//! references) travels as one protobuf-encoded `extra` blob.

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use prost::Message;
use tracevault_core::ids::TraceId;
use tracevault_core::model::{KeyValue, Process, RefKind, Span, SpanLog, SpanRef, TagValue};
use tracevault_core::{Result, VaultError};

pub const TRACE_ID_BYTES: usize = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanRow {
    pub trace_id_low: u64,
    pub trace_id_high: u64,
    pub span_id: u64,
    pub operation_name: String,
    pub flags: u32,
    pub start_time: i64,
    pub duration: i64,
    pub extra: Vec<u8>,
}

impl SpanRow {
    pub fn from_domain(span: &Span) -> Result<Self> {
        let start_time = span
            .start_time
            .timestamp_nanos_opt()
            .ok_or_else(|| VaultError::Codec("start_time out of range".into()))?;
        let extra = pb::SpanExtra {
            process: Some(pb::Process {
                service_name: span.process.service_name.clone(),
                tags: span.process.tags.iter().map(kv_to_pb).collect(),
            }),
            tags: span.tags.iter().map(kv_to_pb).collect(),
            logs: span
                .logs
                .iter()
                .map(|log| {
                    Ok(pb::Log {
                        timestamp: log
                            .timestamp
                            .timestamp_nanos_opt()
                            .ok_or_else(|| VaultError::Codec("log timestamp out of range".into()))?,
                        fields: log.fields.iter().map(kv_to_pb).collect(),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            references: span
                .references
                .iter()
                .map(|r| pb::SpanRef {
                    trace_id_high: r.trace_id.high,
                    trace_id_low: r.trace_id.low,
                    span_id: r.span_id,
                    ref_type: match r.kind {
                        RefKind::ChildOf => pb::RefType::ChildOf as i32,
                        RefKind::FollowsFrom => pb::RefType::FollowsFrom as i32,
                    },
                })
                .collect(),
        };

        Ok(Self {
            trace_id_low: span.trace_id.low,
            trace_id_high: span.trace_id.high,
            span_id: span.span_id,
            operation_name: span.operation_name.clone(),
            flags: span.flags,
            start_time,
            duration: span.duration.as_nanos() as i64,
            extra: extra.encode_to_vec(),
        })
    }

    pub fn to_domain(&self) -> Result<Span> {
        let extra = pb::SpanExtra::decode(self.extra.as_slice())
            .map_err(|e| VaultError::Codec(format!("extra blob decode: {e}")))?;
        let process = extra
            .process
            .map(|p| {
                Ok::<_, VaultError>(Process {
                    service_name: p.service_name,
                    tags: p.tags.iter().map(kv_from_pb).collect::<Result<Vec<_>>>()?,
                })
            })
            .transpose()?
            .unwrap_or_else(|| Process::new("", vec![]));

        Ok(Span {
            trace_id: TraceId::new(self.trace_id_high, self.trace_id_low),
            span_id: self.span_id,
            operation_name: self.operation_name.clone(),
            flags: self.flags,
            start_time: Utc.timestamp_nanos(self.start_time),
            duration: std::time::Duration::from_nanos(self.duration.max(0) as u64),
            process,
            tags: extra.tags.iter().map(kv_from_pb).collect::<Result<Vec<_>>>()?,
            logs: extra
                .logs
                .into_iter()
                .map(|log| {
                    Ok(SpanLog {
                        timestamp: Utc.timestamp_nanos(log.timestamp),
                        fields: log.fields.iter().map(kv_from_pb).collect::<Result<Vec<_>>>()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            references: extra
                .references
                .into_iter()
                .map(|r| SpanRef {
                    trace_id: TraceId::new(r.trace_id_high, r.trace_id_low),
                    span_id: r.span_id,
                    kind: match pb::RefType::try_from(r.ref_type) {
                        Ok(pb::RefType::FollowsFrom) => RefKind::FollowsFrom,
                        _ => RefKind::ChildOf,
                    },
                })
                .collect(),
        })
    }
}

fn kv_to_pb(kv: &KeyValue) -> pb::KeyValue {
    let mut out = pb::KeyValue {
        key: kv.key.clone(),
        ..Default::default()
    };
    match &kv.value {
        TagValue::String(s) => {
            out.v_type = pb::ValueType::String as i32;
            out.v_str = s.clone();
        }
        TagValue::Bool(b) => {
            out.v_type = pb::ValueType::Bool as i32;
            out.v_bool = *b;
        }
        TagValue::Int64(i) => {
            out.v_type = pb::ValueType::Int64 as i32;
            out.v_int64 = *i;
        }
        TagValue::Float64(f) => {
            out.v_type = pb::ValueType::Float64 as i32;
            out.v_float64 = *f;
        }
        TagValue::Binary(b) => {
            out.v_type = pb::ValueType::Binary as i32;
            out.v_binary = b.clone();
        }
    }
    out
}

fn kv_from_pb(kv: &pb::KeyValue) -> Result<KeyValue> {
    let value = match pb::ValueType::try_from(kv.v_type) {
        Ok(pb::ValueType::String) => TagValue::String(kv.v_str.clone()),
        Ok(pb::ValueType::Bool) => TagValue::Bool(kv.v_bool),
        Ok(pb::ValueType::Int64) => TagValue::Int64(kv.v_int64),
        Ok(pb::ValueType::Float64) => TagValue::Float64(kv.v_float64),
        Ok(pb::ValueType::Binary) => TagValue::Binary(kv.v_binary.clone()),
        Err(_) => {
            return Err(VaultError::Codec(format!(
                "unknown tag value type {}",
                kv.v_type
            )))
        }
    };
    Ok(KeyValue {
        key: kv.key.clone(),
        value,
    })
}

/// 16-byte big-endian row form: `high || low`.
pub fn trace_id_to_bytes(id: &TraceId) -> [u8; TRACE_ID_BYTES] {
    let mut buf = [0u8; TRACE_ID_BYTES];
    buf[..8].copy_from_slice(&id.high.to_be_bytes());
    buf[8..].copy_from_slice(&id.low.to_be_bytes());
    buf
}

pub fn trace_id_from_bytes(buf: &[u8]) -> Result<TraceId> {
    if buf.len() < TRACE_ID_BYTES {
        return Err(VaultError::Codec("short trace id".into()));
    }
    let high = u64::from_be_bytes(buf[..8].try_into().expect("8 bytes"));
    let low = u64::from_be_bytes(buf[8..16].try_into().expect("8 bytes"));
    Ok(TraceId::new(high, low))
}

/// Packs trace ids as `n * 16` contiguous bytes.
pub fn trace_ids_to_bytes(ids: &[TraceId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.len() * TRACE_ID_BYTES);
    for id in ids {
        buf.extend_from_slice(&trace_id_to_bytes(id));
    }
    buf
}

pub fn trace_ids_from_bytes(buf: &[u8]) -> Result<Vec<TraceId>> {
    if buf.len() % TRACE_ID_BYTES != 0 {
        return Err(VaultError::Codec("invalid trace id list length".into()));
    }
    buf.chunks(TRACE_ID_BYTES).map(trace_id_from_bytes).collect()
}

/// One row read from a secondary index.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub ids: Vec<TraceId>,
    pub rev_ts: i64,
}

/// Deduplicating trace-id set that preserves insertion order.
#[derive(Debug, Default)]
pub struct UniqueTraceIds {
    set: HashSet<TraceId>,
    list: Vec<TraceId>,
}

impl UniqueTraceIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: TraceId) {
        if self.set.insert(id) {
            self.list.push(id);
        }
    }

    pub fn contains(&self, id: &TraceId) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn as_slice(&self) -> &[TraceId] {
        &self.list
    }

    pub fn into_list(self) -> Vec<TraceId> {
        self.list
    }
}

/// Set intersection across all inputs, preserving the insertion order of the
/// first one.
pub fn intersect_trace_ids(sets: &[UniqueTraceIds]) -> UniqueTraceIds {
    let mut out = UniqueTraceIds::new();
    let Some((first, rest)) = sets.split_first() else {
        return out;
    };
    for id in first.as_slice() {
        if rest.iter().all(|s| s.contains(id)) {
            out.add(*id);
        }
    }
    out
}

mod pb {
    //! Wire form of the `extra` column. Field numbers are part of the stored
    //! format; never renumber.

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SpanExtra {
        #[prost(message, optional, tag = "1")]
        pub process: Option<Process>,
        #[prost(message, repeated, tag = "2")]
        pub tags: Vec<KeyValue>,
        #[prost(message, repeated, tag = "3")]
        pub logs: Vec<Log>,
        #[prost(message, repeated, tag = "4")]
        pub references: Vec<SpanRef>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Process {
        #[prost(string, tag = "1")]
        pub service_name: String,
        #[prost(message, repeated, tag = "2")]
        pub tags: Vec<KeyValue>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KeyValue {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(enumeration = "ValueType", tag = "2")]
        pub v_type: i32,
        #[prost(string, tag = "3")]
        pub v_str: String,
        #[prost(bool, tag = "4")]
        pub v_bool: bool,
        #[prost(int64, tag = "5")]
        pub v_int64: i64,
        #[prost(double, tag = "6")]
        pub v_float64: f64,
        #[prost(bytes = "vec", tag = "7")]
        pub v_binary: Vec<u8>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ValueType {
        String = 0,
        Bool = 1,
        Int64 = 2,
        Float64 = 3,
        Binary = 4,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Log {
        #[prost(int64, tag = "1")]
        pub timestamp: i64,
        #[prost(message, repeated, tag = "2")]
        pub fields: Vec<KeyValue>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SpanRef {
        #[prost(uint64, tag = "1")]
        pub trace_id_high: u64,
        #[prost(uint64, tag = "2")]
        pub trace_id_low: u64,
        #[prost(uint64, tag = "3")]
        pub span_id: u64,
        #[prost(enumeration = "RefType", tag = "4")]
        pub ref_type: i32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RefType {
        ChildOf = 0,
        FollowsFrom = 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracevault_core::model::{KeyValue, Process, RefKind, SpanRef};

    #[test]
    fn span_round_trips_through_row() {
        let now = Utc::now();
        let span = Span {
            trace_id: TraceId::new(1, 42),
            span_id: 42,
            operation_name: "this-stuff".into(),
            flags: 1,
            start_time: now,
            duration: std::time::Duration::from_secs(1),
            process: Process::new(
                "svc1",
                vec![KeyValue::string("k", "v"), KeyValue::int64("k2", 1)],
            ),
            tags: vec![KeyValue::string("kk", "vv"), KeyValue::int64("a", 1)],
            logs: vec![
                SpanLog {
                    timestamp: now,
                    fields: vec![KeyValue::string("log", "record")],
                },
                SpanLog {
                    timestamp: now,
                    fields: vec![KeyValue::string("log2", "record2")],
                },
            ],
            references: vec![SpanRef {
                trace_id: TraceId::new(42, 0),
                span_id: 1,
                kind: RefKind::ChildOf,
            }],
        };

        let row = SpanRow::from_domain(&span).unwrap();
        let back = row.to_domain().unwrap();
        assert_eq!(back.start_time, span.start_time);
        assert_eq!(back, span);
    }

    #[test]
    fn trace_id_list_round_trips() {
        let ids = vec![TraceId::new(1, 2), TraceId::new(u64::MAX, 0)];
        let buf = trace_ids_to_bytes(&ids);
        assert_eq!(buf.len(), 32);
        assert_eq!(trace_ids_from_bytes(&buf).unwrap(), ids);
    }

    #[test]
    fn trace_id_bytes_are_big_endian() {
        let buf = trace_id_to_bytes(&TraceId::new(1, 2));
        assert_eq!(buf[7], 1);
        assert_eq!(buf[15], 2);
    }

    #[test]
    fn bad_list_length_is_rejected() {
        assert!(trace_ids_from_bytes(&[0u8; 15]).is_err());
        assert!(trace_ids_from_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn unique_ids_dedupe_in_order() {
        let mut ids = UniqueTraceIds::new();
        ids.add(TraceId::new(0, 2));
        ids.add(TraceId::new(0, 1));
        ids.add(TraceId::new(0, 2));
        assert_eq!(ids.len(), 2);
        assert_eq!(
            ids.as_slice(),
            &[TraceId::new(0, 2), TraceId::new(0, 1)]
        );
    }

    #[test]
    fn intersection_preserves_first_order() {
        let mut a = UniqueTraceIds::new();
        a.add(TraceId::new(0, 3));
        a.add(TraceId::new(0, 1));
        a.add(TraceId::new(0, 2));
        let mut b = UniqueTraceIds::new();
        b.add(TraceId::new(0, 2));
        b.add(TraceId::new(0, 3));
        let both = intersect_trace_ids(&[a, b]);
        assert_eq!(
            both.as_slice(),
            &[TraceId::new(0, 3), TraceId::new(0, 2)]
        );
    }
}
