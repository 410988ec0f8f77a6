use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TraceId;

/// Tag key carrying the span kind (`server`, `client`, ...) when the
/// instrumentation sets one.
pub const SPAN_KIND_TAG: &str = "span.kind";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: u64,
    pub operation_name: String,
    pub flags: u32,
    pub start_time: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub process: Process,
    pub tags: Vec<KeyValue>,
    pub logs: Vec<SpanLog>,
    pub references: Vec<SpanRef>,
}

impl Span {
    pub fn service_name(&self) -> &str {
        &self.process.service_name
    }

    /// Span kind as reported by the `span.kind` tag, empty when absent.
    pub fn span_kind(&self) -> &str {
        self.tags
            .iter()
            .find(|kv| kv.key == SPAN_KIND_TAG)
            .and_then(|kv| match &kv.value {
                TagValue::String(s) => Some(s.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<KeyValue>,
}

impl Process {
    pub fn new(service_name: impl Into<String>, tags: Vec<KeyValue>) -> Self {
        Self {
            service_name: service_name.into(),
            tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: TagValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Binary(Vec<u8>),
}

impl KeyValue {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: TagValue::String(value.into()),
        }
    }

    pub fn bool(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Bool(value),
        }
    }

    pub fn int64(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Int64(value),
        }
    }

    pub fn float64(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Float64(value),
        }
    }

    pub fn binary(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Binary(value),
        }
    }

    /// Rendering used for tag-index values, matching what the query side
    /// sends as a plain string.
    pub fn value_string(&self) -> String {
        match &self.value {
            TagValue::String(s) => s.clone(),
            TagValue::Bool(b) => b.to_string(),
            TagValue::Int64(i) => i.to_string(),
            TagValue::Float64(f) => f.to_string(),
            TagValue::Binary(b) => hex_string(b),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.value, TagValue::Binary(_))
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLog {
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefKind {
    ChildOf,
    FollowsFrom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRef {
    pub trace_id: TraceId,
    pub span_id: u64,
    pub kind: RefKind,
}

/// A trace is the set of spans sharing one trace id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub spans: Vec<Span>,
}

impl Trace {
    pub fn find_span(&self, span_id: u64) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_kind_comes_from_tag() {
        let span = Span {
            trace_id: TraceId::new(1, 2),
            span_id: 3,
            operation_name: "op".into(),
            flags: 0,
            start_time: Utc::now(),
            duration: std::time::Duration::from_millis(5),
            process: Process::new("svc", vec![]),
            tags: vec![KeyValue::string(SPAN_KIND_TAG, "server")],
            logs: vec![],
            references: vec![],
        };
        assert_eq!(span.span_kind(), "server");
    }

    #[test]
    fn tag_values_render_as_strings() {
        assert_eq!(KeyValue::string("k", "v").value_string(), "v");
        assert_eq!(KeyValue::int64("k", 504).value_string(), "504");
        assert_eq!(KeyValue::bool("k", true).value_string(), "true");
        assert_eq!(KeyValue::binary("k", vec![0xde, 0xad]).value_string(), "dead");
        assert!(KeyValue::binary("k", vec![1]).is_binary());
    }
}
