use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trace search parameters as handed over by the tracing platform.
///
/// `num_traces == 0` means "use the server default"; absent time bounds are
/// rejected during validation on the read path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceQuery {
    pub service_name: String,
    pub operation_name: String,
    pub tags: HashMap<String, String>,
    pub start_time_min: Option<DateTime<Utc>>,
    pub start_time_max: Option<DateTime<Utc>>,
    pub duration_min: Option<Duration>,
    pub duration_max: Option<Duration>,
    pub num_traces: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationQuery {
    pub service_name: String,
    pub span_kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub span_kind: String,
}

/// Inter-service dependency edge. The store exposes the read operation but
/// does not materialize dependency data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
}
