//! Counter and timer emission for the write pipeline and the span filters.

use std::time::Duration;

use ::metrics::{counter, histogram};
use tracevault_core::VaultError;

/// Attempt/ok/err counters plus latency timers for one upsert target.
pub(crate) struct WriteMetrics {
    table: String,
}

impl WriteMetrics {
    pub(crate) fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }

    pub(crate) fn emit(&self, err: Option<&VaultError>, latency: Duration, records: usize) {
        counter!("tracevault_write_attempts_total", "table" => self.table.clone()).increment(1);
        let outcome = if err.is_some() { "err" } else { "ok" };
        histogram!(
            "tracevault_write_latency_seconds",
            "table" => self.table.clone(),
            "outcome" => outcome
        )
        .record(latency.as_secs_f64());
        counter!(
            "tracevault_write_records_total",
            "table" => self.table.clone(),
            "outcome" => outcome
        )
        .increment(records as u64);
        if err.is_some() {
            counter!("tracevault_write_errors_total", "table" => self.table.clone()).increment(1);
        } else {
            counter!("tracevault_write_inserts_total", "table" => self.table.clone()).increment(1);
        }
    }
}

pub(crate) fn record_dropped(queue: &'static str) {
    counter!("tracevault_queue_dropped_total", "queue" => queue).increment(1);
}

pub(crate) fn record_invalid_span(svc: &str, op: &str) {
    counter!(
        "tracevault_invalid_spans_total",
        "svc" => svc.to_string(),
        "op" => op.to_string()
    )
    .increment(1);
}
