//! Read-path query templates.
//!
//! Index probes bind, in order: idx_hash, rev_start_time bounds
//! (`-time_max`, `-time_min`), any extra columns, then the row limit.

use crate::partition::PartitionKey;
use crate::schema::{self, DbFolder};

pub fn span_count(folder: &DbFolder, part: &PartitionKey) -> String {
    span_count_in(&folder.partition_table(schema::TBL_TRACES, part))
}

pub fn span_count_archive(folder: &DbFolder) -> String {
    span_count_in(&folder.table(schema::TBL_ARCHIVE))
}

fn span_count_in(full: &str) -> String {
    format!("SELECT COUNT(*) FROM {full} WHERE trace_id_high = ? AND trace_id_low = ?")
}

pub fn by_trace_id(folder: &DbFolder, part: &PartitionKey) -> String {
    by_trace_id_in(&folder.partition_table(schema::TBL_TRACES, part))
}

pub fn by_trace_id_archive(folder: &DbFolder) -> String {
    by_trace_id_in(&folder.table(schema::TBL_ARCHIVE))
}

fn by_trace_id_in(full: &str) -> String {
    format!(
        "SELECT trace_id_low, trace_id_high, span_id, operation_name, flags, start_time, duration, extra \
         FROM {full} \
         WHERE trace_id_high = ? AND trace_id_low = ? \
         LIMIT ? OFFSET ?"
    )
}

pub fn by_service_name(folder: &DbFolder, part: &PartitionKey) -> String {
    index_probe(&folder.partition_table(schema::TBL_IDX_SERVICE_NAME, part), "")
}

pub fn by_service_and_operation(folder: &DbFolder, part: &PartitionKey) -> String {
    index_probe(&folder.partition_table(schema::TBL_IDX_SERVICE_OP, part), "")
}

pub fn by_duration(folder: &DbFolder, part: &PartitionKey) -> String {
    index_probe(
        &folder.partition_table(schema::TBL_IDX_DURATION, part),
        "AND duration >= ? AND duration <= ? ",
    )
}

pub fn by_tag(folder: &DbFolder, part: &PartitionKey) -> String {
    index_probe(&folder.partition_table(schema::TBL_IDX_TAG, part), "")
}

pub fn by_tag_and_operation(folder: &DbFolder, part: &PartitionKey) -> String {
    index_probe(
        &folder.partition_table(schema::TBL_IDX_TAG, part),
        "AND op_hash = ? ",
    )
}

fn index_probe(full: &str, extra_where: &str) -> String {
    format!(
        "SELECT trace_ids, rev_start_time \
         FROM {full} \
         WHERE idx_hash = ? AND rev_start_time >= ? AND rev_start_time <= ? \
         {extra_where}\
         LIMIT ?"
    )
}

pub fn services(folder: &DbFolder) -> String {
    format!(
        "SELECT service_name FROM {} ORDER BY service_name LIMIT ?",
        folder.table(schema::TBL_SERVICE_NAMES)
    )
}

pub fn operations(folder: &DbFolder) -> String {
    format!(
        "SELECT operation_name, span_kind FROM {} WHERE service_name = ? \
         ORDER BY operation_name LIMIT ?",
        folder.table(schema::TBL_OPERATION_NAMES)
    )
}

pub fn operations_with_kind(folder: &DbFolder) -> String {
    format!(
        "SELECT operation_name, span_kind FROM {} WHERE service_name = ? AND span_kind = ? \
         ORDER BY operation_name LIMIT ?",
        folder.table(schema::TBL_OPERATION_NAMES)
    )
}
