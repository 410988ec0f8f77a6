//! Table definitions and the DDL/DML templates parameterized by table path.
//!
//! All tables live under one logical folder (a schema namespace); partitioned
//! tables additionally carry a `_<date>_<num>` suffix per time slice.

use crate::partition::PartitionKey;

pub const TBL_PARTITIONS: &str = "partitions";
pub const TBL_SERVICE_NAMES: &str = "service_names";
pub const TBL_OPERATION_NAMES: &str = "operation_names_v2";
pub const TBL_ARCHIVE: &str = "archive";

pub const TBL_TRACES: &str = "traces";
pub const TBL_IDX_SERVICE_NAME: &str = "idx_service_name";
pub const TBL_IDX_SERVICE_OP: &str = "idx_service_op";
pub const TBL_IDX_DURATION: &str = "idx_duration";
pub const TBL_IDX_TAG: &str = "idx_tag_v2";

pub type Definition = fn(&str) -> String;

/// Logical path prefix all tables live under.
#[derive(Debug, Clone)]
pub struct DbFolder {
    name: String,
}

impl DbFolder {
    pub fn new(name: &str) -> Self {
        let name = if name.is_empty() { "main" } else { name };
        Self { name: name.to_string() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_sql(&self) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.name)
    }

    /// Fully qualified static table name.
    pub fn table(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.name, table)
    }

    /// Fully qualified partitioned table name for one time slice.
    pub fn partition_table(&self, table: &str, part: &PartitionKey) -> String {
        format!("\"{}\".\"{}_{}\"", self.name, table, part.suffix())
    }
}

/// Static tables, created once and kept forever.
pub fn static_tables() -> [(&'static str, Definition); 4] {
    [
        (TBL_PARTITIONS, partitions),
        (TBL_SERVICE_NAMES, service_names),
        (TBL_OPERATION_NAMES, operation_names),
        (TBL_ARCHIVE, span_table),
    ]
}

/// Tables created per `{date, num}` slice and dropped on retirement.
pub fn partition_tables() -> [(&'static str, Definition); 5] {
    [
        (TBL_TRACES, span_table),
        (TBL_IDX_SERVICE_NAME, service_name_index),
        (TBL_IDX_SERVICE_OP, service_name_index),
        (TBL_IDX_DURATION, duration_index),
        (TBL_IDX_TAG, tag_index),
    ]
}

fn span_table(full: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n\
         \ttrace_id_low UBIGINT NOT NULL,\n\
         \ttrace_id_high UBIGINT NOT NULL,\n\
         \tspan_id UBIGINT NOT NULL,\n\
         \toperation_name TEXT,\n\
         \tflags UINTEGER,\n\
         \tstart_time BIGINT,\n\
         \tduration BIGINT,\n\
         \textra BLOB,\n\
         \tPRIMARY KEY (trace_id_low, trace_id_high, span_id)\n\
         )"
    )
}

fn service_name_index(full: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n\
         \tidx_hash UBIGINT NOT NULL,\n\
         \trev_start_time BIGINT NOT NULL,\n\
         \tuniq UINTEGER NOT NULL,\n\
         \ttrace_ids BLOB,\n\
         \tPRIMARY KEY (idx_hash, rev_start_time, uniq)\n\
         )"
    )
}

fn duration_index(full: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n\
         \tidx_hash UBIGINT NOT NULL,\n\
         \tduration BIGINT NOT NULL,\n\
         \trev_start_time BIGINT NOT NULL,\n\
         \tuniq UINTEGER NOT NULL,\n\
         \ttrace_ids BLOB,\n\
         \tPRIMARY KEY (idx_hash, duration, rev_start_time, uniq)\n\
         )"
    )
}

fn tag_index(full: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n\
         \tidx_hash UBIGINT NOT NULL,\n\
         \trev_start_time BIGINT NOT NULL,\n\
         \top_hash UBIGINT NOT NULL,\n\
         \tuniq UINTEGER NOT NULL,\n\
         \ttrace_ids BLOB,\n\
         \tPRIMARY KEY (idx_hash, rev_start_time, op_hash, uniq)\n\
         )"
    )
}

fn partitions(full: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n\
         \tpart_date TEXT NOT NULL,\n\
         \tpart_num UTINYINT NOT NULL,\n\
         \tis_active BOOLEAN NOT NULL,\n\
         \tPRIMARY KEY (part_date, part_num)\n\
         )"
    )
}

fn service_names(full: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n\
         \tservice_name TEXT NOT NULL,\n\
         \tPRIMARY KEY (service_name)\n\
         )"
    )
}

fn operation_names(full: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {full} (\n\
         \tservice_name TEXT NOT NULL,\n\
         \tspan_kind TEXT NOT NULL,\n\
         \toperation_name TEXT NOT NULL,\n\
         \tPRIMARY KEY (service_name, span_kind, operation_name)\n\
         )"
    )
}

// Partition bookkeeping rows.

pub fn upsert_partition(folder: &DbFolder) -> String {
    format!(
        "INSERT OR REPLACE INTO {} (part_date, part_num, is_active) VALUES (?, ?, ?)",
        folder.table(TBL_PARTITIONS)
    )
}

pub fn update_partition_active(folder: &DbFolder) -> String {
    format!(
        "UPDATE {} SET is_active = ? WHERE part_date = ? AND part_num = ?",
        folder.table(TBL_PARTITIONS)
    )
}

pub fn delete_partition(folder: &DbFolder) -> String {
    format!(
        "DELETE FROM {} WHERE part_date = ? AND part_num = ?",
        folder.table(TBL_PARTITIONS)
    )
}

pub fn select_partitions(folder: &DbFolder) -> String {
    format!(
        "SELECT part_date, part_num, is_active FROM {}",
        folder.table(TBL_PARTITIONS)
    )
}

pub fn select_active_partitions(folder: &DbFolder) -> String {
    format!(
        "SELECT part_date, part_num, is_active FROM {} WHERE is_active = true",
        folder.table(TBL_PARTITIONS)
    )
}

// Catalog rows, written idempotently.

pub fn upsert_service_name(folder: &DbFolder) -> String {
    format!(
        "INSERT OR REPLACE INTO {} (service_name) VALUES (?)",
        folder.table(TBL_SERVICE_NAMES)
    )
}

pub fn upsert_operation_name(folder: &DbFolder) -> String {
    format!(
        "INSERT OR REPLACE INTO {} (service_name, span_kind, operation_name) VALUES (?, ?, ?)",
        folder.table(TBL_OPERATION_NAMES)
    )
}

// Bulk upserts into span and index tables.

pub fn upsert_span(full: &str) -> String {
    format!(
        "INSERT OR REPLACE INTO {full} \
         (trace_id_low, trace_id_high, span_id, operation_name, flags, start_time, duration, extra) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    )
}

pub fn upsert_index(table: &str, full: &str) -> String {
    match table {
        TBL_IDX_DURATION => format!(
            "INSERT OR REPLACE INTO {full} (idx_hash, duration, rev_start_time, uniq, trace_ids) \
             VALUES (?, ?, ?, ?, ?)"
        ),
        TBL_IDX_TAG => format!(
            "INSERT OR REPLACE INTO {full} (idx_hash, rev_start_time, op_hash, uniq, trace_ids) \
             VALUES (?, ?, ?, ?, ?)"
        ),
        _ => format!(
            "INSERT OR REPLACE INTO {full} (idx_hash, rev_start_time, uniq, trace_ids) \
             VALUES (?, ?, ?, ?)"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition_from_time;
    use chrono::{TimeZone, Utc};

    #[test]
    fn qualified_names() {
        let folder = DbFolder::new("jaeger");
        let part = partition_from_time(Utc.with_ymd_and_hms(2063, 4, 5, 0, 30, 0).unwrap());
        assert_eq!(folder.table(TBL_ARCHIVE), "\"jaeger\".\"archive\"");
        assert_eq!(
            folder.partition_table(TBL_TRACES, &part),
            "\"jaeger\".\"traces_20630405_0\""
        );
    }

    #[test]
    fn empty_folder_falls_back_to_main() {
        assert_eq!(DbFolder::new("").table("t"), "\"main\".\"t\"");
    }

    #[test]
    fn index_upserts_match_table_shapes() {
        assert!(upsert_index(TBL_IDX_DURATION, "t").contains("duration"));
        assert!(upsert_index(TBL_IDX_TAG, "t").contains("op_hash"));
        assert!(!upsert_index(TBL_IDX_SERVICE_NAME, "t").contains("op_hash"));
    }
}
