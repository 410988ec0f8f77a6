use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use tracevault_core::{Result, VaultError};

const PARTITION_DATE_FORMAT: &str = "%Y%m%d";
const NANOS_PER_DAY: i64 = 24 * 3600 * 1_000_000_000;

/// Number of time slices a day is split into. Read once per process from
/// `TRACEVAULT_SCHEMA_NUM_PARTITIONS`; writers and the watcher must agree on
/// it, so it is deliberately not per-call configuration.
pub fn num_partitions() -> u8 {
    static N: OnceLock<u8> = OnceLock::new();
    *N.get_or_init(|| {
        std::env::var("TRACEVAULT_SCHEMA_NUM_PARTITIONS")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(10)
    })
}

pub fn partition_step() -> Duration {
    Duration::nanoseconds(NANOS_PER_DAY / num_partitions() as i64)
}

/// One `{date, num}` time slice: the unit of table creation and retirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub date: String,
    pub num: u8,
    pub is_active: bool,
}

impl PartitionKey {
    /// Table-name suffix, e.g. `20630405_3`.
    pub fn suffix(&self) -> String {
        format!("{}_{}", self.date, self.num)
    }

    /// Time range `[begin, end)` covered by this slice.
    pub fn time_span(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let date = NaiveDate::parse_from_str(&self.date, PARTITION_DATE_FORMAT)
            .map_err(|e| VaultError::Codec(format!("bad partition date {}: {e}", self.date)))?;
        let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight"));
        let begin = midnight + partition_step() * self.num as i32;
        Ok((begin, begin + partition_step()))
    }
}

pub fn partition_from_time(t: DateTime<Utc>) -> PartitionKey {
    let secs_into_day = (t.timestamp().rem_euclid(86_400)) as u64;
    PartitionKey {
        date: t.format(PARTITION_DATE_FORMAT).to_string(),
        num: (secs_into_day * num_partitions() as u64 / 86_400) as u8,
        is_active: true,
    }
}

/// Consecutive partition keys covering `[start, end]`, separated by exactly
/// one partition step.
pub fn make_partition_list(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PartitionKey> {
    let step = partition_step().num_nanoseconds().expect("step nanos");
    let start_nanos = start.timestamp_nanos_opt().unwrap_or(0);
    let mut cur = Utc.timestamp_nanos(start_nanos - start_nanos.rem_euclid(step));
    let mut out = Vec::new();
    while end >= cur {
        out.push(partition_from_time(cur));
        cur += partition_step();
    }
    out
}

pub fn intersect_partitions(a: &[PartitionKey], b: &[PartitionKey]) -> Vec<PartitionKey> {
    let set: HashSet<&PartitionKey> = a.iter().collect();
    b.iter().filter(|k| set.contains(k)).cloned().collect()
}
