use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Store configuration, loaded from `TRACEVAULT_*` environment variables on
/// top of built-in defaults. Durations accept humantime syntax ("5m", "12h").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Database file location.
    pub db_path: PathBuf,
    /// Logical folder all tables live under (a schema namespace).
    pub folder: String,

    pub connect_timeout: Duration,
    pub pool_size: usize,
    pub query_cache_size: u64,

    pub write_timeout: Duration,
    pub write_attempt_timeout: Duration,
    pub read_timeout: Duration,
    pub read_query_parallel: usize,
    pub read_op_limit: u64,
    pub read_svc_limit: u64,

    pub writer_buffer_size: usize,
    pub writer_batch_size: usize,
    pub writer_batch_workers: usize,
    /// Spans older than this are counted and dropped; zero disables the check.
    pub writer_max_span_age: Duration,
    pub writer_name_cache_size: u64,

    pub indexer_buffer_size: usize,
    pub indexer_max_traces: usize,
    pub indexer_max_ttl: Duration,

    pub watcher_interval: Duration,
    pub watcher_age: Duration,
    pub watcher_lookahead: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_root = env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(home).join(".local/share"));

        Self {
            db_path: data_root.join("tracevault/tracevault.duckdb"),
            folder: "tracevault".to_string(),

            connect_timeout: Duration::from_secs(10),
            pool_size: 100,
            query_cache_size: 50,

            write_timeout: Duration::from_secs(1),
            write_attempt_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(10),
            read_query_parallel: 16,
            read_op_limit: 5000,
            read_svc_limit: 1000,

            writer_buffer_size: 1000,
            writer_batch_size: 100,
            writer_batch_workers: 10,
            writer_max_span_age: Duration::ZERO,
            writer_name_cache_size: 256,

            indexer_buffer_size: 1000,
            indexer_max_traces: 100,
            indexer_max_ttl: Duration::from_secs(5),

            watcher_interval: Duration::from_secs(300),
            watcher_age: Duration::from_secs(24 * 3600),
            watcher_lookahead: Duration::from_secs(12 * 3600),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("TRACEVAULT_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("TRACEVAULT_DB_FOLDER") {
            cfg.folder = v;
        }

        env_duration("TRACEVAULT_CONNECT_TIMEOUT", &mut cfg.connect_timeout)?;
        env_parse("TRACEVAULT_POOL_SIZE", &mut cfg.pool_size)?;
        env_parse("TRACEVAULT_QUERY_CACHE_SIZE", &mut cfg.query_cache_size)?;

        env_duration("TRACEVAULT_WRITE_TIMEOUT", &mut cfg.write_timeout)?;
        env_duration(
            "TRACEVAULT_WRITE_ATTEMPT_TIMEOUT",
            &mut cfg.write_attempt_timeout,
        )?;
        env_duration("TRACEVAULT_READ_TIMEOUT", &mut cfg.read_timeout)?;
        env_parse(
            "TRACEVAULT_READ_QUERY_PARALLEL",
            &mut cfg.read_query_parallel,
        )?;
        env_parse("TRACEVAULT_READ_OP_LIMIT", &mut cfg.read_op_limit)?;
        env_parse("TRACEVAULT_READ_SVC_LIMIT", &mut cfg.read_svc_limit)?;

        env_parse("TRACEVAULT_WRITER_BUFFER_SIZE", &mut cfg.writer_buffer_size)?;
        env_parse("TRACEVAULT_WRITER_BATCH_SIZE", &mut cfg.writer_batch_size)?;
        env_parse(
            "TRACEVAULT_WRITER_BATCH_WORKERS",
            &mut cfg.writer_batch_workers,
        )?;
        env_duration(
            "TRACEVAULT_WRITER_MAX_SPAN_AGE",
            &mut cfg.writer_max_span_age,
        )?;
        env_parse(
            "TRACEVAULT_WRITER_NAME_CACHE_SIZE",
            &mut cfg.writer_name_cache_size,
        )?;

        env_parse(
            "TRACEVAULT_INDEXER_BUFFER_SIZE",
            &mut cfg.indexer_buffer_size,
        )?;
        env_parse("TRACEVAULT_INDEXER_MAX_TRACES", &mut cfg.indexer_max_traces)?;
        env_duration("TRACEVAULT_INDEXER_MAX_TTL", &mut cfg.indexer_max_ttl)?;

        env_duration("TRACEVAULT_WATCHER_INTERVAL", &mut cfg.watcher_interval)?;
        env_duration("TRACEVAULT_WATCHER_AGE", &mut cfg.watcher_age)?;
        env_duration("TRACEVAULT_WATCHER_LOOKAHEAD", &mut cfg.watcher_lookahead)?;

        Ok(cfg)
    }
}

fn env_duration(key: &str, slot: &mut Duration) -> Result<()> {
    if let Ok(v) = env::var(key) {
        *slot = humantime::parse_duration(&v)
            .map_err(|e| VaultError::Config(format!("bad {key}: {e}")))?;
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(v) = env::var(key) {
        *slot = v
            .parse::<T>()
            .map_err(|e| VaultError::Config(format!("bad {key}: {e}")))?;
    }
    Ok(())
}
