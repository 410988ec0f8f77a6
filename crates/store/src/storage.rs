//! Wires the session pool, writers and readers into the span-store surface
//! the tracing platform consumes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracevault_core::config::Config;
use tracevault_core::query::DependencyLink;
use tracevault_core::{Result, VaultError};

use crate::db::SessionPool;
use crate::reader::{SpanReader, SpanReaderOptions};
use crate::watcher::{Watcher, WatcherOptions};
use crate::writer::{SpanWriter, SpanWriterOptions};

pub struct Storage {
    pool: Arc<SessionPool>,
    writer: Arc<SpanWriter>,
    reader: Arc<SpanReader>,
    archive_writer: Arc<SpanWriter>,
    archive_reader: Arc<SpanReader>,
}

impl Storage {
    /// Opens the pool and builds both the partitioned and the archive
    /// writer/reader pairs. Spawns pipeline tasks, so this must run inside a
    /// tokio runtime.
    pub fn open(cfg: &Config) -> Result<Self> {
        let pool = SessionPool::open(cfg)?;
        Ok(Self::with_pool(pool, cfg))
    }

    pub fn with_pool(pool: Arc<SessionPool>, cfg: &Config) -> Self {
        let writer = Arc::new(SpanWriter::new(
            pool.clone(),
            SpanWriterOptions::from_config(cfg, false),
        ));
        let archive_writer = Arc::new(SpanWriter::new(
            pool.clone(),
            SpanWriterOptions::from_config(cfg, true),
        ));
        let reader = Arc::new(SpanReader::new(
            pool.clone(),
            SpanReaderOptions::from_config(cfg, false),
        ));
        let archive_reader = Arc::new(SpanReader::new(
            pool.clone(),
            SpanReaderOptions::from_config(cfg, true),
        ));
        Self {
            pool,
            writer,
            reader,
            archive_writer,
            archive_reader,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn span_writer(&self) -> Arc<SpanWriter> {
        self.writer.clone()
    }

    pub fn span_reader(&self) -> Arc<SpanReader> {
        self.reader.clone()
    }

    pub fn archive_writer(&self) -> Arc<SpanWriter> {
        self.archive_writer.clone()
    }

    pub fn archive_reader(&self) -> Arc<SpanReader> {
        self.archive_reader.clone()
    }

    pub fn dependency_reader(&self) -> DependencyReader {
        DependencyReader
    }

    /// Schema-lifecycle controller bound to this store's pool.
    pub fn watcher(&self, opts: WatcherOptions) -> Arc<Watcher> {
        Watcher::new(self.pool.clone(), opts)
    }
}

/// Dependency data is not materialized in this store; the operation exists
/// only to satisfy the platform surface.
pub struct DependencyReader;

impl DependencyReader {
    pub async fn get_dependencies(
        &self,
        _end_ts: DateTime<Utc>,
        _lookback: Duration,
    ) -> Result<Vec<DependencyLink>> {
        Err(VaultError::Unimplemented("dependency reader"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependencies_are_unimplemented() {
        let err = DependencyReader
            .get_dependencies(Utc::now(), Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Unimplemented(_)));
    }
}
