//! Schema lifecycle: a periodic task creates tables ahead of the write front
//! and retires expired partitions in two phases (deactivate, then drop).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use duckdb::params;
use tokio::task::JoinHandle;
use tracevault_core::config::Config;
use tracevault_core::Result;
use tracing::{error, info, warn};

use crate::db::{is_not_found, store_err, SessionPool};
use crate::partition::{make_partition_list, PartitionKey};
use crate::schema;

const KNOWN_TABLES_CAPACITY: u64 = 500;

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Retention window: partitions whose time span ended earlier than
    /// `now - expiration` are retired.
    pub expiration: Duration,
    /// Forward window for which tables are pre-created.
    pub lookahead: Duration,
}

impl WatcherOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            expiration: cfg.watcher_age,
            lookahead: cfg.watcher_lookahead,
        }
    }
}

pub struct Watcher {
    pool: Arc<SessionPool>,
    opts: WatcherOptions,
    known_tables: moka::sync::Cache<String, ()>,
}

impl Watcher {
    pub fn new(pool: Arc<SessionPool>, opts: WatcherOptions) -> Arc<Self> {
        Arc::new(Self {
            pool,
            opts,
            known_tables: moka::sync::Cache::new(KNOWN_TABLES_CAPACITY),
        })
    }

    /// Runs a pass immediately, then one per interval, until the handle is
    /// aborted.
    pub fn run(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let w = watcher.clone();
                let pass = tokio::task::spawn_blocking(move || w.run_once()).await;
                match pass {
                    Ok(Err(e)) => error!(error = %e, "watcher pass failed"),
                    Err(e) => error!(error = %e, "watcher task failed"),
                    Ok(Ok(())) => {}
                }
            }
        })
    }

    /// One maintenance pass: create static tables and upcoming partitions,
    /// then retire expired ones. A create failure aborts the pass; the next
    /// tick retries.
    pub fn run_once(&self) -> Result<()> {
        self.create_tables()?;
        self.drop_old_tables();
        Ok(())
    }

    fn create_tables(&self) -> Result<()> {
        let now = Utc::now();
        let folder = self.pool.folder();

        for (name, definition) in schema::static_tables() {
            if self.table_known(name) {
                continue;
            }
            let ddl = definition(&folder.table(name));
            self.pool.do_with(true, |conn| {
                conn.execute_batch(&ddl)
                    .map_err(|e| store_err("create table", e))
            })?;
            self.known_tables.insert(name.to_string(), ());
        }

        let upsert = schema::upsert_partition(folder);
        for part in make_partition_list(now, now + chrono_duration(self.opts.lookahead)) {
            info!(suffix = %part.suffix(), "creating partition");
            self.create_tables_for_partition(&part)?;
            self.pool.do_with(true, |conn| {
                conn.execute(&upsert, params![part.date, part.num, true])
                    .map_err(|e| store_err("partition save", e))
                    .map(|_| ())
            })?;
        }
        Ok(())
    }

    fn create_tables_for_partition(&self, part: &PartitionKey) -> Result<()> {
        let folder = self.pool.folder();
        for (name, definition) in schema::partition_tables() {
            let bare = format!("{name}_{}", part.suffix());
            if self.table_known(&bare) {
                continue;
            }
            let ddl = definition(&folder.partition_table(name, part));
            self.pool.do_with(true, |conn| {
                conn.execute_batch(&ddl)
                    .map_err(|e| store_err("create table", e))
            })?;
            self.known_tables.insert(bare, ());
        }
        Ok(())
    }

    fn drop_old_tables(&self) {
        let expire_before = Utc::now() - chrono_duration(self.opts.expiration);
        info!(before = %expire_before, "retiring expired partitions");

        let parts = match self.list_partitions() {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "partition list query failed");
                return;
            }
        };

        for part in parts {
            let end = match part.time_span() {
                Ok((_, end)) => end,
                Err(e) => {
                    error!(error = %e, "partition scan failed");
                    continue;
                }
            };
            if end >= expire_before {
                continue;
            }
            if part.is_active {
                if let Err(e) = self.deactivate_partition(&part) {
                    error!(suffix = %part.suffix(), error = %e, "partition update failed");
                }
            } else {
                info!(suffix = %part.suffix(), "dropping partition");
                if self.drop_partition_tables(&part).is_err() {
                    continue;
                }
                if let Err(e) = self.delete_partition_row(&part) {
                    error!(suffix = %part.suffix(), error = %e, "partition delete failed");
                }
            }
        }
    }

    fn list_partitions(&self) -> Result<Vec<PartitionKey>> {
        let sql = schema::select_partitions(self.pool.folder());
        self.pool.do_with(true, |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| store_err("prepare partitions", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(PartitionKey {
                        date: row.get::<_, String>(0)?,
                        num: row.get::<_, u8>(1)?,
                        is_active: row.get::<_, bool>(2)?,
                    })
                })
                .map_err(|e| store_err("query partitions", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err("scan partitions", e))
        })
    }

    fn deactivate_partition(&self, part: &PartitionKey) -> Result<()> {
        let sql = schema::update_partition_active(self.pool.folder());
        self.pool.do_with(true, |conn| {
            conn.execute(&sql, params![false, part.date, part.num])
                .map_err(|e| store_err("partition update", e))
                .map(|_| ())
        })
    }

    fn drop_partition_tables(&self, part: &PartitionKey) -> Result<()> {
        let folder = self.pool.folder();
        for (name, _) in schema::partition_tables() {
            let full = folder.partition_table(name, part);
            let res = self.pool.do_with(true, |conn| {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {full}"))
                    .map_err(|e| store_err("drop table", e))
            });
            match res {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    warn!(table = %full, error = %e, "drop table failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn delete_partition_row(&self, part: &PartitionKey) -> Result<()> {
        let sql = schema::delete_partition(self.pool.folder());
        self.pool.do_with(true, |conn| {
            conn.execute(&sql, params![part.date, part.num])
                .map_err(|e| store_err("partition delete", e))
                .map(|_| ())
        })
    }

    /// Cache lookup with a catalog probe fallback, so restarts do not
    /// re-issue creates for tables that already exist.
    fn table_known(&self, bare_name: &str) -> bool {
        if self.known_tables.get(bare_name).is_some() {
            return true;
        }
        let sql = "SELECT COUNT(*) FROM information_schema.tables \
                   WHERE table_schema = ? AND table_name = ?";
        let folder_name = self.pool.folder().name().to_string();
        let exists = self
            .pool
            .do_with(true, |conn| {
                conn.query_row(sql, params![folder_name, bare_name], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(|e| store_err("table probe", e))
            })
            .map(|n| n > 0)
            .unwrap_or(false);
        if exists {
            self.known_tables.insert(bare_name.to_string(), ());
        }
        exists
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::MAX)
}
