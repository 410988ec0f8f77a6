//! Session pool over the embedded database.
//!
//! One database handle is cloned into `pool_size` connections, each guarded
//! by a mutex. Every subsystem goes through [`SessionPool::do_with`], which
//! acquires a session, runs the operation and retries transient failures
//! when the operation is idempotent.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use duckdb::Connection;
use parking_lot::Mutex;
use tracevault_core::config::Config;
use tracevault_core::{Result, VaultError};

use crate::schema::DbFolder;

const MAX_RETRIES: usize = 12;
const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);

pub struct SessionPool {
    sessions: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    folder: DbFolder,
}

impl SessionPool {
    pub fn open(cfg: &Config) -> Result<Arc<Self>> {
        let started = Instant::now();
        if let Some(parent) = cfg.db_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| VaultError::Io(format!("create db dir: {e}")))?;
        }
        let conn = Connection::open(&cfg.db_path)
            .map_err(|e| VaultError::Store(format!("open database: {e}")))?;
        let pool = Self::from_connection(conn, &cfg.folder, cfg.pool_size)?;
        if started.elapsed() > cfg.connect_timeout {
            return Err(VaultError::Store(format!(
                "connect exceeded {:?}",
                cfg.connect_timeout
            )));
        }
        Ok(pool)
    }

    pub fn open_in_memory(folder: &str, pool_size: usize) -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()
            .map_err(|e| VaultError::Store(format!("open in-memory database: {e}")))?;
        Self::from_connection(conn, folder, pool_size)
    }

    fn from_connection(conn: Connection, folder: &str, pool_size: usize) -> Result<Arc<Self>> {
        let folder = DbFolder::new(folder);
        conn.execute_batch(&folder.create_sql())
            .map_err(|e| VaultError::Store(format!("create folder: {e}")))?;

        let mut sessions = Vec::with_capacity(pool_size.max(1));
        for _ in 1..pool_size.max(1) {
            let clone = conn
                .try_clone()
                .map_err(|e| VaultError::Store(format!("clone session: {e}")))?;
            sessions.push(Mutex::new(clone));
        }
        sessions.push(Mutex::new(conn));

        let pool = Arc::new(Self {
            sessions,
            next: AtomicUsize::new(0),
            folder,
        });
        // Startup ping: a pool that cannot run a trivial statement is fatal.
        pool.do_with(true, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
                .map_err(|e| VaultError::Store(format!("ping: {e}")))
        })?;
        Ok(pool)
    }

    pub fn folder(&self) -> &DbFolder {
        &self.folder
    }

    /// Acquire a session, run `op`, release. Idempotent operations are
    /// retried on transient errors with bounded attempts and backoff.
    pub fn do_with<T>(
        &self,
        idempotent: bool,
        op: impl Fn(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let attempts = if idempotent { MAX_RETRIES } else { 1 };
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(RETRY_BACKOFF);
            }
            let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
            let mut conn = self.sessions[slot].lock();
            match op(&mut conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_retriable(&e) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| VaultError::Store("retries exhausted".into())))
    }
}

/// Transient failures worth another attempt on a fresh session.
fn is_retriable(err: &VaultError) -> bool {
    match err {
        VaultError::Store(msg) => {
            msg.contains("database is locked")
                || msg.contains("Conflict")
                || msg.contains("TransactionContext")
                || msg.contains("IO Error")
        }
        _ => false,
    }
}

/// Table-not-found shape of scheme errors, tolerated on drops.
pub(crate) fn is_not_found(err: &VaultError) -> bool {
    matches!(err, VaultError::Store(msg) if msg.contains("does not exist") || msg.contains("not found"))
}

pub(crate) fn store_err(what: &str, e: duckdb::Error) -> VaultError {
    VaultError::Store(format!("{what}: {e}"))
}

/// Run `f` inside one transaction; commit on success.
pub(crate) fn in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&duckdb::Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn
        .transaction()
        .map_err(|e| store_err("begin transaction", e))?;
    let out = f(&tx)?;
    tx.commit().map_err(|e| store_err("commit", e))?;
    Ok(out)
}
