mod telemetry;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use duckdb::params;
use tracevault_core::config::Config;
use tracevault_core::VaultError;
use tracevault_store::{SessionPool, Watcher, WatcherOptions};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tracevault")]
#[command(about = "Schema maintenance for the tracevault span store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Database file (env: TRACEVAULT_DB_PATH)")]
    db_path: Option<PathBuf>,

    #[arg(long, global = true, help = "Logical folder (env: TRACEVAULT_DB_FOLDER)")]
    folder: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run the partition maintenance loop")]
    Watcher,
    #[command(about = "Drop every table found in the folder")]
    DropTables,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut cfg = Config::from_env().context("load config from env")?;
    if let Some(path) = cli.db_path {
        cfg.db_path = path;
    }
    if let Some(folder) = cli.folder {
        cfg.folder = folder;
    }

    match cli.command {
        Commands::Watcher => run_watcher(cfg).await,
        Commands::DropTables => drop_tables(cfg).await,
    }
}

async fn run_watcher(cfg: Config) -> anyhow::Result<()> {
    let pool = SessionPool::open(&cfg).context("open store")?;
    let watcher = Watcher::new(pool, WatcherOptions::from_config(&cfg));

    info!("starting watcher");
    let handle = watcher.run(cfg.watcher_interval);
    shutdown_signal().await;
    info!("stopping watcher");
    handle.abort();
    Ok(())
}

async fn drop_tables(cfg: Config) -> anyhow::Result<()> {
    let pool = SessionPool::open(&cfg).context("open store")?;
    let folder = pool.folder().clone();

    let tables = pool
        .do_with(true, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT table_name FROM information_schema.tables WHERE table_schema = ?",
                )
                .map_err(|e| VaultError::Store(format!("prepare table list: {e}")))?;
            let rows = stmt
                .query_map(params![folder.name()], |row| row.get::<_, String>(0))
                .map_err(|e| VaultError::Store(format!("list tables: {e}")))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| VaultError::Store(format!("scan table list: {e}")))
        })
        .context("enumerate tables")?;

    for table in tables {
        let full = folder.table(&table);
        println!("dropping table '{full}'");
        pool.do_with(true, |conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {full}"))
                .map_err(|e| VaultError::Store(format!("drop table: {e}")))
        })
        .with_context(|| format!("drop {full}"))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
