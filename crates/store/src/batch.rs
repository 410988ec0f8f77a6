//! Generic single-producer/multi-consumer batching queue.
//!
//! Submit is non-blocking: a full item buffer drops the item and reports
//! overflow. One accumulator task flushes on batch size or a one-second
//! timer into a 10-slot in-flight channel drained by N workers; the in-flight
//! channel is where backpressure builds up between accumulation and writes.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracevault_core::{Result, VaultError};

use crate::metrics::record_dropped;

const IN_FLIGHT_BATCHES: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Destination for flushed batches. Implementations swallow their own errors;
/// a batch handed over is considered spent.
pub trait BatchSink<T>: Send + Sync + 'static {
    fn write_items(&self, items: Vec<T>);
}

#[derive(Debug, Clone, Copy)]
pub struct BatchQueueOptions {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub workers: usize,
}

impl Default for BatchQueueOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_size: 100,
            workers: 10,
        }
    }
}

#[derive(Clone)]
pub struct BatchQueue<T> {
    tx: mpsc::Sender<T>,
    name: &'static str,
}

impl<T: Send + 'static> BatchQueue<T> {
    /// Spawns the accumulator and flush workers; must be called inside a
    /// tokio runtime.
    pub fn start(name: &'static str, opts: BatchQueueOptions, sink: Arc<dyn BatchSink<T>>) -> Self {
        let (tx, rx) = mpsc::channel(opts.buffer_size.max(1));
        let (flush_tx, flush_rx) = mpsc::channel(IN_FLIGHT_BATCHES);

        tokio::spawn(accumulate(rx, flush_tx, opts.batch_size.max(1)));
        let flush_rx = Arc::new(tokio::sync::Mutex::new(flush_rx));
        for _ in 0..opts.workers.max(1) {
            tokio::spawn(drain(flush_rx.clone(), sink.clone()));
        }

        Self { tx, name }
    }

    /// Non-blocking submit; a full buffer counts and drops the item.
    pub fn add(&self, item: T) -> Result<()> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_dropped(self.name);
                Err(VaultError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VaultError::Store(format!("{} queue closed", self.name)))
            }
        }
    }
}

async fn accumulate<T>(
    mut rx: mpsc::Receiver<T>,
    flush_tx: mpsc::Sender<Vec<T>>,
    batch_size: usize,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    batch.push(item);
                    if batch.len() >= batch_size
                        && flush_tx.send(mem::take(&mut batch)).await.is_err()
                    {
                        return;
                    }
                }
                None => {
                    if !batch.is_empty() {
                        let _ = flush_tx.send(batch).await;
                    }
                    return;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() && flush_tx.send(mem::take(&mut batch)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn drain<T: 'static>(
    flush_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<T>>>>,
    sink: Arc<dyn BatchSink<T>>,
) {
    loop {
        let batch = { flush_rx.lock().await.recv().await };
        match batch {
            Some(items) => sink.write_items(items),
            None => return,
        }
    }
}
