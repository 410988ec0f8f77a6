pub mod batch;
pub mod db;
pub mod dbmodel;
pub mod hash;
pub mod index;
pub mod partition;
pub mod queries;
pub mod reader;
pub mod schema;
pub mod storage;
pub mod watcher;
pub mod writer;

mod indexer;
mod metrics;
mod ttl_map;

pub use db::SessionPool;
pub use reader::{SpanReader, SpanReaderOptions};
pub use storage::{DependencyReader, Storage};
pub use watcher::{Watcher, WatcherOptions};
pub use writer::{SpanWriter, SpanWriterOptions};
