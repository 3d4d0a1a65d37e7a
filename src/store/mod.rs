//! The storage engine: the versioned chunk registry, column-parallel
//! read/write pipelines, filtered deletion, and background maintenance.

mod deleter;
mod metas_map;
mod reader;
mod scheduler;
mod writer;

pub use deleter::{DeleteJob, Deleter};
pub use metas_map::{MetasMap, UpdateStateTask, VersionReservation};
pub use reader::{ChunkReader, ReadLogsTask};
pub use scheduler::{align_chunks, Scheduler};
pub use writer::{ChunkWriter, WriteLogsTask};

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A bounded queue shared by several worker instances. Whichever instance
/// holds the lock picks up the next task; processing runs in parallel.
pub type SharedQueue<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Wrap a receiver for shared consumption.
pub fn shared_queue<T>(rx: mpsc::Receiver<T>) -> SharedQueue<T> {
    Arc::new(Mutex::new(rx))
}
