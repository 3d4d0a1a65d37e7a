//! The storage engine facade: boot recovery, worker spawn, and the typed
//! operations the HTTP layer (and tests) drive.
//!
//! Boot order matters: committed transaction journals replay first, then
//! storages are discovered and indexed, then workers start, and finally
//! pending delete jobs are resubmitted so interrupted deletions finish.

use crate::config::Config;
use crate::fs::{self, FileSys};
use crate::model::{
    DeleteQuery, LogRecord, SearchQuery, Value, BLOCK_MAX_SIZE, DELETED_SENTINEL,
    DIR_DELETE_TASKS, DIR_STORAGES, DIR_TRANSACTIONS, MAX_LOGS_IN_CHUNK,
};
use crate::query::Processor;
use crate::store::{
    shared_queue, ChunkReader, ChunkWriter, DeleteJob, Deleter, MetasMap, ReadLogsTask, Scheduler,
    WriteLogsTask,
};
use crate::{Error, Result};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Engine {
    metas: MetasMap,
    filesys: FileSys,
    write_tx: mpsc::Sender<WriteLogsTask>,
    read_tx: mpsc::Sender<ReadLogsTask>,
    delete_tx: mpsc::Sender<DeleteJob>,
    cancel: CancellationToken,
}

impl Engine {
    /// Recover on-disk state and start every worker and scheduler task.
    pub async fn bootstrap(config: &Config) -> Result<Engine> {
        let filesys = FileSys::new(config.data_dir.clone());
        filesys.make_dir_all(DIR_STORAGES)?;
        filesys.make_dir_all(DIR_TRANSACTIONS)?;
        filesys.make_dir_all(DIR_DELETE_TASKS)?;

        let replayed = fs::replay_all(&filesys)?;
        let (metas_by_storage, first_raw_chunks) = filesys.discover_storages()?;
        info!(
            replayed,
            storages = metas_by_storage.len(),
            "boot recovery complete"
        );

        let metas = MetasMap::new(BLOCK_MAX_SIZE);
        for (storage, chunk_metas) in &metas_by_storage {
            metas.add_storage(storage, chunk_metas);
        }

        let (write_tx, write_rx) = mpsc::channel(1);
        let (read_tx, read_rx) = mpsc::channel(1);
        let (delete_tx, delete_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        spawn_writers(config, &filesys, &first_raw_chunks, &metas, write_rx);
        spawn_readers(config, &filesys, &metas, read_rx);
        spawn_deleters(config, &filesys, &metas, delete_rx, &cancel);

        // Resubmit deletions that were journaled but not finished.
        for query in filesys.read_pending_delete_queries()? {
            let _ = delete_tx.send(DeleteJob { query, reply: None }).await;
        }

        Ok(Engine {
            metas,
            filesys,
            write_tx,
            read_tx,
            delete_tx,
            cancel,
        })
    }

    /// Append a validated batch; resolves once the batch is durable and the
    /// registry update has been queued.
    pub async fn write_logs(&self, storage: String, logs: Vec<LogRecord>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .send(WriteLogsTask {
                storage,
                logs,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Internal("writers are gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("writer dropped the reply".to_string()))?
    }

    /// Run a search query to completion and return its rows.
    pub async fn search(&self, query: SearchQuery) -> Result<Vec<Vec<Value>>> {
        let (mut processor, plan) = Processor::new(query)?;

        let (logs_tx, mut logs_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.read_tx
            .send(ReadLogsTask {
                plan,
                logs_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Internal("readers are gone".to_string()))?;

        processor.collect(&mut logs_rx, reply_rx).await?;
        processor.into_rows()
    }

    /// Journal a delete query. Resolves once the job is durable; the actual
    /// deletion is eventual.
    pub async fn delete_logs(&self, query: DeleteQuery) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.delete_tx
            .send(DeleteJob {
                query,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| Error::Internal("deleters are gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("deleter dropped the reply".to_string()))?
    }

    pub fn storages(&self) -> Vec<String> {
        self.metas.storages()
    }

    pub fn create_storage(&self, storage: &str) -> Result<()> {
        if !self.metas.add_storage(storage, &[]) {
            return Err(Error::Conflict(format!(
                "Storage '{storage}' already exists"
            )));
        }
        self.filesys
            .make_dir_all(&format!("{DIR_STORAGES}/{storage}"))?;
        Ok(())
    }

    /// Unregister a storage. Its directory is dropped asynchronously by the
    /// remover; the sentinel covers a crash before that happens.
    pub fn drop_storage(&self, storage: &str) -> Result<()> {
        if !self.metas.delete_storage(storage) {
            return Err(Error::not_found(format!("Storage '{storage}' not exists")));
        }
        self.filesys.write_file(
            &format!("{DIR_STORAGES}/{storage}/{DELETED_SENTINEL}"),
            b"",
            false,
        )?;
        Ok(())
    }

    /// Stop the background schedulers. In-flight worker tasks run to
    /// completion.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// The registry handle, exposed for maintenance passes and tests.
    pub fn metas(&self) -> &MetasMap {
        &self.metas
    }
}

fn spawn_writers(
    config: &Config,
    filesys: &FileSys,
    first_raw_chunks: &HashMap<String, u64>,
    metas: &MetasMap,
    write_rx: mpsc::Receiver<WriteLogsTask>,
) {
    let queue = shared_queue(write_rx);
    let step = u64::from(config.writers);
    for instance in 0..u64::from(config.writers) {
        let writer = ChunkWriter::new(filesys.clone(), MAX_LOGS_IN_CHUNK);
        let reader = ChunkReader::new(filesys.clone());
        writer.spawn(
            reader,
            queue.clone(),
            instance,
            step,
            first_raw_chunks,
            metas.clone(),
        );
    }
}

fn spawn_readers(
    config: &Config,
    filesys: &FileSys,
    metas: &MetasMap,
    read_rx: mpsc::Receiver<ReadLogsTask>,
) {
    let queue = shared_queue(read_rx);
    for _ in 0..config.readers {
        let reader = ChunkReader::new(filesys.clone());
        reader.spawn(queue.clone(), metas.clone());
    }
}

fn spawn_deleters(
    config: &Config,
    filesys: &FileSys,
    metas: &MetasMap,
    delete_rx: mpsc::Receiver<DeleteJob>,
    cancel: &CancellationToken,
) {
    let queue = shared_queue(delete_rx);

    // Deleter instances share one read/write pipeline pair.
    let reader = ChunkReader::new(filesys.clone());
    let writer = ChunkWriter::new(filesys.clone(), MAX_LOGS_IN_CHUNK);
    for _ in 0..config.deleters {
        let deleter = Deleter::new(reader.clone(), writer.clone(), filesys.clone());
        deleter.spawn(queue.clone(), metas.clone());
    }

    let scheduler_deleter = Deleter::new(reader.clone(), writer.clone(), filesys.clone());
    let scheduler = Scheduler::new(
        reader,
        writer,
        scheduler_deleter,
        filesys.clone(),
        config.scheduler.clone(),
    );
    scheduler.spawn(metas.clone(), cancel.clone());
}
