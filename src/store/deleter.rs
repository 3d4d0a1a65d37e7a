//! The delete pipeline: a query receiver that validates, journals, and
//! enqueues delete jobs, and workers that rewrite or tombstone the chunks a
//! job touches.
//!
//! New queries are persisted under `delete_tasks/<uuid>` before any chunk is
//! touched, so deletion is idempotent across restarts: a resubmitted job
//! finds nothing left to remove.

use super::metas_map::{MetasMap, UpdateStateTask};
use super::reader::ChunkReader;
use super::writer::ChunkWriter;
use super::SharedQueue;
use crate::fs::{codec, Backuper, FileSys};
use crate::model::{
    ChunkMeta, DeleteQuery, LogRecord, TimeRange, DIR_DELETE_TASKS, DIR_STORAGES, META_NEW_FILE,
};
use crate::query::condition::{self, Condition};
use crate::query::{selector, time_range};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

const TASK_QUEUE_CAPACITY: usize = 20;

/// A delete request plus the caller's reply slot. Jobs resubmitted from
/// disk at boot have no caller.
pub struct DeleteJob {
    pub query: DeleteQuery,
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

struct DeleteLogsTask {
    id: String,
    storage: String,
    time_range: TimeRange,
    condition: Option<Condition>,
}

pub struct Deleter {
    reader: Arc<ChunkReader>,
    writer: Arc<ChunkWriter>,
    filesys: FileSys,
}

impl Deleter {
    pub fn new(reader: Arc<ChunkReader>, writer: Arc<ChunkWriter>, filesys: FileSys) -> Arc<Deleter> {
        Arc::new(Deleter {
            reader,
            writer,
            filesys,
        })
    }

    /// Spawn one receiver/worker pair on the shared delete queue.
    pub fn spawn(self: &Arc<Deleter>, queue: SharedQueue<DeleteJob>, metas: MetasMap) {
        let (task_tx, task_rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
        tokio::spawn(run_receiver(
            Arc::clone(self),
            queue,
            task_tx,
            metas.clone(),
        ));
        tokio::spawn(run_worker(Arc::clone(self), task_rx, metas));
    }

    /// Tombstone a chunk: stage a descriptor with `is_deleted` set, to be
    /// promoted on commit. Column files stay until the remover collects the
    /// whole directory.
    pub fn mark_chunk_deleted(
        &self,
        storage: &str,
        meta: &mut ChunkMeta,
        backuper: &mut Backuper,
    ) -> Result<()> {
        let staged = format!(
            "{DIR_STORAGES}/{storage}/{}/{META_NEW_FILE}",
            meta.dir_name()
        );
        backuper.add_for_replace(&staged);
        backuper.commit()?;

        meta.is_deleted = true;
        let frame = codec::encode_frame(&meta.to_file())?;
        self.filesys.write_file(&staged, &frame, false)?;

        debug!(storage, chunk = meta.dir_name(), "chunk marked deleted");
        Ok(())
    }

    /// Unconditional range deletion on one chunk. A range that covers the
    /// chunk entirely tombstones it without touching column files; anything
    /// else rewrites the survivors as a new version.
    async fn delete_by_time_range(
        &self,
        storage: &str,
        meta: &mut ChunkMeta,
        tr: TimeRange,
        backuper: &mut Backuper,
    ) -> Result<()> {
        if tr.contains(&meta.time_range) {
            return self.mark_chunk_deleted(storage, meta, backuper);
        }

        let logs = self.reader.read_chunk(storage, meta, None).await?;
        let kept = selector::reject_range(logs, tr, !meta.is_raw());
        if kept.is_empty() {
            // The meta's range was wider than its actual records.
            return self.mark_chunk_deleted(storage, meta, backuper);
        }
        self.writer
            .write_new_version_chunk(storage, meta, &kept, backuper)
            .await?;
        Ok(())
    }

    /// Conditional deletion on one chunk: records inside the range span are
    /// dropped iff the condition holds; records outside it always survive.
    /// Returns whether the chunk changed.
    async fn delete_by_condition(
        &self,
        storage: &str,
        meta: &mut ChunkMeta,
        tr: TimeRange,
        condition: &Condition,
        backuper: &mut Backuper,
    ) -> Result<bool> {
        let mut logs = self.reader.read_chunk(storage, meta, None).await?;
        let Some((start, end)) = selector::range_indices(&mut logs, tr, !meta.is_raw()) else {
            return Ok(false);
        };

        let total = logs.len();
        let mut kept: Vec<LogRecord> = Vec::with_capacity(total);

        for (at, log) in logs.into_iter().enumerate() {
            let matched = if at < start || at >= end {
                false
            } else {
                match condition.check(&log) {
                    Ok(matched) => matched,
                    Err(e) => {
                        warn!(storage, chunk = meta.dir_name(), error = %e,
                            "condition failed mid-delete; chunk preserved");
                        return Ok(false);
                    }
                }
            };
            if !matched {
                kept.push(log);
            }
        }

        if kept.len() == total {
            return Ok(false);
        }
        if kept.is_empty() {
            self.mark_chunk_deleted(storage, meta, backuper)?;
            return Ok(true);
        }
        self.writer
            .write_new_version_chunk(storage, meta, &kept, backuper)
            .await?;
        Ok(true)
    }
}

async fn run_receiver(
    deleter: Arc<Deleter>,
    queue: SharedQueue<DeleteJob>,
    task_tx: mpsc::Sender<DeleteLogsTask>,
    metas: MetasMap,
) {
    loop {
        let job = { queue.lock().await.recv().await };
        let Some(mut job) = job else { break };

        let result = receive_query(&deleter, &metas, &mut job.query, &task_tx).await;
        if let Some(reply) = job.reply.take() {
            let _ = reply.send(result);
        }
    }
}

async fn receive_query(
    deleter: &Deleter,
    metas: &MetasMap,
    query: &mut DeleteQuery,
    task_tx: &mpsc::Sender<DeleteLogsTask>,
) -> Result<()> {
    if !metas.exists(&query.storage) {
        return Err(Error::not_found(format!(
            "Storage '{}' not exists",
            query.storage
        )));
    }

    let condition = if query.r#where.is_empty() {
        None
    } else {
        Some(condition::parse(
            &query.r#where,
            &query.where_values,
            None,
            None,
        )?)
    };
    let tr = if query.time_range.is_empty() {
        TimeRange::default()
    } else {
        time_range::parse(&query.time_range)?
    };

    // Journal new queries before any chunk is touched.
    if query.task_id.is_empty() {
        query.task_id = Uuid::new_v4().to_string();
        deleter.filesys.write_file(
            &format!("{DIR_DELETE_TASKS}/{}", query.task_id),
            &serde_json::to_vec(query).map_err(|e| Error::Codec(e.to_string()))?,
            true,
        )?;
    }

    task_tx
        .send(DeleteLogsTask {
            id: query.task_id.clone(),
            storage: query.storage.clone(),
            time_range: tr,
            condition,
        })
        .await
        .map_err(|_| Error::Internal("delete worker is gone".to_string()))?;

    debug!(task = query.task_id, storage = query.storage, "delete task journaled");
    Ok(())
}

async fn run_worker(
    deleter: Arc<Deleter>,
    mut task_rx: mpsc::Receiver<DeleteLogsTask>,
    metas: MetasMap,
) {
    while let Some(task) = task_rx.recv().await {
        run_delete_task(&deleter, &metas, &task).await;

        if let Err(e) = deleter
            .filesys
            .remove_file(&format!("{DIR_DELETE_TASKS}/{}", task.id))
        {
            error!(task = task.id, error = %e, "failed to drop delete journal");
        }
        debug!(task = task.id, "delete task completed");
    }
}

async fn run_delete_task(deleter: &Deleter, metas: &MetasMap, task: &DeleteLogsTask) {
    let _reservation = metas.reserve_version();

    let Some(in_range) = metas.in_range(&task.storage, task.time_range) else {
        // Storage vanished; the task has nothing left to do.
        return;
    };

    let mut backuper = Backuper::new(deleter.filesys.clone(), &format!("del_{}", task.id));

    for meta in in_range {
        let guard = meta.lock.clone().lock_owned().await;
        // Re-fetch under the lock: the chunk may have rotated or vanished.
        let Some(mut fresh) = metas.find(&task.storage, meta.id) else {
            continue;
        };

        let outcome = match &task.condition {
            None => deleter
                .delete_by_time_range(&task.storage, &mut fresh, task.time_range, &mut backuper)
                .await
                .map(|()| true),
            Some(condition) => {
                deleter
                    .delete_by_condition(
                        &task.storage,
                        &mut fresh,
                        task.time_range,
                        condition,
                        &mut backuper,
                    )
                    .await
            }
        };

        match outcome {
            Ok(true) => {
                if let Err(e) = backuper.cancel() {
                    error!(task = task.id, chunk = fresh.dir_name(), error = %e,
                        "failed to commit chunk deletion");
                    continue;
                }
                metas
                    .update(UpdateStateTask {
                        storage: task.storage.clone(),
                        for_update: vec![fresh],
                        for_add: Vec::new(),
                        guards: vec![guard],
                        done: None,
                    })
                    .await;
            }
            Ok(false) => {
                let _ = backuper.cancel();
            }
            Err(e) => {
                // Per-chunk failures roll back and the task moves on.
                error!(task = task.id, chunk = fresh.dir_name(), error = %e, "chunk delete failed");
                if let Err(undo) = backuper.backup() {
                    error!(task = task.id, error = %undo, "backup after failed delete also failed");
                }
            }
        }
    }
}
