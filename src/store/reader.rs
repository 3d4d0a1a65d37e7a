//! The read pipeline: per-column reader tasks that parse length-prefixed
//! frames, and reader instances that stream time-filtered packs to the
//! search processor.

use super::metas_map::MetasMap;
use super::SharedQueue;
use crate::fs::{codec, FileSys};
use crate::model::{ChunkMeta, Column, ColumnSet, LoadPlan, LogRecord, Value, DIR_STORAGES};
use crate::query::selector;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// One search travelling from the API to a reader instance. Packs stream
/// out on `logs_tx`; the terminal result arrives on `reply` after the last
/// pack.
pub struct ReadLogsTask {
    pub plan: LoadPlan,
    pub logs_tx: mpsc::Sender<Vec<LogRecord>>,
    pub reply: oneshot::Sender<Result<()>>,
}

struct ColumnReadJob {
    chunk_dir: String,
    logs_len: usize,
    reply: oneshot::Sender<Result<Vec<Value>>>,
}

/// Column-parallel chunk reader, symmetric to the writer's appender fan-out.
pub struct ChunkReader {
    columns: Vec<mpsc::Sender<ColumnReadJob>>,
}

impl ChunkReader {
    pub fn new(filesys: FileSys) -> Arc<ChunkReader> {
        let mut columns = Vec::with_capacity(Column::COUNT);
        for column in Column::ALL {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(run_column_reader(column, filesys.clone(), rx));
            columns.push(tx);
        }
        Arc::new(ChunkReader { columns })
    }

    /// Read a chunk into records, restricted to `columns` when given (the
    /// timestamp column always loads, since every filter needs it).
    pub async fn read_chunk(
        &self,
        storage: &str,
        meta: &ChunkMeta,
        columns: Option<ColumnSet>,
    ) -> Result<Vec<LogRecord>> {
        let selected = match columns {
            Some(mut set) if !set.is_empty() => {
                set.insert(Column::Timestamp);
                set
            }
            _ => ColumnSet::all(),
        };
        let chunk_dir = format!("{DIR_STORAGES}/{storage}/{}", meta.dir_name());

        let mut replies = Vec::new();
        for column in selected.iter() {
            let (tx, rx) = oneshot::channel();
            self.columns[column.index()]
                .send(ColumnReadJob {
                    chunk_dir: chunk_dir.clone(),
                    logs_len: meta.logs_len,
                    reply: tx,
                })
                .await
                .map_err(|_| Error::Internal("column reader is gone".to_string()))?;
            replies.push((column, rx));
        }

        let mut logs = vec![LogRecord::default(); meta.logs_len];
        for (column, rx) in replies {
            let values = rx
                .await
                .map_err(|_| Error::Internal("column reader dropped its reply".to_string()))??;
            for (log, value) in logs.iter_mut().zip(values) {
                log.set_value(column, value)?;
            }
        }

        debug!(storage, chunk = meta.dir_name(), logs = logs.len(), "chunk read");
        Ok(logs)
    }

    /// Spawn one reader instance consuming the shared search queue.
    pub fn spawn(self: &Arc<ChunkReader>, queue: SharedQueue<ReadLogsTask>, metas: MetasMap) {
        let reader = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let task = { queue.lock().await.recv().await };
                let Some(task) = task else { break };

                let result = handle_read(&reader, &metas, &task.plan, &task.logs_tx).await;
                drop(task.logs_tx);
                let _ = task.reply.send(result);
            }
        });
    }
}

async fn handle_read(
    reader: &ChunkReader,
    metas: &MetasMap,
    plan: &LoadPlan,
    logs_tx: &mpsc::Sender<Vec<LogRecord>>,
) -> Result<()> {
    let _reservation = metas.reserve_version();

    let Some(in_range) = metas.in_range(&plan.storage, plan.time_range) else {
        return Err(Error::not_found(format!(
            "Storage '{}' not exists",
            plan.storage
        )));
    };

    for meta in in_range {
        let logs = reader
            .read_chunk(&plan.storage, &meta, Some(plan.columns))
            .await?;
        // Raw chunks are unordered on disk and get sorted here.
        let logs = selector::clamp_to_range(logs, plan.time_range, !meta.is_raw());
        if logs_tx.send(logs).await.is_err() {
            // The processor hung up; nothing left to stream.
            return Ok(());
        }
    }
    Ok(())
}

async fn run_column_reader(
    column: Column,
    filesys: FileSys,
    mut jobs: mpsc::Receiver<ColumnReadJob>,
) {
    while let Some(job) = jobs.recv().await {
        let result = read_column(&filesys, column, &job);
        let _ = job.reply.send(result);
    }
}

fn read_column(filesys: &FileSys, column: Column, job: &ColumnReadJob) -> Result<Vec<Value>> {
    let path = format!("{}/{column}", job.chunk_dir);
    let data = filesys.read_file(&path)?;

    let corrupt = |reason: &str| Error::Corrupt {
        path: path.clone(),
        reason: reason.to_string(),
    };

    let mut values = Vec::with_capacity(job.logs_len);
    let mut at = 0;
    for _ in 0..job.logs_len {
        if at + 2 > data.len() {
            return Err(corrupt("truncated frame length"));
        }
        let len = usize::from(u16::from_le_bytes([data[at], data[at + 1]]));
        at += 2;
        if at + len > data.len() {
            return Err(corrupt("frame length past end of file"));
        }
        values.push(codec::from_bytes(&data[at..at + len])?);
        at += len;
    }
    Ok(values)
}
