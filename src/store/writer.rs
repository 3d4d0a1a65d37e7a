//! The write pipeline: per-column appender tasks, raw-chunk appends, and
//! fill-and-rotate when a batch overflows the current chunk.
//!
//! Writer instances shard the chunk id space: instance `k` of `W` writers
//! owns ids `1+k, 1+k+W, 1+k+2W, …`, so two instances never race on the
//! same chunk. The per-chunk lock still serializes against the deleter and
//! the aligner, which operate on any id.

use super::metas_map::{MetasMap, UpdateStateTask};
use super::reader::ChunkReader;
use super::SharedQueue;
use crate::fs::{codec, Backuper, FileSys};
use crate::model::{
    ChunkMeta, Column, ColumnOffsets, LogRecord, TimeRange, DIR_STORAGES, META_NEW_FILE,
};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tracing::{debug, error, warn};

/// One ingest batch travelling from the API to a writer instance.
pub struct WriteLogsTask {
    pub storage: String,
    pub logs: Vec<LogRecord>,
    pub reply: oneshot::Sender<Result<()>>,
}

struct ColumnWriteJob {
    chunk_dir: String,
    logs: Arc<Vec<LogRecord>>,
    reply: oneshot::Sender<Result<ColumnWriteOutcome>>,
}

struct ColumnWriteOutcome {
    bytes: u64,
    /// Min/max timestamps seen, reported by the timestamp appender only.
    observed: Option<(i64, i64)>,
}

/// Column-parallel chunk writer. One instance owns nine appender tasks,
/// one per column, each behind a capacity-1 channel.
pub struct ChunkWriter {
    max_logs: usize,
    columns: Vec<mpsc::Sender<ColumnWriteJob>>,
    filesys: FileSys,
}

impl ChunkWriter {
    pub fn new(filesys: FileSys, max_logs: usize) -> Arc<ChunkWriter> {
        let mut columns = Vec::with_capacity(Column::COUNT);
        for column in Column::ALL {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(run_column_appender(column, filesys.clone(), rx));
            columns.push(tx);
        }
        Arc::new(ChunkWriter {
            max_logs,
            columns,
            filesys,
        })
    }

    pub fn max_logs(&self) -> usize {
        self.max_logs
    }

    /// Append up to the chunk's free capacity from `logs`, fanning each
    /// column out to its appender. Seals the chunk when it reaches capacity.
    /// Returns how many records were written.
    pub async fn write_to_chunk(
        &self,
        storage: &str,
        meta: &mut ChunkMeta,
        logs: &[LogRecord],
        backuper: &mut Backuper,
    ) -> Result<usize> {
        if logs.is_empty() {
            warn!(storage, chunk = meta.dir_name(), "no logs to write");
            return Ok(0);
        }
        let free = self.max_logs - meta.logs_len;
        let will_write = free.min(logs.len());
        if will_write == 0 {
            warn!(storage, chunk = meta.dir_name(), "chunk already full");
            return Ok(0);
        }

        meta.logs_len += will_write;
        if meta.logs_len == self.max_logs {
            meta.offsets = None;
        }

        let chunk_dir = format!("{DIR_STORAGES}/{storage}/{}", meta.dir_name());
        backuper.add_chunk(&chunk_dir, meta.offsets.as_ref())?;
        backuper.commit()?;

        let pack = Arc::new(logs[..will_write].to_vec());
        let mut replies = Vec::with_capacity(Column::COUNT);
        for column in Column::ALL {
            let (tx, rx) = oneshot::channel();
            self.columns[column.index()]
                .send(ColumnWriteJob {
                    chunk_dir: chunk_dir.clone(),
                    logs: Arc::clone(&pack),
                    reply: tx,
                })
                .await
                .map_err(|_| Error::Internal("column appender is gone".to_string()))?;
            replies.push((column, rx));
        }

        for (column, rx) in replies {
            let outcome = rx
                .await
                .map_err(|_| Error::Internal("column appender dropped its reply".to_string()))??;
            if let Some(offsets) = &mut meta.offsets {
                offsets.advance(column, outcome.bytes);
            }
            if let Some((min, max)) = outcome.observed {
                meta.time_range.expand(min);
                meta.time_range.expand(max);
            }
        }

        // Stage the descriptor; the backuper's cancel path promotes it.
        let frame = codec::encode_frame(&meta.to_file())?;
        self.filesys
            .write_file(&format!("{chunk_dir}/{META_NEW_FILE}"), &frame, false)?;

        debug!(
            storage,
            chunk = meta.dir_name(),
            written = will_write,
            of = logs.len(),
            "logs written to chunk"
        );
        Ok(will_write)
    }

    /// Rewrite a chunk as its next version, used by deletion and alignment.
    /// Sealed inputs stay sealed with their range taken from the first and
    /// last record; raw inputs restart their offsets and collapse the range
    /// until the appender re-expands it.
    pub async fn write_new_version_chunk(
        &self,
        storage: &str,
        meta: &mut ChunkMeta,
        logs: &[LogRecord],
        backuper: &mut Backuper,
    ) -> Result<usize> {
        if logs.is_empty() {
            warn!(storage, chunk = meta.dir_name(), "refusing empty rewrite");
            return Ok(0);
        }

        meta.version += 1;
        meta.logs_len = 0;
        if meta.offsets.is_none() {
            meta.time_range =
                TimeRange::new(logs[0].timestamp, logs[logs.len() - 1].timestamp);
        } else {
            meta.offsets = Some(ColumnOffsets::default());
            meta.time_range = TimeRange::point(logs[0].timestamp);
        }

        self.write_to_chunk(storage, meta, logs, backuper).await
    }

    /// Spawn one writer instance consuming the shared ingest queue.
    /// `first_raw_chunks` seeds the per-storage id cursor discovered at boot.
    pub fn spawn(
        self: &Arc<ChunkWriter>,
        reader: Arc<ChunkReader>,
        queue: SharedQueue<WriteLogsTask>,
        instance: u64,
        step: u64,
        first_raw_chunks: &HashMap<String, u64>,
        metas: MetasMap,
    ) {
        let writer = Arc::clone(self);
        let cursor: HashMap<String, u64> = first_raw_chunks
            .iter()
            .map(|(storage, id)| (storage.clone(), id + instance))
            .collect();

        tokio::spawn(run_writer(writer, reader, queue, instance, step, cursor, metas));
    }
}

async fn run_writer(
    writer: Arc<ChunkWriter>,
    reader: Arc<ChunkReader>,
    queue: SharedQueue<WriteLogsTask>,
    instance: u64,
    step: u64,
    mut cursor: HashMap<String, u64>,
    metas: MetasMap,
) {
    let mut pending_ack: Option<oneshot::Receiver<()>> = None;

    loop {
        let task = { queue.lock().await.recv().await };
        let Some(task) = task else { break };

        // The previous update must land before this batch reads the registry.
        if let Some(ack) = pending_ack.take() {
            let _ = ack.await;
        }

        let result = handle_batch(
            &writer, &reader, &metas, &mut cursor, &mut pending_ack, instance, step, &task,
        )
        .await;
        let _ = task.reply.send(result);
    }
}

struct BatchState {
    id: u64,
    for_update: Vec<ChunkMeta>,
    for_add: Vec<ChunkMeta>,
    guards: Vec<OwnedMutexGuard<()>>,
}

#[allow(clippy::too_many_arguments)]
async fn handle_batch(
    writer: &ChunkWriter,
    reader: &ChunkReader,
    metas: &MetasMap,
    cursor: &mut HashMap<String, u64>,
    pending_ack: &mut Option<oneshot::Receiver<()>>,
    instance: u64,
    step: u64,
    task: &WriteLogsTask,
) -> Result<()> {
    let _reservation = metas.reserve_version();
    let storage = &task.storage;

    if !metas.exists(storage) {
        cursor.remove(storage);
        return Err(Error::not_found(format!("Storage '{storage}' not exists")));
    }
    let id = *cursor.entry(storage.clone()).or_insert(1 + instance);

    let mut backuper = Backuper::new(writer.filesys.clone(), &format!("{storage}_{id}"));
    let mut state = BatchState {
        id,
        for_update: Vec::new(),
        for_add: Vec::new(),
        guards: Vec::new(),
    };

    match write_batch(writer, reader, metas, &mut state, &mut backuper, storage, &task.logs, step)
        .await
    {
        Ok(()) => {
            backuper.cancel()?;

            let (done_tx, done_rx) = oneshot::channel();
            metas
                .update(UpdateStateTask {
                    storage: storage.clone(),
                    for_update: state.for_update,
                    for_add: state.for_add,
                    guards: state.guards,
                    done: Some(done_tx),
                })
                .await;
            *pending_ack = Some(done_rx);
            cursor.insert(storage.clone(), state.id);
            Ok(())
        }
        Err(e) => {
            // Undo partial column appends; the journal replays on boot if
            // even that fails.
            if let Err(undo) = backuper.backup() {
                error!(storage, error = %undo, "backup after failed write also failed");
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_batch(
    writer: &ChunkWriter,
    reader: &ChunkReader,
    metas: &MetasMap,
    state: &mut BatchState,
    backuper: &mut Backuper,
    storage: &str,
    logs: &[LogRecord],
    step: u64,
) -> Result<()> {
    let mut written = 0;

    while written < logs.len() {
        let (mut meta, is_update) = match metas.find(storage, state.id) {
            Some(existing) => {
                let guard = existing.lock.clone().lock_owned().await;
                // Re-fetch under the lock: the aligner or deleter may have
                // produced a newer version meanwhile.
                match metas.find(storage, state.id) {
                    Some(fresh) => {
                        state.guards.push(guard);
                        (fresh, true)
                    }
                    None => (ChunkMeta::new(state.id, logs[written].timestamp), false),
                }
            }
            None => (ChunkMeta::new(state.id, logs[written].timestamp), false),
        };

        let total = meta.logs_len + (logs.len() - written);
        if total < writer.max_logs {
            // The tail fits into this raw chunk.
            written += writer
                .write_to_chunk(storage, &mut meta, &logs[written..], backuper)
                .await?;
        } else {
            // Fill and rotate: pool the chunk's records with enough incoming
            // ones to reach capacity, order them, and seal a new version.
            let free = writer.max_logs - meta.logs_len;
            let mut pooled = reader.read_chunk(storage, &meta, None).await?;
            pooled.extend_from_slice(&logs[written..written + free]);
            pooled.sort_by_key(|log| log.timestamp);

            meta.version += 1;
            meta.logs_len = 0;
            writer
                .write_to_chunk(storage, &mut meta, &pooled, backuper)
                .await?;
            written += free;
            state.id += step;
        }

        if is_update {
            state.for_update.push(meta);
        } else {
            state.for_add.push(meta);
        }
    }
    Ok(())
}

async fn run_column_appender(
    column: Column,
    filesys: FileSys,
    mut jobs: mpsc::Receiver<ColumnWriteJob>,
) {
    while let Some(job) = jobs.recv().await {
        let result = append_column(&filesys, column, &job);
        let _ = job.reply.send(result);
    }
}

fn append_column(
    filesys: &FileSys,
    column: Column,
    job: &ColumnWriteJob,
) -> Result<ColumnWriteOutcome> {
    let mut buf = BytesMut::new();
    let mut observed: Option<(i64, i64)> = None;

    for log in job.logs.iter() {
        let frame = codec::to_bytes(&log.value(column))?;
        if frame.len() > usize::from(u16::MAX) {
            return Err(Error::Codec(format!(
                "column '{column}' frame exceeds u16 length prefix"
            )));
        }
        buf.put_u16_le(frame.len() as u16);
        buf.extend_from_slice(&frame);

        if column == Column::Timestamp {
            let ts = log.timestamp;
            observed = Some(match observed {
                None => (ts, ts),
                Some((min, max)) => (min.min(ts), max.max(ts)),
            });
        }
    }

    let bytes = filesys.append_file(&format!("{}/{column}", job.chunk_dir), &buf)?;
    Ok(ColumnWriteOutcome {
        bytes: bytes as u64,
        observed,
    })
}
