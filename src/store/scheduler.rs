//! Background maintenance loops: the aligner rebalances chunks whose time
//! ranges overlap, the expired deleter tombstones chunks past their TTL,
//! and the remover physically collects files released by the reservation
//! protocol. The remover is the only place where disk objects disappear
//! for good.

use super::deleter::Deleter;
use super::metas_map::{MetasMap, UpdateStateTask};
use super::reader::ChunkReader;
use super::writer::ChunkWriter;
use crate::config::SchedulerConfig;
use crate::fs::{Backuper, FileSys};
use crate::model::LogRecord;
use crate::Result;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Scheduler {
    reader: Arc<ChunkReader>,
    writer: Arc<ChunkWriter>,
    deleter: Arc<Deleter>,
    filesys: FileSys,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        reader: Arc<ChunkReader>,
        writer: Arc<ChunkWriter>,
        deleter: Arc<Deleter>,
        filesys: FileSys,
        config: SchedulerConfig,
    ) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            reader,
            writer,
            deleter,
            filesys,
            config,
        })
    }

    /// Spawn all three loops. They stop when `cancel` fires.
    pub fn spawn(self: &Arc<Scheduler>, metas: MetasMap, cancel: CancellationToken) {
        tokio::spawn(run_aligner(
            Arc::clone(self),
            metas.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_expired_deleter(
            Arc::clone(self),
            metas.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_remover(Arc::clone(self), metas, cancel));
    }
}

/// Pool every record of the group, order by timestamp, and deal the records
/// back over the same number of chunks: `len/n` each, remainder to the
/// last. Preserves the multiset.
pub fn align_chunks(packs: Vec<Vec<LogRecord>>) -> Vec<Vec<LogRecord>> {
    let count = packs.len();
    if count == 0 {
        return packs;
    }
    let mut logs: Vec<LogRecord> = packs.into_iter().flatten().collect();
    logs.sort_by_key(|log| log.timestamp);

    let size = logs.len() / count;
    let mut out = Vec::with_capacity(count);
    let mut rest = logs;
    for _ in 0..count - 1 {
        let tail = rest.split_off(size);
        out.push(std::mem::replace(&mut rest, tail));
    }
    // The remainder lands in the last chunk.
    out.push(rest);
    out
}

async fn run_aligner(scheduler: Arc<Scheduler>, metas: MetasMap, cancel: CancellationToken) {
    loop {
        let mut aligned = 0;
        for storage in metas.storages() {
            match align_storage(&scheduler, &metas, &storage).await {
                Ok(count) => aligned += count,
                Err(e) => warn!(storage, error = %e, "aligning pass failed"),
            }
        }
        info!(aligned, "chunks aligned");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(scheduler.config.aligning_period) => {}
        }
    }
}

async fn align_storage(scheduler: &Scheduler, metas: &MetasMap, storage: &str) -> Result<usize> {
    let _reservation = metas.reserve_version();

    let crossed = metas.crossed_sealed(storage);
    let mut guards: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(crossed.len());
    for meta in &crossed {
        guards.push(meta.lock.clone().lock_owned().await);
    }

    // Re-fetch under the locks; chunks may have rotated or vanished.
    let fresh = match metas.last_version_metas(storage, &crossed) {
        Some(fresh) if fresh.len() >= 2 => fresh,
        _ => {
            debug!(storage, "no chunks to align");
            return Ok(0);
        }
    };

    let mut packs = Vec::with_capacity(fresh.len());
    for meta in &fresh {
        packs.push(scheduler.reader.read_chunk(storage, meta, None).await?);
    }
    let packs = align_chunks(packs);

    let mut backuper = Backuper::new(
        scheduler.filesys.clone(),
        &format!("{storage}_{}", fresh[0].id),
    );

    let mut rewritten = Vec::with_capacity(fresh.len());
    let result = async {
        for (mut meta, pack) in fresh.into_iter().zip(packs) {
            scheduler
                .writer
                .write_new_version_chunk(storage, &mut meta, &pack, &mut backuper)
                .await?;
            rewritten.push(meta);
        }
        backuper.cancel()
    }
    .await;

    if let Err(e) = result {
        if let Err(undo) = backuper.backup() {
            warn!(storage, error = %undo, "backup after failed alignment also failed");
        }
        return Err(e);
    }

    let count = rewritten.len();
    metas
        .update(UpdateStateTask {
            storage: storage.to_string(),
            for_update: rewritten,
            for_add: Vec::new(),
            guards,
            done: None,
        })
        .await;

    debug!(storage, chunks = count, "chunks aligned");
    Ok(count)
}

async fn run_expired_deleter(scheduler: Arc<Scheduler>, metas: MetasMap, cancel: CancellationToken) {
    loop {
        let deadline =
            chrono::Utc::now().timestamp_millis() - scheduler.config.logs_ttl.as_millis() as i64;

        let mut deleted = 0;
        for storage in metas.storages() {
            match expire_storage(&scheduler, &metas, &storage, deadline).await {
                Ok(count) => deleted += count,
                Err(e) => warn!(storage, error = %e, "expiry pass failed"),
            }
        }
        info!(deleted, "expired chunks deleted");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(scheduler.config.del_expired_period) => {}
        }
    }
}

async fn expire_storage(
    scheduler: &Scheduler,
    metas: &MetasMap,
    storage: &str,
    deadline: i64,
) -> Result<usize> {
    let _reservation = metas.reserve_version();

    let expired = metas.expired(storage, deadline);
    if expired.is_empty() {
        return Ok(0);
    }

    let mut backuper = Backuper::new(
        scheduler.filesys.clone(),
        &format!("{storage}_{}", expired[0].id),
    );

    let mut guards = Vec::with_capacity(expired.len());
    let mut tombstoned = Vec::with_capacity(expired.len());
    let result = async {
        for mut meta in expired {
            guards.push(meta.lock.clone().lock_owned().await);
            scheduler
                .deleter
                .mark_chunk_deleted(storage, &mut meta, &mut backuper)?;
            tombstoned.push(meta);
        }
        backuper.cancel()
    }
    .await;

    if let Err(e) = result {
        if let Err(undo) = backuper.backup() {
            warn!(storage, error = %undo, "backup after failed expiry also failed");
        }
        return Err(e);
    }

    let count = tombstoned.len();
    metas
        .update(UpdateStateTask {
            storage: storage.to_string(),
            for_update: tombstoned,
            for_add: Vec::new(),
            guards,
            done: None,
        })
        .await;

    debug!(storage, chunks = count, "expired chunks tombstoned");
    Ok(count)
}

async fn run_remover(scheduler: Arc<Scheduler>, metas: MetasMap, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(scheduler.config.rm_files_period) => {}
        }

        let names = metas.take_removable();
        if names.is_empty() {
            debug!("no files to remove");
            continue;
        }
        match scheduler.filesys.atomic_remove(&names) {
            Ok(()) => info!(removed = names.len(), "files removed"),
            Err(e) => warn!(error = %e, "file removal failed"),
        }
    }
}
