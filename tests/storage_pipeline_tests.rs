//! Store-level pipeline tests with small chunk capacities: rotation across
//! the id shard, background alignment, TTL expiry, and file collection
//! under the reservation protocol.

use loghouse::config::SchedulerConfig;
use loghouse::fs::{Backuper, FileSys};
use loghouse::model::{ChunkMeta, LoadPlan, LogRecord, TimeRange};
use loghouse::store::{
    shared_queue, ChunkReader, ChunkWriter, Deleter, MetasMap, ReadLogsTask, Scheduler,
    WriteLogsTask,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

fn log_at(ts: i64) -> LogRecord {
    LogRecord {
        timestamp: ts,
        level: 1,
        traces: vec!["trace1".into()],
        entity: "entity".into(),
        entity_id: "1".into(),
        message: "message".into(),
        modules: vec!["module1".into()],
        ..LogRecord::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn writer_rotates_chunks_and_reader_streams_them_back() {
    let dir = TempDir::new().unwrap();
    let filesys = FileSys::new(dir.path());
    filesys.make_dir_all("storages/storage").unwrap();

    let metas = MetasMap::new(100);
    metas.add_storage("storage", &[]);

    // One writer instance owning the whole id space, three logs per chunk.
    let writer = ChunkWriter::new(filesys.clone(), 3);
    let writer_reader = ChunkReader::new(filesys.clone());
    let (write_tx, write_rx) = mpsc::channel(1);
    writer.spawn(
        writer_reader,
        shared_queue(write_rx),
        0,
        1,
        &HashMap::from([("storage".to_string(), 1u64)]),
        metas.clone(),
    );

    let timestamps = [9i64, 5, 7, 3, 8, 1, 4, 2];
    let (reply_tx, reply_rx) = oneshot::channel();
    write_tx
        .send(WriteLogsTask {
            storage: "storage".into(),
            logs: timestamps.iter().map(|ts| log_at(*ts)).collect(),
            reply: reply_tx,
        })
        .await
        .unwrap();
    reply_rx.await.unwrap().unwrap();

    wait_until(|| metas.find("storage", 3).is_some()).await;

    // Two full chunks rotated to a sealed second version; the tail stays raw.
    let chunk1 = metas.find("storage", 1).unwrap();
    assert_eq!((chunk1.version, chunk1.logs_len), (2, 3));
    assert!(!chunk1.is_raw());

    let chunk2 = metas.find("storage", 2).unwrap();
    assert_eq!((chunk2.version, chunk2.logs_len), (2, 3));
    assert!(!chunk2.is_raw());

    let chunk3 = metas.find("storage", 3).unwrap();
    assert_eq!((chunk3.version, chunk3.logs_len), (1, 2));
    assert!(chunk3.is_raw());

    // Stream everything back in chunk order.
    let reader = ChunkReader::new(filesys.clone());
    let (read_tx, read_rx) = mpsc::channel(1);
    reader.spawn(shared_queue(read_rx), metas.clone());

    let (logs_tx, mut logs_rx) = mpsc::channel(1);
    let (reply_tx, reply_rx) = oneshot::channel();
    read_tx
        .send(ReadLogsTask {
            plan: LoadPlan {
                storage: "storage".into(),
                ..LoadPlan::default()
            },
            logs_tx,
            reply: reply_tx,
        })
        .await
        .unwrap();

    let mut packs = Vec::new();
    while let Some(pack) = logs_rx.recv().await {
        packs.push(pack);
    }
    reply_rx.await.unwrap().unwrap();

    let sizes: Vec<usize> = packs.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 3, 2]);

    let flat: Vec<i64> = packs
        .iter()
        .flat_map(|pack| pack.iter().map(|l| l.timestamp))
        .collect();
    // Rotated chunks are timestamp-sorted; the raw tail keeps arrival order.
    assert_eq!(flat, vec![5, 7, 9, 1, 3, 8, 4, 2]);
}

struct Pipeline {
    _dir: TempDir,
    filesys: FileSys,
    reader: Arc<ChunkReader>,
    writer: Arc<ChunkWriter>,
    metas: MetasMap,
}

fn pipeline(max_logs: usize) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let filesys = FileSys::new(dir.path());
    filesys.make_dir_all("storages/storage").unwrap();
    Pipeline {
        filesys: filesys.clone(),
        reader: ChunkReader::new(filesys.clone()),
        writer: ChunkWriter::new(filesys, max_logs),
        metas: MetasMap::new(100),
        _dir: dir,
    }
}

async fn seed_chunk(p: &Pipeline, id: u64, timestamps: &[i64]) -> ChunkMeta {
    let mut meta = ChunkMeta::new(id, timestamps[0]);
    let mut backuper = Backuper::new(p.filesys.clone(), &format!("seed_{id}"));
    let logs: Vec<LogRecord> = timestamps.iter().map(|ts| log_at(*ts)).collect();
    p.writer
        .write_to_chunk("storage", &mut meta, &logs, &mut backuper)
        .await
        .unwrap();
    backuper.cancel().unwrap();
    meta
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        logs_ttl: Duration::from_secs(30 * 24 * 3600),
        aligning_period: Duration::from_secs(3600),
        del_expired_period: Duration::from_secs(3600),
        rm_files_period: Duration::from_secs(3600),
    }
}

#[tokio::test]
async fn aligner_rebalances_crossed_chunks_and_remover_collects() {
    let p = pipeline(4);
    let base = chrono::Utc::now().timestamp_millis();

    // Two sealed chunks with interleaved time ranges.
    let meta1 = seed_chunk(&p, 1, &[base + 1, base + 5, base + 9, base + 13]).await;
    let meta2 = seed_chunk(&p, 2, &[base + 3, base + 6, base + 10, base + 15]).await;
    assert!(!meta1.is_raw() && !meta2.is_raw());
    p.metas.add_storage("storage", &[meta1, meta2]);

    let deleter = Deleter::new(p.reader.clone(), p.writer.clone(), p.filesys.clone());
    let scheduler = Scheduler::new(
        p.reader.clone(),
        p.writer.clone(),
        deleter,
        p.filesys.clone(),
        SchedulerConfig {
            rm_files_period: Duration::from_millis(50),
            ..scheduler_config()
        },
    );
    let cancel = CancellationToken::new();
    scheduler.spawn(p.metas.clone(), cancel.clone());

    wait_until(|| {
        p.metas.find("storage", 1).map(|m| m.version) == Some(2)
            && p.metas.find("storage", 2).map(|m| m.version) == Some(2)
    })
    .await;

    // Records are redistributed into disjoint, sorted ranges.
    let chunk1 = p.metas.find("storage", 1).unwrap();
    let chunk2 = p.metas.find("storage", 2).unwrap();
    let logs1 = p.reader.read_chunk("storage", &chunk1, None).await.unwrap();
    let logs2 = p.reader.read_chunk("storage", &chunk2, None).await.unwrap();

    let ts1: Vec<i64> = logs1.iter().map(|l| l.timestamp).collect();
    let ts2: Vec<i64> = logs2.iter().map(|l| l.timestamp).collect();
    assert_eq!(ts1, vec![base + 1, base + 3, base + 5, base + 6]);
    assert_eq!(ts2, vec![base + 9, base + 10, base + 13, base + 15]);
    assert!(chunk1.time_range.end < chunk2.time_range.start);

    // Superseded directories are collected once nothing reserves them.
    wait_until(|| {
        !p.filesys.exists("storages/storage/1_1") && !p.filesys.exists("storages/storage/2_1")
    })
    .await;
    assert!(p.filesys.exists("storages/storage/1_2"));
    assert!(p.filesys.exists("storages/storage/2_2"));

    cancel.cancel();
}

#[tokio::test]
async fn expired_sealed_chunks_are_tombstoned_but_raw_survive() {
    let p = pipeline(2);
    let base = chrono::Utc::now().timestamp_millis();

    // A sealed chunk far in the past and a raw chunk with recent data.
    let old = seed_chunk(&p, 1, &[base - 3_600_000, base - 3_599_000]).await;
    let recent = seed_chunk(&p, 2, &[base]).await;
    assert!(!old.is_raw());
    assert!(recent.is_raw());
    p.metas.add_storage("storage", &[old, recent]);

    let deleter = Deleter::new(p.reader.clone(), p.writer.clone(), p.filesys.clone());
    let scheduler = Scheduler::new(
        p.reader.clone(),
        p.writer.clone(),
        deleter,
        p.filesys.clone(),
        SchedulerConfig {
            logs_ttl: Duration::from_secs(60),
            del_expired_period: Duration::from_millis(50),
            ..scheduler_config()
        },
    );
    let cancel = CancellationToken::new();
    scheduler.spawn(p.metas.clone(), cancel.clone());

    wait_until(|| p.metas.find("storage", 1).is_none()).await;
    assert!(p.metas.find("storage", 2).is_some(), "raw chunks never expire");

    // The tombstone is durable: the promoted descriptor says deleted.
    let file = p
        .filesys
        .read_meta("storages/storage/1_1")
        .unwrap()
        .unwrap();
    assert!(file.is_deleted);

    cancel.cancel();
}

#[tokio::test]
async fn reader_reservation_defers_file_removal() {
    let p = pipeline(4);
    let base = chrono::Utc::now().timestamp_millis();

    let meta = seed_chunk(&p, 1, &[base + 1, base + 2]).await;
    p.metas.add_storage("storage", &[meta.clone()]);

    // A reader pins the current version.
    let reservation = p.metas.reserve_version();

    // A rewrite supersedes version 1.
    let mut bumped = p.metas.find("storage", 1).unwrap();
    let mut backuper = Backuper::new(p.filesys.clone(), "rewrite");
    p.writer
        .write_new_version_chunk(
            "storage",
            &mut bumped,
            &[log_at(base + 1), log_at(base + 2)],
            &mut backuper,
        )
        .await
        .unwrap();
    backuper.cancel().unwrap();

    let (done_tx, done_rx) = oneshot::channel();
    p.metas
        .update(loghouse::store::UpdateStateTask {
            storage: "storage".into(),
            for_update: vec![bumped],
            for_add: vec![],
            guards: vec![],
            done: Some(done_tx),
        })
        .await;
    done_rx.await.unwrap();

    // The old directory is not collectable while the reservation lives.
    assert!(p.metas.take_removable().is_empty());

    drop(reservation);
    assert_eq!(
        p.metas.take_removable(),
        vec!["storages/storage/1_1".to_string()]
    );
}

#[tokio::test]
async fn range_reads_skip_unrelated_chunks() {
    let p = pipeline(2);
    let base = chrono::Utc::now().timestamp_millis();

    let meta1 = seed_chunk(&p, 1, &[base + 1, base + 2]).await;
    let meta2 = seed_chunk(&p, 2, &[base + 10, base + 11]).await;
    p.metas.add_storage("storage", &[meta1, meta2]);

    let in_range = p
        .metas
        .in_range("storage", TimeRange::new(base + 9, base + 20))
        .unwrap();
    let ids: Vec<u64> = in_range.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![2]);
}
