//! The in-memory chunk index: per-storage blocks of id-sorted metas behind
//! a monotonic version counter, a single serialized updater task, and the
//! reservation protocol that gates file removal.
//!
//! Readers take a short mutex only to clone the slice of block pointers and
//! the current version; blocks themselves are immutable and copy-on-write,
//! so a point update clones only the block it touches. Every mutation flows
//! through one updater task fed by a bounded queue, which makes state
//! transitions per storage totally ordered.

use crate::model::{ChunkMeta, TimeRange, DIR_STORAGES};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tracing::debug;

const UPDATE_QUEUE_CAPACITY: usize = 20;

/// An immutable, shareable block of id-sorted metas.
pub type Block = Arc<Vec<ChunkMeta>>;

/// One batch of registry mutations. `for_update` replaces existing metas by
/// id, `for_add` appends new ones. The chunk-lock guards ride along and are
/// released only after the new block set is visible; `done` fires at the
/// same point so a producer can wait for its update to land.
pub struct UpdateStateTask {
    pub storage: String,
    pub for_update: Vec<ChunkMeta>,
    pub for_add: Vec<ChunkMeta>,
    pub guards: Vec<OwnedMutexGuard<()>>,
    pub done: Option<oneshot::Sender<()>>,
}

struct Registry {
    map: HashMap<String, Vec<Block>>,
    version: u64,
}

struct GcState {
    /// Chunk/storage directories awaiting removal, tagged with the version
    /// at which they became unreferenced.
    delete_list: HashMap<String, u64>,
    /// Live reservations: token -> version the holder depends on.
    reservations: HashMap<u64, u64>,
    next_token: u64,
}

struct Shared {
    state: Mutex<Registry>,
    gc: Mutex<GcState>,
}

impl Shared {
    fn get(&self, storage: &str) -> Option<(Vec<Block>, u64)> {
        let state = self.state.lock();
        state
            .map
            .get(storage)
            .map(|blocks| (blocks.clone(), state.version))
    }

    fn set(&self, storage: &str, blocks: Vec<Block>) -> Option<u64> {
        let mut state = self.state.lock();
        if !state.map.contains_key(storage) {
            return None;
        }
        state.version += 1;
        let version = state.version;
        state.map.insert(storage.to_string(), blocks);
        Some(version)
    }

    fn version(&self) -> u64 {
        self.state.lock().version
    }
}

/// Keeps GC away from every file version the holder may still be reading.
/// Dropping the guard releases the reservation.
pub struct VersionReservation {
    shared: Arc<Shared>,
    token: u64,
}

impl Drop for VersionReservation {
    fn drop(&mut self) {
        self.shared.gc.lock().reservations.remove(&self.token);
    }
}

#[derive(Clone)]
pub struct MetasMap {
    shared: Arc<Shared>,
    update_tx: mpsc::Sender<UpdateStateTask>,
    block_max: usize,
}

impl MetasMap {
    /// Create the registry and spawn its updater task. The task exits when
    /// every handle is dropped.
    pub fn new(block_max: usize) -> MetasMap {
        let shared = Arc::new(Shared {
            state: Mutex::new(Registry {
                map: HashMap::new(),
                version: 1,
            }),
            gc: Mutex::new(GcState {
                delete_list: HashMap::new(),
                reservations: HashMap::new(),
                next_token: 0,
            }),
        });
        let (update_tx, update_rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);

        tokio::spawn(run_updater(Arc::clone(&shared), update_rx, block_max));

        MetasMap {
            shared,
            update_tx,
            block_max,
        }
    }

    // Reservations and GC

    /// Record that the caller depends on the current version. Files deleted
    /// at a later version stay on disk until this guard drops.
    pub fn reserve_version(&self) -> VersionReservation {
        let mut gc = self.shared.gc.lock();
        let version = self.shared.version();
        let token = gc.next_token;
        gc.next_token += 1;
        gc.reservations.insert(token, version);
        debug!(version, "version reserved");

        VersionReservation {
            shared: Arc::clone(&self.shared),
            token,
        }
    }

    /// Paths whose deletion version is covered by every live reservation.
    /// Returned paths are forgotten; the caller must remove them.
    pub fn take_removable(&self) -> Vec<String> {
        let mut gc = self.shared.gc.lock();
        if gc.delete_list.is_empty() {
            return Vec::new();
        }

        let min_reserved = gc.reservations.values().copied().min().unwrap_or(u64::MAX);
        let removable: Vec<String> = gc
            .delete_list
            .iter()
            .filter(|(_, version)| min_reserved >= **version)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &removable {
            gc.delete_list.remove(path);
        }
        removable
    }

    // Storages

    pub fn storages(&self) -> Vec<String> {
        self.shared.state.lock().map.keys().cloned().collect()
    }

    pub fn exists(&self, storage: &str) -> bool {
        self.shared.state.lock().map.contains_key(storage)
    }

    /// Register a storage with its discovered metas. Returns false if it
    /// already exists.
    pub fn add_storage(&self, storage: &str, metas: &[ChunkMeta]) -> bool {
        let blocks: Vec<Block> = metas
            .chunks(self.block_max.max(1))
            .map(|chunk| Arc::new(chunk.to_vec()))
            .collect();

        let mut state = self.shared.state.lock();
        if state.map.contains_key(storage) {
            return false;
        }
        state.map.insert(storage.to_string(), blocks);
        state.version += 1;
        debug!(storage, "storage added");
        true
    }

    /// Unregister a storage and queue its directory for removal under the
    /// reservation protocol. Returns false if it does not exist.
    pub fn delete_storage(&self, storage: &str) -> bool {
        let version = {
            let mut state = self.shared.state.lock();
            if state.map.remove(storage).is_none() {
                return false;
            }
            state.version += 1;
            state.version
        };

        self.shared
            .gc
            .lock()
            .delete_list
            .insert(format!("{DIR_STORAGES}/{storage}"), version);
        debug!(storage, "storage deleted");
        true
    }

    // Reads

    /// Find a live (non-tombstoned) meta by chunk id.
    pub fn find(&self, storage: &str, chunk_id: u64) -> Option<ChunkMeta> {
        let (blocks, _) = self.shared.get(storage)?;
        let block_idx = bin_search_block(&blocks, chunk_id)?;
        let meta_idx = bin_search_meta(&blocks[block_idx], chunk_id)?;
        let meta = &blocks[block_idx][meta_idx];
        if meta.is_deleted {
            return None;
        }
        Some(meta.clone())
    }

    /// Re-fetch the current registry state of previously seen metas,
    /// dropping any that vanished or were tombstoned meanwhile. `None`
    /// means the storage itself is gone.
    pub fn last_version_metas(&self, storage: &str, old: &[ChunkMeta]) -> Option<Vec<ChunkMeta>> {
        let (blocks, _) = self.shared.get(storage)?;
        let mut latest = Vec::with_capacity(old.len());

        for meta in old {
            let Some(block_idx) = bin_search_block(&blocks, meta.id) else {
                continue;
            };
            let Some(meta_idx) = bin_search_meta(&blocks[block_idx], meta.id) else {
                continue;
            };
            let found = &blocks[block_idx][meta_idx];
            if !found.is_deleted {
                latest.push(found.clone());
            }
        }
        Some(latest)
    }

    /// Live metas whose time range crosses `tr`, in id order. `None` means
    /// the storage does not exist.
    pub fn in_range(&self, storage: &str, tr: TimeRange) -> Option<Vec<ChunkMeta>> {
        let (blocks, _) = self.shared.get(storage)?;
        let metas = blocks
            .iter()
            .flat_map(|block| block.iter())
            .filter(|meta| !meta.is_deleted && meta.time_range.overlaps(&tr))
            .cloned()
            .collect();
        Some(metas)
    }

    /// Sealed, live chunks whose whole range ended before `deadline`.
    pub fn expired(&self, storage: &str, deadline: i64) -> Vec<ChunkMeta> {
        let Some((blocks, _)) = self.shared.get(storage) else {
            return Vec::new();
        };
        blocks
            .iter()
            .flat_map(|block| block.iter())
            .filter(|meta| {
                meta.time_range.end < deadline && !meta.is_deleted && !meta.is_raw()
            })
            .cloned()
            .collect()
    }

    /// Up to five consecutive sealed chunks whose time ranges overlap their
    /// predecessor when ordered by range start. Raw chunks break a run, and
    /// the first completed run wins, which bounds aligner work per pass.
    pub fn crossed_sealed(&self, storage: &str) -> Vec<ChunkMeta> {
        const LIMIT: usize = 5;

        let Some((blocks, _)) = self.shared.get(storage) else {
            return Vec::new();
        };
        let mut metas: Vec<&ChunkMeta> = blocks
            .iter()
            .flat_map(|block| block.iter())
            .filter(|meta| !meta.is_deleted)
            .collect();
        metas.sort_by_key(|meta| meta.time_range.start);

        let mut crossed: Vec<ChunkMeta> = Vec::with_capacity(LIMIT);

        for pair in metas.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);

            if prev.is_raw() || cur.is_raw() {
                if !crossed.is_empty() {
                    break;
                }
                continue;
            }
            if prev.time_range.end > cur.time_range.start {
                if crossed.is_empty() {
                    crossed.push(prev.clone());
                }
                crossed.push(cur.clone());
                if crossed.len() == LIMIT {
                    break;
                }
            } else if !crossed.is_empty() {
                break;
            }
        }
        crossed
    }

    // Updates

    /// Queue a state mutation for the updater task.
    pub async fn update(&self, task: UpdateStateTask) {
        // The updater task lives as long as any handle, so send only fails
        // during shutdown, when dropping the task is the right outcome.
        let _ = self.update_tx.send(task).await;
    }
}

fn bin_search_block(blocks: &[Block], id: u64) -> Option<usize> {
    let first = blocks.first()?.first()?;
    let last_block = blocks.last()?;
    let last = last_block.last()?;
    if id < first.id || last.id < id {
        return None;
    }

    let (mut lo, mut hi) = (0, blocks.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        let block = &blocks[mid];
        if block.first()?.id <= id && id <= block.last()?.id {
            return Some(mid);
        }
        if id < block.first()?.id {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    None
}

fn bin_search_meta(metas: &[ChunkMeta], id: u64) -> Option<usize> {
    metas.binary_search_by_key(&id, |meta| meta.id).ok()
}

fn metas_len(blocks: &[Block], block_max: usize) -> usize {
    match blocks.last() {
        Some(last) => (blocks.len() - 1) * block_max + last.len(),
        None => 0,
    }
}

fn block_indices(index: usize, block_max: usize) -> (usize, usize) {
    (index / block_max, index % block_max)
}

async fn run_updater(
    shared: Arc<Shared>,
    mut update_rx: mpsc::Receiver<UpdateStateTask>,
    block_max: usize,
) {
    // Tombstones accumulated by in-place updates since the last rebuild.
    let mut tombstones = 0usize;

    while let Some(task) = update_rx.recv().await {
        apply_update(&shared, task, block_max, &mut tombstones);
    }
}

fn apply_update(shared: &Shared, task: UpdateStateTask, block_max: usize, tombstones: &mut usize) {
    let UpdateStateTask {
        storage,
        mut for_update,
        for_add,
        guards,
        done,
    } = task;

    // Guards drop and `done` fires on every exit path, including a storage
    // that vanished mid-flight.
    let _guards = guards;
    let _done = DoneSignal(done);

    let Some((blocks, _)) = shared.get(&storage) else {
        debug!(storage, "update for missing storage dropped");
        return;
    };
    if blocks.is_empty() && for_add.is_empty() {
        return;
    }

    let new_len = metas_len(&blocks, block_max) + for_add.len();
    for_update.sort_by_key(|meta| meta.id);

    let mut deleted: Vec<ChunkMeta> = Vec::new();
    let mut new_blocks: Vec<Block>;
    let mut index;

    if blocks.is_empty() {
        new_blocks = vec![Arc::new(Vec::with_capacity(block_max))];
        index = 0;
    } else if *tombstones > 0 && *tombstones * 10 > new_len {
        // Rebuild from scratch, dropping tombstoned metas entirely.
        let (rebuilt, len) = reconstruct(&blocks, &for_update, &mut deleted, block_max);
        new_blocks = rebuilt;
        index = len;
        *tombstones = 0;
    } else {
        // Clone only the blocks that hold updated ids.
        new_blocks = blocks.clone();
        index = update_in_place(
            &blocks,
            &mut new_blocks,
            &for_update,
            &mut deleted,
            tombstones,
            block_max,
        );
    }

    // Append new metas, bubbling each one left to its sorted position.
    for meta in &for_add {
        let (block_idx, _) = block_indices(index, block_max);
        if block_idx == new_blocks.len() {
            new_blocks.push(Arc::new(Vec::with_capacity(block_max)));
        }
        Arc::make_mut(&mut new_blocks[block_idx]).push(meta.clone());

        let mut at = index;
        while at > 0 {
            let (i1, j1) = block_indices(at - 1, block_max);
            let (i2, j2) = block_indices(at, block_max);
            if new_blocks[i1][j1].id < new_blocks[i2][j2].id {
                break;
            }
            let left = new_blocks[i1][j1].clone();
            let right = new_blocks[i2][j2].clone();
            Arc::make_mut(&mut new_blocks[i1])[j1] = right;
            Arc::make_mut(&mut new_blocks[i2])[j2] = left;
            at -= 1;
        }
        index += 1;
    }

    let last_block = if index == 0 { 0 } else { (index - 1) / block_max };
    new_blocks.truncate(last_block + 1);

    let Some(version) = shared.set(&storage, new_blocks) else {
        debug!(storage, "update for missing storage dropped");
        return;
    };

    // Locks release before the superseded files become collectable.
    drop(_guards);
    drop(_done);

    if !deleted.is_empty() {
        let mut gc = shared.gc.lock();
        for meta in &deleted {
            let path = format!("{DIR_STORAGES}/{storage}/{}", meta.dir_name());
            gc.delete_list.insert(path, version);
        }
        debug!(
            storage,
            updated = for_update.len(),
            added = for_add.len(),
            superseded = deleted.len(),
            version,
            "metas updated"
        );
    }
}

struct DoneSignal(Option<oneshot::Sender<()>>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            let _ = done.send(());
        }
    }
}

fn update_in_place(
    blocks: &[Block],
    new_blocks: &mut [Block],
    for_update: &[ChunkMeta],
    deleted: &mut Vec<ChunkMeta>,
    tombstones: &mut usize,
    block_max: usize,
) -> usize {
    for upd in for_update {
        let Some(block_idx) = bin_search_block(blocks, upd.id) else {
            continue;
        };
        let Some(meta_idx) = bin_search_meta(&blocks[block_idx], upd.id) else {
            continue;
        };

        let block = Arc::make_mut(&mut new_blocks[block_idx]);
        let old = &block[meta_idx];
        if upd.version > old.version || upd.is_deleted {
            deleted.push(old.clone());
            if upd.is_deleted {
                *tombstones += 1;
            }
        }
        block[meta_idx] = upd.clone();
    }
    metas_len(blocks, block_max)
}

fn reconstruct(
    blocks: &[Block],
    for_update: &[ChunkMeta],
    deleted: &mut Vec<ChunkMeta>,
    block_max: usize,
) -> (Vec<Block>, usize) {
    let mut rebuilt: Vec<Vec<ChunkMeta>> = Vec::new();
    let mut current: Vec<ChunkMeta> = Vec::with_capacity(block_max);
    let mut upd_idx = 0;

    for meta in blocks.iter().flat_map(|block| block.iter()) {
        if meta.is_deleted {
            continue;
        }
        if current.len() == block_max {
            rebuilt.push(std::mem::replace(&mut current, Vec::with_capacity(block_max)));
        }

        if upd_idx < for_update.len() && meta.id == for_update[upd_idx].id {
            let upd = &for_update[upd_idx];
            upd_idx += 1;

            if upd.version > meta.version || upd.is_deleted {
                deleted.push(meta.clone());
                if upd.is_deleted {
                    continue;
                }
            }
            current.push(upd.clone());
        } else {
            current.push(meta.clone());
        }
    }

    let len = rebuilt.len() * block_max + current.len();
    rebuilt.push(current);
    (rebuilt.into_iter().map(Arc::new).collect(), len)
}
