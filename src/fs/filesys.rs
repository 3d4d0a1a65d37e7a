//! Typed file IO rooted at the data directory, plus boot-time discovery of
//! storages, chunk descriptors, and resumable delete jobs.
//!
//! All paths handled here are relative to the root; the same relative
//! strings appear inside transaction journals and the GC delete list, so a
//! data directory can be relocated wholesale.

use super::codec;
use super::transaction::{Action, Transaction};
use crate::model::{
    ChunkMeta, DeleteQuery, MetaFile, DELETED_SENTINEL, DIR_DELETE_TASKS, DIR_STORAGES, META_FILE,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix of staged files that an atomic write promotes by rename.
pub const NEW_SUFFIX: &str = ".new";

#[derive(Debug, Clone)]
pub struct FileSys {
    root: Arc<PathBuf>,
}

impl FileSys {
    pub fn new(root: impl Into<PathBuf>) -> FileSys {
        FileSys {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Read a whole file. A missing file reads as empty, which callers treat
    /// the same as a zero-length one.
    pub fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        match fs::read(self.resolve(rel)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a whole file, creating parent directories. With `atomic`, the
    /// bytes land in `<rel>.new` first and are renamed over the target.
    pub fn write_file(&self, rel: &str, bytes: &[u8], atomic: bool) -> Result<usize> {
        let path = self.resolve(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if !atomic {
            fs::write(&path, bytes)?;
        } else {
            let staged = self.resolve(&format!("{rel}{NEW_SUFFIX}"));
            fs::write(&staged, bytes)?;
            if let Err(e) = fs::rename(&staged, &path) {
                let _ = fs::remove_file(&staged);
                return Err(e.into());
            }
        }

        debug!(path = rel, bytes = bytes.len(), "file written");
        Ok(bytes.len())
    }

    pub fn append_file(&self, rel: &str, bytes: &[u8]) -> Result<usize> {
        use std::io::Write;

        let path = self.resolve(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(bytes)?;

        debug!(path = rel, bytes = bytes.len(), "appended to file");
        Ok(bytes.len())
    }

    /// Size of a file, or `None` if it does not exist.
    pub fn file_size(&self, rel: &str) -> Result<Option<u64>> {
        match fs::metadata(self.resolve(rel)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).exists()
    }

    /// Remove a single file. Returns whether it existed.
    pub fn remove_file(&self, rel: &str) -> Result<bool> {
        match fs::remove_file(self.resolve(rel)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a file or directory tree; missing targets are fine.
    pub fn remove_all(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel);
        let result = match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn make_dir_all(&self, rel: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(rel))?;
        Ok(())
    }

    /// Remove a set of paths under a journaled transaction, so a crash
    /// mid-removal finishes on the next boot.
    pub fn atomic_remove(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut tx = Transaction::new(self.clone(), &format!("rm_{}", Uuid::new_v4()));
        for name in names {
            tx.add(Action::Remove { path: name.clone() });
        }
        tx.commit()?;
        tx.apply()
    }

    /// Truncate a file to `size`; missing files are fine (idempotent replay).
    pub fn truncate(&self, rel: &str, size: u64) -> Result<()> {
        match fs::OpenOptions::new().write(true).open(self.resolve(rel)) {
            Ok(file) => {
                file.set_len(size)?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rename a file; a missing source is fine (idempotent replay).
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        match fs::rename(self.resolve(from), self.resolve(to)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a chunk descriptor. `None` means missing, empty, or corrupt; the
    /// caller decides whether that is fatal or grounds for cleanup.
    pub fn read_meta(&self, chunk_dir: &str) -> Result<Option<MetaFile>> {
        let rel = format!("{chunk_dir}/{META_FILE}");
        let bytes = self.read_file(&rel)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        match codec::decode_frame(&rel, &bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(Error::Corrupt { path, reason }) => {
                warn!(path, reason, "unreadable chunk meta");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resumable delete jobs left behind by a previous run. Stray `*.new`
    /// files are dropped; corrupt journals are logged and removed.
    pub fn read_pending_delete_queries(&self) -> Result<Vec<DeleteQuery>> {
        self.make_dir_all(DIR_DELETE_TASKS)?;
        let mut queries = Vec::new();

        for entry in fs::read_dir(self.resolve(DIR_DELETE_TASKS))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = format!("{DIR_DELETE_TASKS}/{name}");

            if name.ends_with(NEW_SUFFIX) {
                self.remove_file(&rel)?;
                continue;
            }

            let bytes = self.read_file(&rel)?;
            match serde_json::from_slice::<DeleteQuery>(&bytes) {
                Ok(mut query) => {
                    query.task_id = name;
                    queries.push(query);
                }
                Err(e) => {
                    warn!(path = rel, error = %e, "dropping unreadable delete task");
                    self.remove_file(&rel)?;
                }
            }
        }
        Ok(queries)
    }

    /// Enumerate chunk directories of one storage, keep the highest version
    /// per id, and schedule everything superseded, tombstoned, or unreadable
    /// for removal. Returns `None` when the storage itself was marked for
    /// deletion and has now been dropped.
    fn read_storage_metas(&self, storage: &str) -> Result<Option<Vec<ChunkMeta>>> {
        let storage_dir = format!("{DIR_STORAGES}/{storage}");
        let mut found: Vec<(u64, u64)> = Vec::new();

        for entry in fs::read_dir(self.resolve(&storage_dir))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if !entry.file_type()?.is_dir() {
                if name == DELETED_SENTINEL {
                    self.atomic_remove(std::slice::from_ref(&storage_dir))?;
                    debug!(storage, "dropped storage marked for deletion");
                    return Ok(None);
                }
                continue;
            }
            if let Some(parsed) = ChunkMeta::parse_dir_name(&name) {
                found.push(parsed);
            }
        }

        // Highest version first within each id, so the survivor comes first.
        found.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut metas = Vec::new();
        let mut for_remove = Vec::new();
        let mut current_id = None;

        for (id, version) in found {
            let chunk_dir = format!("{storage_dir}/{id}_{version}");

            if current_id == Some(id) {
                for_remove.push(chunk_dir);
                continue;
            }
            let Some(file) = self.read_meta(&chunk_dir)? else {
                for_remove.push(chunk_dir);
                continue;
            };
            if file.is_deleted {
                for_remove.push(chunk_dir);
                continue;
            }
            metas.push(ChunkMeta::from_parts(id, version, file));
            current_id = Some(id);
        }

        if !for_remove.is_empty() {
            self.atomic_remove(&for_remove)?;
        }

        debug!(storage, chunks = metas.len(), "storage discovered");
        Ok(Some(metas))
    }

    /// Walk `storages/` on boot: drop storages marked for deletion, load
    /// surviving metas, and locate the first raw chunk id per storage.
    #[allow(clippy::type_complexity)]
    pub fn discover_storages(
        &self,
    ) -> Result<(HashMap<String, Vec<ChunkMeta>>, HashMap<String, u64>)> {
        self.make_dir_all(DIR_STORAGES)?;

        let mut metas_by_storage = HashMap::new();
        let mut first_raw_chunks = HashMap::new();

        for entry in fs::read_dir(self.resolve(DIR_STORAGES))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let storage = entry.file_name().to_string_lossy().into_owned();

            let Some(metas) = self.read_storage_metas(&storage)? else {
                continue;
            };

            let first_raw = metas
                .iter()
                .find(|m| m.is_raw())
                .map(|m| m.id)
                .unwrap_or_else(|| metas.last().map(|m| m.id + 1).unwrap_or(1));

            first_raw_chunks.insert(storage.clone(), first_raw);
            metas_by_storage.insert(storage, metas);
        }

        Ok((metas_by_storage, first_raw_chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::codec;
    use crate::model::{ColumnOffsets, TimeRange};
    use tempfile::TempDir;

    fn write_chunk_meta(fsys: &FileSys, storage: &str, name: &str, file: &MetaFile) {
        let rel = format!("{DIR_STORAGES}/{storage}/{name}/{META_FILE}");
        fsys.write_file(&rel, &codec::encode_frame(file).unwrap(), false)
            .unwrap();
    }

    fn sealed_meta() -> MetaFile {
        MetaFile {
            time_range: TimeRange::new(1, 9),
            logs_len: 3,
            offsets: None,
            is_deleted: false,
        }
    }

    #[test]
    fn atomic_write_promotes_staged_file() {
        let dir = TempDir::new().unwrap();
        let fsys = FileSys::new(dir.path());

        fsys.write_file("a/b.txt", b"hello", true).unwrap();
        assert_eq!(fsys.read_file("a/b.txt").unwrap(), b"hello");
        assert!(!fsys.exists("a/b.txt.new"));
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let fsys = FileSys::new(dir.path());
        assert!(fsys.read_file("nope").unwrap().is_empty());
    }

    #[test]
    fn discovery_keeps_highest_version_and_drops_the_rest() {
        let dir = TempDir::new().unwrap();
        let fsys = FileSys::new(dir.path());

        write_chunk_meta(&fsys, "s", "1_1", &sealed_meta());
        write_chunk_meta(&fsys, "s", "1_2", &sealed_meta());
        write_chunk_meta(&fsys, "s", "2_1", &sealed_meta());
        // Corrupt meta: empty file.
        fsys.write_file(&format!("{DIR_STORAGES}/s/3_1/{META_FILE}"), b"", false)
            .unwrap();
        // Tombstoned chunk.
        let mut deleted = sealed_meta();
        deleted.is_deleted = true;
        write_chunk_meta(&fsys, "s", "4_1", &deleted);

        let (metas, first_raw) = fsys.discover_storages().unwrap();
        let ids: Vec<(u64, u64)> = metas["s"].iter().map(|m| (m.id, m.version)).collect();
        assert_eq!(ids, vec![(1, 2), (2, 1)]);
        assert_eq!(first_raw["s"], 3);

        assert!(!fsys.exists(&format!("{DIR_STORAGES}/s/1_1")));
        assert!(!fsys.exists(&format!("{DIR_STORAGES}/s/3_1")));
        assert!(!fsys.exists(&format!("{DIR_STORAGES}/s/4_1")));
        assert!(fsys.exists(&format!("{DIR_STORAGES}/s/1_2")));
    }

    #[test]
    fn discovery_finds_first_raw_chunk() {
        let dir = TempDir::new().unwrap();
        let fsys = FileSys::new(dir.path());

        write_chunk_meta(&fsys, "s", "1_1", &sealed_meta());
        let raw = MetaFile {
            offsets: Some(ColumnOffsets::default()),
            logs_len: 1,
            ..sealed_meta()
        };
        write_chunk_meta(&fsys, "s", "2_1", &raw);
        write_chunk_meta(&fsys, "s", "3_1", &sealed_meta());

        let (_, first_raw) = fsys.discover_storages().unwrap();
        assert_eq!(first_raw["s"], 2);
    }

    #[test]
    fn discovery_drops_storage_with_sentinel() {
        let dir = TempDir::new().unwrap();
        let fsys = FileSys::new(dir.path());

        write_chunk_meta(&fsys, "doomed", "1_1", &sealed_meta());
        fsys.write_file(&format!("{DIR_STORAGES}/doomed/{DELETED_SENTINEL}"), b"", false)
            .unwrap();

        let (metas, _) = fsys.discover_storages().unwrap();
        assert!(!metas.contains_key("doomed"));
        assert!(!fsys.exists(&format!("{DIR_STORAGES}/doomed")));
    }

    #[test]
    fn empty_storage_starts_at_chunk_one() {
        let dir = TempDir::new().unwrap();
        let fsys = FileSys::new(dir.path());
        fsys.make_dir_all(&format!("{DIR_STORAGES}/fresh")).unwrap();

        let (metas, first_raw) = fsys.discover_storages().unwrap();
        assert!(metas["fresh"].is_empty());
        assert_eq!(first_raw["fresh"], 1);
    }

    #[test]
    fn pending_delete_queries_survive_and_strays_are_dropped() {
        let dir = TempDir::new().unwrap();
        let fsys = FileSys::new(dir.path());

        let query = DeleteQuery {
            storage: "s".into(),
            time_range: "after 5".into(),
            ..DeleteQuery::default()
        };
        fsys.write_file(
            &format!("{DIR_DELETE_TASKS}/task-1"),
            &serde_json::to_vec(&query).unwrap(),
            false,
        )
        .unwrap();
        fsys.write_file(&format!("{DIR_DELETE_TASKS}/task-2.new"), b"{}", false)
            .unwrap();

        let pending = fsys.read_pending_delete_queries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "task-1");
        assert_eq!(pending[0].storage, "s");
        assert!(!fsys.exists(&format!("{DIR_DELETE_TASKS}/task-2.new")));
    }
}
