//! Journalled multi-action file transactions.
//!
//! A transaction is an ordered list of file actions persisted under
//! `transactions/<name>` before being executed. Replay is idempotent: a
//! missing target is not an error, so a journal interrupted mid-apply can be
//! re-applied on the next boot until it reaches its fixed point.

use super::codec;
use super::filesys::{FileSys, NEW_SUFFIX};
use crate::model::DIR_TRANSACTIONS;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::debug;

/// One recoverable file mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Truncate `path` to `size` bytes.
    Cut { path: String, size: u64 },
    /// Remove `path` recursively.
    Remove { path: String },
    /// Rename `from` to `to`.
    Rename { from: String, to: String },
}

#[derive(Debug)]
pub struct Transaction {
    name: String,
    actions: Vec<Action>,
    filesys: FileSys,
}

impl Transaction {
    pub fn new(filesys: FileSys, name: &str) -> Transaction {
        Transaction {
            name: format!("{DIR_TRANSACTIONS}/{name}"),
            actions: Vec::new(),
            filesys,
        }
    }

    /// Reload a committed journal from disk.
    pub fn load(filesys: FileSys, name: &str) -> Result<Transaction> {
        let rel = format!("{DIR_TRANSACTIONS}/{name}");
        let bytes = filesys.read_file(&rel)?;
        let actions: Vec<Action> = codec::decode_frame(&rel, &bytes)?;
        Ok(Transaction {
            name: rel,
            actions,
            filesys,
        })
    }

    pub fn add(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Persist the journal. Empty action lists are not committed.
    pub fn commit(&self) -> Result<()> {
        if self.actions.is_empty() {
            return Ok(());
        }
        let frame = codec::encode_frame(&self.actions)?;
        self.filesys.write_file(&self.name, &frame, true)?;
        debug!(journal = self.name, actions = self.actions.len(), "transaction committed");
        Ok(())
    }

    /// Execute every action in order, then remove the journal. Missing
    /// targets are tolerated so replay converges.
    pub fn apply(&mut self) -> Result<()> {
        for action in &self.actions {
            match action {
                Action::Cut { path, size } => self.filesys.truncate(path, *size)?,
                Action::Remove { path } => self.filesys.remove_all(path)?,
                Action::Rename { from, to } => self.filesys.rename(from, to)?,
            }
        }
        self.filesys.remove_file(&self.name)?;
        debug!(journal = self.name, actions = self.actions.len(), "transaction applied");
        self.actions.clear();
        Ok(())
    }

    /// Discard the journal without executing it.
    pub fn cancel(&mut self) -> Result<()> {
        if self.actions.is_empty() {
            return Ok(());
        }
        self.filesys.remove_file(&self.name)?;
        self.actions.clear();
        Ok(())
    }
}

/// Boot-time recovery: drop stray staged journals, then replay every
/// committed one. After this returns no partially-applied mutation remains.
pub fn replay_all(filesys: &FileSys) -> Result<usize> {
    filesys.make_dir_all(DIR_TRANSACTIONS)?;
    let mut replayed = 0;

    for entry in fs::read_dir(filesys.resolve(DIR_TRANSACTIONS))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();

        if name.ends_with(NEW_SUFFIX) {
            filesys.remove_file(&format!("{DIR_TRANSACTIONS}/{name}"))?;
            continue;
        }
        let mut tx = Transaction::load(filesys.clone(), &name)?;
        tx.apply()?;
        replayed += 1;
    }

    debug!(replayed, "transactions replayed");
    Ok(replayed)
}
