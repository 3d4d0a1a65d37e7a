//! Before-image journals around chunk mutations.
//!
//! A `Backuper` records, before a mutation runs, the actions that would undo
//! it: truncate appended columns back, remove freshly created files, drop
//! staged `.new` descriptors. On success the backup journal is replaced by a
//! cancel journal that promotes the staged files; on failure the backup
//! journal is applied to restore the before-image. Both journals share one
//! file under `transactions/`, so whichever was committed last wins replay.

use super::filesys::{FileSys, NEW_SUFFIX};
use super::transaction::{Action, Transaction};
use crate::model::{Column, ColumnOffsets, META_NEW_FILE};
use crate::Result;

#[derive(Debug)]
pub struct Backuper {
    name: String,
    backup: Transaction,
    cancel: Option<Transaction>,
    filesys: FileSys,
}

impl Backuper {
    pub fn new(filesys: FileSys, name: &str) -> Backuper {
        Backuper {
            name: name.to_string(),
            backup: Transaction::new(filesys.clone(), name),
            cancel: None,
            filesys,
        }
    }

    /// Record the restore action for a file about to be appended to: cut it
    /// back to its current size, or remove it if it does not exist yet.
    pub fn add_for_cut(&mut self, path: &str) -> Result<u64> {
        match self.filesys.file_size(path)? {
            Some(size) => {
                self.backup.add(Action::Cut {
                    path: path.to_string(),
                    size,
                });
                Ok(size)
            }
            None => {
                self.backup.add(Action::Remove {
                    path: path.to_string(),
                });
                Ok(0)
            }
        }
    }

    /// Register a staged `<path>.new` file: the backup journal removes it,
    /// the cancel journal promotes it over `<path>`.
    pub fn add_for_replace(&mut self, staged: &str) {
        debug_assert!(staged.ends_with(NEW_SUFFIX), "not a staged path: {staged}");

        self.backup.add(Action::Remove {
            path: staged.to_string(),
        });

        let cancel = self
            .cancel
            .get_or_insert_with(|| Transaction::new(self.filesys.clone(), &self.name));
        cancel.add(Action::Rename {
            from: staged.to_string(),
            to: staged[..staged.len() - NEW_SUFFIX.len()].to_string(),
        });
    }

    /// Register a whole chunk mutation. A sealed rewrite (or a brand new raw
    /// chunk) is undone by removing the chunk directory; an append to a raw
    /// chunk is undone by cutting every column back to its recorded offset.
    /// Either way the staged descriptor rides the replace slot.
    pub fn add_chunk(&mut self, chunk_dir: &str, offsets: Option<&ColumnOffsets>) -> Result<()> {
        match offsets {
            None => self.backup.add(Action::Remove {
                path: chunk_dir.to_string(),
            }),
            Some(offsets) if offsets.is_zero() => self.backup.add(Action::Remove {
                path: chunk_dir.to_string(),
            }),
            Some(offsets) => {
                for column in Column::ALL {
                    self.backup.add(Action::Cut {
                        path: format!("{chunk_dir}/{column}"),
                        size: offsets.get(column),
                    });
                }
            }
        }
        self.add_for_replace(&format!("{chunk_dir}/{META_NEW_FILE}"));
        Ok(())
    }

    /// Persist the backup journal before mutating anything.
    pub fn commit(&self) -> Result<()> {
        self.backup.commit()
    }

    /// Success path: promote staged files via the cancel journal, or just
    /// drop the backup journal when nothing was staged.
    pub fn cancel(&mut self) -> Result<()> {
        match self.cancel.take() {
            Some(mut cancel) => {
                cancel.commit()?;
                cancel.apply()?;
                self.backup = Transaction::new(self.filesys.clone(), &self.name);
                Ok(())
            }
            None => self.backup.cancel(),
        }
    }

    /// Failure path: apply the before-image, undoing partial changes.
    pub fn backup(&mut self) -> Result<()> {
        self.cancel = None;
        self.backup.apply()
    }
}
