//! Crash-safe file mutation: checksummed codecs, journalled transactions,
//! before-image backups, and the rooted filesystem layer with boot
//! discovery.

pub mod codec;

mod backuper;
mod filesys;
mod transaction;

pub use backuper::Backuper;
pub use filesys::{FileSys, NEW_SUFFIX};
pub use transaction::{replay_all, Action, Transaction};
