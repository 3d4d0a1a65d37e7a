//! Core data model: the closed column schema, chunk descriptors, and
//! request shapes.

mod log;
mod meta;
mod query;
mod value;

pub use log::{validate_storage_name, LogBatch, LogRecord};
pub use meta::{
    ChunkMeta, ColumnOffsets, MetaFile, TimeRange, BLOCK_MAX_SIZE, DELETED_SENTINEL,
    DIR_DELETE_TASKS, DIR_STORAGES, DIR_TRANSACTIONS, MAX_LOGS_IN_CHUNK, META_FILE, META_NEW_FILE,
};
pub use query::{DeleteQuery, LoadPlan, SearchQuery, ShutdownRequest, StorageRequest};
pub use value::{Column, ColumnSet, Value, ValueSource, ValueType};
