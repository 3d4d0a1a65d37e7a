//! Request bodies for the search, delete, storage, and shutdown endpoints.

use super::log::validate_storage_name;
use super::meta::TimeRange;
use super::value::ColumnSet;
use crate::Result;
use serde::{Deserialize, Serialize};

/// `POST /logs/search` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub storage: String,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub time_range: String,
    #[serde(default)]
    pub aggreg_values: Vec<serde_json::Value>,
    #[serde(default)]
    pub r#where: String,
    #[serde(default)]
    pub where_values: Vec<serde_json::Value>,
    #[serde(default)]
    pub group_by: String,
    #[serde(default)]
    pub having: String,
    #[serde(default)]
    pub having_values: Vec<serde_json::Value>,
    #[serde(default)]
    pub order_by: String,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// `DELETE /logs` body. Journaled to `delete_tasks/<task_id>` so deletion
/// survives restarts; the task id is the journal file name, not part of the
/// body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteQuery {
    pub storage: String,
    #[serde(default)]
    pub time_range: String,
    #[serde(default)]
    pub r#where: String,
    #[serde(default)]
    pub where_values: Vec<serde_json::Value>,
    #[serde(skip)]
    pub task_id: String,
}

impl DeleteQuery {
    pub fn validate(&self) -> Result<()> {
        validate_storage_name(&self.storage)
    }
}

/// `POST /storage` / `DELETE /storage` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRequest {
    pub storage: String,
}

impl StorageRequest {
    pub fn validate(&self) -> Result<()> {
        validate_storage_name(&self.storage)
    }
}

/// `POST /shutdown` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub password: String,
}

/// What a search needs loaded from disk: the storage, the columns its
/// conditions and projections touch, and the requested time window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    pub storage: String,
    pub columns: ColumnSet,
    pub time_range: TimeRange,
}
