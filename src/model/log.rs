//! The log record schema and batch-level validation limits.

use super::value::{Column, Value, ValueSource};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One structured log record. The column set is closed and typed; see
/// [`Column`] for the on-disk layout order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: i64,
    pub level: u8,
    #[serde(default)]
    pub traces: Vec<String>,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn str_in_bounds(s: &str, max: usize) -> bool {
    !s.is_empty() && s.len() <= max
}

impl LogRecord {
    pub fn validate(&self) -> Result<()> {
        if self.timestamp == 0 {
            return Err(Error::bad_request("'timestamp' is a required column"));
        }
        if self.level > 7 {
            return Err(Error::bad_request("'level' must be in range 0-7"));
        }
        if !str_in_bounds(&self.entity, 50) {
            return Err(Error::bad_request(
                "Number of characters in 'entity' must be from 1 to 50",
            ));
        }
        if !str_in_bounds(&self.entity_id, 50) {
            return Err(Error::bad_request(
                "Number of characters in 'entity_id' must be from 1 to 50",
            ));
        }
        if !str_in_bounds(&self.message, 255) {
            return Err(Error::bad_request(
                "Number of characters in 'message' must be from 1 to 255",
            ));
        }
        if self.traces.is_empty() || self.traces.len() > 20 {
            return Err(Error::bad_request("Number of 'traces' must be from 1 to 20"));
        }
        if self.traces.iter().any(|t| !str_in_bounds(t, 50)) {
            return Err(Error::bad_request(
                "Number of characters in all 'traces' must be from 1 to 50",
            ));
        }
        if self.modules.is_empty() || self.modules.len() > 40 {
            return Err(Error::bad_request("Number of 'modules' must be from 1 to 40"));
        }
        if self.modules.iter().any(|m| !str_in_bounds(m, 50)) {
            return Err(Error::bad_request(
                "Number of characters in all 'modules' must be from 1 to 50",
            ));
        }
        if self.labels.len() > 20 {
            return Err(Error::bad_request("Number of 'labels' is more than 20"));
        }
        if self.labels.iter().any(|l| !str_in_bounds(l, 50)) {
            return Err(Error::bad_request(
                "Number of characters in all 'labels' must be from 1 to 50",
            ));
        }
        if self.fields.len() > 20 {
            return Err(Error::bad_request(
                "Number of entries in 'fields' is more than 20",
            ));
        }
        for (key, val) in &self.fields {
            if !str_in_bounds(key, 50) || !str_in_bounds(val, 50) {
                return Err(Error::bad_request(
                    "Number of characters in all keys and values in 'fields' must be from 1 to 50",
                ));
            }
        }
        Ok(())
    }

    /// Read one column as a tagged value.
    pub fn value(&self, column: Column) -> Value {
        match column {
            Column::Timestamp => Value::Int(self.timestamp),
            Column::Level => Value::Int(i64::from(self.level)),
            Column::Traces => Value::StrArray(self.traces.clone()),
            Column::Entity => Value::Str(self.entity.clone()),
            Column::EntityId => Value::Str(self.entity_id.clone()),
            Column::Message => Value::Str(self.message.clone()),
            Column::Modules => Value::StrArray(self.modules.clone()),
            Column::Labels => Value::StrArray(self.labels.clone()),
            Column::Fields => Value::StrMap(self.fields.clone()),
        }
    }

    /// Write one column from a tagged value, as read back from a column file.
    pub fn set_value(&mut self, column: Column, value: Value) -> Result<()> {
        match (column, value) {
            (Column::Timestamp, Value::Int(v)) => self.timestamp = v,
            (Column::Level, Value::Int(v)) => {
                self.level = u8::try_from(v)
                    .map_err(|_| Error::Codec(format!("level out of range: {v}")))?
            }
            (Column::Traces, Value::StrArray(v)) => self.traces = v,
            (Column::Entity, Value::Str(v)) => self.entity = v,
            (Column::EntityId, Value::Str(v)) => self.entity_id = v,
            (Column::Message, Value::Str(v)) => self.message = v,
            (Column::Modules, Value::StrArray(v)) => self.modules = v,
            (Column::Labels, Value::StrArray(v)) => self.labels = v,
            (Column::Fields, Value::StrMap(v)) => self.fields = v,
            (column, value) => {
                return Err(Error::Codec(format!(
                    "column '{column}' cannot hold a {:?} value",
                    value.value_type()
                )))
            }
        }
        Ok(())
    }
}

impl ValueSource for LogRecord {
    fn lookup(&self, key: &str) -> Option<Value> {
        Column::parse(key).map(|column| self.value(column))
    }
}

/// An ingest batch: one storage, at least one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub storage: String,
    pub logs: Vec<LogRecord>,
}

/// Storage names are directory names, bounded at 200 characters.
pub fn validate_storage_name(storage: &str) -> Result<()> {
    if storage.is_empty() || storage.len() > 200 {
        return Err(Error::bad_request(
            "Number of characters in 'storage' must be from 1 to 200",
        ));
    }
    Ok(())
}

impl LogBatch {
    pub fn validate(&self) -> Result<()> {
        validate_storage_name(&self.storage)?;
        if self.logs.is_empty() {
            return Err(Error::bad_request("'logs' not specified"));
        }
        for log in &self.logs {
            log.validate()?;
        }
        Ok(())
    }
}
