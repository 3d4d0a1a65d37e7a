//! The closed column schema and the tagged value shapes that flow through
//! the engine: column files, condition operands, and result rows all carry
//! [`Value`]s.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The nine log columns. The set is closed; adding a column is a schema
/// change that touches the on-disk chunk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Timestamp,
    Level,
    Traces,
    Entity,
    EntityId,
    Message,
    Modules,
    Labels,
    Fields,
}

impl Column {
    pub const COUNT: usize = 9;

    pub const ALL: [Column; Column::COUNT] = [
        Column::Timestamp,
        Column::Level,
        Column::Traces,
        Column::Entity,
        Column::EntityId,
        Column::Message,
        Column::Modules,
        Column::Labels,
        Column::Fields,
    ];

    /// File name of this column inside a chunk directory.
    pub fn name(self) -> &'static str {
        match self {
            Column::Timestamp => "timestamp",
            Column::Level => "level",
            Column::Traces => "traces",
            Column::Entity => "entity",
            Column::EntityId => "entity_id",
            Column::Message => "message",
            Column::Modules => "modules",
            Column::Labels => "labels",
            Column::Fields => "fields",
        }
    }

    pub fn parse(name: &str) -> Option<Column> {
        Column::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn value_type(self) -> ValueType {
        match self {
            Column::Timestamp | Column::Level => ValueType::Int,
            Column::Entity | Column::EntityId | Column::Message => ValueType::Str,
            Column::Traces | Column::Modules | Column::Labels => ValueType::StrArray,
            Column::Fields => ValueType::StrMap,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type tags for values in conditions and column files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Str,
    IntArray,
    StrArray,
    StrMap,
}

/// A single typed value. Column files store one tagged `Value` per record;
/// condition operands and result cells reuse the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Str(String),
    IntArray(Vec<i64>),
    StrArray(Vec<String>),
    StrMap(BTreeMap<String, String>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Str(_) => ValueType::Str,
            Value::IntArray(_) => ValueType::IntArray,
            Value::StrArray(_) => ValueType::StrArray,
            Value::StrMap(_) => ValueType::StrMap,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Flatten to a totally ordered string key, used for grouping and for
    /// ordering rows by array- or map-valued columns.
    pub fn group_key(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Str(v) => v.clone(),
            Value::IntArray(vs) => vs
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Value::StrArray(vs) => vs.join(","),
            Value::StrMap(m) => m
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// JSON form for HTTP result rows.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Str(v) => serde_json::Value::from(v.clone()),
            Value::IntArray(vs) => serde_json::Value::from(vs.clone()),
            Value::StrArray(vs) => serde_json::Value::from(vs.clone()),
            Value::StrMap(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone())))
                    .collect(),
            ),
        }
    }
}

/// Anything a condition can pull operand values out of: a log record or an
/// aggregated group row.
pub trait ValueSource {
    fn lookup(&self, key: &str) -> Option<Value>;
}

/// A small set of columns, used to restrict chunk reads to what a query
/// actually touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnSet(u16);

impl ColumnSet {
    pub fn all() -> ColumnSet {
        ColumnSet((1 << Column::COUNT) - 1)
    }

    pub fn insert(&mut self, column: Column) {
        self.0 |= 1 << column.index();
    }

    pub fn contains(&self, column: Column) -> bool {
        self.0 & (1 << column.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Column> + '_ {
        Column::ALL.into_iter().filter(|c| self.contains(*c))
    }
}
