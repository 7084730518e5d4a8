//! Mirrored rows and read-only row views.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::value::{Atom, Value};

/// Server-assigned modification counter of a row.
pub type Revision = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub uuid: Uuid,
    pub revision: Revision,
    pub columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(uuid: Uuid, revision: Revision, columns: BTreeMap<String, Value>) -> Self {
        Self {
            uuid,
            revision,
            columns,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Missing map columns read as empty.
    pub fn map_entry(&self, column: &str, key: &str) -> Option<&str> {
        self.columns
            .get(column)
            .and_then(Value::as_map)
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }

    /// True when `column` holds `owner`, either as the scalar value or as a
    /// set member.
    pub fn references(&self, column: &str, owner: &Uuid) -> bool {
        self.columns
            .get(column)
            .is_some_and(|v| v.matches(&Atom::Uuid(*owner)))
    }
}

/// Snapshot of a mirrored row.
///
/// Holds the row as it was when the view was taken; later notifications
/// replace the mirror's copy and are not reflected here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowView {
    row: Arc<Row>,
}

impl RowView {
    pub fn new(row: Arc<Row>) -> Self {
        Self { row }
    }

    pub fn uuid(&self) -> Uuid {
        self.row.uuid
    }

    pub fn revision(&self) -> Revision {
        self.row.revision
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.row.get(column).and_then(Value::as_str)
    }

    pub fn get_integer(&self, column: &str) -> Option<i64> {
        self.row.get(column).and_then(Value::as_integer)
    }

    pub fn get_map(&self, column: &str) -> BTreeMap<String, String> {
        self.row
            .get(column)
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default()
    }

    pub fn map_entry(&self, column: &str, key: &str) -> Option<&str> {
        self.row.map_entry(column, key)
    }

    pub fn references(&self, column: &str, owner: &Uuid) -> bool {
        self.row.references(column, owner)
    }

    pub fn columns(&self) -> &BTreeMap<String, Value> {
        &self.row.columns
    }
}

impl From<Arc<Row>> for RowView {
    fn from(row: Arc<Row>) -> Self {
        Self::new(row)
    }
}

impl Serialize for RowView {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.row.serialize(serializer)
    }
}
