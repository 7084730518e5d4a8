//! Database schema model.
//!
//! Parsed from the JSON schema document an OVSDB server returns for
//! `get_schema`. Only what the IDL needs is kept: table and column names,
//! the column shape, and root/index metadata.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use tracing::warn;

use crate::error::{IdlError, IdlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicType {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

impl AtomicType {
    fn parse(name: &str) -> IdlResult<Self> {
        match name {
            "integer" => Ok(AtomicType::Integer),
            "real" => Ok(AtomicType::Real),
            "boolean" => Ok(AtomicType::Boolean),
            "string" => Ok(AtomicType::String),
            "uuid" => Ok(AtomicType::Uuid),
            other => Err(IdlError::InvalidSchema(format!(
                "unknown atomic type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Scalar,
    Set,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: ColumnKind,
    pub key_type: AtomicType,
    pub value_type: Option<AtomicType>,
    pub min: u64,
    /// `None` means unlimited.
    pub max: Option<u64>,
    pub mutable: bool,
}

impl ColumnSchema {
    pub fn is_optional(&self) -> bool {
        self.min == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeMap<String, ColumnSchema>,
    pub is_root: bool,
    pub indexes: Vec<Vec<String>>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.get(name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSchema {
    pub name: String,
    pub version: String,
    pub tables: BTreeMap<String, TableSchema>,
}

impl DatabaseSchema {
    pub fn from_json(raw: &str) -> IdlResult<Self> {
        let raw: RawSchema = serde_json::from_str(raw)?;
        Self::from_raw(raw)
    }

    pub fn from_value(value: serde_json::Value) -> IdlResult<Self> {
        let raw: RawSchema = serde_json::from_value(value)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSchema) -> IdlResult<Self> {
        let mut tables = BTreeMap::new();
        for (table_name, raw_table) in raw.tables {
            let mut columns = BTreeMap::new();
            for (column_name, raw_column) in raw_table.columns {
                if column_name.starts_with('_') {
                    return Err(IdlError::InvalidSchema(format!(
                        "column name '{column_name}' in {table_name} is reserved"
                    )));
                }
                let column = raw_column.into_column(&column_name)?;
                columns.insert(column_name, column);
            }
            tables.insert(
                table_name.clone(),
                TableSchema {
                    name: table_name,
                    columns,
                    is_root: raw_table.is_root,
                    indexes: raw_table.indexes,
                },
            );
        }
        Ok(Self {
            name: raw.name,
            version: raw.version,
            tables,
        })
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Selects which tables of a fetched schema get mirrored.
///
/// Nothing is mirrored until tables are registered (or `register_all` is
/// called); `build` returns the registered subset.
#[derive(Debug, Clone)]
pub struct SchemaHelper {
    schema: DatabaseSchema,
    registered: BTreeSet<String>,
    all: bool,
}

impl SchemaHelper {
    pub fn new(schema: DatabaseSchema) -> Self {
        Self {
            schema,
            registered: BTreeSet::new(),
            all: false,
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    /// Returns false, leaving the selection untouched, when the server
    /// schema has no such table.
    pub fn register_table(&mut self, name: &str) -> bool {
        if !self.schema.has_table(name) {
            warn!(
                "Table {} is not part of schema {} {}, skipping",
                name, self.schema.name, self.schema.version
            );
            return false;
        }
        self.registered.insert(name.to_string());
        true
    }

    pub fn register_all(&mut self) {
        self.all = true;
    }

    pub fn registered_tables(&self) -> Vec<String> {
        if self.all {
            return self.schema.tables.keys().cloned().collect();
        }
        self.registered.iter().cloned().collect()
    }

    pub fn build(&self) -> DatabaseSchema {
        if self.all {
            return self.schema.clone();
        }
        DatabaseSchema {
            name: self.schema.name.clone(),
            version: self.schema.version.clone(),
            tables: self
                .schema
                .tables
                .iter()
                .filter(|(name, _)| self.registered.contains(*name))
                .map(|(name, table)| (name.clone(), table.clone()))
                .collect(),
        }
    }
}

// ============================================================================
// Wire shape of the schema document
// ============================================================================

#[derive(Deserialize)]
struct RawSchema {
    name: String,
    #[serde(default)]
    version: String,
    tables: BTreeMap<String, RawTable>,
}

#[derive(Deserialize)]
struct RawTable {
    columns: BTreeMap<String, RawColumn>,
    #[serde(rename = "isRoot", default)]
    is_root: bool,
    #[serde(default)]
    indexes: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct RawColumn {
    #[serde(rename = "type")]
    column_type: RawType,
    #[serde(default = "default_mutable")]
    mutable: bool,
}

fn default_mutable() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawType {
    Atomic(String),
    Complex(RawComplexType),
}

#[derive(Deserialize)]
struct RawComplexType {
    key: RawBaseType,
    #[serde(default)]
    value: Option<RawBaseType>,
    #[serde(default = "default_bound")]
    min: u64,
    #[serde(default = "default_max")]
    max: RawMax,
}

fn default_bound() -> u64 {
    1
}

fn default_max() -> RawMax {
    RawMax::Count(1)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBaseType {
    Atomic(String),
    Constrained {
        #[serde(rename = "type")]
        kind: String,
    },
}

impl RawBaseType {
    fn atomic(&self) -> IdlResult<AtomicType> {
        match self {
            RawBaseType::Atomic(name) => AtomicType::parse(name),
            RawBaseType::Constrained { kind } => AtomicType::parse(kind),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMax {
    Count(u64),
    Unlimited(String),
}

impl RawColumn {
    fn into_column(self, name: &str) -> IdlResult<ColumnSchema> {
        let (key_type, value_type, min, max) = match self.column_type {
            RawType::Atomic(atomic) => (AtomicType::parse(&atomic)?, None, 1, Some(1)),
            RawType::Complex(complex) => {
                let max = match complex.max {
                    RawMax::Count(n) => Some(n),
                    RawMax::Unlimited(s) if s == "unlimited" => None,
                    RawMax::Unlimited(s) => {
                        return Err(IdlError::InvalidSchema(format!(
                            "column {name}: invalid max '{s}'"
                        )))
                    }
                };
                let value_type = complex.value.as_ref().map(RawBaseType::atomic).transpose()?;
                (complex.key.atomic()?, value_type, complex.min, max)
            }
        };

        let kind = if value_type.is_some() {
            ColumnKind::Map
        } else if max == Some(1) && min == 1 {
            ColumnKind::Scalar
        } else {
            ColumnKind::Set
        };

        Ok(ColumnSchema {
            name: name.to_string(),
            kind,
            key_type,
            value_type,
            min,
            max,
            mutable: self.mutable,
        })
    }
}
