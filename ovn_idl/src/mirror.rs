//! Live row store.
//!
//! The mirror engine owns one `Mirror` per connection and applies server
//! notifications to it; everything else only reads. Rows are shared as
//! `Arc<Row>` and replaced wholesale on change, so readers never observe a
//! half-updated row, and one `Update` is applied under a single write lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::row::Row;

/// Change to one row, as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange {
    /// Row created or modified; carries the complete new row.
    Upsert(Row),
    Delete(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUpdate {
    pub table: String,
    pub changes: Vec<RowChange>,
}

/// One server notification: changes to any number of tables, applied as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub tables: Vec<TableUpdate>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.changes.is_empty())
    }
}

type TableRows = HashMap<Uuid, Arc<Row>>;

#[derive(Debug, Clone, Default)]
pub struct Mirror {
    tables: Arc<RwLock<HashMap<String, TableRows>>>,
    seqno: Arc<AtomicU64>,
}

impl Mirror {
    /// Only the given tables are tracked; updates for others are dropped.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables = tables
            .into_iter()
            .map(|t| (t.into(), TableRows::new()))
            .collect();
        Self {
            tables: Arc::new(RwLock::new(tables)),
            seqno: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }

    /// Number of updates applied so far.
    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    /// `None` if the table is not tracked.
    pub fn rows(&self, table: &str) -> Option<Vec<Arc<Row>>> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
    }

    pub fn get(&self, table: &str, uuid: &Uuid) -> Option<Arc<Row>> {
        self.tables.read().get(table)?.get(uuid).cloned()
    }

    pub fn find<F>(&self, table: &str, predicate: F) -> Vec<Arc<Row>>
    where
        F: Fn(&Row) -> bool,
    {
        self.tables
            .read()
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| predicate(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_first<F>(&self, table: &str, predicate: F) -> Option<Arc<Row>>
    where
        F: Fn(&Row) -> bool,
    {
        self.tables
            .read()
            .get(table)?
            .values()
            .find(|row| predicate(row))
            .cloned()
    }

    /// Any row of the table; meant for single-row tables such as `NB_Global`.
    pub fn first(&self, table: &str) -> Option<Arc<Row>> {
        self.tables.read().get(table)?.values().next().cloned()
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, HashMap::len)
    }

    pub fn apply(&self, update: &Update) {
        let mut tables = self.tables.write();
        for table_update in &update.tables {
            let Some(rows) = tables.get_mut(&table_update.table) else {
                debug!(
                    "Ignoring update for unregistered table {}",
                    table_update.table
                );
                continue;
            };
            for change in &table_update.changes {
                match change {
                    RowChange::Upsert(row) => {
                        rows.insert(row.uuid, Arc::new(row.clone()));
                    }
                    RowChange::Delete(uuid) => {
                        rows.remove(uuid);
                    }
                }
            }
        }
        self.seqno.fetch_add(1, Ordering::AcqRel);
    }

    /// Replace the contents of every tracked table, as after an initial
    /// monitor reply or a resync.
    pub fn reset(&self, snapshot: HashMap<String, Vec<Row>>) {
        let mut tables = self.tables.write();
        for (name, rows) in tables.iter_mut() {
            rows.clear();
            if let Some(fresh) = snapshot.get(name) {
                rows.extend(fresh.iter().map(|r| (r.uuid, Arc::new(r.clone()))));
            }
        }
        self.seqno.fetch_add(1, Ordering::AcqRel);
    }

    pub fn clear(&self) {
        for rows in self.tables.write().values_mut() {
            rows.clear();
        }
    }
}
