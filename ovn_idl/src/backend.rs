//! Capability layer shared by the northbound and southbound clients.

use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    engine::LiveConnection,
    error::{IdlError, IdlResult},
    mirror::Mirror,
    retry::RetryPolicy,
    row::RowView,
    schema::DatabaseSchema,
    transaction::Transaction,
    value::Atom,
};

#[derive(Clone)]
pub struct Backend {
    conn: Arc<dyn LiveConnection>,
    row_retry: RetryPolicy,
    timeout: Duration,
}

impl Backend {
    pub fn new(conn: Arc<dyn LiveConnection>, row_retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            conn,
            row_retry,
            timeout,
        }
    }

    pub fn connection(&self) -> &Arc<dyn LiveConnection> {
        &self.conn
    }

    pub fn mirror(&self) -> &Mirror {
        self.conn.mirror()
    }

    /// Registered tables confirmed by the server.
    pub fn schema(&self) -> &DatabaseSchema {
        self.conn.schema()
    }

    pub fn is_table_present(&self, table: &str) -> bool {
        self.schema().has_table(table)
    }

    /// False when the table itself is not present.
    pub fn is_col_present(&self, table: &str, column: &str) -> bool {
        self.schema()
            .table(table)
            .is_some_and(|t| t.has_column(column))
    }

    pub fn lookup(&self, table: &str, uuid: &Uuid) -> IdlResult<RowView> {
        if !self.is_table_present(table) {
            return Err(IdlError::TableNotFound(table.to_string()));
        }
        self.mirror()
            .get(table, uuid)
            .map(RowView::new)
            .ok_or_else(|| IdlError::RecordNotFound {
                table: table.to_string(),
                record: uuid.to_string(),
            })
    }

    /// First mirrored row of `table` whose `column` equals, or for set
    /// columns contains, `value`.
    pub fn row_by_value(&self, table: &str, column: &str, value: &Atom) -> IdlResult<RowView> {
        if !self.is_table_present(table) {
            return Err(IdlError::TableNotFound(table.to_string()));
        }
        self.mirror()
            .find_first(table, |row| row.get(column).is_some_and(|v| v.matches(value)))
            .map(RowView::new)
            .ok_or_else(|| IdlError::RowNotFound {
                table: table.to_string(),
                column: column.to_string(),
                value: value.to_string(),
            })
    }

    /// Wait for a row to show up in the mirror.
    ///
    /// A missing row is retried with the row-visibility policy (10s in
    /// total by default); once the budget is spent the last `RowNotFound`
    /// is returned. A table that is not mirrored fails immediately.
    pub async fn check_for_row_by_value_and_retry(
        &self,
        table: &str,
        column: &str,
        value: impl Into<Atom>,
    ) -> IdlResult<RowView> {
        let value = value.into();
        let what = format!("Lookup of {value} in {column} of {table}");
        let value = &value;
        self.row_retry
            .retry(&what, IdlError::is_row_not_found, move || async move {
                self.row_by_value(table, column, value)
            })
            .await
    }

    pub fn create_transaction(&self) -> Transaction {
        Transaction::new(self.conn.clone(), self.timeout)
    }
}
