//! Transactions over a live connection.
//!
//! A `Transaction` queues operations, validated against the registered
//! schema as they are added, and submits them in one atomic request on
//! `commit`. Pre-commit hooks run just before submission and may queue more
//! operations, which then share the fate of the rest of the transaction.
//!
//! Revision conflicts are intercepted here and only here: `commit` turns
//! them into `TxnOutcome::AbortedConflict`, every other failure is returned
//! as an error.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    commands::Command,
    engine::{LiveConnection, Mutation, Operation},
    error::{IdlError, IdlResult},
    mirror::Mirror,
    row::RowView,
    schema::TableSchema,
    value::Value,
};

/// How a submitted transaction ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    /// Lost an optimistic-concurrency race; nothing was applied.
    AbortedConflict { reason: String },
}

impl TxnOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed)
    }
}

/// Runs right before a transaction is submitted.
pub trait PreCommitHook: Send + Sync {
    fn name(&self) -> &str;

    fn pre_commit(&self, txn: &mut Transaction) -> IdlResult<()>;
}

/// Increments a counter column on the single row of a global table.
#[derive(Debug, Clone)]
pub struct BumpGlobalCounter {
    table: String,
    column: String,
}

impl BumpGlobalCounter {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// `NB_Global.nb_cfg`, watched by ovn-northd and the chassis agents.
    pub fn nb_cfg() -> Self {
        Self::new("NB_Global", "nb_cfg")
    }
}

impl PreCommitHook for BumpGlobalCounter {
    fn name(&self) -> &str {
        "bump_global_counter"
    }

    fn pre_commit(&self, txn: &mut Transaction) -> IdlResult<()> {
        txn.check_column(&self.table, &self.column)?;
        let global = txn
            .mirror()
            .first(&self.table)
            .ok_or_else(|| IdlError::RecordNotFound {
                table: self.table.clone(),
                record: "global row".to_string(),
            })?;
        txn.mutate(
            &self.table,
            global.uuid,
            &self.column,
            Mutation::Increment(1),
        )
    }
}

pub struct Transaction {
    conn: Arc<dyn LiveConnection>,
    timeout: Duration,
    ops: Vec<Operation>,
    hooks: Vec<Box<dyn PreCommitHook>>,
    finished: bool,
}

impl Transaction {
    pub fn new(conn: Arc<dyn LiveConnection>, timeout: Duration) -> Self {
        Self {
            conn,
            timeout,
            ops: Vec::new(),
            hooks: Vec::new(),
            finished: false,
        }
    }

    pub fn add_hook(&mut self, hook: Box<dyn PreCommitHook>) {
        self.hooks.push(hook);
    }

    pub fn with_hook(mut self, hook: Box<dyn PreCommitHook>) -> Self {
        self.add_hook(hook);
        self
    }

    pub fn mirror(&self) -> &Mirror {
        self.conn.mirror()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn check_table(&self, table: &str) -> IdlResult<&TableSchema> {
        self.conn
            .schema()
            .table(table)
            .ok_or_else(|| IdlError::TableNotFound(table.to_string()))
    }

    pub fn check_column(&self, table: &str, column: &str) -> IdlResult<()> {
        if self.check_table(table)?.has_column(column) {
            Ok(())
        } else {
            Err(IdlError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    /// Current mirrored copy of a row.
    pub fn lookup(&self, table: &str, uuid: &Uuid) -> IdlResult<RowView> {
        self.check_table(table)?;
        self.mirror()
            .get(table, uuid)
            .map(RowView::new)
            .ok_or_else(|| IdlError::RecordNotFound {
                table: table.to_string(),
                record: uuid.to_string(),
            })
    }

    pub fn insert<I, K>(&mut self, table: &str, columns: I) -> IdlResult<Uuid>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let columns = self.collect_columns(table, columns)?;
        let uuid = Uuid::new_v4();
        self.ops.push(Operation::Insert {
            table: table.to_string(),
            uuid,
            columns,
        });
        Ok(uuid)
    }

    pub fn update<I, K>(&mut self, table: &str, uuid: Uuid, columns: I) -> IdlResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let columns = self.collect_columns(table, columns)?;
        self.ops.push(Operation::Update {
            table: table.to_string(),
            uuid,
            columns,
        });
        Ok(())
    }

    pub fn delete(&mut self, table: &str, uuid: Uuid) -> IdlResult<()> {
        self.check_table(table)?;
        self.ops.push(Operation::Delete {
            table: table.to_string(),
            uuid,
        });
        Ok(())
    }

    pub fn mutate(
        &mut self,
        table: &str,
        uuid: Uuid,
        column: &str,
        mutation: Mutation,
    ) -> IdlResult<()> {
        self.check_column(table, column)?;
        self.ops.push(Operation::Mutate {
            table: table.to_string(),
            uuid,
            column: column.to_string(),
            mutation,
        });
        Ok(())
    }

    /// Set one key of a map column, replacing any previous value.
    pub fn set_key(
        &mut self,
        table: &str,
        uuid: Uuid,
        column: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> IdlResult<()> {
        self.mutate(
            table,
            uuid,
            column,
            Mutation::MapSet {
                key: key.into(),
                value: value.into(),
            },
        )
    }

    pub fn del_key(
        &mut self,
        table: &str,
        uuid: Uuid,
        column: &str,
        key: impl Into<String>,
    ) -> IdlResult<()> {
        self.mutate(table, uuid, column, Mutation::MapDelete { key: key.into() })
    }

    /// Make the commit conditional on `row` still being at the revision the
    /// view was taken at.
    pub fn verify(&mut self, table: &str, row: &RowView) -> IdlResult<()> {
        self.check_table(table)?;
        self.ops.push(Operation::Verify {
            table: table.to_string(),
            uuid: row.uuid(),
            revision: row.revision(),
        });
        Ok(())
    }

    pub fn add<C: Command + ?Sized>(&mut self, command: &C) -> IdlResult<C::Output> {
        command.run_idl(self)
    }

    fn collect_columns<I, K>(&self, table: &str, columns: I) -> IdlResult<BTreeMap<String, Value>>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let schema = self.check_table(table)?;
        columns
            .into_iter()
            .map(|(name, value)| {
                let name = name.into();
                if schema.has_column(&name) {
                    Ok((name, value))
                } else {
                    Err(IdlError::ColumnNotFound {
                        table: table.to_string(),
                        column: name,
                    })
                }
            })
            .collect()
    }

    /// Run the hooks and submit.
    ///
    /// A revision conflict is logged and reported as
    /// `TxnOutcome::AbortedConflict`; any other failure is returned as is
    /// and, like a conflict, leaves the database untouched.
    pub async fn commit(mut self) -> IdlResult<TxnOutcome> {
        let hooks = std::mem::take(&mut self.hooks);
        for hook in &hooks {
            debug!("Running pre-commit hook {}", hook.name());
            hook.pre_commit(&mut self)?;
        }

        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return Ok(TxnOutcome::Committed);
        }

        let count = ops.len();
        let result = match tokio::time::timeout(self.timeout, self.conn.transact(ops)).await {
            Ok(result) => result,
            Err(_) => Err(IdlError::Timeout(self.timeout)),
        };
        match result {
            Ok(()) => {
                debug!("Committed transaction with {} operations", count);
                Ok(TxnOutcome::Committed)
            }
            Err(IdlError::RevisionConflict(reason)) => {
                info!("Transaction aborted. Reason: {}", reason);
                Ok(TxnOutcome::AbortedConflict { reason })
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            debug!(
                "Discarding transaction with {} uncommitted operations",
                self.ops.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        config::Endpoint,
        engine::{MirrorEngine, SessionOptions},
        memory::{MemoryEngine, MemoryServer},
        schema::DatabaseSchema,
    };

    fn schema() -> DatabaseSchema {
        DatabaseSchema::from_value(json!({
            "name": "OVN_Northbound",
            "tables": {
                "NB_Global": {
                    "columns": {"nb_cfg": {"type": {"key": "integer"}}},
                    "isRoot": true
                },
                "Load_Balancer": {
                    "columns": {
                        "name": {"type": "string"},
                        "ip_port_mappings": {"type": {"key": "string", "value": "string",
                                                      "min": 0, "max": "unlimited"}}
                    },
                    "isRoot": true
                }
            }
        }))
        .unwrap()
    }

    async fn setup() -> (MemoryServer, Arc<dyn LiveConnection>) {
        let endpoint = Endpoint::parse("tcp:127.0.0.1:6641").unwrap();
        let server = MemoryServer::new(schema());
        server
            .insert_row("NB_Global", [("nb_cfg", Value::from(4i64))])
            .unwrap();
        let engine = MemoryEngine::new();
        engine.add_server(&endpoint, server.clone());

        let mut helper = engine
            .get_schema_helper(&endpoint, "OVN_Northbound")
            .await
            .unwrap();
        helper.register_all();
        let conn = engine
            .start_connection(
                &endpoint,
                helper,
                SessionOptions {
                    timeout: Duration::from_secs(5),
                    probe_interval: Duration::from_secs(60),
                    ssl: None,
                },
            )
            .await
            .unwrap();
        (server, conn)
    }

    fn nb_cfg(server: &MemoryServer) -> Option<i64> {
        server
            .rows("NB_Global")
            .first()
            .and_then(|row| row.get("nb_cfg"))
            .and_then(Value::as_integer)
    }

    #[tokio::test]
    async fn test_queueing_validates_schema() {
        let (_server, conn) = setup().await;
        let mut txn = Transaction::new(conn, Duration::from_secs(5));

        assert!(matches!(
            txn.insert("ACL", [("name", Value::from("x"))]),
            Err(IdlError::TableNotFound(_))
        ));
        assert!(matches!(
            txn.insert("Load_Balancer", [("vips", Value::empty_map())]),
            Err(IdlError::ColumnNotFound { .. })
        ));
        assert!(txn.is_empty());
    }

    #[tokio::test]
    async fn test_bump_hook_increments_counter() {
        let (server, conn) = setup().await;
        let mut txn = Transaction::new(conn.clone(), Duration::from_secs(5))
            .with_hook(Box::new(BumpGlobalCounter::nb_cfg()));
        txn.insert("Load_Balancer", [("name", Value::from("lb-1"))])
            .unwrap();

        assert_eq!(txn.commit().await.unwrap(), TxnOutcome::Committed);
        assert_eq!(nb_cfg(&server), Some(5));
        assert_eq!(server.rows("Load_Balancer").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_bump_counter() {
        let (server, conn) = setup().await;
        let mut txn = Transaction::new(conn, Duration::from_secs(5))
            .with_hook(Box::new(BumpGlobalCounter::nb_cfg()));
        txn.delete("Load_Balancer", Uuid::new_v4()).unwrap();

        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, IdlError::RecordNotFound { .. }));
        assert_eq!(nb_cfg(&server), Some(4));
    }

    #[tokio::test]
    async fn test_conflict_is_a_clean_abort() {
        let (server, conn) = setup().await;
        let lb = server
            .insert_row("Load_Balancer", [("name", Value::from("lb-1"))])
            .unwrap();
        let mut txn = Transaction::new(conn.clone(), Duration::from_secs(5));
        let stale = RowView::new(Arc::new(server.row("Load_Balancer", &lb).unwrap()));

        server
            .commit(&[Operation::Update {
                table: "Load_Balancer".to_string(),
                uuid: lb,
                columns: [("name".to_string(), Value::from("lb-other"))].into(),
            }])
            .unwrap();

        txn.verify("Load_Balancer", &stale).unwrap();
        txn.update("Load_Balancer", lb, [("name", Value::from("lb-mine"))])
            .unwrap();
        let outcome = txn.commit().await.unwrap();
        assert!(matches!(outcome, TxnOutcome::AbortedConflict { .. }));
        assert!(!outcome.is_committed());
        assert_eq!(
            server
                .row("Load_Balancer", &lb)
                .unwrap()
                .get("name")
                .and_then(Value::as_str),
            Some("lb-other")
        );
    }

    #[tokio::test]
    async fn test_empty_transaction_is_a_no_op() {
        let (server, conn) = setup().await;
        let before = server.generation();
        let txn = Transaction::new(conn, Duration::from_secs(5));
        assert!(txn.commit().await.unwrap().is_committed());
        assert_eq!(server.generation(), before);
    }

    #[tokio::test]
    async fn test_map_key_helpers() {
        let (server, conn) = setup().await;
        let lb = server
            .insert_row("Load_Balancer", [("name", Value::from("lb-1"))])
            .unwrap();

        let mut txn = Transaction::new(conn.clone(), Duration::from_secs(5));
        txn.set_key("Load_Balancer", lb, "ip_port_mappings", "10.0.0.5", "p1:10.0.0.2")
            .unwrap();
        txn.commit().await.unwrap();

        let view = Transaction::new(conn.clone(), Duration::from_secs(5))
            .lookup("Load_Balancer", &lb)
            .unwrap();
        assert_eq!(view.map_entry("ip_port_mappings", "10.0.0.5"), Some("p1:10.0.0.2"));

        let mut txn = Transaction::new(conn, Duration::from_secs(5));
        txn.del_key("Load_Balancer", lb, "ip_port_mappings", "10.0.0.5")
            .unwrap();
        txn.commit().await.unwrap();
        assert!(server
            .row("Load_Balancer", &lb)
            .unwrap()
            .map_entry("ip_port_mappings", "10.0.0.5")
            .is_none());
    }
}
