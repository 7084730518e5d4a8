//! Mirror engine interface.
//!
//! The engine owns the wire session: it fetches schemas, keeps the mirror
//! current from server notifications, submits transactions and mediates
//! named locks. This crate only configures it and reads/writes through it.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    config::{Endpoint, SslConfig},
    error::IdlResult,
    mirror::Mirror,
    row::Revision,
    schema::{DatabaseSchema, SchemaHelper},
    value::{Atom, Value},
};

/// In-place change to one column of an existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Integer columns; a missing value counts as 0.
    Increment(i64),
    MapSet { key: String, value: String },
    /// Removing an absent key is not an error.
    MapDelete { key: String },
    SetAdd(Atom),
    SetRemove(Atom),
}

/// One step of a transaction. Steps are applied in order, all or nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert {
        table: String,
        uuid: Uuid,
        columns: BTreeMap<String, Value>,
    },
    Update {
        table: String,
        uuid: Uuid,
        columns: BTreeMap<String, Value>,
    },
    Delete {
        table: String,
        uuid: Uuid,
    },
    Mutate {
        table: String,
        uuid: Uuid,
        column: String,
        mutation: Mutation,
    },
    /// Abort the transaction with a revision conflict unless the row still
    /// carries `revision`.
    Verify {
        table: String,
        uuid: Uuid,
        revision: Revision,
    },
}

impl Operation {
    pub fn table(&self) -> &str {
        match self {
            Operation::Insert { table, .. }
            | Operation::Update { table, .. }
            | Operation::Delete { table, .. }
            | Operation::Mutate { table, .. }
            | Operation::Verify { table, .. } => table,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Operation::Insert { uuid, .. }
            | Operation::Update { uuid, .. }
            | Operation::Delete { uuid, .. }
            | Operation::Mutate { uuid, .. }
            | Operation::Verify { uuid, .. } => *uuid,
        }
    }
}

/// Session parameters handed to the engine when a connection starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub timeout: Duration,
    pub probe_interval: Duration,
    pub ssl: Option<SslConfig>,
}

#[async_trait]
pub trait MirrorEngine: Send + Sync + 'static {
    /// Fetch the schema named `schema_name` from `endpoint`.
    ///
    /// Fails with `ConnectionUnavailable` when the server cannot be reached.
    async fn get_schema_helper(
        &self,
        endpoint: &Endpoint,
        schema_name: &str,
    ) -> IdlResult<SchemaHelper>;

    /// Open a session mirroring the tables registered in `helper`.
    async fn start_connection(
        &self,
        endpoint: &Endpoint,
        helper: SchemaHelper,
        options: SessionOptions,
    ) -> IdlResult<Arc<dyn LiveConnection>>;
}

#[async_trait]
pub trait LiveConnection: Send + Sync + 'static {
    /// Registered tables that the server schema confirmed.
    fn schema(&self) -> &DatabaseSchema;

    fn mirror(&self) -> &Mirror;

    fn endpoint(&self) -> &Endpoint;

    /// Submit `ops` atomically. A failed `Verify` yields `RevisionConflict`.
    async fn transact(&self, ops: Vec<Operation>) -> IdlResult<()>;

    /// Ask the server for the named lock. Acquisition is asynchronous;
    /// poll `has_lock`.
    fn set_lock(&self, name: &str);

    fn lock_name(&self) -> Option<String>;

    fn has_lock(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Close the session and stop notification processing. Returns false if
    /// the background work did not finish within `timeout`. Calling it again
    /// is a no-op returning true.
    async fn stop(&self, timeout: Duration) -> bool;
}
