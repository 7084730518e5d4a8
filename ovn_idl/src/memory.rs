//! In-process OVSDB server and mirror engine.
//!
//! `MemoryServer` holds one database with per-row revisions and commits
//! transactions atomically; `MemoryEngine` hands out connections whose
//! mirrors follow the server through a broadcast of committed updates.
//! Notification delivery can be delayed, and schema fetches and commits can
//! be made to fail, so that callers can exercise retry and conflict paths
//! without a real server.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Endpoint,
    engine::{LiveConnection, MirrorEngine, Mutation, Operation, SessionOptions},
    error::{IdlError, IdlResult},
    mirror::{Mirror, RowChange, TableUpdate, Update},
    row::Row,
    schema::{AtomicType, ColumnKind, DatabaseSchema, SchemaHelper, TableSchema},
    value::{Atom, Value},
};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

type Tables = HashMap<String, HashMap<Uuid, Row>>;

/// Committed update tagged with the server generation it produced.
#[derive(Debug)]
struct Notification {
    generation: u64,
    update: Update,
}

#[derive(Debug, Default)]
struct Database {
    tables: Tables,
    generation: u64,
}

#[derive(Debug, Default)]
struct LockTable {
    holders: HashMap<String, u64>,
    waiters: HashMap<String, VecDeque<u64>>,
}

impl LockTable {
    fn request(&mut self, name: &str, conn: u64) {
        match self.holders.get(name) {
            None => {
                self.holders.insert(name.to_string(), conn);
            }
            Some(holder) if *holder == conn => {}
            Some(_) => {
                let queue = self.waiters.entry(name.to_string()).or_default();
                if !queue.contains(&conn) {
                    queue.push_back(conn);
                }
            }
        }
    }

    fn release(&mut self, name: &str, conn: u64) {
        if let Some(queue) = self.waiters.get_mut(name) {
            queue.retain(|c| *c != conn);
        }
        if self.holders.get(name) != Some(&conn) {
            return;
        }
        self.holders.remove(name);
        if let Some(next) = self.waiters.get_mut(name).and_then(VecDeque::pop_front) {
            self.holders.insert(name.to_string(), next);
        }
    }

    fn holds(&self, name: &str, conn: u64) -> bool {
        self.holders.get(name) == Some(&conn)
    }
}

#[derive(Debug)]
struct ServerInner {
    schema: DatabaseSchema,
    db: Mutex<Database>,
    updates: broadcast::Sender<Arc<Notification>>,
    locks: Mutex<LockTable>,
    schema_outages: AtomicU32,
    fail_next_commit: Mutex<Option<String>>,
    propagation_delay: Mutex<Duration>,
    next_conn_id: AtomicU64,
}

/// A single in-process database.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    pub fn new(schema: DatabaseSchema) -> Self {
        let tables = schema
            .table_names()
            .map(|name| (name.to_string(), HashMap::new()))
            .collect();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                schema,
                db: Mutex::new(Database {
                    tables,
                    generation: 0,
                }),
                updates,
                locks: Mutex::new(LockTable::default()),
                schema_outages: AtomicU32::new(0),
                fail_next_commit: Mutex::new(None),
                propagation_delay: Mutex::new(Duration::ZERO),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.inner.schema
    }

    /// Delay every notification by `delay` before a connection applies it.
    pub fn set_propagation_delay(&self, delay: Duration) {
        *self.inner.propagation_delay.lock() = delay;
    }

    /// The next `count` schema fetches fail as if the server were down.
    pub fn fail_schema_fetches(&self, count: u32) {
        self.inner.schema_outages.store(count, Ordering::SeqCst);
    }

    /// The next commit is rejected with a non-conflict error.
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        *self.inner.fail_next_commit.lock() = Some(reason.into());
    }

    pub fn generation(&self) -> u64 {
        self.inner.db.lock().generation
    }

    /// Insert a row directly, as another client would.
    pub fn insert_row<I, K>(&self, table: &str, columns: I) -> IdlResult<Uuid>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let uuid = Uuid::new_v4();
        self.commit(&[Operation::Insert {
            table: table.to_string(),
            uuid,
            columns: columns.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }])?;
        Ok(uuid)
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .db
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, uuid: &Uuid) -> Option<Row> {
        self.inner.db.lock().tables.get(table)?.get(uuid).cloned()
    }

    /// Apply `ops` all or nothing and publish the resulting update.
    ///
    /// Returns the generation the database is at afterwards.
    pub fn commit(&self, ops: &[Operation]) -> IdlResult<u64> {
        if let Some(reason) = self.inner.fail_next_commit.lock().take() {
            return Err(IdlError::Transaction(reason));
        }

        let mut db = self.inner.db.lock();
        let mut staged = db.tables.clone();
        let mut touched: Vec<(String, Uuid)> = Vec::new();
        for op in ops {
            self.apply_op(&mut staged, op)?;
            if !matches!(op, Operation::Verify { .. }) {
                let key = (op.table().to_string(), op.uuid());
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
        }
        if touched.is_empty() {
            return Ok(db.generation);
        }

        let generation = db.generation + 1;
        let mut changes: BTreeMap<String, Vec<RowChange>> = BTreeMap::new();
        for (table, uuid) in touched {
            let existed = db
                .tables
                .get(&table)
                .is_some_and(|rows| rows.contains_key(&uuid));
            let change = match staged.get_mut(&table).and_then(|rows| rows.get_mut(&uuid)) {
                Some(row) => {
                    row.revision = generation;
                    RowChange::Upsert(row.clone())
                }
                None if existed => RowChange::Delete(uuid),
                None => continue,
            };
            changes.entry(table).or_default().push(change);
        }

        db.tables = staged;
        db.generation = generation;

        let update = Update {
            tables: changes
                .into_iter()
                .map(|(table, changes)| TableUpdate { table, changes })
                .collect(),
        };
        // No subscribers is fine; the update is already durable.
        let _ = self.inner.updates.send(Arc::new(Notification { generation, update }));
        Ok(generation)
    }

    fn apply_op(&self, tables: &mut Tables, op: &Operation) -> IdlResult<()> {
        let table = op.table();
        let schema = self
            .inner
            .schema
            .table(table)
            .ok_or_else(|| IdlError::TableNotFound(table.to_string()))?;
        let check_column = |column: &str| {
            if schema.has_column(column) {
                Ok(())
            } else {
                Err(IdlError::ColumnNotFound {
                    table: table.to_string(),
                    column: column.to_string(),
                })
            }
        };
        let missing = |uuid: &Uuid| IdlError::RecordNotFound {
            table: table.to_string(),
            record: uuid.to_string(),
        };
        let rows = tables.entry(table.to_string()).or_default();

        match op {
            Operation::Insert { uuid, columns, .. } => {
                for column in columns.keys() {
                    check_column(column)?;
                }
                if rows.contains_key(uuid) {
                    return Err(IdlError::Transaction(format!(
                        "duplicate uuid {uuid} in {table}"
                    )));
                }
                let mut values = default_columns(schema);
                values.extend(columns.clone());
                rows.insert(*uuid, Row::new(*uuid, 0, values));
            }
            Operation::Update { uuid, columns, .. } => {
                for column in columns.keys() {
                    check_column(column)?;
                }
                let row = rows.get_mut(uuid).ok_or_else(|| missing(uuid))?;
                row.columns.extend(columns.clone());
            }
            Operation::Delete { uuid, .. } => {
                rows.remove(uuid).ok_or_else(|| missing(uuid))?;
            }
            Operation::Mutate {
                uuid,
                column,
                mutation,
                ..
            } => {
                check_column(column)?;
                let row = rows.get_mut(uuid).ok_or_else(|| missing(uuid))?;
                let mutated = mutate(row.columns.get(column), mutation).ok_or_else(|| {
                    IdlError::Transaction(format!(
                        "cannot apply {mutation:?} to column {column} of {table}"
                    ))
                })?;
                row.columns.insert(column.clone(), mutated);
            }
            Operation::Verify { uuid, revision, .. } => match rows.get(uuid) {
                Some(row) if row.revision == *revision => {}
                Some(row) => {
                    return Err(IdlError::RevisionConflict(format!(
                        "{table} row {uuid} is at revision {}, expected {revision}",
                        row.revision
                    )))
                }
                None => {
                    return Err(IdlError::RevisionConflict(format!(
                        "{table} row {uuid} no longer exists"
                    )))
                }
            },
        }
        Ok(())
    }

    /// Current contents of `tables` and a receiver positioned right after
    /// them, taken atomically with respect to commits.
    fn subscribe(
        &self,
        tables: &[String],
    ) -> (
        HashMap<String, Vec<Row>>,
        u64,
        broadcast::Receiver<Arc<Notification>>,
    ) {
        let db = self.inner.db.lock();
        let snapshot = tables
            .iter()
            .map(|name| {
                let rows = db
                    .tables
                    .get(name)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default();
                (name.clone(), rows)
            })
            .collect();
        (snapshot, db.generation, self.inner.updates.subscribe())
    }

    fn take_schema_outage(&self) -> bool {
        self.inner
            .schema_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn propagation_delay(&self) -> Duration {
        *self.inner.propagation_delay.lock()
    }

    fn next_conn_id(&self) -> u64 {
        self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn default_columns(schema: &TableSchema) -> BTreeMap<String, Value> {
    schema
        .columns
        .values()
        .map(|column| {
            let value = match (column.kind, column.key_type) {
                (ColumnKind::Map, _) => Value::empty_map(),
                (ColumnKind::Set, _) | (_, AtomicType::Real) => Value::empty_set(),
                (ColumnKind::Scalar, AtomicType::Integer) => Value::from(0i64),
                (ColumnKind::Scalar, AtomicType::Boolean) => Value::from(false),
                (ColumnKind::Scalar, AtomicType::String) => Value::from(""),
                (ColumnKind::Scalar, AtomicType::Uuid) => Value::from(Uuid::nil()),
            };
            (column.name.clone(), value)
        })
        .collect()
}

fn mutate(current: Option<&Value>, mutation: &Mutation) -> Option<Value> {
    match mutation {
        Mutation::Increment(delta) => {
            let base = match current {
                None => 0,
                Some(value) => value.as_integer()?,
            };
            Some(Value::from(base.checked_add(*delta)?))
        }
        Mutation::MapSet { key, value } => {
            let mut map = current.map_or(Some(BTreeMap::new()), |v| v.as_map().cloned())?;
            map.insert(key.clone(), value.clone());
            Some(Value::Map(map))
        }
        Mutation::MapDelete { key } => {
            let mut map = current.map_or(Some(BTreeMap::new()), |v| v.as_map().cloned())?;
            map.remove(key);
            Some(Value::Map(map))
        }
        Mutation::SetAdd(atom) => {
            let mut set = current.map_or(Some(Default::default()), set_of)?;
            set.insert(atom.clone());
            Some(Value::Set(set))
        }
        Mutation::SetRemove(atom) => {
            let mut set = current.map_or(Some(Default::default()), set_of)?;
            set.remove(atom);
            Some(Value::Set(set))
        }
    }
}

fn set_of(value: &Value) -> Option<BTreeSet<Atom>> {
    match value {
        Value::Set(set) => Some(set.clone()),
        Value::Atom(atom) => Some([atom.clone()].into_iter().collect()),
        Value::Map(_) => None,
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Engine resolving endpoints to registered in-process servers.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    servers: DashMap<String, MemoryServer>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server` reachable at `endpoint`.
    pub fn add_server(&self, endpoint: &Endpoint, server: MemoryServer) {
        self.servers.insert(endpoint.to_string(), server);
    }

    pub fn remove_server(&self, endpoint: &Endpoint) -> Option<MemoryServer> {
        self.servers.remove(&endpoint.to_string()).map(|(_, s)| s)
    }

    fn server(&self, endpoint: &Endpoint, schema_name: &str) -> IdlResult<MemoryServer> {
        self.servers
            .get(&endpoint.to_string())
            .map(|s| s.value().clone())
            .ok_or_else(|| IdlError::ConnectionUnavailable {
                schema: schema_name.to_string(),
                error: format!("{endpoint}: connection refused"),
            })
    }
}

#[async_trait]
impl MirrorEngine for MemoryEngine {
    async fn get_schema_helper(
        &self,
        endpoint: &Endpoint,
        schema_name: &str,
    ) -> IdlResult<SchemaHelper> {
        let server = self.server(endpoint, schema_name)?;
        if server.take_schema_outage() {
            return Err(IdlError::ConnectionUnavailable {
                schema: schema_name.to_string(),
                error: format!("{endpoint}: connection reset by peer"),
            });
        }
        if server.schema().name != schema_name {
            return Err(IdlError::SchemaNotFound(schema_name.to_string()));
        }
        Ok(SchemaHelper::new(server.schema().clone()))
    }

    async fn start_connection(
        &self,
        endpoint: &Endpoint,
        helper: SchemaHelper,
        options: SessionOptions,
    ) -> IdlResult<Arc<dyn LiveConnection>> {
        let server = self.server(endpoint, helper.schema_name())?;
        let schema = helper.build();
        let tables: Vec<String> = schema.table_names().map(str::to_string).collect();

        let mirror = Mirror::new(tables.iter().cloned());
        let (snapshot, generation, updates) = server.subscribe(&tables);
        mirror.reset(snapshot);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (applied_tx, applied_rx) = watch::channel(generation);
        let task = tokio::spawn(follow_updates(
            server.clone(),
            mirror.clone(),
            tables,
            updates,
            applied_tx,
            shutdown_rx,
        ));

        let conn = MemoryConnection {
            id: server.next_conn_id(),
            endpoint: endpoint.clone(),
            schema,
            mirror,
            server,
            options,
            lock_name: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            applied: applied_rx,
            task: Mutex::new(Some(task)),
        };
        info!(
            "Connected to {} ({} tables of {}, probe interval {:?})",
            conn.endpoint,
            conn.schema.tables.len(),
            conn.schema.name,
            conn.options.probe_interval
        );
        Ok(Arc::new(conn))
    }
}

async fn follow_updates(
    server: MemoryServer,
    mirror: Mirror,
    tables: Vec<String>,
    mut updates: broadcast::Receiver<Arc<Notification>>,
    applied: watch::Sender<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = updates.recv() => match received {
                Ok(notification) => {
                    let delay = server.propagation_delay();
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    mirror.apply(&notification.update);
                    applied.send_replace(notification.generation);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Mirror fell {} updates behind, resyncing", skipped);
                    let (snapshot, generation, fresh) = server.subscribe(&tables);
                    updates = fresh;
                    mirror.reset(snapshot);
                    applied.send_replace(generation);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!("Notification processing stopped");
}

/// Connection handed out by `MemoryEngine`.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    endpoint: Endpoint,
    schema: DatabaseSchema,
    mirror: Mirror,
    server: MemoryServer,
    options: SessionOptions,
    lock_name: Mutex<Option<String>>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    applied: watch::Receiver<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl LiveConnection for MemoryConnection {
    fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Resolves once this connection's mirror reflects the commit.
    async fn transact(&self, ops: Vec<Operation>) -> IdlResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(IdlError::ConnectionClosed);
        }
        let generation = self.server.commit(&ops)?;

        let mut applied = self.applied.clone();
        let timeout = self.options.timeout;
        let caught_up = tokio::time::timeout(timeout, async {
            applied.wait_for(|g| *g >= generation).await.map(|_| ())
        })
        .await;
        match caught_up {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(IdlError::ConnectionClosed),
            Err(_) => Err(IdlError::Timeout(timeout)),
        }
    }

    fn set_lock(&self, name: &str) {
        let mut current = self.lock_name.lock();
        let mut locks = self.server.inner.locks.lock();
        if let Some(previous) = current.as_deref() {
            if previous != name {
                locks.release(previous, self.id);
            }
        }
        locks.request(name, self.id);
        *current = Some(name.to_string());
    }

    fn lock_name(&self) -> Option<String> {
        self.lock_name.lock().clone()
    }

    fn has_lock(&self) -> bool {
        match self.lock_name.lock().as_deref() {
            Some(name) => self.server.inner.locks.lock().holds(name, self.id),
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    async fn stop(&self, timeout: Duration) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return true;
        }
        if let Some(name) = self.lock_name.lock().as_deref() {
            self.server.inner.locks.lock().release(name, self.id);
        }
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().take();
        match task {
            Some(task) => tokio::time::timeout(timeout, task).await.is_ok(),
            None => true,
        }
    }
}
