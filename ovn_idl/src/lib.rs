//! OVSDB IDL client core for the OVN load balancer provider.
//!
//! Provides:
//! - Schema bootstrap with retry, table registration and named locks
//! - A mirror of the registered tables, kept current by a mirror engine
//! - Transactions with a pre-commit hook and revision-conflict recovery
//! - Bounded waits for rows that have not reached the mirror yet
//! - Load balancer read commands and `ip_port_mappings` maintenance
//!
//! Engines:
//! - Memory (in-process server, used by tests and embedders)

pub mod addr;
pub mod backend;
pub mod commands;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod mirror;
pub mod nb;
pub mod retry;
pub mod row;
pub mod sb;
pub mod schema;
pub mod transaction;
pub mod value;

pub use backend::Backend;
pub use commands::{
    AddBackendToIpPortMapping, Command, DelBackendFromIpPortMapping, FindRowsReferencing,
    IpPortMapping, ListRows,
};
pub use config::{ConnectionSettings, Endpoint, OvnConfig, SslConfig};
pub use connector::{connect, IdlConnector, MirrorHandle};
pub use engine::{LiveConnection, MirrorEngine, Mutation, Operation, SessionOptions};
pub use error::{IdlError, IdlResult};
pub use lifecycle::{IdlLifecycle, Stoppable};
pub use memory::{MemoryEngine, MemoryServer};
pub use mirror::{Mirror, RowChange, TableUpdate, Update};
pub use nb::{OvnNbIdl, NB_SCHEMA, NB_TABLES};
pub use retry::RetryPolicy;
pub use row::{Revision, Row, RowView};
pub use sb::{OvnSbIdl, SB_SCHEMA, SB_TABLES};
pub use schema::{DatabaseSchema, SchemaHelper};
pub use transaction::{BumpGlobalCounter, PreCommitHook, Transaction, TxnOutcome};
pub use value::{Atom, Value};
