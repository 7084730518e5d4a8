//! Commands run inside a transaction.
//!
//! Read commands only look at the mirror and return row views. The
//! `ip_port_mappings` commands queue map mutations on a `Load_Balancer` row
//! and never fail the surrounding transaction: whatever goes wrong is
//! logged and the command is skipped.

use tracing::error;
use uuid::Uuid;

use crate::{
    addr::{bracket_if_ipv6, strip_brackets},
    error::{IdlError, IdlResult},
    row::RowView,
    transaction::Transaction,
};

pub const LOAD_BALANCER_TABLE: &str = "Load_Balancer";
pub const LOGICAL_ROUTER_TABLE: &str = "Logical_Router";
pub const IP_PORT_MAPPINGS: &str = "ip_port_mappings";

/// A unit of work executed against a transaction.
pub trait Command {
    type Output;

    fn run_idl(&self, txn: &mut Transaction) -> IdlResult<Self::Output>;
}

/// Rows of `table` whose reference column contains `owner`.
#[derive(Debug, Clone)]
pub struct FindRowsReferencing {
    table: String,
    column: String,
    owner: Uuid,
}

impl FindRowsReferencing {
    pub fn new(table: impl Into<String>, column: impl Into<String>, owner: Uuid) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            owner,
        }
    }

    /// Rows of `table` that attach load balancer `lb`.
    pub fn load_balancer(table: impl Into<String>, lb: Uuid) -> Self {
        Self::new(table, "load_balancer", lb)
    }
}

impl Command for FindRowsReferencing {
    type Output = Vec<RowView>;

    fn run_idl(&self, txn: &mut Transaction) -> IdlResult<Vec<RowView>> {
        txn.check_table(&self.table)?;
        Ok(txn
            .mirror()
            .find(&self.table, |row| row.references(&self.column, &self.owner))
            .into_iter()
            .map(RowView::new)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ListRows {
    table: String,
}

impl ListRows {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Command for ListRows {
    type Output = Vec<RowView>;

    fn run_idl(&self, txn: &mut Transaction) -> IdlResult<Vec<RowView>> {
        txn.check_table(&self.table)?;
        Ok(txn
            .mirror()
            .rows(&self.table)
            .unwrap_or_default()
            .into_iter()
            .map(RowView::new)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct DelBackendFromIpPortMapping {
    lb: Uuid,
    backend_ip: String,
}

impl DelBackendFromIpPortMapping {
    pub fn new(lb: Uuid, backend_ip: impl Into<String>) -> Self {
        Self {
            lb,
            backend_ip: backend_ip.into(),
        }
    }

    fn try_run(&self, txn: &mut Transaction) -> IdlResult<()> {
        let key = bracket_if_ipv6(&self.backend_ip)?;
        let lb = txn.lookup(LOAD_BALANCER_TABLE, &self.lb)?;
        txn.del_key(LOAD_BALANCER_TABLE, lb.uuid(), IP_PORT_MAPPINGS, key)
    }
}

impl Command for DelBackendFromIpPortMapping {
    type Output = ();

    fn run_idl(&self, txn: &mut Transaction) -> IdlResult<()> {
        if let Err(e) = self.try_run(txn) {
            error!(
                "Error deleting backend {} from ip_port_mappings for LB uuid {}: {}",
                self.backend_ip, self.lb, e
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AddBackendToIpPortMapping {
    lb: Uuid,
    backend_ip: String,
    port_name: String,
    src_ip: String,
}

impl AddBackendToIpPortMapping {
    pub fn new(
        lb: Uuid,
        backend_ip: impl Into<String>,
        port_name: impl Into<String>,
        src_ip: impl Into<String>,
    ) -> Self {
        Self {
            lb,
            backend_ip: backend_ip.into(),
            port_name: port_name.into(),
            src_ip: src_ip.into(),
        }
    }

    fn try_run(&self, txn: &mut Transaction) -> IdlResult<()> {
        let key = bracket_if_ipv6(&self.backend_ip)?;
        let value = format!("{}:{}", self.port_name, bracket_if_ipv6(&self.src_ip)?);
        let lb = txn.lookup(LOAD_BALANCER_TABLE, &self.lb)?;
        txn.set_key(LOAD_BALANCER_TABLE, lb.uuid(), IP_PORT_MAPPINGS, key, value)
    }
}

impl Command for AddBackendToIpPortMapping {
    type Output = ();

    fn run_idl(&self, txn: &mut Transaction) -> IdlResult<()> {
        if let Err(e) = self.try_run(txn) {
            error!(
                "Error adding backend {} to ip_port_mappings for LB uuid {}: {}",
                self.backend_ip, self.lb, e
            );
        }
        Ok(())
    }
}

/// One decoded `ip_port_mappings` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPortMapping {
    /// Stored key, bracketed for IPv6.
    pub backend_ip: String,
    pub port_name: String,
    /// Source address, bracketed for IPv6.
    pub src_ip: String,
}

impl IpPortMapping {
    /// Decode `key -> "port_name:src_ip"`.
    pub fn parse(key: &str, value: &str) -> IdlResult<Self> {
        let (port_name, src_ip) = value
            .split_once(':')
            .filter(|(port, src)| !port.is_empty() && !src.is_empty())
            .ok_or_else(|| {
                IdlError::InvalidAddress(format!("malformed ip_port_mappings entry {key}={value}"))
            })?;
        Ok(Self {
            backend_ip: key.to_string(),
            port_name: port_name.to_string(),
            src_ip: src_ip.to_string(),
        })
    }

    pub fn backend_addr(&self) -> &str {
        strip_brackets(&self.backend_ip)
    }

    pub fn src_addr(&self) -> &str {
        strip_brackets(&self.src_ip)
    }
}
