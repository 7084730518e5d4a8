//! Northbound database client.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    backend::Backend,
    commands::{
        AddBackendToIpPortMapping, Command, DelBackendFromIpPortMapping, FindRowsReferencing,
        IpPortMapping, ListRows, IP_PORT_MAPPINGS, LOAD_BALANCER_TABLE, LOGICAL_ROUTER_TABLE,
    },
    config::{ConnectionSettings, OvnConfig},
    connector::{connect, MirrorHandle},
    engine::MirrorEngine,
    error::{IdlError, IdlResult},
    lifecycle::Stoppable,
    row::RowView,
    transaction::{BumpGlobalCounter, Transaction, TxnOutcome},
};

pub const NB_SCHEMA: &str = "OVN_Northbound";

pub const NB_GLOBAL_TABLE: &str = "NB_Global";

/// Tables mirrored from the northbound database.
pub const NB_TABLES: &[&str] = &[
    "Logical_Switch",
    "Load_Balancer",
    "Load_Balancer_Health_Check",
    "Logical_Router",
    "Logical_Switch_Port",
    "Logical_Router_Port",
    "Gateway_Chassis",
    "NAT",
    "HA_Chassis_Group",
    NB_GLOBAL_TABLE,
];

#[derive(Clone)]
pub struct OvnNbIdl {
    handle: MirrorHandle,
    backend: Backend,
}

impl OvnNbIdl {
    pub fn new(handle: MirrorHandle) -> Self {
        let backend = handle.backend();
        Self { handle, backend }
    }

    /// Connect to the remotes in `config.ovn_nb_connection`.
    pub async fn connect(
        engine: Arc<dyn MirrorEngine>,
        config: &OvnConfig,
        lock_name: Option<&str>,
    ) -> IdlResult<Self> {
        let settings = config.nb_settings(lock_name)?;
        Self::connect_with(engine, &settings).await
    }

    pub async fn connect_with(
        engine: Arc<dyn MirrorEngine>,
        settings: &ConnectionSettings,
    ) -> IdlResult<Self> {
        Ok(Self::new(connect(engine, settings).await?))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn handle(&self) -> &MirrorHandle {
        &self.handle
    }

    pub fn has_lock(&self) -> bool {
        self.handle.has_lock()
    }

    /// The single `NB_Global` row.
    pub fn nb_global(&self) -> IdlResult<RowView> {
        if !self.backend.is_table_present(NB_GLOBAL_TABLE) {
            return Err(IdlError::TableNotFound(NB_GLOBAL_TABLE.to_string()));
        }
        self.backend
            .mirror()
            .first(NB_GLOBAL_TABLE)
            .map(RowView::new)
            .ok_or_else(|| IdlError::RecordNotFound {
                table: NB_GLOBAL_TABLE.to_string(),
                record: "global row".to_string(),
            })
    }

    /// A transaction that, with `bump_nb_cfg`, also increments
    /// `NB_Global.nb_cfg` when committed.
    pub fn create_transaction(&self, bump_nb_cfg: bool) -> Transaction {
        let txn = self.backend.create_transaction();
        if bump_nb_cfg {
            txn.with_hook(Box::new(BumpGlobalCounter::nb_cfg()))
        } else {
            txn
        }
    }

    /// Queue operations with `f` and commit them.
    ///
    /// Errors from `f` abandon the transaction. A revision conflict at commit
    /// comes back as `Ok(TxnOutcome::AbortedConflict)`.
    pub async fn transaction<F>(&self, bump_nb_cfg: bool, f: F) -> IdlResult<TxnOutcome>
    where
        F: FnOnce(&mut Transaction) -> IdlResult<()>,
    {
        let mut txn = self.create_transaction(bump_nb_cfg);
        f(&mut txn)?;
        txn.commit().await
    }

    /// Run a single command in its own transaction.
    pub async fn execute<C: Command>(&self, command: C) -> IdlResult<C::Output> {
        let mut txn = self.create_transaction(false);
        let output = txn.add(&command)?;
        txn.commit().await?;
        Ok(output)
    }

    /// Rows of `table` (`Logical_Router` or `Logical_Switch`) that attach
    /// load balancer `lb`.
    pub fn find_lb_in_table(&self, lb: Uuid, table: &str) -> FindRowsReferencing {
        FindRowsReferencing::load_balancer(table, lb)
    }

    pub fn get_lrs(&self) -> ListRows {
        ListRows::new(LOGICAL_ROUTER_TABLE)
    }

    pub fn lb_del_ip_port_mapping(
        &self,
        lb: Uuid,
        backend_ip: impl Into<String>,
    ) -> DelBackendFromIpPortMapping {
        DelBackendFromIpPortMapping::new(lb, backend_ip)
    }

    pub fn lb_add_ip_port_mapping(
        &self,
        lb: Uuid,
        backend_ip: impl Into<String>,
        port_name: impl Into<String>,
        src_ip: impl Into<String>,
    ) -> AddBackendToIpPortMapping {
        AddBackendToIpPortMapping::new(lb, backend_ip, port_name, src_ip)
    }

    /// Decoded `ip_port_mappings` of load balancer `lb`.
    pub fn ip_port_mappings(&self, lb: &Uuid) -> IdlResult<Vec<IpPortMapping>> {
        self.backend
            .lookup(LOAD_BALANCER_TABLE, lb)?
            .get_map(IP_PORT_MAPPINGS)
            .iter()
            .map(|(key, value)| IpPortMapping::parse(key, value))
            .collect()
    }

    pub async fn stop(&self) -> bool {
        self.handle.stop().await
    }
}

#[async_trait]
impl Stoppable for OvnNbIdl {
    fn name(&self) -> &str {
        NB_SCHEMA
    }

    async fn stop(&self) -> bool {
        OvnNbIdl::stop(self).await
    }
}
