//! Southbound database client.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    backend::Backend,
    commands::{Command, ListRows},
    config::{ConnectionSettings, OvnConfig},
    connector::{connect, MirrorHandle},
    engine::MirrorEngine,
    error::IdlResult,
    lifecycle::Stoppable,
    row::RowView,
    transaction::{Transaction, TxnOutcome},
};

pub const SB_SCHEMA: &str = "OVN_Southbound";

pub const SERVICE_MONITOR_TABLE: &str = "Service_Monitor";

/// Tables mirrored from the southbound database.
pub const SB_TABLES: &[&str] = &["Load_Balancer", SERVICE_MONITOR_TABLE];

#[derive(Clone)]
pub struct OvnSbIdl {
    handle: MirrorHandle,
    backend: Backend,
}

impl OvnSbIdl {
    pub fn new(handle: MirrorHandle) -> Self {
        let backend = handle.backend();
        Self { handle, backend }
    }

    pub async fn connect(
        engine: Arc<dyn MirrorEngine>,
        config: &OvnConfig,
        lock_name: Option<&str>,
    ) -> IdlResult<Self> {
        let settings = config.sb_settings(lock_name)?;
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

    pub fn create_transaction(&self) -> Transaction {
        self.backend.create_transaction()
    }

    pub async fn transaction<F>(&self, f: F) -> IdlResult<TxnOutcome>
    where
        F: FnOnce(&mut Transaction) -> IdlResult<()>,
    {
        let mut txn = self.create_transaction();
        f(&mut txn)?;
        txn.commit().await
    }

    pub async fn execute<C: Command>(&self, command: C) -> IdlResult<C::Output> {
        let mut txn = self.create_transaction();
        let output = txn.add(&command)?;
        txn.commit().await?;
        Ok(output)
    }

    /// Health-check monitors ovn-northd created for load balancer members.
    pub async fn get_service_monitors(&self) -> IdlResult<Vec<RowView>> {
        self.execute(ListRows::new(SERVICE_MONITOR_TABLE)).await
    }

    pub async fn stop(&self) -> bool {
        self.handle.stop().await
    }
}

#[async_trait]
impl Stoppable for OvnSbIdl {
    fn name(&self) -> &str {
        SB_SCHEMA
    }

    async fn stop(&self) -> bool {
        OvnSbIdl::stop(self).await
    }
}
