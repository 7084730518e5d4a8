//! Schema connector: bootstrap a mirrored connection.
//!
//! Bootstrap fetches the schema, retrying for as long as the server is
//! unreachable, and registers the requested tables. `start` then opens the
//! session and requests the optional named lock. Stopping is idempotent and
//! safe before `start`.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backend::Backend,
    config::{ConnectionSettings, Endpoint},
    engine::{LiveConnection, MirrorEngine},
    error::{IdlError, IdlResult},
    lifecycle::Stoppable,
    retry::RetryPolicy,
    schema::SchemaHelper,
};

/// Bootstrap and start in one go.
pub async fn connect(
    engine: Arc<dyn MirrorEngine>,
    settings: &ConnectionSettings,
) -> IdlResult<MirrorHandle> {
    IdlConnector::bootstrap(engine, settings.clone())
        .await?
        .start()
        .await
}

pub struct IdlConnector {
    engine: Arc<dyn MirrorEngine>,
    settings: ConnectionSettings,
    endpoint: Endpoint,
    helper: SchemaHelper,
    handle: Mutex<Option<MirrorHandle>>,
}

impl IdlConnector {
    /// Fetch the schema and register `settings.tables`.
    ///
    /// Unreachable servers are retried with `settings.bootstrap_retry`,
    /// which by default never gives up. Remotes are tried in order on every
    /// attempt. Other failures (unknown schema, missing TLS files) are
    /// returned at once.
    pub async fn bootstrap(
        engine: Arc<dyn MirrorEngine>,
        settings: ConnectionSettings,
    ) -> IdlResult<Self> {
        settings.check_ssl()?;

        let attempts = AtomicU32::new(0);
        let (endpoint, mut helper) = {
            let engine = engine.as_ref();
            let settings = &settings;
            let attempts = &attempts;
            settings
                .bootstrap_retry
                .retry_notify(
                    IdlError::is_connectivity,
                    move || async move {
                        attempts.fetch_add(1, Ordering::Relaxed);
                        fetch_schema(engine, settings).await
                    },
                    |e: &IdlError, delay: Duration| {
                        warn!(
                            "Schema retrieval attempt {} for {} failed: {}. Retrying in {:?}",
                            attempts.load(Ordering::Relaxed),
                            settings.schema_name,
                            e,
                            delay
                        );
                    },
                )
                .await?
        };

        for table in &settings.tables {
            helper.register_table(table);
        }
        info!(
            "Fetched schema {} from {} after {} attempt(s), {} tables registered",
            settings.schema_name,
            endpoint,
            attempts.load(Ordering::Relaxed),
            helper.registered_tables().len()
        );

        Ok(Self {
            engine,
            settings,
            endpoint,
            helper,
            handle: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn schema_helper(&self) -> &SchemaHelper {
        &self.helper
    }

    /// Open the session. Starting twice returns the existing handle; once
    /// that handle has been stopped, a fresh session is opened.
    pub async fn start(&self) -> IdlResult<MirrorHandle> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref().filter(|h| !h.is_stopped()) {
            return Ok(handle.clone());
        }

        let conn = self
            .engine
            .start_connection(
                &self.endpoint,
                self.helper.clone(),
                self.settings.session_options(),
            )
            .await?;
        if let Some(lock) = &self.settings.lock_name {
            debug!("Requesting lock {} on {}", lock, self.endpoint);
            conn.set_lock(lock);
        }

        let handle = MirrorHandle::new(conn, &self.settings);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the session if one was started. Returns false if background
    /// processing did not finish within the configured timeout.
    pub async fn stop(&self) -> bool {
        let handle = self.handle.lock().await.take();
        match handle {
            Some(handle) => handle.stop().await,
            None => {
                debug!("{} connection was never started", self.settings.schema_name);
                true
            }
        }
    }
}

async fn fetch_schema(
    engine: &dyn MirrorEngine,
    settings: &ConnectionSettings,
) -> IdlResult<(Endpoint, SchemaHelper)> {
    let mut last_err = None;
    for endpoint in &settings.remotes {
        match engine
            .get_schema_helper(endpoint, &settings.schema_name)
            .await
        {
            Ok(helper) => return Ok((endpoint.clone(), helper)),
            Err(e) if e.is_connectivity() => {
                debug!("Remote {} unavailable: {}", endpoint, e);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        IdlError::Config(format!("no remotes configured for {}", settings.schema_name))
    }))
}

struct HandleInner {
    conn: Arc<dyn LiveConnection>,
    schema_name: String,
    timeout: Duration,
    row_retry: RetryPolicy,
    stopped: AtomicBool,
}

/// A started, mirrored connection. Clones share the session.
#[derive(Clone)]
pub struct MirrorHandle {
    inner: Arc<HandleInner>,
}

impl MirrorHandle {
    pub fn new(conn: Arc<dyn LiveConnection>, settings: &ConnectionSettings) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                conn,
                schema_name: settings.schema_name.clone(),
                timeout: settings.timeout,
                row_retry: settings.row_retry.clone(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn connection(&self) -> &Arc<dyn LiveConnection> {
        &self.inner.conn
    }

    pub fn schema_name(&self) -> &str {
        &self.inner.schema_name
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn backend(&self) -> Backend {
        Backend::new(
            self.inner.conn.clone(),
            self.inner.row_retry.clone(),
            self.inner.timeout,
        )
    }

    /// Whether this connection currently holds its named lock.
    pub fn has_lock(&self) -> bool {
        self.inner.conn.has_lock()
    }

    pub fn lock_name(&self) -> Option<String> {
        self.inner.conn.lock_name()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Close the session. Only the first call does any work.
    pub async fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return true;
        }
        let clean = self.inner.conn.stop(self.inner.timeout).await;
        if clean {
            info!(
                "Closed {} connection to {}",
                self.inner.schema_name,
                self.inner.conn.endpoint()
            );
        } else {
            debug!(
                "Connection terminated to {} but a thread is still alive",
                self.inner.schema_name
            );
        }
        clean
    }
}

#[async_trait]
impl Stoppable for MirrorHandle {
    fn name(&self) -> &str {
        self.schema_name()
    }

    async fn stop(&self) -> bool {
        MirrorHandle::stop(self).await
    }
}

#[async_trait]
impl Stoppable for IdlConnector {
    fn name(&self) -> &str {
        &self.settings.schema_name
    }

    async fn stop(&self) -> bool {
        IdlConnector::stop(self).await
    }
}
