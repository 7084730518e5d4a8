//! Process-level ownership of connection handles.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Something holding a session that must be closed on shutdown.
#[async_trait]
pub trait Stoppable: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent. Returns false if shutdown was not clean.
    async fn stop(&self) -> bool;
}

/// Owns every long-lived handle and stops them once, newest first.
#[derive(Default)]
pub struct IdlLifecycle {
    handles: Mutex<Vec<Arc<dyn Stoppable>>>,
    shut_down: AtomicBool,
}

impl IdlLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handle`. After `shutdown` the handle is stopped
    /// immediately instead, and the result of that stop is returned.
    pub async fn register(&self, handle: Arc<dyn Stoppable>) -> bool {
        {
            let mut handles = self.handles.lock();
            if !self.shut_down.load(Ordering::Acquire) {
                handles.push(handle);
                return true;
            }
        }
        warn!("{} registered after shutdown, stopping it now", handle.name());
        handle.stop().await
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Stop all registered handles in reverse registration order. Returns
    /// true if every handle stopped cleanly. Later calls do nothing.
    pub async fn shutdown(&self) -> bool {
        let handles = {
            let mut registered = self.handles.lock();
            if self.shut_down.swap(true, Ordering::AcqRel) {
                debug!("Shutdown already performed");
                return true;
            }
            std::mem::take(&mut *registered)
        };
        let mut clean = true;
        for handle in handles.iter().rev() {
            if !handle.stop().await {
                warn!("{} did not stop cleanly", handle.name());
                clean = false;
            }
        }
        info!("Stopped {} OVSDB connection(s)", handles.len());
        clean
    }
}
