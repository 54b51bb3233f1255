use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::cm::conn::ConnId;
use crate::cm::manager::ConnManager;
use crate::config::RdmConfig;
use crate::error::CmError;
use crate::peer::{LogicalAddr, PeerDirectory};
use crate::transport::{CompletionBindings, TransportDomain};

/// An RDM context: a reliable-datagram endpoint that talks to any number of peers, with
///  connection management behind its progress lock.
///
/// Dropping it closes and frees all connections that were not closed explicitly.
pub struct RdmEndpoint {
    config: Arc<RdmConfig>,
    addr: SocketAddr,
    cm: Mutex<ConnManager>,
}

impl RdmEndpoint {
    pub fn new(
        config: Arc<RdmConfig>,
        addr: SocketAddr,
        bindings: CompletionBindings,
        peers: Arc<dyn PeerDirectory>,
        domain: Arc<dyn TransportDomain>,
    ) -> anyhow::Result<RdmEndpoint> {
        config.validate()?;
        debug!("RDM endpoint at {:?}, pid {}", addr, config.process_id);

        Ok(RdmEndpoint {
            cm: Mutex::new(ConnManager::new(config.clone(), addr, bindings, peers, domain)),
            config,
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &RdmConfig {
        &self.config
    }

    /// Acquires the progress lock
    pub fn lock(&self) -> MutexGuard<'_, ConnManager> {
        // connection management does not leave half-done work behind when an operation fails,
        //  so a panic elsewhere does not invalidate its state
        self.cm.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` under the progress lock. This is how the data path and the transport (which
    ///  raises events) get at connection management.
    pub fn with_cm<R>(&self, f: impl FnOnce(&mut ConnManager) -> R) -> R {
        f(&mut self.lock())
    }

    /// One progress iteration: handles all queued connection events
    pub fn progress(&self) -> Result<usize, CmError> {
        self.lock().handle_events()
    }

    /// Returns the established connection for a logical address, or [CmError::TryAgain] while
    ///  it is being established
    pub fn get_conn(&self, addr: LogicalAddr) -> Result<ConnId, CmError> {
        self.lock().get_conn(addr)
    }

    /// Closes and frees all connections. Auto-progress should be shut down before.
    pub fn close(&self) {
        info!("closing RDM endpoint at {:?}", self.addr);
        self.lock().free_all_conns();
    }

    /// Spawns a task that drives progress periodically, unless auto-progress is disabled in the
    ///  configuration. This must be called from inside a tokio runtime.
    ///
    /// The task holds only a weak reference, so it ends by itself when the RDM endpoint is
    ///  dropped.
    pub fn start_auto_progress(self: &Arc<Self>) -> Option<AutoProgress> {
        if self.config.disable_auto_progress {
            debug!("auto-progress is disabled");
            return None;
        }

        let rdm = Arc::downgrade(self);
        let period = self.config.auto_progress_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(rdm) = rdm.upgrade() else {
                    debug!("RDM endpoint is gone, stopping auto-progress");
                    break;
                };
                match rdm.progress() {
                    Ok(_) => {}
                    Err(e) if e.is_invariant_violation() => error!("auto-progress: {}", e),
                    Err(e) => warn!("auto-progress: {}", e),
                }
            }
        });
        Some(AutoProgress { handle })
    }
}

impl Drop for RdmEndpoint {
    fn drop(&mut self) {
        let cm = self.cm.get_mut()
            .unwrap_or_else(|e| e.into_inner());
        if cm.num_conns() == 0 {
            return;
        }
        debug!("dropping RDM endpoint at {:?} with {} open connection(s)", self.addr, cm.num_conns());
        cm.free_all_conns();
    }
}

/// Handle to a running auto-progress task. Dropping it stops the task.
pub struct AutoProgress {
    handle: JoinHandle<()>,
}

impl AutoProgress {
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for AutoProgress {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
