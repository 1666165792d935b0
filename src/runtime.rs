//! # Runtime Composition Root
//!
//! The [`Runtime`] value owns every process-wide table: the MSU type
//! registry, placements, routes, workers, peers and stats. It is built once
//! at boot and threaded (as an `Arc`) into every component; no component
//! reads global state. A single top-level holder keeps the `Arc` alive so
//! signal handling can reach it, nothing else is special about it.
//!
//! The IO plane (peer listener, peer connections, controller session,
//! stats ticker) runs as tokio tasks on the main thread's runtime; workers
//! are native threads. The only bridges between the two worlds are the
//! non-blocking queue pushes and the peers' bounded outgoing channels.

use crate::defaults;
use crate::error::{CoreError, CoreResult};
use crate::message::{Envelope, RuntimeId, ThreadId};
use crate::msu::{MsuTypeRegistry, PlacementTable};
use crate::net::controller::ControllerReply;
use crate::net::peer::PeerTable;
use crate::queue::WorkQueue;
use crate::routing::{Locality, RouteTable};
use crate::stats::StatsCollector;
use crate::worker::{ControlCommand, WorkerTable};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Boot-time configuration injected into the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// This process's runtime id, as published in the DFG. All locality
    /// decisions compare against this value and nothing else.
    pub local_runtime_id: RuntimeId,
    /// Listen address for inbound peer-runtime connections; `None`
    /// disables the listener (single-runtime deployments and tests).
    pub listen_addr: Option<SocketAddr>,
    /// Controller address. Required for `serve`; absence at boot is a
    /// fatal configuration error.
    pub controller_addr: Option<SocketAddr>,
    /// Capacity of each worker's data channel.
    pub queue_capacity: usize,
    /// Document root handed to the bundled cache/fileio MSUs.
    pub www_dir: PathBuf,
}

impl RuntimeConfig {
    pub fn new(local_runtime_id: RuntimeId) -> Self {
        Self {
            local_runtime_id,
            listen_addr: None,
            controller_addr: None,
            queue_capacity: defaults::QUEUE_CAPACITY,
            www_dir: PathBuf::from(defaults::WWW_DIR),
        }
    }
}

/// The per-process execution engine.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub types: MsuTypeRegistry,
    pub placements: PlacementTable,
    pub routes: RouteTable,
    pub workers: WorkerTable,
    pub peers: PeerTable,
    pub stats: StatsCollector,
    replies: RwLock<Option<UnboundedSender<ControllerReply>>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let local_id = config.local_runtime_id;
        Arc::new(Self {
            config,
            types: MsuTypeRegistry::new(),
            placements: PlacementTable::new(),
            routes: RouteTable::new(),
            workers: WorkerTable::new(),
            peers: PeerTable::new(local_id),
            stats: StatsCollector::new(),
            replies: RwLock::new(None),
        })
    }

    /// Register the MSU types bundled with the runtime (cache, fileio).
    pub fn register_builtin_types(&self) -> CoreResult<()> {
        crate::msu::cache::register(self)?;
        crate::msu::fileio::register(self)?;
        Ok(())
    }

    /// Approximate data-queue length of a worker, if it exists.
    pub fn worker_queue_len(&self, thread_id: ThreadId) -> Option<usize> {
        self.workers.get(thread_id).ok().map(|w| w.queue.len())
    }

    /// Enqueue an envelope on the owning worker of its destination MSU.
    pub fn dispatch_local(&self, env: Envelope) -> CoreResult<()> {
        let thread_id = self.placements.thread_of(env.dst_msu_id)?;
        let worker = self.workers.get(thread_id)?;
        worker.push_data(env)
    }

    /// Deliver an envelope to an endpoint: a local worker queue, or a
    /// peer's outgoing queue (which returns immediately).
    pub fn forward(&self, locality: Locality, env: Envelope) -> CoreResult<()> {
        match locality {
            Locality::Local => self.dispatch_local(env),
            Locality::Remote(runtime_id) => self.peers.try_send(runtime_id, env),
        }
    }

    /// Install the controller reply channel once the session is up.
    pub fn set_reply_sender(&self, sender: UnboundedSender<ControllerReply>) {
        *self.replies.write() = Some(sender);
    }

    /// Best-effort reply to the controller. Silently a no-op before the
    /// session exists or after it went away; the controller reconciles
    /// through periodic stats.
    pub fn send_reply(&self, reply: ControllerReply) {
        if let Some(sender) = self.replies.read().as_ref() {
            if sender.send(reply).is_err() {
                debug!("controller reply channel closed; reply dropped");
            }
        }
    }

    /// Serve the IO plane until the controller session ends.
    ///
    /// Spawns the peer listener and the stats ticker, then runs the
    /// controller session on the calling task. A missing controller
    /// address is fatal: the core is the controller's mechanism and
    /// cannot run unattended.
    pub async fn serve(self: &Arc<Self>) -> CoreResult<()> {
        let controller_addr = self.config.controller_addr.ok_or_else(|| {
            CoreError::FatalConfig("no controller address configured".to_string())
        })?;

        if let Some(listen_addr) = self.config.listen_addr {
            let rt = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = crate::net::peer::serve_listener(rt, listen_addr).await {
                    warn!(%err, "peer listener exited");
                }
            });
        }

        let rt = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(defaults::STAT_FLUSH_INTERVAL);
            loop {
                ticker.tick().await;
                rt.stats.flush_all(false);
                rt.send_reply(ControllerReply::Stats(rt.stats.snapshot_update()));
            }
        });

        crate::net::controller::run_session(Arc::clone(self), controller_addr).await
    }

    /// Stop every worker, drop peer connections and flush stats.
    ///
    /// Blocks joining worker threads; call from a blocking context.
    pub fn shutdown(&self) {
        info!("runtime shutting down");
        let ids = self.workers.ids();
        let mut handles = Vec::new();
        for id in ids {
            if let Ok(worker) = self.workers.get(id) {
                worker.push_ctrl(ControlCommand::Stop);
                handles.push(worker);
            }
        }
        for worker in handles {
            worker.join();
        }
        self.peers.disconnect_all();
        self.stats.flush_all(true);
    }

    /// Direct access to a worker's queue, for diagnostics and tests.
    pub fn worker_queue(&self, thread_id: ThreadId) -> CoreResult<Arc<WorkQueue>> {
        Ok(Arc::clone(&self.workers.get(thread_id)?.queue))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("local_runtime_id", &self.config.local_runtime_id)
            .field("workers", &self.workers.ids())
            .field("msus", &self.placements.len())
            .finish()
    }
}
