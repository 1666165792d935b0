//! # Worker Thread Module
//!
//! A worker is a native OS thread hosting one work queue and a disjoint set
//! of MSU instances. Thread 0 is the main/IO plane; workers have ids > 0.
//!
//! ## Event Loop
//!
//! Each iteration of the cooperative loop:
//!
//! 1. Drains the control channel, bounded per iteration so a burst of
//!    control traffic cannot starve data indefinitely.
//! 2. Pops at most one data envelope and dispatches it to the target MSU's
//!    `receive`.
//! 3. Parks on the queue's condvar (with a timeout) when both channels are
//!    empty.
//! 4. Observes the stop flag after draining control and exits cleanly:
//!    remaining control commands run, owned MSUs are destroyed on this
//!    thread, and the placement table forgets them.
//!
//! A `receive` error is logged with the MSU id and the envelope is dropped;
//! the worker never aborts on it. Panics inside `receive` are not caught;
//! a language-level crash is fatal for the whole process.
//!
//! ## Control Commands
//!
//! Control actions arrive as typed [`ControlCommand`] values on the control
//! channel, which guarantees that MSU state is created and destroyed only
//! by the owning thread. CREATE_MSU optionally carries a completion channel
//! so the DFG interpreter can wait for acks instead of sleeping; every
//! outcome is also reported to the controller as an ACK or NACK.

use crate::defaults;
use crate::error::{CoreError, CoreResult};
use crate::message::{
    ControlMsgType, Envelope, MsuId, MsuTypeId, RouteId, ThreadId, ThreadMode,
};
use crate::msu::{MsuContext, MsuInstance};
use crate::net::controller::ControllerReply;
use crate::queue::WorkQueue;
use crate::runtime::Runtime;
use crate::stats::StatId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Typed control action executed on a worker's own event loop.
#[derive(Debug)]
pub enum ControlCommand {
    CreateMsu {
        msu_id: MsuId,
        type_id: MsuTypeId,
        init_data: Vec<u8>,
        /// Ack channel for the DFG interpreter; `None` for
        /// controller-initiated creates (those are acked over the socket).
        completion: Option<oneshot::Sender<CoreResult<()>>>,
    },
    DeleteMsu {
        msu_id: MsuId,
    },
    AttachRoutes {
        msu_id: MsuId,
        route_ids: Vec<RouteId>,
    },
    Stop,
}

/// Shared handle to a worker thread: its queue, stop flag and join handle.
pub struct WorkerHandle {
    pub id: ThreadId,
    pub pinned: bool,
    pub queue: Arc<WorkQueue>,
    stop: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    fn new(id: ThreadId, pinned: bool, queue_capacity: usize) -> Self {
        Self {
            id,
            pinned,
            queue: Arc::new(WorkQueue::new(queue_capacity)),
            stop: AtomicBool::new(false),
            join: Mutex::new(None),
        }
    }

    /// Enqueue a data envelope for this worker.
    ///
    /// A stopping worker refuses new data; its id is already on the way out
    /// of the thread table.
    pub fn push_data(&self, env: Envelope) -> CoreResult<()> {
        if self.is_stopping() {
            return Err(CoreError::UnknownThread(self.id));
        }
        self.queue.push_data(env)
    }

    pub fn push_ctrl(&self, cmd: ControlCommand) {
        self.queue.push_ctrl(cmd);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn set_stopping(&self) {
        self.stop.store(true, Ordering::Release);
        self.queue.notify();
    }

    /// Block until the worker thread exits. Call only after a Stop command
    /// was enqueued.
    pub fn join(&self) {
        if let Some(handle) = self.join.lock().take() {
            if handle.join().is_err() {
                error!(thread_id = self.id, "worker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pinned", &self.pinned)
            .field("queue_len", &self.queue.len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Process-wide table of worker threads, keyed by id.
///
/// Registration is append-only once a worker is initialized; lookups after
/// publication take only the short read side.
#[derive(Default)]
pub struct WorkerTable {
    map: RwLock<HashMap<ThreadId, Arc<WorkerHandle>>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, handle: Arc<WorkerHandle>) -> CoreResult<()> {
        let mut map = self.map.write();
        if map.contains_key(&handle.id) {
            return Err(CoreError::ThreadExists(handle.id));
        }
        map.insert(handle.id, handle);
        Ok(())
    }

    pub fn get(&self, id: ThreadId) -> CoreResult<Arc<WorkerHandle>> {
        self.map
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::UnknownThread(id))
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.map.read().contains_key(&id)
    }

    pub fn remove(&self, id: ThreadId) -> Option<Arc<WorkerHandle>> {
        self.map.write().remove(&id)
    }

    pub fn ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self.map.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Spawn a worker thread and register it in the runtime's thread table.
///
/// Pinned workers get affinity to a dedicated core, assigned round-robin
/// from the worker id the way the reference deployment lays threads out.
pub fn spawn_worker(
    runtime: &Arc<Runtime>,
    thread_id: ThreadId,
    mode: ThreadMode,
) -> CoreResult<Arc<WorkerHandle>> {
    if thread_id == 0 {
        return Err(CoreError::MalformedControlMsg {
            reason: "thread 0 is reserved for the IO plane".to_string(),
        });
    }
    let pinned = mode == ThreadMode::Pinned;
    let handle = Arc::new(WorkerHandle::new(
        thread_id,
        pinned,
        runtime.config.queue_capacity,
    ));
    // Register before spawning so control messages can target the worker
    // as soon as the spawn request is acked.
    runtime.workers.register(Arc::clone(&handle))?;

    let thread_runtime = Arc::clone(runtime);
    let thread_handle = Arc::clone(&handle);
    let spawned = std::thread::Builder::new()
        .name(format!("worker-{thread_id}"))
        .spawn(move || {
            if pinned {
                pin_current_thread(thread_id);
            }
            worker_main(thread_runtime, thread_handle);
        });
    match spawned {
        Ok(join) => {
            *handle.join.lock() = Some(join);
            info!(thread_id, pinned, "spawned worker");
            Ok(handle)
        }
        Err(err) => {
            runtime.workers.remove(thread_id);
            Err(CoreError::Io(err))
        }
    }
}

/// Pin the calling thread to a core derived from its worker id.
fn pin_current_thread(thread_id: ThreadId) {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        warn!(thread_id, "could not enumerate cores; running unpinned");
        return;
    };
    if core_ids.is_empty() {
        warn!(thread_id, "no cores reported; running unpinned");
        return;
    }
    let target = core_ids[(thread_id as usize - 1) % core_ids.len()];
    if !core_affinity::set_for_current(target) {
        warn!(thread_id, core = target.id, "failed to set core affinity");
    }
}

/// The worker event loop. Runs until a Stop command sets the stop flag.
fn worker_main(runtime: Arc<Runtime>, handle: Arc<WorkerHandle>) {
    let mut instances: HashMap<MsuId, MsuInstance> = HashMap::new();
    debug!(thread_id = handle.id, "worker loop starting");

    loop {
        let loop_started = Instant::now();
        let mut did_work = false;

        let mut drained = 0;
        while drained < defaults::CTRL_DRAIN_LIMIT {
            let Some(cmd) = handle.queue.pop_ctrl() else {
                break;
            };
            exec_control(&runtime, &handle, &mut instances, cmd);
            drained += 1;
            did_work = true;
        }

        if handle.is_stopping() {
            // Finish whatever control is left, then exit; new data pushes
            // are already being refused.
            while let Some(cmd) = handle.queue.pop_ctrl() {
                exec_control(&runtime, &handle, &mut instances, cmd);
            }
            break;
        }

        if let Some(env) = handle.queue.pop_data() {
            dispatch(&runtime, &handle, &mut instances, env);
            did_work = true;
        }

        if did_work {
            runtime.stats.record_elapsed(
                StatId::ThreadLoopTime,
                handle.id,
                loop_started,
            );
        } else {
            handle.queue.park(defaults::IDLE_PARK_TIMEOUT);
        }
    }

    // Teardown on the owning thread: destruction is Drop, placements are
    // released so the ids become routable errors instead of stale targets.
    for (msu_id, instance) in instances.drain() {
        runtime.placements.remove(msu_id);
        debug!(thread_id = handle.id, msu_id, "destroying MSU at shutdown");
        drop(instance);
    }
    runtime.workers.remove(handle.id);
    info!(thread_id = handle.id, "worker loop exited");
}

/// Dispatch one data envelope to its target MSU.
fn dispatch(
    runtime: &Arc<Runtime>,
    handle: &Arc<WorkerHandle>,
    instances: &mut HashMap<MsuId, MsuInstance>,
    env: Envelope,
) {
    let full_started = Instant::now();
    let dst = env.dst_msu_id;
    let Some(instance) = instances.get_mut(&dst) else {
        warn!(thread_id = handle.id, msu_id = dst, "envelope for unknown MSU dropped");
        return;
    };

    runtime
        .stats
        .record(StatId::QueueLength, handle.id, handle.queue.len() as f64);
    runtime.stats.record(StatId::ItemsProcessed, dst, 1.0);

    let origin = env.origin_runtime;
    let MsuInstance {
        id,
        routes,
        kind,
        ..
    } = instance;
    let mut ctx = MsuContext::new(runtime, *id, handle.id, routes, origin);

    let inner_started = Instant::now();
    if let Err(err) = kind.receive(&mut ctx, env) {
        // Per-message failure: the envelope's payload is gone with it and
        // the worker moves on.
        let err = CoreError::MsuReceiveError {
            msu_id: dst,
            reason: err.to_string(),
        };
        error!(thread_id = handle.id, %err, "dispatch failed");
    }
    runtime
        .stats
        .record_elapsed(StatId::InternalMsuTime, dst, inner_started);
    runtime
        .stats
        .record_elapsed(StatId::FullMsuTime, dst, full_started);
}

/// Execute one control command on the owning worker.
fn exec_control(
    runtime: &Arc<Runtime>,
    handle: &Arc<WorkerHandle>,
    instances: &mut HashMap<MsuId, MsuInstance>,
    cmd: ControlCommand,
) {
    match cmd {
        ControlCommand::CreateMsu {
            msu_id,
            type_id,
            init_data,
            completion,
        } => {
            let result = create_msu(runtime, handle, instances, msu_id, type_id, &init_data);
            match &result {
                Ok(()) => info!(thread_id = handle.id, msu_id, type_id, "created MSU"),
                Err(err) => error!(thread_id = handle.id, msu_id, type_id, %err, "MSU creation failed"),
            }
            runtime.send_reply(ControllerReply::for_result(
                ControlMsgType::CreateMsu,
                msu_id,
                &result,
            ));
            if let Some(tx) = completion {
                let _ = tx.send(result);
            }
        }
        ControlCommand::DeleteMsu { msu_id } => {
            let result = match instances.remove(&msu_id) {
                Some(instance) => {
                    // Out of the map (and placements) before destroy, so no
                    // new envelope can race the teardown.
                    runtime.placements.remove(msu_id);
                    drop(instance);
                    info!(thread_id = handle.id, msu_id, "deleted MSU");
                    Ok(())
                }
                None => Err(CoreError::UnknownMsu(msu_id)),
            };
            if let Err(err) = &result {
                warn!(thread_id = handle.id, msu_id, %err, "MSU deletion failed");
            }
            runtime.send_reply(ControllerReply::for_result(
                ControlMsgType::DeleteMsu,
                msu_id,
                &result,
            ));
        }
        ControlCommand::AttachRoutes { msu_id, route_ids } => {
            let result = attach_routes(runtime, instances, msu_id, &route_ids);
            if let Err(err) = &result {
                warn!(thread_id = handle.id, msu_id, %err, "route attachment failed");
            }
            runtime.send_reply(ControllerReply::for_result(
                ControlMsgType::MsuRoutes,
                msu_id,
                &result,
            ));
        }
        ControlCommand::Stop => {
            debug!(thread_id = handle.id, "stop requested");
            handle.set_stopping();
        }
    }
}

fn create_msu(
    runtime: &Arc<Runtime>,
    handle: &Arc<WorkerHandle>,
    instances: &mut HashMap<MsuId, MsuInstance>,
    msu_id: MsuId,
    type_id: MsuTypeId,
    init_data: &[u8],
) -> CoreResult<()> {
    if instances.contains_key(&msu_id) {
        return Err(CoreError::MsuExists(msu_id));
    }
    let spec = runtime.types.get(type_id)?;
    let kind = spec.instantiate(msu_id, init_data)?;
    // Claim the process-wide id last; a failed init never registers.
    runtime.placements.insert(msu_id, handle.id)?;
    instances.insert(msu_id, MsuInstance::new(msu_id, spec, kind));
    Ok(())
}

fn attach_routes(
    runtime: &Arc<Runtime>,
    instances: &mut HashMap<MsuId, MsuInstance>,
    msu_id: MsuId,
    route_ids: &[RouteId],
) -> CoreResult<()> {
    let instance = instances
        .get_mut(&msu_id)
        .ok_or(CoreError::UnknownMsu(msu_id))?;
    for route_id in route_ids {
        let route = runtime.routes.get(*route_id)?;
        instance.attach_route(route);
    }
    Ok(())
}
