//! # MSU Types, Instances and the Developer API
//!
//! An MSU (minimum schedulable unit) is a typed message handler with
//! private state, owned by exactly one worker thread. This module defines:
//!
//! - [`MsuKind`], the capability trait every MSU implementation provides;
//! - [`MsuTypeSpec`] and [`MsuTypeRegistry`], the static description of a
//!   type (wire-stable id, name, routing strategy, constructor) registered
//!   before the runtime boots;
//! - [`MsuInstance`], the per-instance pairing of a kind with its attached
//!   routes, living inside its owning worker;
//! - [`PlacementTable`], the process-wide map from MSU id to owning thread
//!   that backs routing and controller replies;
//! - [`MsuContext`], the dispatch context handed to `receive`, carrying the
//!   emission API (`call_type`, `call_msu`, `call_local`).
//!
//! ## Ownership Rules
//!
//! Instance state is mutated only on the owning worker; every cross-thread
//! interaction goes through envelope queues. Construction and destruction
//! both happen on the owning worker (CREATE_MSU / DELETE_MSU are delivered
//! to that worker's control channel); destruction is `Drop`.
//!
//! ## Emission
//!
//! Emitting to a *type* locates the sender's route for that type and
//! applies the destination type's routing strategy; the resulting endpoint
//! is enqueued locally or handed to the peer's outgoing queue. `receive`
//! itself is strictly synchronous: blocking I/O belongs in dedicated I/O
//! MSUs (see [`crate::msu::fileio`]).

pub mod cache;
pub mod fileio;

use crate::error::{CoreError, CoreResult};
use crate::message::{Envelope, MsuId, MsuTypeId, RuntimeId, ThreadId};
use crate::routing::{select_endpoint, Route, RouteStrategy, StrategyContext};
use crate::runtime::Runtime;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Capability trait implemented by every MSU.
///
/// `receive` handles one envelope; construction is the type's build
/// closure, destruction is `Drop`. An error return is logged by the worker
/// and the envelope dropped; the worker never aborts on it.
pub trait MsuKind: Send {
    fn receive(&mut self, ctx: &mut MsuContext<'_>, env: Envelope) -> CoreResult<()>;
}

impl std::fmt::Debug for dyn MsuKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn MsuKind")
    }
}

/// Constructor for an MSU type: builds fresh instance state from the
/// CREATE_MSU init data.
pub type BuildFn = Arc<dyn Fn(&[u8]) -> CoreResult<Box<dyn MsuKind>> + Send + Sync>;

/// Static description of an MSU type, registered once at startup.
///
/// Type ids are stable identifiers used in wire formats and the DFG.
pub struct MsuTypeSpec {
    pub id: MsuTypeId,
    pub name: &'static str,
    /// Strategy applied to messages addressed *to* this type.
    pub strategy: RouteStrategy,
    /// Whether the controller may clone instances of this type.
    pub cloneable: bool,
    /// Types sharing a colocation group prefer placement on one runtime.
    pub colocation_group: u32,
    build: BuildFn,
}

impl MsuTypeSpec {
    pub fn new(id: MsuTypeId, name: &'static str, strategy: RouteStrategy, build: BuildFn) -> Self {
        Self {
            id,
            name,
            strategy,
            cloneable: true,
            colocation_group: 0,
            build,
        }
    }

    pub fn with_cloneable(mut self, cloneable: bool) -> Self {
        self.cloneable = cloneable;
        self
    }

    pub fn with_colocation_group(mut self, group: u32) -> Self {
        self.colocation_group = group;
        self
    }

    /// Build instance state, mapping constructor failures to
    /// [`CoreError::InitFailure`] for the given instance id.
    pub fn instantiate(&self, msu_id: MsuId, init_data: &[u8]) -> CoreResult<Box<dyn MsuKind>> {
        (self.build)(init_data).map_err(|err| CoreError::InitFailure {
            msu_id,
            reason: err.to_string(),
        })
    }
}

impl std::fmt::Debug for MsuTypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsuTypeSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Id-keyed registry of MSU types.
#[derive(Default)]
pub struct MsuTypeRegistry {
    types: RwLock<HashMap<MsuTypeId, Arc<MsuTypeSpec>>>,
}

impl MsuTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: MsuTypeSpec) -> CoreResult<()> {
        let mut types = self.types.write();
        if types.contains_key(&spec.id) {
            return Err(CoreError::MsuTypeExists(spec.id));
        }
        debug!(type_id = spec.id, name = spec.name, "registered MSU type");
        types.insert(spec.id, Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, id: MsuTypeId) -> CoreResult<Arc<MsuTypeSpec>> {
        self.types
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::UnknownMsuType(id))
    }
}

/// One MSU instance, owned by a single worker for its whole lifetime.
pub struct MsuInstance {
    pub id: MsuId,
    pub spec: Arc<MsuTypeSpec>,
    /// Routes this instance may emit on, one per downstream type.
    pub routes: HashMap<MsuTypeId, Arc<Route>>,
    pub kind: Box<dyn MsuKind>,
}

impl MsuInstance {
    pub fn new(id: MsuId, spec: Arc<MsuTypeSpec>, kind: Box<dyn MsuKind>) -> Self {
        Self {
            id,
            spec,
            routes: HashMap::new(),
            kind,
        }
    }

    /// Attach a route; a later attachment for the same target type
    /// replaces the earlier one.
    pub fn attach_route(&mut self, route: Arc<Route>) {
        self.routes.insert(route.target_type, route);
    }
}

/// Process-wide map from MSU id to owning worker thread.
///
/// Append-mostly: routing and the controller handler read it lock-free in
/// spirit (short read-lock), mutation happens only on create/delete.
#[derive(Default)]
pub struct PlacementTable {
    map: RwLock<HashMap<MsuId, ThreadId>>,
}

impl PlacementTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an MSU id for a worker. An id may appear at most once in the
    /// process.
    pub fn insert(&self, msu_id: MsuId, thread_id: ThreadId) -> CoreResult<()> {
        let mut map = self.map.write();
        if map.contains_key(&msu_id) {
            return Err(CoreError::MsuExists(msu_id));
        }
        map.insert(msu_id, thread_id);
        Ok(())
    }

    pub fn remove(&self, msu_id: MsuId) -> Option<ThreadId> {
        self.map.write().remove(&msu_id)
    }

    pub fn thread_of(&self, msu_id: MsuId) -> CoreResult<ThreadId> {
        self.map
            .read()
            .get(&msu_id)
            .copied()
            .ok_or(CoreError::UnknownMsu(msu_id))
    }

    pub fn contains(&self, msu_id: MsuId) -> bool {
        self.map.read().contains_key(&msu_id)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

/// Dispatch context handed to [`MsuKind::receive`].
///
/// Carries the instance's identity, its attached routes, and the origin of
/// the envelope being handled (inherited by every emission so that
/// origin-runtime routing keeps working downstream).
pub struct MsuContext<'a> {
    runtime: &'a Runtime,
    self_id: MsuId,
    self_thread: ThreadId,
    routes: &'a HashMap<MsuTypeId, Arc<Route>>,
    origin: Option<RuntimeId>,
}

impl<'a> MsuContext<'a> {
    pub fn new(
        runtime: &'a Runtime,
        self_id: MsuId,
        self_thread: ThreadId,
        routes: &'a HashMap<MsuTypeId, Arc<Route>>,
        origin: Option<RuntimeId>,
    ) -> Self {
        Self {
            runtime,
            self_id,
            self_thread,
            routes,
            origin,
        }
    }

    /// This instance's id.
    pub fn msu_id(&self) -> MsuId {
        self.self_id
    }

    /// Approximate data-queue length of the owning worker, for
    /// diagnostics.
    pub fn queue_len(&self) -> usize {
        self.runtime.worker_queue_len(self.self_thread).unwrap_or(0)
    }

    /// The runtime the envelope being handled originally arrived from.
    pub fn origin_runtime(&self) -> Option<RuntimeId> {
        self.origin
    }

    /// Whether a route for `target_type` is attached to this instance.
    pub fn has_route(&self, target_type: MsuTypeId) -> bool {
        self.routes.contains_key(&target_type)
    }

    fn route_for(&self, target_type: MsuTypeId) -> CoreResult<&Arc<Route>> {
        self.routes
            .get(&target_type)
            .ok_or(CoreError::NoRouteToType(target_type))
    }

    fn outgoing(&self, dst: MsuId, key: i32, payload: Vec<u8>) -> Envelope {
        let mut env = Envelope::new(dst, key, payload);
        env.origin_runtime = self.origin;
        env
    }

    /// Emit to a downstream *type*: the sender's route for that type is
    /// located and the destination type's strategy picks the endpoint.
    pub fn call_type(&self, target_type: MsuTypeId, key: i32, payload: Vec<u8>) -> CoreResult<()> {
        let route = self.route_for(target_type)?;
        let strategy = self.runtime.types.get(target_type)?.strategy;
        let env = self.outgoing(0, key, payload);
        let queue_len = |msu: MsuId| -> Option<usize> {
            let thread = self.runtime.placements.thread_of(msu).ok()?;
            self.runtime.worker_queue_len(thread)
        };
        let cx = StrategyContext {
            local_runtime_id: self.runtime.config.local_runtime_id,
            queue_len: &queue_len,
        };
        let endpoint = select_endpoint(route, strategy, &env, &cx)?;
        let mut env = env;
        env.dst_msu_id = endpoint.msu_id;
        self.runtime.forward(endpoint.locality, env)
    }

    /// Emit to a specific MSU through the sender's route for its type
    /// (the route-to-id strategy): the endpoint must be present on the
    /// route, but may be local or remote.
    pub fn call_msu(
        &self,
        target_type: MsuTypeId,
        target_msu: MsuId,
        key: i32,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        let route = self.route_for(target_type)?;
        let endpoint = route.endpoint_to_msu(target_msu)?;
        let env = self.outgoing(endpoint.msu_id, key, payload);
        self.runtime.forward(endpoint.locality, env)
    }

    /// Emit directly to a local MSU, bypassing routes entirely.
    pub fn call_local(&self, target_msu: MsuId, key: i32, payload: Vec<u8>) -> CoreResult<()> {
        let env = self.outgoing(target_msu, key, payload);
        self.runtime.dispatch_local(env)
    }
}
