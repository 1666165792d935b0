//! # Dataflow Graph Model and Interpreter
//!
//! The controller publishes the application as a DFG document: MSU types,
//! MSU instances with their placement (runtime, thread, routes), and per-
//! runtime route definitions. This module carries the serde model of that
//! JSON and the interpreter that turns the local share of a document into
//! concrete runtime actions.
//!
//! ## Interpretation Order
//!
//! For the vertices placed on this runtime (locality always compares the
//! vertex's scheduled runtime id against the *configured* local id, never
//! against runtime objects inside the document), the interpreter:
//!
//! 1. spawns any worker threads the vertices reference that do not exist
//!    yet (pinned while inside the runtime record's pinned-thread range);
//! 2. creates this runtime's routes with empty endpoint sets;
//! 3. requests each CREATE_MSU on its owning worker, with an ack channel
//!    attached;
//! 4. waits for every ack (creation is confirmed by the owning workers,
//!    not by a settling delay) and marks vertices whose ack failed or
//!    timed out;
//! 5. attaches endpoints to routes, resolving locality from the document's
//!    placements;
//! 6. attaches routes to the surviving MSUs.

use crate::defaults;
use crate::error::{CoreError, CoreResult};
use crate::message::{MsuId, MsuTypeId, RouteId, RuntimeId, ThreadId, ThreadMode};
use crate::routing::{Endpoint, Locality};
use crate::runtime::Runtime;
use crate::worker::{spawn_worker, ControlCommand};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// The published dataflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfgDocument {
    pub application_name: String,
    pub global_ctl_ip: String,
    pub global_ctl_port: u16,
    #[serde(rename = "MSU_types", default)]
    pub msu_types: Vec<DfgMsuType>,
    #[serde(rename = "MSUs")]
    pub msus: Vec<DfgMsu>,
    pub runtimes: Vec<DfgRuntime>,
}

/// Type metadata as published; the executable side of a type lives in the
/// process's own registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfgMsuType {
    pub id: MsuTypeId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfgMsu {
    pub id: MsuId,
    #[serde(rename = "type")]
    pub type_id: MsuTypeId,
    pub vertex_type: VertexType,
    #[serde(default)]
    pub init_data: String,
    pub blocking_mode: BlockingMode,
    pub scheduling: DfgScheduling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VertexType {
    #[serde(rename = "entry")]
    Entry,
    #[serde(rename = "exit")]
    Exit,
    #[serde(rename = "entry/exit")]
    EntryExit,
    #[serde(rename = "nop")]
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingMode {
    #[serde(rename = "blocking")]
    Blocking,
    #[serde(rename = "non-blocking")]
    NonBlocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfgScheduling {
    pub runtime: RuntimeId,
    pub thread_id: ThreadId,
    #[serde(default)]
    pub routes: Vec<RouteId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfgRuntime {
    pub id: RuntimeId,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub n_cores: u32,
    #[serde(default)]
    pub n_pinned_threads: u32,
    #[serde(default)]
    pub n_unpinned_threads: u32,
    #[serde(default)]
    pub routes: Vec<DfgRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfgRoute {
    pub id: RouteId,
    #[serde(rename = "type")]
    pub type_id: MsuTypeId,
    #[serde(default)]
    pub endpoints: Vec<DfgEndpoint>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DfgEndpoint {
    pub key: i32,
    pub msu: MsuId,
}

/// What an interpretation pass actually did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DfgSummary {
    pub workers_spawned: usize,
    pub routes_created: usize,
    pub msus_created: usize,
    pub msus_failed: usize,
    pub endpoints_attached: usize,
}

/// Parse a DFG document from a JSON file.
pub fn load_dfg(path: &Path) -> CoreResult<DfgDocument> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Materialize this runtime's share of a DFG document.
pub async fn apply_dfg(runtime: &Arc<Runtime>, doc: &DfgDocument) -> CoreResult<DfgSummary> {
    let local_id = runtime.config.local_runtime_id;
    let local_record = doc
        .runtimes
        .iter()
        .find(|r| r.id == local_id)
        .ok_or_else(|| {
            CoreError::FatalConfig(format!("DFG has no record for local runtime {local_id}"))
        })?;
    let local_vertices: Vec<&DfgMsu> = doc
        .msus
        .iter()
        .filter(|m| m.scheduling.runtime == local_id)
        .collect();
    info!(
        application = %doc.application_name,
        vertices = local_vertices.len(),
        "interpreting DFG"
    );

    let mut summary = DfgSummary::default();

    // 1. Workers the local vertices need.
    for vertex in &local_vertices {
        let thread_id = vertex.scheduling.thread_id;
        if runtime.workers.contains(thread_id) {
            continue;
        }
        let mode = if thread_id <= local_record.n_pinned_threads {
            ThreadMode::Pinned
        } else {
            ThreadMode::Unpinned
        };
        spawn_worker(runtime, thread_id, mode)?;
        summary.workers_spawned += 1;
    }

    // 2. This runtime's routes, endpoints deferred.
    for route in &local_record.routes {
        match runtime.routes.create(route.id, route.type_id) {
            Ok(_) => summary.routes_created += 1,
            Err(CoreError::RouteExists(_)) => {
                // Re-applying a document is tolerated; the endpoints get
                // reconciled below.
            }
            Err(err) => return Err(err),
        }
    }

    // 3. Request every MSU on its owning worker, keeping an ack channel.
    let mut pending: Vec<(MsuId, oneshot::Receiver<CoreResult<()>>)> = Vec::new();
    for vertex in &local_vertices {
        let worker = runtime.workers.get(vertex.scheduling.thread_id)?;
        let (tx, rx) = oneshot::channel();
        worker.push_ctrl(ControlCommand::CreateMsu {
            msu_id: vertex.id,
            type_id: vertex.type_id,
            init_data: vertex.init_data.clone().into_bytes(),
            completion: Some(tx),
        });
        pending.push((vertex.id, rx));
    }

    // 4. Confirmation comes from the owning workers, not from a delay.
    let mut failed: HashSet<MsuId> = HashSet::new();
    for (msu_id, rx) in pending {
        match tokio::time::timeout(defaults::CREATE_ACK_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => summary.msus_created += 1,
            Ok(Ok(Err(err))) => {
                warn!(msu_id, %err, "MSU creation was refused");
                failed.insert(msu_id);
            }
            Ok(Err(_closed)) => {
                warn!(msu_id, "MSU creation ack channel closed");
                failed.insert(msu_id);
            }
            Err(_elapsed) => {
                warn!(msu_id, "MSU creation unacknowledged in time");
                failed.insert(msu_id);
            }
        }
    }
    summary.msus_failed = failed.len();

    // 5. Endpoints, with locality resolved from the document's placements.
    for route in &local_record.routes {
        let handle = runtime.routes.get(route.id)?;
        for endpoint in &route.endpoints {
            let Some(target) = doc.msus.iter().find(|m| m.id == endpoint.msu) else {
                warn!(route_id = route.id, msu = endpoint.msu, "endpoint names unknown MSU");
                continue;
            };
            let locality = if target.scheduling.runtime == local_id {
                Locality::Local
            } else {
                Locality::Remote(target.scheduling.runtime)
            };
            if locality == Locality::Local && failed.contains(&endpoint.msu) {
                warn!(route_id = route.id, msu = endpoint.msu, "skipping endpoint of failed MSU");
                continue;
            }
            match handle.add_endpoint(Endpoint {
                key: endpoint.key,
                msu_id: endpoint.msu,
                locality,
            }) {
                Ok(()) => summary.endpoints_attached += 1,
                Err(CoreError::EndpointConflict { .. }) => {
                    // Already present from an earlier pass.
                }
                Err(err) => return Err(err),
            }
        }
    }

    // 6. Routes onto the surviving MSUs.
    for vertex in &local_vertices {
        if failed.contains(&vertex.id) || vertex.scheduling.routes.is_empty() {
            continue;
        }
        let worker = runtime.workers.get(vertex.scheduling.thread_id)?;
        worker.push_ctrl(ControlCommand::AttachRoutes {
            msu_id: vertex.id,
            route_ids: vertex.scheduling.routes.clone(),
        });
    }

    info!(?summary, "DFG interpretation finished");
    Ok(summary)
}
