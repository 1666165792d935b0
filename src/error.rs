//! # Runtime Error Taxonomy
//!
//! This module defines the error kinds the runtime core distinguishes.
//! The split follows the crate-wide convention: `CoreError` (thiserror) for
//! errors the core handles or reports structurally, `anyhow::Error` at the
//! binary and orchestration edges where errors only propagate upward.
//!
//! ## Propagation Policy
//!
//! All per-message errors are local to the worker that observed them; no
//! error crosses a thread boundary except as a NACK reported back to the
//! controller. The core performs no retries; retry policy, if any, belongs
//! to the controller.

use crate::message::{MsuId, MsuTypeId, RouteId, RuntimeId, ThreadId};
use thiserror::Error;

/// Errors produced by the runtime core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A data enqueue was rejected because the queue is at capacity.
    ///
    /// The default sender policy is to drop the envelope and increment the
    /// queue's drop counter; callers may retry per their own policy.
    #[error("data queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// A control frame failed size verification or named an unknown type.
    ///
    /// The controller connection stays open; the offending message is
    /// skipped and counted.
    #[error("malformed control message: {reason}")]
    MalformedControlMsg { reason: String },

    /// A peer frame carried an implausible length or the connection closed
    /// mid-frame. The peer connection is torn down and reopened only on the
    /// next ADD_RUNTIME.
    #[error("malformed peer frame: {reason}")]
    MalformedPeerFrame { reason: String },

    #[error("unknown MSU {0}")]
    UnknownMsu(MsuId),

    #[error("unknown MSU type {0}")]
    UnknownMsuType(MsuTypeId),

    #[error("MSU {0} already exists")]
    MsuExists(MsuId),

    #[error("MSU type {0} already registered")]
    MsuTypeExists(MsuTypeId),

    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("thread {0} already exists")]
    ThreadExists(ThreadId),

    #[error("unknown route {0}")]
    UnknownRoute(RouteId),

    #[error("route {0} already exists")]
    RouteExists(RouteId),

    #[error("unknown peer runtime {0}")]
    UnknownRuntime(RuntimeId),

    /// The sending MSU holds no route delivering to the requested type.
    #[error("no route to MSU type {0}")]
    NoRouteToType(MsuTypeId),

    /// A routing strategy found no usable endpoint; the envelope is dropped
    /// and counted.
    #[error("no endpoint found on route {route_id}")]
    EndpointNotFound { route_id: RouteId },

    /// An endpoint mutation conflicted with the route's current contents.
    #[error("route {route_id} endpoint conflict at key {key}")]
    EndpointConflict { route_id: RouteId, key: i32 },

    /// An MSU's `receive` returned an error. The envelope is freed and the
    /// worker continues.
    #[error("MSU {msu_id} receive failed: {reason}")]
    MsuReceiveError { msu_id: MsuId, reason: String },

    /// An MSU's constructor failed; the instance is not registered and the
    /// controller is sent a NACK.
    #[error("MSU {msu_id} init failed: {reason}")]
    InitFailure { msu_id: MsuId, reason: String },

    /// The runtime cannot start (for example, no controller connection).
    /// The process exits non-zero.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("DFG parse error: {0}")]
    Dfg(#[from] serde_json::Error),
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Numeric code carried in NACK replies to the controller.
    ///
    /// Codes are wire-stable; new variants append rather than renumber.
    pub fn nack_code(&self) -> u32 {
        match self {
            CoreError::QueueFull { .. } => 1,
            CoreError::MalformedControlMsg { .. } => 2,
            CoreError::MalformedPeerFrame { .. } => 3,
            CoreError::UnknownMsu(_) => 4,
            CoreError::UnknownMsuType(_) => 5,
            CoreError::MsuExists(_) => 18,
            CoreError::MsuTypeExists(_) => 19,
            CoreError::UnknownThread(_) => 6,
            CoreError::ThreadExists(_) => 20,
            CoreError::UnknownRoute(_) => 7,
            CoreError::RouteExists(_) => 17,
            CoreError::UnknownRuntime(_) => 8,
            CoreError::NoRouteToType(_) => 9,
            CoreError::EndpointNotFound { .. } => 10,
            CoreError::EndpointConflict { .. } => 11,
            CoreError::MsuReceiveError { .. } => 12,
            CoreError::InitFailure { .. } => 13,
            CoreError::FatalConfig(_) => 14,
            CoreError::Io(_) => 15,
            CoreError::Codec(_) => 16,
            CoreError::Dfg(_) => 21,
        }
    }
}
