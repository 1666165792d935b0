//! # Dataflow Runtime Core
//!
//! A distributed dataflow runtime that executes a graph of small,
//! single-responsibility compute units ("MSUs", minimum schedulable
//! units). A central controller publishes the dataflow graph and issues
//! reconfiguration actions; each runtime process materializes its share of
//! the graph, dispatches messages between MSUs across threads and hosts,
//! and reports back.
//!
//! This crate is the per-runtime execution engine: the worker-thread model
//! and its two-channel work queue, the MSU lifecycle and state ownership,
//! the routing subsystem with its pluggable strategies, the framed
//! inter-runtime transport, the control-plane session, the DFG
//! interpreter, and the bundled cache/fileio MSU pair.

pub mod cli;
pub mod dfg;
pub mod error;
pub mod message;
pub mod msu;
pub mod net;
pub mod queue;
pub mod routing;
pub mod runtime;
pub mod stats;
pub mod worker;

pub use error::{CoreError, CoreResult};
pub use message::{Envelope, MsuId, MsuTypeId, RouteId, RuntimeId, ThreadId};
pub use msu::{MsuContext, MsuKind, MsuTypeSpec};
pub use routing::{Endpoint, Locality, Route, RouteStrategy};
pub use runtime::{Runtime, RuntimeConfig};

/// The current version of the runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Capacity of a worker's bounded data channel.
    pub const QUEUE_CAPACITY: usize = 1024;

    /// Control commands drained per worker loop iteration, so a control
    /// burst cannot starve data forever.
    pub const CTRL_DRAIN_LIMIT: usize = 64;

    /// How long an idle worker parks before re-checking its stop flag.
    pub const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(50);

    /// Largest payload a frame may declare before it is treated as
    /// malformed.
    pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

    /// Capacity of each peer's outgoing envelope queue.
    pub const PEER_QUEUE_CAPACITY: usize = 1024;

    /// Kernel send/receive buffer size applied to runtime sockets.
    pub const SOCKET_BUFFER_SIZE: usize = 8192;

    /// Default listen port for peer-runtime connections.
    pub const LISTEN_PORT: u16 = 4500;

    /// Samples buffered per (stat, item) before recording starts dropping.
    pub const MAX_STAT_SAMPLES: usize = 2048;

    /// Minimum time between flushes of one statistic item.
    pub const STAT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

    /// How long the DFG interpreter waits for a CREATE_MSU ack.
    pub const CREATE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Document root for the bundled webserver MSUs.
    pub const WWW_DIR: &str = "www/";

    /// Cache MSU file-count budget when the init data leaves it unset.
    pub const CACHE_MAX_FILES: usize = usize::MAX;

    /// Cache MSU byte budget (in KB) when the init data leaves it unset.
    pub const CACHE_MAX_KB: u64 = u64::MAX / 1024;

    /// Largest fraction of the byte budget one file may take.
    pub const CACHE_OCCUPANCY_RATE: f32 = 0.2;
}
