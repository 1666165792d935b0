//! # Message Envelope and Wire Framing Module
//!
//! This module defines the in-memory message envelope that moves between
//! worker threads, and the two byte-level frame formats the runtime speaks
//! on the network:
//!
//! - **Peer frames** carry envelopes between runtimes:
//!   `[u32 payload_len][u32 dst_msu_id][i32 key][payload]`, little-endian.
//! - **Controller frames** carry control messages and replies:
//!   `[u32 type][u32 thread_id][u32 payload_size][payload]`, little-endian.
//!
//! Control payloads are serde structs encoded with bincode's fixed-width
//! little-endian integer encoding, which makes every fixed-shape payload a
//! deterministic size. The controller handler exploits this: each control
//! type declares a [`PayloadSizeRule`] that is checked against the header's
//! `payload_size` *before* the payload is decoded, so a truncated or padded
//! message is rejected as [`CoreError::MalformedControlMsg`] without ever
//! reaching a decoder.
//!
//! ## Envelope Ownership
//!
//! An envelope owns its payload buffer. The owning queue slot holds it until
//! dispatch, at which point ownership transfers to the receiving MSU; on
//! queue teardown remaining payloads are dropped with their envelopes.
//!
//! ## Identity Spaces
//!
//! All cross-references in the runtime are plain integer ids (MSU ids, MSU
//! type ids, thread ids, route ids, runtime ids). Ids are wire-stable: they
//! appear verbatim in frames and in the DFG document.

use crate::defaults;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Identifier of an MSU instance, unique across the whole dataflow graph.
pub type MsuId = u32;
/// Identifier of an MSU type, unique process-wide and stable on the wire.
pub type MsuTypeId = u32;
/// Identifier of a worker thread. Thread 0 is the main/IO plane.
pub type ThreadId = u32;
/// Identifier of a route, unique within one runtime.
pub type RouteId = u32;
/// Identifier of a runtime host process.
pub type RuntimeId = u32;

/// Reserved destination id used by the peer-connection handshake frame.
pub const HANDSHAKE_DST: MsuId = 0;

/// Byte length of a peer frame header (`payload_len`, `dst_msu_id`, `key`).
pub const PEER_HEADER_LEN: usize = 12;

/// Byte length of a controller frame header (`type`, `thread_id`, `payload_size`).
pub const CONTROL_HEADER_LEN: usize = 12;

/// The in-flight message between MSUs.
///
/// `key` is an application-defined routing key used for consistent range
/// sharding by the key-based strategy. `origin_runtime` is stamped by the
/// receiving end of a peer connection (from that connection's handshake) and
/// is `None` for envelopes that never crossed a runtime boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub dst_msu_id: MsuId,
    pub key: i32,
    pub origin_runtime: Option<RuntimeId>,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(dst_msu_id: MsuId, key: i32, payload: Vec<u8>) -> Self {
        Self {
            dst_msu_id,
            key,
            origin_runtime: None,
            payload,
        }
    }

    /// Stamp the runtime the envelope arrived from.
    pub fn with_origin(mut self, runtime_id: RuntimeId) -> Self {
        self.origin_runtime = Some(runtime_id);
        self
    }

    /// Encode this envelope as a peer frame.
    ///
    /// A zero-length payload is legal and encodes a pure signalling frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PEER_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.dst_msu_id.to_le_bytes());
        buf.extend_from_slice(&self.key.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a complete peer frame back into an envelope.
    ///
    /// The inverse of [`Envelope::to_frame`]; used by tests and by sync
    /// paths that already hold the full frame in memory. The streaming
    /// receive path parses the header separately (see [`PeerFrameHeader`])
    /// so it can resume partial reads.
    pub fn from_frame(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < PEER_HEADER_LEN {
            return Err(CoreError::MalformedPeerFrame {
                reason: format!("frame shorter than header ({} bytes)", bytes.len()),
            });
        }
        let mut header = [0u8; PEER_HEADER_LEN];
        header.copy_from_slice(&bytes[..PEER_HEADER_LEN]);
        let header = PeerFrameHeader::parse(&header)?;
        let body = &bytes[PEER_HEADER_LEN..];
        if body.len() != header.payload_len as usize {
            return Err(CoreError::MalformedPeerFrame {
                reason: format!(
                    "declared payload {} bytes, got {}",
                    header.payload_len,
                    body.len()
                ),
            });
        }
        Ok(Envelope::new(header.dst_msu_id, header.key, body.to_vec()))
    }
}

/// Parsed header of a peer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFrameHeader {
    pub payload_len: u32,
    pub dst_msu_id: MsuId,
    pub key: i32,
}

impl PeerFrameHeader {
    /// Parse and sanity-check a peer frame header.
    ///
    /// A declared payload larger than [`defaults::MAX_FRAME_PAYLOAD`] is
    /// implausible and treated as a malformed frame, which tears the peer
    /// connection down rather than attempting a multi-gigabyte read.
    pub fn parse(bytes: &[u8; PEER_HEADER_LEN]) -> CoreResult<Self> {
        let payload_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let dst_msu_id = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let key = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if payload_len as usize > defaults::MAX_FRAME_PAYLOAD {
            return Err(CoreError::MalformedPeerFrame {
                reason: format!("implausible payload length {payload_len}"),
            });
        }
        Ok(Self {
            payload_len,
            dst_msu_id,
            key,
        })
    }
}

/// Build the handshake frame that opens every peer connection.
///
/// The handshake is an ordinary peer frame addressed to the reserved MSU id
/// [`HANDSHAKE_DST`] whose 4-byte payload is the sender's runtime id. The
/// receiving end stamps `origin_runtime` on every subsequent envelope from
/// the connection.
pub fn handshake_frame(local_runtime_id: RuntimeId) -> Vec<u8> {
    Envelope::new(HANDSHAKE_DST, 0, local_runtime_id.to_le_bytes().to_vec()).to_frame()
}

/// Extract the peer runtime id from a handshake envelope.
pub fn parse_handshake(env: &Envelope) -> CoreResult<RuntimeId> {
    if env.dst_msu_id != HANDSHAKE_DST || env.payload.len() != 4 {
        return Err(CoreError::MalformedPeerFrame {
            reason: "connection did not open with a handshake frame".to_string(),
        });
    }
    Ok(u32::from_le_bytes(env.payload[..4].try_into().unwrap()))
}

/// Control message types the runtime accepts from the controller.
///
/// Discriminants are the wire values in the controller frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlMsgType {
    AddRuntime = 1,
    CreateThread = 2,
    DeleteThread = 3,
    CreateMsu = 4,
    DeleteMsu = 5,
    MsuRoutes = 6,
    ModifyRoute = 7,
}

impl ControlMsgType {
    pub fn from_wire(raw: u32) -> CoreResult<Self> {
        match raw {
            1 => Ok(Self::AddRuntime),
            2 => Ok(Self::CreateThread),
            3 => Ok(Self::DeleteThread),
            4 => Ok(Self::CreateMsu),
            5 => Ok(Self::DeleteMsu),
            6 => Ok(Self::MsuRoutes),
            7 => Ok(Self::ModifyRoute),
            other => Err(CoreError::MalformedControlMsg {
                reason: format!("unknown control message type {other}"),
            }),
        }
    }

    /// Size constraint the frame header's `payload_size` must satisfy for
    /// this type.
    ///
    /// Fixed-shape payloads must match exactly; the two payloads carrying a
    /// trailing vector (`CreateMsu` init data, `MsuRoutes` route ids) must
    /// be at least their fixed prefix. The exact byte counts are pinned by
    /// bincode's fixed-width little-endian encoding and asserted in tests.
    pub fn payload_size_rule(self) -> PayloadSizeRule {
        match self {
            // runtime_id: u32 + ip: u32 + port: u16
            Self::AddRuntime => PayloadSizeRule::Exactly(10),
            // thread_id: u32 + mode tag: u32
            Self::CreateThread => PayloadSizeRule::Exactly(8),
            Self::DeleteThread => PayloadSizeRule::Exactly(4),
            // msu_id + type_id + u64 init_data length prefix
            Self::CreateMsu => PayloadSizeRule::AtLeast(16),
            Self::DeleteMsu => PayloadSizeRule::Exactly(4),
            // msu_id + u64 route_ids length prefix
            Self::MsuRoutes => PayloadSizeRule::AtLeast(12),
            // route_id + op tag + key + msu_id + locality tag + runtime_id
            Self::ModifyRoute => PayloadSizeRule::Exactly(24),
        }
    }
}

/// Constraint on a control payload's declared size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSizeRule {
    Exactly(usize),
    AtLeast(usize),
}

/// Check a declared payload size against the rule for its message type.
pub fn verify_payload_size(msg_type: ControlMsgType, size: usize) -> CoreResult<()> {
    let ok = match msg_type.payload_size_rule() {
        PayloadSizeRule::Exactly(n) => size == n,
        PayloadSizeRule::AtLeast(n) => size >= n,
    };
    if ok {
        Ok(())
    } else {
        Err(CoreError::MalformedControlMsg {
            reason: format!(
                "payload size {size} does not match {:?} for {msg_type:?}",
                msg_type.payload_size_rule()
            ),
        })
    }
}

/// Reply message types the runtime sends back to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyMsgType {
    Init = 101,
    Ack = 102,
    Nack = 103,
    StatsUpdate = 104,
}

/// Header of a controller frame, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub msg_type: u32,
    pub thread_id: ThreadId,
    pub payload_size: u32,
}

impl ControlHeader {
    pub fn new(msg_type: u32, thread_id: ThreadId, payload_size: u32) -> Self {
        Self {
            msg_type,
            thread_id,
            payload_size,
        }
    }

    pub fn encode(&self) -> [u8; CONTROL_HEADER_LEN] {
        let mut buf = [0u8; CONTROL_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.thread_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_size.to_le_bytes());
        buf
    }

    pub fn parse(bytes: &[u8; CONTROL_HEADER_LEN]) -> Self {
        Self {
            msg_type: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            thread_id: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            payload_size: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

/// Worker pinning mode requested by CREATE_THREAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadMode {
    Pinned,
    Unpinned,
}

/// Endpoint mutation requested by MODIFY_ROUTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOp {
    AddEndpoint,
    DelEndpoint,
    ModEndpoint,
}

/// ADD_RUNTIME payload: open (or re-open) a connection to a peer runtime.
///
/// The address is an IPv4 address in host byte order plus a port, matching
/// the DFG's runtime records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRuntimePayload {
    pub runtime_id: RuntimeId,
    pub ip: u32,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateThreadPayload {
    pub thread_id: ThreadId,
    pub mode: ThreadMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteThreadPayload {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMsuPayload {
    pub msu_id: MsuId,
    pub type_id: MsuTypeId,
    pub init_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMsuPayload {
    pub msu_id: MsuId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsuRoutesPayload {
    pub msu_id: MsuId,
    pub route_ids: Vec<RouteId>,
}

/// MODIFY_ROUTE payload. `runtime_id` is meaningful only when `locality`
/// is [`WireLocality::Remote`]; senders set it to zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyRoutePayload {
    pub route_id: RouteId,
    pub op: RouteOp,
    pub key: i32,
    pub msu_id: MsuId,
    pub locality: WireLocality,
    pub runtime_id: RuntimeId,
}

/// Endpoint locality as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireLocality {
    Local,
    Remote,
}

/// First reply on the controller socket: announces this runtime's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub runtime_id: RuntimeId,
}

/// ACK/NACK payload. `request` is the acknowledged [`ControlMsgType`] wire
/// value, `target_id` the id the request operated on (MSU, thread, route or
/// runtime id depending on the request), and `error_code` a
/// [`CoreError::nack_code`] for NACKs, zero for ACKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub request: u32,
    pub target_id: u32,
    pub error_code: u32,
}

/// One aggregated series in a STATS_UPDATE reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsUpdateEntry {
    pub stat: u32,
    pub item: u32,
    pub n_samples: u32,
    pub mean: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsUpdatePayload {
    pub entries: Vec<StatsUpdateEntry>,
}
