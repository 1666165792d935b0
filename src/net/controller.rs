//! # Controller Communication Module
//!
//! The runtime keeps a single TCP connection to the global controller. The
//! controller drives reconfiguration over it (frame format
//! `[u32 type][u32 thread_id][u32 payload_size]`); the runtime answers on
//! the same socket with replies from the reply type space (INIT, ACK,
//! NACK, STATS_UPDATE).
//!
//! ## Dispatch Discipline
//!
//! On every frame the handler first verifies `payload_size` against the
//! expected size for the type. A mismatch or an unknown type is
//! `MalformedControlMsg`: the payload is consumed to stay in frame sync,
//! the message is skipped and counted, and the session stays open.
//! Well-formed worker-targeted actions (CREATE_MSU, DELETE_MSU,
//! MSU_ROUTES, DELETE_THREAD's stop) are translated into typed control
//! commands and enqueued on the target worker's control channel, so MSU
//! state is only ever touched by its owning thread; those workers send the
//! ACK/NACK themselves once the action ran. IO-plane actions (ADD_RUNTIME,
//! MODIFY_ROUTE, CREATE_THREAD) execute right here and are acked inline.
//!
//! Replies are at-most-once per request and best-effort; the controller
//! reconciles through the periodic stats updates.

use crate::error::{CoreError, CoreResult};
use crate::message::{
    verify_payload_size, AckPayload, AddRuntimePayload, ControlHeader, ControlMsgType,
    CreateMsuPayload, CreateThreadPayload, DeleteMsuPayload, DeleteThreadPayload, InitPayload,
    MsuRoutesPayload, ModifyRoutePayload, ReplyMsgType, StatsUpdatePayload, CONTROL_HEADER_LEN,
};
use crate::net::{configure_stream, is_eof};
use crate::runtime::Runtime;
use crate::worker::{spawn_worker, ControlCommand};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A reply queued for the controller.
#[derive(Debug, Clone)]
pub enum ControllerReply {
    Init {
        runtime_id: u32,
    },
    Ack {
        request: ControlMsgType,
        target_id: u32,
    },
    Nack {
        request: ControlMsgType,
        target_id: u32,
        error_code: u32,
    },
    Stats(StatsUpdatePayload),
}

impl ControllerReply {
    /// Shape an ACK or NACK from an action's outcome.
    pub fn for_result(request: ControlMsgType, target_id: u32, result: &CoreResult<()>) -> Self {
        match result {
            Ok(()) => ControllerReply::Ack { request, target_id },
            Err(err) => ControllerReply::Nack {
                request,
                target_id,
                error_code: err.nack_code(),
            },
        }
    }

    /// Encode as a controller frame (header plus bincode payload).
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let (msg_type, payload) = match self {
            ControllerReply::Init { runtime_id } => (
                ReplyMsgType::Init,
                bincode::serialize(&InitPayload {
                    runtime_id: *runtime_id,
                })?,
            ),
            ControllerReply::Ack { request, target_id } => (
                ReplyMsgType::Ack,
                bincode::serialize(&AckPayload {
                    request: *request as u32,
                    target_id: *target_id,
                    error_code: 0,
                })?,
            ),
            ControllerReply::Nack {
                request,
                target_id,
                error_code,
            } => (
                ReplyMsgType::Nack,
                bincode::serialize(&AckPayload {
                    request: *request as u32,
                    target_id: *target_id,
                    error_code: *error_code,
                })?,
            ),
            ControllerReply::Stats(update) => {
                (ReplyMsgType::StatsUpdate, bincode::serialize(update)?)
            }
        };
        let header = ControlHeader::new(msg_type as u32, 0, payload.len() as u32);
        let mut frame = Vec::with_capacity(CONTROL_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Connect to the controller and run the session until it closes.
///
/// A connection failure at startup is fatal configuration: without its
/// controller the runtime has no source of truth for the graph.
pub async fn run_session(runtime: Arc<Runtime>, addr: SocketAddr) -> CoreResult<()> {
    let stream = TcpStream::connect(addr).await.map_err(|err| {
        CoreError::FatalConfig(format!("cannot reach controller at {addr}: {err}"))
    })?;
    configure_stream(&stream)?;
    info!(%addr, "connected to controller");

    let (mut read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ControllerReply>();
    runtime.set_reply_sender(reply_tx.clone());

    // Announce ourselves before anything else travels the socket.
    let init = ControllerReply::Init {
        runtime_id: runtime.config.local_runtime_id,
    }
    .encode()?;
    write_half.write_all(&init).await?;

    // Writer half: one task serializes every queued reply.
    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let frame = match reply.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "could not encode controller reply");
                    continue;
                }
            };
            if let Err(err) = write_half.write_all(&frame).await {
                warn!(%err, "controller write failed");
                break;
            }
        }
    });

    let result = read_session(&runtime, &mut read_half).await;
    writer.abort();
    result
}

async fn read_session(runtime: &Arc<Runtime>, reader: &mut OwnedReadHalf) -> CoreResult<()> {
    loop {
        let mut header_buf = [0u8; CONTROL_HEADER_LEN];
        if let Err(err) = reader.read_exact(&mut header_buf).await {
            let err = CoreError::from(err);
            if is_eof(&err) {
                info!("controller closed the session");
                return Ok(());
            }
            return Err(err);
        }
        let header = ControlHeader::parse(&header_buf);
        handle_frame(runtime, header, reader).await?;
    }
}

/// Process one controller frame. Only I/O errors propagate; malformed
/// messages are skipped so the session survives them.
async fn handle_frame(
    runtime: &Arc<Runtime>,
    header: ControlHeader,
    reader: &mut OwnedReadHalf,
) -> CoreResult<()> {
    let payload_size = header.payload_size as usize;
    if payload_size > crate::defaults::MAX_FRAME_PAYLOAD {
        // Can't skip what we can't size-bound; the framing itself is gone.
        return Err(CoreError::MalformedControlMsg {
            reason: format!("implausible control payload size {payload_size}"),
        });
    }

    // Consume the payload unconditionally so a bad message leaves the
    // stream aligned on the next frame.
    let mut payload = vec![0u8; payload_size];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    let msg_type = match ControlMsgType::from_wire(header.msg_type) {
        Ok(msg_type) => msg_type,
        Err(err) => {
            warn!(raw_type = header.msg_type, %err, "skipping control message");
            return Ok(());
        }
    };
    if let Err(err) = verify_payload_size(msg_type, payload_size) {
        warn!(?msg_type, %err, "skipping control message");
        return Ok(());
    }

    if let Err(err) = dispatch_control(runtime, msg_type, header.thread_id, &payload).await {
        warn!(?msg_type, thread_id = header.thread_id, %err, "control action failed");
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> CoreResult<T> {
    bincode::deserialize(payload).map_err(|err| CoreError::MalformedControlMsg {
        reason: format!("payload decode failed: {err}"),
    })
}

/// Route a well-formed control message to its executor.
///
/// IO-plane actions run inline and are acked here; worker-targeted
/// actions are enqueued and acked by the owning worker.
async fn dispatch_control(
    runtime: &Arc<Runtime>,
    msg_type: ControlMsgType,
    thread_id: u32,
    payload: &[u8],
) -> CoreResult<()> {
    match msg_type {
        ControlMsgType::AddRuntime => {
            let msg: AddRuntimePayload = decode(payload)?;
            let addr = SocketAddr::from((Ipv4Addr::from(msg.ip), msg.port));
            let result = crate::net::peer::add_runtime(runtime, msg.runtime_id, addr).await;
            runtime.send_reply(ControllerReply::for_result(
                msg_type,
                msg.runtime_id,
                &result,
            ));
            result
        }
        ControlMsgType::CreateThread => {
            let msg: CreateThreadPayload = decode(payload)?;
            let result = spawn_worker(runtime, msg.thread_id, msg.mode).map(|_| ());
            runtime.send_reply(ControllerReply::for_result(msg_type, msg.thread_id, &result));
            result
        }
        ControlMsgType::DeleteThread => {
            let msg: DeleteThreadPayload = decode(payload)?;
            let result = runtime
                .workers
                .get(msg.thread_id)
                .map(|worker| worker.push_ctrl(ControlCommand::Stop));
            runtime.send_reply(ControllerReply::for_result(msg_type, msg.thread_id, &result));
            result
        }
        ControlMsgType::CreateMsu => {
            let msg: CreateMsuPayload = decode(payload)?;
            let msu_id = msg.msu_id;
            let result = runtime.workers.get(thread_id).map(|worker| {
                worker.push_ctrl(ControlCommand::CreateMsu {
                    msu_id: msg.msu_id,
                    type_id: msg.type_id,
                    init_data: msg.init_data,
                    completion: None,
                })
            });
            if result.is_err() {
                // The worker would have acked; with no worker, nack here.
                runtime.send_reply(ControllerReply::for_result(msg_type, msu_id, &result));
            }
            result
        }
        ControlMsgType::DeleteMsu => {
            let msg: DeleteMsuPayload = decode(payload)?;
            let result = runtime
                .workers
                .get(thread_id)
                .map(|worker| worker.push_ctrl(ControlCommand::DeleteMsu { msu_id: msg.msu_id }));
            if result.is_err() {
                runtime.send_reply(ControllerReply::for_result(msg_type, msg.msu_id, &result));
            }
            result
        }
        ControlMsgType::MsuRoutes => {
            let msg: MsuRoutesPayload = decode(payload)?;
            let msu_id = msg.msu_id;
            let result = runtime.workers.get(thread_id).map(|worker| {
                worker.push_ctrl(ControlCommand::AttachRoutes {
                    msu_id: msg.msu_id,
                    route_ids: msg.route_ids,
                })
            });
            if result.is_err() {
                runtime.send_reply(ControllerReply::for_result(msg_type, msu_id, &result));
            }
            result
        }
        ControlMsgType::ModifyRoute => {
            let msg: ModifyRoutePayload = decode(payload)?;
            let result = runtime.routes.apply_modify(&msg);
            debug!(route_id = msg.route_id, op = ?msg.op, ok = result.is_ok(), "route mutation");
            runtime.send_reply(ControllerReply::for_result(msg_type, msg.route_id, &result));
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_frames_parse_back_as_control_headers() {
        let reply = ControllerReply::Nack {
            request: ControlMsgType::CreateMsu,
            target_id: 12,
            error_code: 4,
        };
        let frame = reply.encode().unwrap();
        let mut header_buf = [0u8; CONTROL_HEADER_LEN];
        header_buf.copy_from_slice(&frame[..CONTROL_HEADER_LEN]);
        let header = ControlHeader::parse(&header_buf);
        assert_eq!(header.msg_type, ReplyMsgType::Nack as u32);
        assert_eq!(header.payload_size as usize, frame.len() - CONTROL_HEADER_LEN);

        let ack: AckPayload = bincode::deserialize(&frame[CONTROL_HEADER_LEN..]).unwrap();
        assert_eq!(ack.request, ControlMsgType::CreateMsu as u32);
        assert_eq!(ack.target_id, 12);
        assert_eq!(ack.error_code, 4);
    }

    #[test]
    fn ack_and_nack_follow_the_result() {
        let ok: CoreResult<()> = Ok(());
        assert!(matches!(
            ControllerReply::for_result(ControlMsgType::CreateThread, 2, &ok),
            ControllerReply::Ack { target_id: 2, .. }
        ));
        let err: CoreResult<()> = Err(CoreError::UnknownThread(2));
        assert!(matches!(
            ControllerReply::for_result(ControlMsgType::DeleteThread, 2, &err),
            ControllerReply::Nack { target_id: 2, .. }
        ));
    }
}
