//! Drives a runtime's controller session from a scripted controller on a
//! local socket: init announcement, thread and MSU lifecycle with acks,
//! malformed-message tolerance, and the fatal missing-controller path.

use dataflow_runtime::message::{
    AckPayload, ControlHeader, ControlMsgType, CreateMsuPayload, CreateThreadPayload,
    DeleteMsuPayload, InitPayload, ModifyRoutePayload, MsuRoutesPayload, ReplyMsgType, RouteOp,
    ThreadMode, WireLocality, CONTROL_HEADER_LEN,
};
use dataflow_runtime::msu::{MsuContext, MsuKind, MsuTypeSpec};
use dataflow_runtime::net::controller::run_session;
use dataflow_runtime::routing::RouteStrategy;
use dataflow_runtime::runtime::{Runtime, RuntimeConfig};
use dataflow_runtime::{CoreError, CoreResult, Envelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const NOP_TYPE: u32 = 90;

struct Nop;
impl MsuKind for Nop {
    fn receive(&mut self, _ctx: &mut MsuContext<'_>, _env: Envelope) -> CoreResult<()> {
        Ok(())
    }
}

fn test_runtime() -> Arc<Runtime> {
    let runtime = Runtime::new(RuntimeConfig::new(3));
    runtime
        .types
        .register(MsuTypeSpec::new(
            NOP_TYPE,
            "nop",
            RouteStrategy::KeyBased,
            Arc::new(|_init: &[u8]| Ok(Box::new(Nop) as Box<dyn MsuKind>)),
        ))
        .unwrap();
    runtime
}

/// Controller-side frame helpers.
async fn send_raw(stream: &mut TcpStream, msg_type: u32, thread_id: u32, payload: Vec<u8>) {
    let header = ControlHeader::new(msg_type, thread_id, payload.len() as u32);
    stream.write_all(&header.encode()).await.unwrap();
    stream.write_all(&payload).await.unwrap();
}

async fn send_control(
    stream: &mut TcpStream,
    msg_type: ControlMsgType,
    thread_id: u32,
    payload: Vec<u8>,
) {
    send_raw(stream, msg_type as u32, thread_id, payload).await;
}

async fn read_reply(stream: &mut TcpStream) -> (ControlHeader, Vec<u8>) {
    let mut header_buf = [0u8; CONTROL_HEADER_LEN];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut header_buf))
        .await
        .expect("reply timed out")
        .unwrap();
    let header = ControlHeader::parse(&header_buf);
    let mut payload = vec![0u8; header.payload_size as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (header, payload)
}

async fn read_ack(stream: &mut TcpStream) -> (ReplyMsgType, AckPayload) {
    let (header, payload) = read_reply(stream).await;
    let kind = match header.msg_type {
        x if x == ReplyMsgType::Ack as u32 => ReplyMsgType::Ack,
        x if x == ReplyMsgType::Nack as u32 => ReplyMsgType::Nack,
        other => panic!("expected ack/nack, got reply type {other}"),
    };
    (kind, bincode::deserialize(&payload).unwrap())
}

#[tokio::test]
async fn session_drives_threads_and_msus_and_survives_garbage() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let runtime = test_runtime();
    let session_runtime = Arc::clone(&runtime);
    let session = tokio::spawn(async move { run_session(session_runtime, addr).await });

    let (mut controller, _) = listener.accept().await.unwrap();

    // The runtime announces itself first.
    let (header, payload) = read_reply(&mut controller).await;
    assert_eq!(header.msg_type, ReplyMsgType::Init as u32);
    let init: InitPayload = bincode::deserialize(&payload).unwrap();
    assert_eq!(init.runtime_id, 3);

    // CREATE_THREAD is acked from the IO plane.
    send_control(
        &mut controller,
        ControlMsgType::CreateThread,
        0,
        bincode::serialize(&CreateThreadPayload {
            thread_id: 1,
            mode: ThreadMode::Unpinned,
        })
        .unwrap(),
    )
    .await;
    let (kind, ack) = read_ack(&mut controller).await;
    assert_eq!(kind, ReplyMsgType::Ack);
    assert_eq!(ack.request, ControlMsgType::CreateThread as u32);
    assert_eq!(ack.target_id, 1);

    // CREATE_MSU executes on worker 1, which acks it.
    send_control(
        &mut controller,
        ControlMsgType::CreateMsu,
        1,
        bincode::serialize(&CreateMsuPayload {
            msu_id: 5,
            type_id: NOP_TYPE,
            init_data: Vec::new(),
        })
        .unwrap(),
    )
    .await;
    let (kind, ack) = read_ack(&mut controller).await;
    assert_eq!(kind, ReplyMsgType::Ack);
    assert_eq!(ack.target_id, 5);
    assert!(runtime.placements.contains(5));

    // A DELETE_MSU whose payload carries sizeof + 7 bytes: size
    // verification fails, the message is skipped and the session stays
    // open. No reply is produced for it.
    let mut padded = bincode::serialize(&DeleteMsuPayload { msu_id: 5 }).unwrap();
    padded.extend_from_slice(&[0u8; 7]);
    send_control(&mut controller, ControlMsgType::DeleteMsu, 1, padded).await;
    assert!(runtime.placements.contains(5));

    // A CREATE_MSU shorter than its fixed prefix is skipped the same way.
    send_control(&mut controller, ControlMsgType::CreateMsu, 1, vec![0u8; 9]).await;

    // So is a frame with an unknown type tag.
    send_raw(&mut controller, 99, 0, vec![1, 2, 3]).await;

    // MODIFY_ROUTE against a route that does not exist: NACKed, session
    // still healthy.
    send_control(
        &mut controller,
        ControlMsgType::ModifyRoute,
        0,
        bincode::serialize(&ModifyRoutePayload {
            route_id: 77,
            op: RouteOp::AddEndpoint,
            key: 0,
            msu_id: 5,
            locality: WireLocality::Local,
            runtime_id: 0,
        })
        .unwrap(),
    )
    .await;

    // DELETE_MSU afterwards still round-trips, proving the session
    // survived everything above in order.
    send_control(
        &mut controller,
        ControlMsgType::DeleteMsu,
        1,
        bincode::serialize(&DeleteMsuPayload { msu_id: 5 }).unwrap(),
    )
    .await;

    // The skipped messages produced no replies, so the next one on the
    // socket is the MODIFY_ROUTE nack.
    let (kind, nack) = read_ack(&mut controller).await;
    assert_eq!(kind, ReplyMsgType::Nack);
    assert_eq!(nack.request, ControlMsgType::ModifyRoute as u32);
    assert_eq!(nack.target_id, 77);
    assert_eq!(
        nack.error_code,
        CoreError::UnknownRoute(77).nack_code()
    );

    let (kind, ack) = read_ack(&mut controller).await;
    assert_eq!(kind, ReplyMsgType::Ack);
    assert_eq!(ack.request, ControlMsgType::DeleteMsu as u32);
    assert!(!runtime.placements.contains(5));

    // MSU_ROUTES for an unknown thread: nacked from the IO plane.
    send_control(
        &mut controller,
        ControlMsgType::MsuRoutes,
        9,
        bincode::serialize(&MsuRoutesPayload {
            msu_id: 5,
            route_ids: vec![1],
        })
        .unwrap(),
    )
    .await;
    let (kind, nack) = read_ack(&mut controller).await;
    assert_eq!(kind, ReplyMsgType::Nack);
    assert_eq!(nack.error_code, CoreError::UnknownThread(9).nack_code());

    // Clean close ends the session without error.
    drop(controller);
    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    runtime.shutdown();
}

#[tokio::test]
async fn missing_controller_is_fatal_config() {
    // Bind and drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let runtime = Runtime::new(RuntimeConfig::new(1));
    let err = run_session(runtime, addr).await.unwrap_err();
    assert!(matches!(err, CoreError::FatalConfig(_)));
}
