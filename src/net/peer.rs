//! # Inter-Runtime Communication Module
//!
//! Each peer runtime gets one long-lived TCP connection. Frames are the
//! peer format of [`crate::message`]; the first frame in each direction is
//! the handshake naming the sender's runtime id, and every envelope read
//! after it is stamped with that id as its origin.
//!
//! ## Task Layout
//!
//! Per connection the runtime spawns:
//!
//! - a **sender task** draining the peer's bounded outgoing queue and
//!   serializing writes to the socket, so workers wanting to send to a
//!   remote MSU enqueue and return immediately;
//! - a **reader task** blocking on full-frame reads and enqueueing each
//!   complete frame onto the destination MSU's worker queue.
//!
//! ## Failure and Reconnect
//!
//! A malformed frame, mid-frame close, or write error tears the connection
//! down: the peer is marked disconnected, the partial frame is dropped and
//! nothing of it is delivered. The connection is reopened only by the next
//! ADD_RUNTIME. ADD_RUNTIME for an already-connected peer is idempotent
//! and leaves the peer table untouched.

use crate::defaults;
use crate::error::{CoreError, CoreResult};
use crate::message::{handshake_frame, parse_handshake, Envelope, RuntimeId};
use crate::net::{configure_stream, is_eof, read_envelope};
use crate::runtime::Runtime;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One peer runtime: its address and, while connected, the sender side of
/// its outgoing queue.
pub struct Peer {
    pub runtime_id: RuntimeId,
    pub addr: Mutex<Option<SocketAddr>>,
    outgoing: Mutex<Option<mpsc::Sender<Envelope>>>,
    connected: AtomicBool,
    /// Envelopes dropped because the outgoing queue was full or the peer
    /// was down.
    dropped: AtomicU64,
}

impl Peer {
    fn new(runtime_id: RuntimeId) -> Self {
        Self {
            runtime_id,
            addr: Mutex::new(None),
            outgoing: Mutex::new(None),
            connected: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Guarded table of peer runtimes. The connection behind a peer id is
/// replaced atomically on reconnect; records survive disconnection so the
/// drop counters and addresses do too.
pub struct PeerTable {
    local_id: RuntimeId,
    peers: RwLock<HashMap<RuntimeId, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new(local_id: RuntimeId) -> Self {
        Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> RuntimeId {
        self.local_id
    }

    fn ensure(&self, runtime_id: RuntimeId) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().get(&runtime_id) {
            return Arc::clone(peer);
        }
        let mut peers = self.peers.write();
        Arc::clone(
            peers
                .entry(runtime_id)
                .or_insert_with(|| Arc::new(Peer::new(runtime_id))),
        )
    }

    pub fn get(&self, runtime_id: RuntimeId) -> CoreResult<Arc<Peer>> {
        self.peers
            .read()
            .get(&runtime_id)
            .cloned()
            .ok_or(CoreError::UnknownRuntime(runtime_id))
    }

    pub fn is_connected(&self, runtime_id: RuntimeId) -> bool {
        self.peers
            .read()
            .get(&runtime_id)
            .is_some_and(|p| p.is_connected())
    }

    pub fn runtime_ids(&self) -> Vec<RuntimeId> {
        let mut ids: Vec<RuntimeId> = self.peers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn install_connection(
        &self,
        runtime_id: RuntimeId,
        addr: Option<SocketAddr>,
        sender: mpsc::Sender<Envelope>,
    ) {
        let peer = self.ensure(runtime_id);
        if let Some(addr) = addr {
            *peer.addr.lock() = Some(addr);
        }
        *peer.outgoing.lock() = Some(sender);
        peer.connected.store(true, Ordering::Release);
    }

    /// Tear the connection down, dropping whatever sits in the outgoing
    /// queue. The record stays for the next ADD_RUNTIME.
    pub fn disconnect(&self, runtime_id: RuntimeId) {
        if let Some(peer) = self.peers.read().get(&runtime_id) {
            peer.connected.store(false, Ordering::Release);
            *peer.outgoing.lock() = None;
            debug!(runtime_id, "peer disconnected");
        }
    }

    pub fn disconnect_all(&self) {
        for id in self.runtime_ids() {
            self.disconnect(id);
        }
    }

    /// Hand an envelope to a peer's outgoing queue without blocking.
    ///
    /// A full queue or a down peer drops the envelope and counts it:
    /// backpressure, not an abort.
    pub fn try_send(&self, runtime_id: RuntimeId, env: Envelope) -> CoreResult<()> {
        let peer = self.get(runtime_id)?;
        let guard = peer.outgoing.lock();
        let Some(sender) = guard.as_ref() else {
            peer.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::UnknownRuntime(runtime_id));
        };
        match sender.try_send(env) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                peer.dropped.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::QueueFull {
                    capacity: defaults::PEER_QUEUE_CAPACITY,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                peer.dropped.fetch_add(1, Ordering::Relaxed);
                drop(guard);
                self.disconnect(runtime_id);
                Err(CoreError::UnknownRuntime(runtime_id))
            }
        }
    }
}

/// Handle ADD_RUNTIME: connect out to a peer, handshake, and start its
/// connection tasks. Idempotent for an already-connected peer.
pub async fn add_runtime(
    runtime: &Arc<Runtime>,
    peer_id: RuntimeId,
    addr: SocketAddr,
) -> CoreResult<()> {
    if runtime.peers.is_connected(peer_id) {
        debug!(peer_id, "ADD_RUNTIME for connected peer is a no-op");
        return Ok(());
    }
    let stream = TcpStream::connect(addr).await?;
    configure_stream(&stream)?;
    let (read_half, mut write_half) = stream.into_split();

    // Our handshake goes out before anything else on the connection.
    write_half
        .write_all(&handshake_frame(runtime.peers.local_id()))
        .await?;

    start_connection(runtime, peer_id, Some(addr), read_half, write_half, true);
    info!(peer_id, %addr, "connected to peer runtime");
    Ok(())
}

/// Accept loop for inbound peer connections.
///
/// An inbound connection identifies itself with its handshake frame; only
/// then is it registered in the peer table and answered with our own
/// handshake.
pub async fn serve_listener(runtime: Arc<Runtime>, addr: SocketAddr) -> CoreResult<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(runtime, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_on(runtime: Arc<Runtime>, listener: TcpListener) -> CoreResult<()> {
    info!(addr = %listener.local_addr()?, "listening for peer runtimes");
    loop {
        let (stream, remote) = listener.accept().await?;
        if let Err(err) = configure_stream(&stream) {
            warn!(%remote, %err, "could not configure inbound peer socket");
        }
        let rt = Arc::clone(&runtime);
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = stream.into_split();
            let first = match read_envelope(&mut read_half).await {
                Ok(env) => env,
                Err(err) => {
                    warn!(%remote, %err, "inbound peer closed before handshake");
                    return;
                }
            };
            let peer_id = match parse_handshake(&first) {
                Ok(id) => id,
                Err(err) => {
                    warn!(%remote, %err, "inbound connection rejected");
                    return;
                }
            };
            if let Err(err) = write_half
                .write_all(&handshake_frame(rt.peers.local_id()))
                .await
            {
                warn!(peer_id, %err, "could not answer peer handshake");
                return;
            }
            info!(peer_id, %remote, "peer runtime connected");
            start_connection(&rt, peer_id, None, read_half, write_half, false);
        });
    }
}

/// Wire a connected stream into the peer table: install the outgoing
/// queue, spawn the sender task and the reader task.
fn start_connection(
    runtime: &Arc<Runtime>,
    peer_id: RuntimeId,
    addr: Option<SocketAddr>,
    read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    expect_handshake: bool,
) {
    let (sender, mut outgoing) = mpsc::channel::<Envelope>(defaults::PEER_QUEUE_CAPACITY);
    runtime.peers.install_connection(peer_id, addr, sender);

    // Sender: single writer per peer serializes all frames to the socket.
    let rt = Arc::clone(runtime);
    tokio::spawn(async move {
        while let Some(env) = outgoing.recv().await {
            if let Err(err) = write_half.write_all(&env.to_frame()).await {
                warn!(peer_id, %err, "peer write failed");
                rt.peers.disconnect(peer_id);
                break;
            }
        }
    });

    // Reader: full-frame reads, origin stamping, local delivery.
    let rt = Arc::clone(runtime);
    tokio::spawn(async move {
        read_loop(rt, peer_id, read_half, expect_handshake).await;
    });
}

async fn read_loop(
    runtime: Arc<Runtime>,
    peer_id: RuntimeId,
    mut read_half: OwnedReadHalf,
    mut expect_handshake: bool,
) {
    loop {
        match read_envelope(&mut read_half).await {
            Ok(env) if expect_handshake => {
                expect_handshake = false;
                match parse_handshake(&env) {
                    Ok(advertised) if advertised == peer_id => {}
                    Ok(advertised) => {
                        warn!(peer_id, advertised, "peer handshake id mismatch; closing");
                        break;
                    }
                    Err(err) => {
                        warn!(peer_id, %err, "peer did not handshake; closing");
                        break;
                    }
                }
            }
            Ok(env) => {
                let env = env.with_origin(peer_id);
                if let Err(err) = runtime.dispatch_local(env) {
                    warn!(peer_id, %err, "dropping peer envelope");
                }
            }
            Err(err) => {
                // EOF or a malformed frame: either way the partial frame
                // is gone and the connection with it.
                if is_eof(&err) {
                    info!(peer_id, "peer connection closed");
                } else {
                    warn!(peer_id, %err, "peer connection failed");
                }
                break;
            }
        }
    }
    runtime.peers.disconnect(peer_id);
}
