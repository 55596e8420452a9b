//! TCP bridge server (spec §4.5): exposes one local channel to remote TCP
//! peers, fanning messages out between the local channel and every
//! connected peer.

use crate::bridge::client::BridgeStatus;
use crate::channel::client::{ChannelClient, ClientEvent};
use crate::error::BridgeError;
use crate::framing::{encode, FrameDecoder, Message};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

pub type PeerId = u64;

/// Observable events emitted by a [`TcpBridgeServer`].
#[derive(Debug, Clone)]
pub enum BridgeServerEvent {
    PeerConnect { peer_id: PeerId, addr: SocketAddr },
    PeerDisconnect { peer_id: PeerId },
    Error(String),
}

struct Peer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct Inner {
    local_socket_path: PathBuf,
    host: String,
    port: u16,
    max_frame_bytes: u32,
    local: Arc<ChannelClient>,
    peers: Mutex<HashMap<PeerId, Peer>>,
    next_peer_id: AtomicU64,
    events: broadcast::Sender<BridgeServerEvent>,
    status: Mutex<BridgeStatus>,
}

/// Server half of the TCP bridge: listens for TCP peers and relays every
/// message between them and one local channel.
pub struct TcpBridgeServer {
    inner: Arc<Inner>,
    running: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpBridgeServer {
    pub fn new(local_socket_path: impl Into<PathBuf>, host: impl Into<String>, port: u16) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        let local_socket_path = local_socket_path.into();
        Self {
            inner: Arc::new(Inner {
                local: Arc::new(ChannelClient::new(&local_socket_path)),
                local_socket_path,
                host: host.into(),
                port,
                max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
                peers: Mutex::new(HashMap::new()),
                next_peer_id: AtomicU64::new(1),
                events,
                status: Mutex::new(BridgeStatus::Stopped),
            }),
            running: AtomicBool::new(false),
            accept_task: Mutex::new(None),
            local_relay_task: Mutex::new(None),
        }
    }

    /// Override the frame size cap applied to the local channel client and
    /// every TCP peer connection, e.g. from a loaded
    /// [`crate::config::ChannelsConfig`]. Must be called before [`Self::start`].
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        {
            let inner = Arc::get_mut(&mut self.inner)
                .expect("with_max_frame_bytes called before any clone of inner");
            inner.max_frame_bytes = max_frame_bytes;
            inner.local = Arc::new(
                ChannelClient::new(&inner.local_socket_path).with_max_frame_bytes(max_frame_bytes),
            );
        }
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> BridgeStatus {
        *self.inner.status.lock().await
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    /// Connect to the local channel, install the local-to-peers relay
    /// handler, then bind the TCP listener and start accepting peers.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }

        self.inner.local.connect().await?;

        let relay_inner = self.inner.clone();
        let local_rx = self.inner.local.subscribe();
        let relay_task = tokio::spawn(relay_local_to_peers(relay_inner, local_rx));

        let listener = match TcpListener::bind((self.inner.host.as_str(), self.inner.port)).await {
            Ok(l) => l,
            Err(e) => {
                relay_task.abort();
                self.inner.local.disconnect().await;
                self.running.store(false, Ordering::SeqCst);
                return Err(BridgeError::Io(e));
            }
        };

        let accept_inner = self.inner.clone();
        let accept_task = tokio::spawn(accept_loop(accept_inner, listener));

        *self.accept_task.lock().await = Some(accept_task);
        *self.local_relay_task.lock().await = Some(relay_task);
        *self.inner.status.lock().await = BridgeStatus::Running;
        Ok(())
    }

    /// Stop accepting peers, tear down every peer connection, and
    /// disconnect from the local channel. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.inner.status.lock().await = BridgeStatus::Stopped;

        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.local_relay_task.lock().await.take() {
            handle.abort();
        }
        self.inner.peers.lock().await.clear();
        self.inner.local.disconnect().await;
    }
}

async fn relay_local_to_peers(inner: Arc<Inner>, mut rx: broadcast::Receiver<ClientEvent>) {
    loop {
        match rx.recv().await {
            Ok(ClientEvent::Message(m)) => {
                let frame = encode(&m);
                let peers = inner.peers.lock().await;
                for peer in peers.values() {
                    let _ = peer.tx.send(frame.clone());
                }
            }
            Ok(ClientEvent::Disconnect) => {
                *inner.status.lock().await = BridgeStatus::Error;
                let _ = inner
                    .events
                    .send(BridgeServerEvent::Error("local channel disconnected".to_string()));
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let peer_id = inner.next_peer_id.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_peer(inner.clone(), peer_id, addr, stream));
            }
            Err(e) => {
                let _ = inner.events.send(BridgeServerEvent::Error(e.to_string()));
                break;
            }
        }
    }
}

async fn handle_peer(
    inner: Arc<Inner>,
    peer_id: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    inner.peers.lock().await.insert(peer_id, Peer { tx });
    let _ = inner
        .events
        .send(BridgeServerEvent::PeerConnect { peer_id, addr });

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::with_max_size(inner.max_frame_bytes);
    let mut buf = [0u8; 8192];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match decoder.push(&buf[..n]) {
                Ok(messages) => {
                    for m in messages {
                        forward_peer_message(&inner, peer_id, &m).await;
                    }
                }
                Err(_) => break,
            },
            Err(_) => break,
        }
    }

    writer.abort();
    inner.peers.lock().await.remove(&peer_id);
    let _ = inner
        .events
        .send(BridgeServerEvent::PeerDisconnect { peer_id });
}

/// A message arriving from one TCP peer is sent to the local channel (whose
/// own fan-out then reaches every other local subscriber) and relayed
/// directly to every other connected TCP peer.
async fn forward_peer_message(inner: &Arc<Inner>, from_peer: PeerId, message: &Message) {
    let _ = inner.local.send(message).await;

    let frame = encode(message);
    let peers = inner.peers.lock().await;
    for (id, peer) in peers.iter() {
        if *id == from_peer {
            continue;
        }
        let _ = peer.tx.send(frame.clone());
    }
}
