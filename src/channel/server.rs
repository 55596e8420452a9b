//! Unix-domain-socket fan-out channel server (spec §4.2).

use crate::config::STALE_SOCKET_PROBE_TIMEOUT;
use crate::error::ChannelError;
use crate::framing::{encode, FrameDecoder, Message};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Opaque per-connection client identifier, e.g. `client-3`.
pub type ClientId = u64;

/// Observable events emitted by a [`ChannelServer`].
///
/// Register a receiver before sending traffic through the channel —
/// broadcast delivery is live-only, so handlers installed after the first
/// message will miss it.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connect { client_id: ClientId },
    Disconnect { client_id: ClientId },
    Message { message: Message, client_id: ClientId },
    Error { client_id: Option<ClientId>, message: String },
}

struct ClientHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct ServerInner {
    socket_path: PathBuf,
    echo_to_sender: bool,
    max_frame_bytes: u32,
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    next_client_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
}

/// A single Unix-domain-socket fan-out server: every client's message is
/// relayed to every other connected client (sender excluded unless
/// `echo_to_sender` is set).
pub struct ChannelServer {
    inner: Arc<ServerInner>,
    started: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelServer {
    /// Construct a server bound to `socket_path`, not yet started.
    pub fn new(socket_path: impl Into<PathBuf>, echo_to_sender: bool) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(ServerInner {
                socket_path: socket_path.into(),
                echo_to_sender,
                max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
                clients: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(0),
                events,
            }),
            started: AtomicBool::new(false),
            accept_task: Mutex::new(None),
        }
    }

    /// Override the per-connection frame size cap, e.g. from a loaded
    /// [`crate::config::ChannelsConfig`]. Must be called before [`Self::start`].
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_max_frame_bytes called before any clone of inner")
            .max_frame_bytes = max_frame_bytes;
        self
    }

    /// Subscribe to server events. May be called any number of times;
    /// replacing a handler is just dropping the old receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub async fn client_count(&self) -> usize {
        self.inner.clients.lock().await.len()
    }

    /// Bind the listener, replacing a stale (non-listening) socket file if
    /// one exists. Fails with [`ChannelError::SocketInUse`] if a live
    /// listener already owns the path.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ChannelError::AlreadyStarted);
        }

        clean_stale_socket(&self.inner.socket_path).await?;

        if let Some(parent) = self.inner.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&self.inner.socket_path)?;
        self.started.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        spawn_connection(inner.clone(), stream);
                    }
                    Err(e) => {
                        let _ = inner.events.send(ServerEvent::Error {
                            client_id: None,
                            message: e.to_string(),
                        });
                    }
                }
            }
        });
        *self.accept_task.lock().await = Some(handle);

        Ok(())
    }

    /// Send `message` to every connected client, regardless of sender.
    pub async fn broadcast(&self, message: &Message) {
        self.fan_out(message, None).await;
    }

    /// Fan out `message` to every client except `sender_id` (unless
    /// `echo_to_sender` is set, in which case the sender also receives it).
    pub async fn fan_out(&self, message: &Message, sender_id: Option<ClientId>) {
        let frame = encode(message);
        let snapshot: Vec<(ClientId, mpsc::UnboundedSender<Vec<u8>>)> = {
            let clients = self.inner.clients.lock().await;
            clients.iter().map(|(id, h)| (*id, h.tx.clone())).collect()
        };

        for (id, tx) in snapshot {
            if !self.inner.echo_to_sender && Some(id) == sender_id {
                continue;
            }
            // A full/closed channel just drops this client; the reader/writer
            // task will emit Disconnect when it notices the stream is gone.
            let _ = tx.send(frame.clone());
        }
    }

    /// Idempotent shutdown: disconnects every client, stops accepting new
    /// connections, and unlinks the socket file.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }

        self.inner.clients.lock().await.clear();
        let _ = tokio::fs::remove_file(&self.inner.socket_path).await;
    }
}

/// Probe `path`: if a file exists there and a connection succeeds within
/// [`STALE_SOCKET_PROBE_TIMEOUT`], the socket is live and in use. Otherwise
/// any stale file at that path is removed.
async fn clean_stale_socket(path: &Path) -> Result<(), ChannelError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }

    let probe = tokio::time::timeout(STALE_SOCKET_PROBE_TIMEOUT, UnixStream::connect(path)).await;
    match probe {
        Ok(Ok(stream)) => {
            drop(stream);
            Err(ChannelError::SocketInUse(path.to_path_buf()))
        }
        _ => {
            let _ = tokio::fs::remove_file(path).await;
            Ok(())
        }
    }
}

fn spawn_connection(inner: Arc<ServerInner>, stream: UnixStream) {
    tokio::spawn(async move {
        let client_id = inner.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        inner
            .clients
            .lock()
            .await
            .insert(client_id, ClientHandle { tx });
        let _ = inner.events.send(ServerEvent::Connect { client_id });

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
                        for message in messages {
                            let _ = inner.events.send(ServerEvent::Message {
                                message: message.clone(),
                                client_id,
                            });
                            fan_out_from(&inner, &message, client_id).await;
                        }
                    }
                    Err(e) => {
                        let _ = inner.events.send(ServerEvent::Error {
                            client_id: Some(client_id),
                            message: e.to_string(),
                        });
                        break;
                    }
                },
                Err(e) if is_peer_reset(&e) => break,
                Err(e) => {
                    let _ = inner.events.send(ServerEvent::Error {
                        client_id: Some(client_id),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        writer.abort();
        inner.clients.lock().await.remove(&client_id);
        let _ = inner.events.send(ServerEvent::Disconnect { client_id });
    });
}

async fn fan_out_from(inner: &Arc<ServerInner>, message: &Message, sender_id: ClientId) {
    let frame = encode(message);
    let snapshot: Vec<(ClientId, mpsc::UnboundedSender<Vec<u8>>)> = {
        let clients = inner.clients.lock().await;
        clients.iter().map(|(id, h)| (*id, h.tx.clone())).collect()
    };

    for (id, tx) in snapshot {
        if !inner.echo_to_sender && id == sender_id {
            continue;
        }
        let _ = tx.send(frame.clone());
    }
}

fn is_peer_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}
