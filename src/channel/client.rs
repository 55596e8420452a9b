//! Channel client (spec §4.3): connects to a channel socket, decodes
//! incoming frames, and writes outgoing ones. No auto-reconnect — that
//! policy lives in [`crate::bridge::client::TcpBridgeClient`] for the TCP
//! leg; a plain channel client only reports connect/disconnect/error.

use crate::error::ChannelError;
use crate::framing::{encode, FrameDecoder, Message};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Observable events emitted by a [`ChannelClient`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    Message(Message),
    Error(String),
}

struct ConnState {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    socket_path: PathBuf,
    connected: AtomicBool,
    max_frame_bytes: u32,
    events: broadcast::Sender<ClientEvent>,
    conn: Mutex<Option<ConnState>>,
}

/// A client connected to one channel's Unix socket.
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl ChannelClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                socket_path: socket_path.into(),
                connected: AtomicBool::new(false),
                max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
                events,
                conn: Mutex::new(None),
            }),
        }
    }

    /// Override the frame size cap, e.g. from a loaded
    /// [`crate::config::ChannelsConfig`]. Must be called before [`Self::connect`].
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_max_frame_bytes called before any clone of inner")
            .max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to client events. Register before sending — events
    /// dispatched before a receiver subscribes are lost.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Connect to the channel's socket. Fails with
    /// [`ChannelError::AlreadyConnected`] if already live.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::AlreadyConnected);
        }

        let stream = UnixStream::connect(&self.inner.socket_path).await?;
        let (mut read_half, mut write_half) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        self.inner.connected.store(true, Ordering::SeqCst);
        let _ = self.inner.events.send(ClientEvent::Connect);

        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            let mut decoder = FrameDecoder::with_max_size(inner.max_frame_bytes);
            let mut buf = [0u8; 8192];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => match decoder.push(&buf[..n]) {
                        Ok(messages) => {
                            for m in messages {
                                let _ = inner.events.send(ClientEvent::Message(m));
                            }
                        }
                        Err(e) => {
                            let _ = inner.events.send(ClientEvent::Error(e.to_string()));
                            break;
                        }
                    },
                    Err(e) if is_peer_reset(&e) => break,
                    Err(e) => {
                        let _ = inner.events.send(ClientEvent::Error(e.to_string()));
                        break;
                    }
                }
            }

            // Transport is gone regardless of why the loop above broke out —
            // drop the write side and clear connected state exactly once.
            if let Some(state) = inner.conn.lock().await.take() {
                for task in state.tasks {
                    task.abort();
                }
            }
            if inner.connected.swap(false, Ordering::SeqCst) {
                let _ = inner.events.send(ClientEvent::Disconnect);
            }
        });

        *self.inner.conn.lock().await = Some(ConnState {
            write_tx,
            tasks: vec![writer, reader],
        });

        Ok(())
    }

    /// Send a message. Fails with [`ChannelError::NotConnected`] if not
    /// currently connected.
    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let guard = self.inner.conn.lock().await;
        let Some(state) = guard.as_ref() else {
            return Err(ChannelError::NotConnected);
        };
        state
            .write_tx
            .send(encode(message))
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Idempotent disconnect.
    pub async fn disconnect(&self) {
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        if let Some(state) = self.inner.conn.lock().await.take() {
            for task in state.tasks {
                task.abort();
            }
        }
        if was_connected {
            let _ = self.inner.events.send(ClientEvent::Disconnect);
        }
    }
}

fn is_peer_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}

/// Shared handle, cheap to clone, used wherever a client must be held by
/// more than one coordination task (e.g. the queen's per-agent inbox
/// clients in [`crate::swarm::state`]).
pub type SharedClient = Arc<ChannelClient>;
