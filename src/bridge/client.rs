//! TCP bridge client: the reconnect state machine (spec §4.6).
//!
//! Tunnels one local channel over TCP to a [`crate::bridge::server::TcpBridgeServer`].
//! `stopping` is the single cancellation signal: it cancels any pending
//! reconnect timer, destroys an in-flight connect, tears down a live TCP
//! socket, and suppresses the reconnect that a TCP close would otherwise
//! schedule.

use crate::channel::client::{ChannelClient, ClientEvent};
use crate::error::BridgeError;
use crate::framing::{encode, FrameDecoder, Message};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle status of a [`TcpBridgeClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Stopped,
    Running,
    Error,
}

/// Observable events emitted by a [`TcpBridgeClient`].
#[derive(Debug, Clone)]
pub enum BridgeClientEvent {
    TcpConnect,
    TcpDisconnect,
    Reconnecting { attempt: u32, delay: Duration },
    Error(String),
}

struct TcpConn {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

struct Inner {
    host: String,
    port: u16,
    should_reconnect: bool,
    initial_delay: Duration,
    max_delay: Duration,
    max_frame_bytes: u32,
    local: Arc<ChannelClient>,
    tcp: Mutex<Option<TcpConn>>,
    pending_connect: Mutex<Option<JoinHandle<std::io::Result<TcpStream>>>>,
    pending_timer: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    attempt: AtomicU32,
    status: Mutex<BridgeStatus>,
    events: broadcast::Sender<BridgeClientEvent>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

/// Client half of the TCP bridge: connects to a local channel and to a
/// remote bridge server, forwarding both directions and reconnecting with
/// jittered exponential backoff.
pub struct TcpBridgeClient {
    inner: Arc<Inner>,
}

impl TcpBridgeClient {
    pub fn new(
        local_socket_path: impl Into<std::path::PathBuf>,
        host: impl Into<String>,
        port: u16,
        should_reconnect: bool,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                should_reconnect,
                initial_delay,
                max_delay,
                max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
                local: Arc::new(ChannelClient::new(local_socket_path)),
                tcp: Mutex::new(None),
                pending_connect: Mutex::new(None),
                pending_timer: Mutex::new(None),
                stopping: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                status: Mutex::new(BridgeStatus::Stopped),
                events,
                forward_task: Mutex::new(None),
            }),
        }
    }

    /// Override the frame size cap applied to the local channel client and
    /// the TCP leg, e.g. from a loaded [`crate::config::ChannelsConfig`].
    /// Must be called before [`Self::start`].
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u32) -> Self {
        {
            let inner = Arc::get_mut(&mut self.inner)
                .expect("with_max_frame_bytes called before any clone of inner");
            inner.max_frame_bytes = max_frame_bytes;
            let local_socket_path = inner.local.socket_path().to_path_buf();
            inner.local =
                Arc::new(ChannelClient::new(local_socket_path).with_max_frame_bytes(max_frame_bytes));
        }
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeClientEvent> {
        self.inner.events.subscribe()
    }

    pub async fn status(&self) -> BridgeStatus {
        *self.inner.status.lock().await
    }

    /// Connect to the local channel, install the forward-to-TCP handler,
    /// and attempt the initial TCP connect. The initial connect is never
    /// retried on failure — only disconnects after a successful connect
    /// trigger the backoff loop.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.local.connect().await?;

        let local_rx = self.inner.local.subscribe();
        let inner = self.inner.clone();
        let forward = tokio::spawn(forward_local_to_tcp(inner, local_rx));
        *self.inner.forward_task.lock().await = Some(forward);

        if let Err(e) = connect_tcp(&self.inner).await {
            self.inner.local.disconnect().await;
            return Err(e);
        }

        *self.inner.status.lock().await = BridgeStatus::Running;
        Ok(())
    }

    /// Send a message directly to the local channel (primarily for tests
    /// driving the bridge from the library side).
    pub async fn send_local(&self, message: &Message) -> Result<(), BridgeError> {
        self.inner.local.send(message).await.map_err(Into::into)
    }

    /// Idempotent shutdown.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        *self.inner.status.lock().await = BridgeStatus::Stopped;

        if let Some(handle) = self.inner.pending_timer.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.pending_connect.lock().await.take() {
            handle.abort();
        }
        if let Some(conn) = self.inner.tcp.lock().await.take() {
            conn.reader_task.abort();
            conn.writer_task.abort();
        }
        if let Some(handle) = self.inner.forward_task.lock().await.take() {
            handle.abort();
        }
        self.inner.local.disconnect().await;
    }
}

async fn forward_local_to_tcp(inner: Arc<Inner>, mut rx: broadcast::Receiver<ClientEvent>) {
    loop {
        match rx.recv().await {
            Ok(ClientEvent::Message(m)) => {
                let guard = inner.tcp.lock().await;
                if let Some(conn) = guard.as_ref() {
                    let _ = conn.write_tx.send(encode(&m));
                }
            }
            Ok(ClientEvent::Disconnect) => {
                if inner.stopping.load(Ordering::SeqCst) {
                    continue;
                }
                *inner.status.lock().await = BridgeStatus::Error;
                let _ = inner
                    .events
                    .send(BridgeClientEvent::Error("local channel disconnected".to_string()));
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Attempt a single TCP connect. Keeps the in-flight task in
/// `pending_connect` so `stop()` can abort it mid-flight.
async fn connect_tcp(inner: &Arc<Inner>) -> Result<(), BridgeError> {
    let addr = format!("{}:{}", inner.host, inner.port);
    let handle = tokio::spawn(async move { TcpStream::connect(&addr).await });
    *inner.pending_connect.lock().await = Some(handle);

    if inner.stopping.load(Ordering::SeqCst) {
        if let Some(h) = inner.pending_connect.lock().await.take() {
            h.abort();
        }
        return Err(BridgeError::NotRunning);
    }

    let handle = inner.pending_connect.lock().await.take();
    let result = match handle {
        Some(h) => h.await,
        None => return Err(BridgeError::NotRunning),
    };
    if inner.stopping.load(Ordering::SeqCst) {
        return Err(BridgeError::NotRunning);
    }

    let stream = match result {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(BridgeError::Io(e)),
        Err(_join_err) => return Err(BridgeError::NotRunning),
    };

    install_tcp_connection(inner.clone(), stream).await;
    inner.attempt.store(0, Ordering::SeqCst);
    let _ = inner.events.send(BridgeClientEvent::TcpConnect);
    Ok(())
}

async fn install_tcp_connection(inner: Arc<Inner>, stream: TcpStream) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let reader_inner = inner.clone();
    let reader_task = tokio::spawn(async move {
        let mut decoder = FrameDecoder::with_max_size(reader_inner.max_frame_bytes);
        let mut buf = [0u8; 8192];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => match decoder.push(&buf[..n]) {
                    Ok(messages) => {
                        for m in messages {
                            // Failures forwarding to the local channel are
                            // swallowed: the local-disconnect handler on the
                            // channel client side covers that case.
                            let _ = reader_inner.local.send(&m).await;
                        }
                    }
                    Err(_) => break,
                },
                Err(_) => break,
            }
        }
        on_tcp_closed(reader_inner).await;
    });

    *inner.tcp.lock().await = Some(TcpConn {
        write_tx,
        reader_task,
        writer_task,
    });
}

async fn on_tcp_closed(inner: Arc<Inner>) {
    let was_connected = inner.tcp.lock().await.take().is_some();
    if !was_connected {
        return;
    }
    if inner.stopping.load(Ordering::SeqCst) {
        return;
    }
    *inner.status.lock().await = BridgeStatus::Error;
    let _ = inner.events.send(BridgeClientEvent::TcpDisconnect);
    schedule_reconnect(inner).await;
}

async fn schedule_reconnect(inner: Arc<Inner>) {
    if !inner.should_reconnect || inner.stopping.load(Ordering::SeqCst) {
        return;
    }

    let attempt = inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
    let base = inner
        .initial_delay
        .as_millis()
        .saturating_mul(1u128 << (attempt - 1).min(32));
    let jitter_factor = 0.75 + rand::rng().random::<f64>() * 0.5;
    let jittered = ((base as f64) * jitter_factor) as u128;
    let delay_ms = jittered.min(inner.max_delay.as_millis()) as u64;
    let delay = Duration::from_millis(delay_ms);

    let _ = inner.events.send(BridgeClientEvent::Reconnecting { attempt, delay });

    let timer_inner = inner.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        *timer_inner.pending_timer.lock().await = None;
        if timer_inner.stopping.load(Ordering::SeqCst) {
            return;
        }
        if connect_tcp(&timer_inner).await.is_err() {
            schedule_reconnect(timer_inner.clone()).await;
        } else {
            *timer_inner.status.lock().await = BridgeStatus::Running;
        }
    });
    *inner.pending_timer.lock().await = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::server::TcpBridgeServer;
    use crate::channel::server::ChannelServer;
    use tempfile::tempdir;

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn bridges_messages_in_both_directions() {
        let dir = tempdir().unwrap();
        let server_local = dir.path().join("server_local.sock");
        let client_local = dir.path().join("client_local.sock");

        let server_channel = ChannelServer::new(&server_local, false);
        server_channel.start().await.unwrap();
        let client_channel = ChannelServer::new(&client_local, false);
        client_channel.start().await.unwrap();

        let port = free_port().await;
        let bridge_server = TcpBridgeServer::new(&server_local, "127.0.0.1", port);
        bridge_server.start().await.unwrap();

        let bridge_client = TcpBridgeClient::new(
            &client_local,
            "127.0.0.1",
            port,
            false,
            Duration::from_millis(50),
            Duration::from_millis(400),
        );
        bridge_client.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let server_side_observer = crate::channel::client::ChannelClient::new(&server_local);
        server_side_observer.connect().await.unwrap();
        let mut server_side_rx = server_side_observer.subscribe();

        let client_side_observer = crate::channel::client::ChannelClient::new(&client_local);
        client_side_observer.connect().await.unwrap();
        let mut client_side_rx = client_side_observer.subscribe();

        tokio::time::sleep(Duration::from_millis(50)).await;

        bridge_client
            .send_local(&Message::new("from-client"))
            .await
            .unwrap();

        let got = loop {
            match server_side_rx.recv().await.unwrap() {
                ClientEvent::Message(m) => break m,
                _ => continue,
            }
        };
        assert_eq!(got.msg, "from-client");

        server_side_observer.send(&Message::new("from-server")).await.unwrap();
        let got2 = loop {
            match client_side_rx.recv().await.unwrap() {
                ClientEvent::Message(m) => break m,
                _ => continue,
            }
        };
        assert_eq!(got2.msg, "from-server");

        bridge_client.stop().await;
        bridge_server.stop().await;
        server_channel.stop().await;
        client_channel.stop().await;
    }

    #[tokio::test]
    async fn reconnect_backoff_emits_growing_delays_within_bounds() {
        let dir = tempdir().unwrap();
        let client_local = dir.path().join("backoff_local.sock");
        let client_channel = ChannelServer::new(&client_local, false);
        client_channel.start().await.unwrap();

        let port = free_port().await;
        // Bind briefly so the initial connect succeeds, then drop the
        // listener so subsequent reconnects exercise the backoff loop.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let bridge_client = TcpBridgeClient::new(
            &client_local,
            "127.0.0.1",
            port,
            true,
            Duration::from_millis(50),
            Duration::from_millis(400),
        );
        bridge_client.start().await.unwrap();
        let mut events = bridge_client.subscribe();

        accept_task.await.unwrap();
        // Force-close by dropping: nothing left to do, the peer we
        // accepted above is dropped when `accept_task` completes, closing
        // the connection from the server side.

        let mut delays = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
        while delays.len() < 3 && tokio::time::Instant::now() < deadline {
            if let Ok(Ok(BridgeClientEvent::Reconnecting { delay, .. })) =
                tokio::time::timeout(Duration::from_millis(1500), events.recv()).await
            {
                delays.push(delay);
            }
        }

        assert!(delays.len() >= 3, "expected at least 3 reconnect attempts, got {}", delays.len());
        assert!(delays[0] >= Duration::from_millis(37) && delays[0] <= Duration::from_millis(63));
        for d in &delays {
            assert!(*d <= Duration::from_millis(400));
        }

        bridge_client.stop().await;
        client_channel.stop().await;
    }

    #[tokio::test]
    async fn no_reconnect_flag_suppresses_reconnecting_events() {
        let dir = tempdir().unwrap();
        let client_local = dir.path().join("noreconnect_local.sock");
        let client_channel = ChannelServer::new(&client_local, false);
        client_channel.start().await.unwrap();

        let port = free_port().await;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let bridge_client = TcpBridgeClient::new(
            &client_local,
            "127.0.0.1",
            port,
            false,
            Duration::from_millis(50),
            Duration::from_millis(400),
        );
        bridge_client.start().await.unwrap();
        let mut events = bridge_client.subscribe();
        accept_task.await.unwrap();

        let saw_reconnecting = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                if let Ok(BridgeClientEvent::Reconnecting { .. }) = events.recv().await {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);

        assert!(!saw_reconnecting);
        bridge_client.stop().await;
        client_channel.stop().await;
    }

    #[tokio::test]
    async fn local_channel_disconnect_sets_error_status() {
        let dir = tempdir().unwrap();
        let client_local = dir.path().join("local-disconnect-client.sock");
        let client_channel = ChannelServer::new(&client_local, false);
        client_channel.start().await.unwrap();

        let port = free_port().await;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let bridge_client = TcpBridgeClient::new(
            &client_local,
            "127.0.0.1",
            port,
            false,
            Duration::from_millis(50),
            Duration::from_millis(400),
        );
        bridge_client.start().await.unwrap();
        accept_task.await.unwrap();
        let mut events = bridge_client.subscribe();

        // Kill the local channel out from under the bridge, not via stop().
        client_channel.stop().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            assert!(!remaining.is_zero(), "expected a local-disconnect error event");
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(BridgeClientEvent::Error(msg))) => {
                    assert_eq!(msg, "local channel disconnected");
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => panic!("expected a local-disconnect error event"),
            }
        }
        assert_eq!(bridge_client.status().await, BridgeStatus::Error);

        bridge_client.stop().await;
    }
}
