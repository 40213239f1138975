//! Reconnecting secure channel to the relay.
//!
//! Owns the websocket connection and the payload cipher. Everything
//! that leaves here is a sealed frame; everything that arrives is
//! opened and authenticated before the session sees it. Connection
//! loss is handled internally: exponential backoff, capped, never
//! abandoned short of an explicit stop. Updates sent while offline are
//! queued and replayed after reconnect; every reconnect re-joins the
//! room and surfaces `Connected` so the session re-runs its sync
//! handshake and republishes presence.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::access::AccessCredential;
use crate::cipher::{CipherError, PayloadCipher};
use crate::protocol::{FrameKind, JoinRequest, ProtocolError, RelayFrame, SyncMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the owning session.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Joined (or re-joined) the room; `peers` were already present.
    Connected { peers: usize },
    /// The relay rejected our access proof. Fatal for this attempt.
    Denied { reason: String },
    /// Connection lost; reconnection is already underway.
    Disconnected,
    /// Backoff before reconnect attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// A decrypted message from a peer.
    Message(SyncMessage),
}

/// Channel errors.
#[derive(Debug)]
pub enum ChannelError {
    /// `start` called twice.
    AlreadyStarted,
    /// The channel task is gone.
    Closed,
    Cipher(CipherError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::AlreadyStarted => write!(f, "Channel already started"),
            ChannelError::Closed => write!(f, "Channel closed"),
            ChannelError::Cipher(e) => write!(f, "Cipher error: {e}"),
            ChannelError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<CipherError> for ChannelError {
    fn from(e: CipherError) -> Self {
        ChannelError::Cipher(e)
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        ChannelError::Protocol(e)
    }
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub relay_url: String,
    pub credential: AccessCredential,
    /// Our participant id, stamped into buffered snapshots.
    pub participant_id: Uuid,
    /// Ask the relay to retain snapshots for async joiners.
    pub buffering: bool,
    /// First reconnect delay; doubles per attempt.
    pub initial_backoff: Duration,
    /// Backoff cap. Retries continue at this pace forever.
    pub max_backoff: Duration,
    /// How long to wait for the relay's welcome before treating the
    /// attempt as failed.
    pub welcome_timeout: Duration,
    /// Bound on the offline replay queue.
    pub offline_queue_limit: usize,
}

impl ChannelConfig {
    pub fn new(
        relay_url: impl Into<String>,
        credential: AccessCredential,
        participant_id: Uuid,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            credential,
            participant_id,
            buffering: false,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            welcome_timeout: Duration::from_secs(10),
            offline_queue_limit: 1024,
        }
    }
}

/// Sealed frames waiting for the connection to come back.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    /// Queue a frame for replay. Returns `false` (dropping the frame)
    /// when full; the next sync handshake recovers the data anyway.
    pub fn enqueue(&mut self, frame: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|f| f.len()).sum()
    }
}

enum Command {
    Send { frame: Vec<u8>, queue_offline: bool },
    Stop,
}

struct Boot {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<ChannelEvent>,
}

struct ChannelInner {
    config: ChannelConfig,
    cipher: PayloadCipher,
    state: RwLock<ConnectionState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    boot: Mutex<Option<Boot>>,
}

/// The secure channel handle. Clones share the underlying connection.
pub struct SecureChannel {
    inner: Arc<ChannelInner>,
    event_rx: Option<mpsc::Receiver<ChannelEvent>>,
}

impl Clone for SecureChannel {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            event_rx: None,
        }
    }
}

impl SecureChannel {
    pub fn new(config: ChannelConfig, cipher: PayloadCipher) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            config,
            cipher,
            state: RwLock::new(ConnectionState::Disconnected),
            cmd_tx,
            boot: Mutex::new(Some(Boot { cmd_rx, event_tx })),
        });
        Self {
            inner,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection supervisor. It joins, reconnects with
    /// backoff, and keeps running until `stop` or a deny.
    pub fn start(&self) -> Result<tokio::task::JoinHandle<()>, ChannelError> {
        let boot = self
            .inner
            .boot
            .lock()
            .unwrap()
            .take()
            .ok_or(ChannelError::AlreadyStarted)?;
        let inner = self.inner.clone();
        Ok(tokio::spawn(supervise(inner, boot.cmd_rx, boot.event_tx)))
    }

    /// Seal and send one sync message. Updates are queued for replay
    /// when offline; presence and handshake traffic is dropped instead
    /// (it is refreshed on reconnect anyway).
    pub fn send(&self, msg: &SyncMessage) -> Result<(), ChannelError> {
        let queue_offline = matches!(
            msg,
            SyncMessage::Update { .. } | SyncMessage::SyncResponse { .. }
        );
        let sealed = self.inner.cipher.seal(&msg.encode()?)?;
        let frame = RelayFrame::frame(self.inner.config.credential.room_id, sealed).encode()?;
        self.inner
            .cmd_tx
            .send(Command::Send {
                frame,
                queue_offline,
            })
            .map_err(|_| ChannelError::Closed)
    }

    /// Seal a full-state snapshot and hand it to the relay to retain
    /// for participants who join while nobody is online.
    pub fn push_snapshot(&self, update: Vec<u8>) -> Result<(), ChannelError> {
        let msg = SyncMessage::SyncResponse {
            participant_id: self.inner.config.participant_id,
            update,
        };
        let sealed = self.inner.cipher.seal(&msg.encode()?)?;
        let frame = RelayFrame::buffer(self.inner.config.credential.room_id, sealed).encode()?;
        self.inner
            .cmd_tx
            .send(Command::Send {
                frame,
                queue_offline: false,
            })
            .map_err(|_| ChannelError::Closed)
    }

    /// Stop the supervisor and close the connection.
    pub fn stop(&self) {
        let _ = self.inner.cmd_tx.send(Command::Stop);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub fn relay_url(&self) -> &str {
        &self.inner.config.relay_url
    }
}

fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << exponent).min(max)
}

enum ServeEnd {
    Stop,
    ConnectionLost,
    Denied(String),
}

enum WelcomeOutcome {
    Welcome { peers: usize },
    Denied(String),
    Failed,
}

async fn supervise(
    inner: Arc<ChannelInner>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<ChannelEvent>,
) {
    let mut queue = OfflineQueue::new(inner.config.offline_queue_limit);
    let mut attempt: u32 = 0;

    'outer: loop {
        *inner.state.write().await = if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };

        let stream = match tokio_tungstenite::connect_async(&inner.config.relay_url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::debug!("Relay connect failed: {e}");
                if !backoff_pause(&inner, &mut cmd_rx, &mut queue, &event_tx, &mut attempt).await {
                    break 'outer;
                }
                continue;
            }
        };
        let (mut ws_sink, mut ws_reader) = stream.split();

        if send_join(&inner, &mut ws_sink).await.is_err() {
            if !backoff_pause(&inner, &mut cmd_rx, &mut queue, &event_tx, &mut attempt).await {
                break 'outer;
            }
            continue;
        }

        match wait_welcome(&mut ws_reader, inner.config.welcome_timeout).await {
            WelcomeOutcome::Welcome { peers } => {
                attempt = 0;
                *inner.state.write().await = ConnectionState::Connected;
                let _ = event_tx.send(ChannelEvent::Connected { peers }).await;

                // Replay anything written while we were away.
                let backlog = queue.drain();
                if !backlog.is_empty() {
                    log::info!("Replaying {} queued frames", backlog.len());
                }
                let mut replay_failed = false;
                for frame in backlog {
                    if ws_sink
                        .send(Message::Binary(frame.clone().into()))
                        .await
                        .is_err()
                    {
                        queue.enqueue(frame);
                        replay_failed = true;
                        break;
                    }
                }
                if replay_failed {
                    let _ = event_tx.send(ChannelEvent::Disconnected).await;
                    if !backoff_pause(&inner, &mut cmd_rx, &mut queue, &event_tx, &mut attempt)
                        .await
                    {
                        break 'outer;
                    }
                    continue;
                }

                match serve(
                    &inner,
                    &mut ws_sink,
                    &mut ws_reader,
                    &mut cmd_rx,
                    &mut queue,
                    &event_tx,
                )
                .await
                {
                    ServeEnd::Stop => {
                        let _ = ws_sink.close().await;
                        break 'outer;
                    }
                    ServeEnd::Denied(reason) => {
                        let _ = event_tx.send(ChannelEvent::Denied { reason }).await;
                        break 'outer;
                    }
                    ServeEnd::ConnectionLost => {
                        let _ = event_tx.send(ChannelEvent::Disconnected).await;
                        if !backoff_pause(&inner, &mut cmd_rx, &mut queue, &event_tx, &mut attempt)
                            .await
                        {
                            break 'outer;
                        }
                        continue;
                    }
                }
            }
            WelcomeOutcome::Denied(reason) => {
                let _ = event_tx.send(ChannelEvent::Denied { reason }).await;
                break 'outer;
            }
            WelcomeOutcome::Failed => {
                if !backoff_pause(&inner, &mut cmd_rx, &mut queue, &event_tx, &mut attempt).await {
                    break 'outer;
                }
                continue;
            }
        }
    }

    *inner.state.write().await = ConnectionState::Disconnected;
}

async fn send_join(inner: &ChannelInner, ws_sink: &mut WsSink) -> Result<(), ChannelError> {
    let request = JoinRequest {
        token: *inner.config.credential.token.as_bytes(),
        buffering: inner.config.buffering,
    };
    let frame = RelayFrame::join(inner.config.credential.room_id, &request)?.encode()?;
    ws_sink
        .send(Message::Binary(frame.into()))
        .await
        .map_err(|_| ChannelError::Closed)
}

/// Read until the relay accepts or rejects the join.
async fn wait_welcome(ws_reader: &mut WsReader, timeout: Duration) -> WelcomeOutcome {
    let wait = tokio::time::timeout(timeout, async {
        while let Some(item) = ws_reader.next().await {
            let data = match item {
                Ok(Message::Binary(data)) => data,
                Ok(_) => continue,
                Err(_) => return WelcomeOutcome::Failed,
            };
            let bytes: Vec<u8> = data.into();
            let Ok(frame) = RelayFrame::decode(&bytes) else {
                continue;
            };
            match frame.kind {
                FrameKind::Welcome => {
                    let peers = frame.welcome_info().map(|i| i.peer_count).unwrap_or(0);
                    return WelcomeOutcome::Welcome { peers };
                }
                FrameKind::Deny => return WelcomeOutcome::Denied(frame.deny_reason()),
                _ => continue,
            }
        }
        WelcomeOutcome::Failed
    });
    wait.await.unwrap_or(WelcomeOutcome::Failed)
}

/// Connected steady state: pump commands out, frames in.
async fn serve(
    inner: &ChannelInner,
    ws_sink: &mut WsSink,
    ws_reader: &mut WsReader,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    queue: &mut OfflineQueue,
    event_tx: &mpsc::Sender<ChannelEvent>,
) -> ServeEnd {
    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(Command::Send { frame, queue_offline }) => {
                        if ws_sink.send(Message::Binary(frame.clone().into())).await.is_err() {
                            if queue_offline {
                                queue.enqueue(frame);
                            }
                            return ServeEnd::ConnectionLost;
                        }
                    }
                    Some(Command::Stop) | None => return ServeEnd::Stop,
                }
            }
            item = ws_reader.next() => {
                match item {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match RelayFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Undecodable relay frame: {e}");
                                continue;
                            }
                        };
                        match frame.kind {
                            FrameKind::Frame | FrameKind::Buffered => {
                                match inner.cipher.open(&frame.payload) {
                                    Ok(plaintext) => match SyncMessage::decode(&plaintext) {
                                        Ok(msg) => {
                                            let _ = event_tx
                                                .send(ChannelEvent::Message(msg))
                                                .await;
                                        }
                                        Err(e) => log::warn!("Undecodable sync message: {e}"),
                                    },
                                    // Tampered frame or mismatched secret:
                                    // drop it, keep the session alive.
                                    Err(e) => log::warn!("Dropping unopenable frame: {e}"),
                                }
                            }
                            FrameKind::Deny => return ServeEnd::Denied(frame.deny_reason()),
                            FrameKind::Ping => {
                                let pong = RelayFrame::pong(frame.room_id);
                                if let Ok(encoded) = pong.encode() {
                                    let _ = ws_sink.send(Message::Binary(encoded.into())).await;
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return ServeEnd::ConnectionLost,
                    Some(Err(e)) => {
                        log::debug!("WebSocket error: {e}");
                        return ServeEnd::ConnectionLost;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Sleep through one backoff window, still accepting commands.
/// Returns `false` when a stop arrived.
async fn backoff_pause(
    inner: &ChannelInner,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    queue: &mut OfflineQueue,
    event_tx: &mpsc::Sender<ChannelEvent>,
    attempt: &mut u32,
) -> bool {
    *attempt += 1;
    let delay = backoff_delay(
        *attempt,
        inner.config.initial_backoff,
        inner.config.max_backoff,
    );
    *inner.state.write().await = ConnectionState::Reconnecting;
    let _ = event_tx
        .send(ChannelEvent::Reconnecting { attempt: *attempt })
        .await;
    log::debug!("Reconnecting in {delay:?} (attempt {attempt})");

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = cmd_rx.recv() => {
                match command {
                    Some(Command::Send { frame, queue_offline }) => {
                        if queue_offline && !queue.enqueue(frame) {
                            log::warn!("Offline queue full; dropping frame");
                        }
                    }
                    Some(Command::Stop) | None => return false,
                }
            }
        }
    }
}
