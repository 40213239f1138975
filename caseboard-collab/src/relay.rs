//! The untrusted relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (derived id) ── BroadcastGroup ──► Clients B, C…
//! Client B ──┘         │
//!                      ├── token fingerprint (pinned on first join)
//!                      └── buffered ciphertext snapshot (async mode)
//! ```
//!
//! The relay never holds a replica, never reads a payload and never
//! learns a document id. It routes sealed frames between the members
//! of a room, verifies join tokens against the fingerprint pinned by
//! the room's first member, and — for rooms created with buffering —
//! retains the most recent sealed snapshot so a participant can
//! bootstrap with nobody else online.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::access::RoomId;
use crate::broadcast::BroadcastGroup;
use crate::protocol::{FrameKind, RelayFrame, WelcomeInfo};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// Upper bound on accepted frame size in bytes.
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9440".to_string(),
            broadcast_capacity: 256,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Relay-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub denied_joins: u64,
    pub active_rooms: usize,
    pub buffered_snapshots: usize,
}

/// One room's relay-side state. Everything in here is either routing
/// metadata or ciphertext.
struct RelayRoom {
    broadcast: Arc<BroadcastGroup>,
    /// blake3 fingerprint of the access token pinned at creation.
    token_fingerprint: [u8; 32],
    /// Whether this room retains snapshots for async joiners.
    buffering: bool,
    /// Most recent sealed snapshot, if any.
    buffered: Option<Arc<Vec<u8>>>,
}

impl RelayRoom {
    fn new(token_fingerprint: [u8; 32], buffering: bool, capacity: usize) -> Self {
        Self {
            broadcast: Arc::new(BroadcastGroup::new(capacity)),
            token_fingerprint,
            buffering,
            buffered: None,
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RwLock<HashMap<RoomId, RelayRoom>>>,
    stats: Arc<RwLock<RelayStats>>,
    next_conn_id: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Run the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, conn_id, rooms, stats, config).await
                {
                    log::debug!("Connection {conn_id} from {addr} ended: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        let rooms = self.rooms.read().await;
        stats.active_rooms = rooms.len();
        stats.buffered_snapshots = rooms.values().filter(|r| r.buffered.is_some()).count();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    rooms: Arc<RwLock<HashMap<RoomId, RelayRoom>>>,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut joined_room: Option<RoomId> = None;
    let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<(u64, Arc<Vec<u8>>)>> = None;

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        if bytes.len() > config.max_frame_bytes {
                            log::warn!("Oversized frame ({} bytes) from {addr}", bytes.len());
                            continue;
                        }
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let frame = match RelayFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Undecodable frame from {addr}: {e}");
                                continue;
                            }
                        };

                        match frame.kind {
                            FrameKind::Join => {
                                let request = match frame.join_request() {
                                    Ok(request) => request,
                                    Err(_) => {
                                        let deny = RelayFrame::deny(frame.room_id, "malformed join");
                                        ws_sender.send(Message::Binary(deny.encode()?.into())).await?;
                                        continue;
                                    }
                                };
                                let fingerprint = *blake3::hash(&request.token).as_bytes();

                                let (accepted, buffered, peer_count) = {
                                    let mut rooms_w = rooms.write().await;
                                    let room = rooms_w.entry(frame.room_id).or_insert_with(|| {
                                        log::info!("Room {} created", frame.room_id);
                                        RelayRoom::new(
                                            fingerprint,
                                            request.buffering,
                                            config.broadcast_capacity,
                                        )
                                    });
                                    if room.token_fingerprint != fingerprint {
                                        (false, None, 0)
                                    } else {
                                        let rx = room.broadcast.add_connection(conn_id).await;
                                        broadcast_rx = Some(rx);
                                        let peers = room.broadcast.connection_count().await - 1;
                                        (true, room.buffered.clone(), peers)
                                    }
                                };

                                if !accepted {
                                    stats.write().await.denied_joins += 1;
                                    log::warn!("Join denied for room {} from {addr}", frame.room_id);
                                    let deny = RelayFrame::deny(frame.room_id, "bad token");
                                    ws_sender.send(Message::Binary(deny.encode()?.into())).await?;
                                    continue;
                                }

                                joined_room = Some(frame.room_id);
                                let welcome = RelayFrame::welcome(
                                    frame.room_id,
                                    WelcomeInfo {
                                        peer_count,
                                        has_buffered: buffered.is_some(),
                                    },
                                )?;
                                ws_sender.send(Message::Binary(welcome.encode()?.into())).await?;

                                // Bootstrap async joiners from the retained snapshot.
                                if let Some(snapshot) = buffered {
                                    let replay = RelayFrame::buffered(
                                        frame.room_id,
                                        snapshot.as_ref().clone(),
                                    );
                                    ws_sender.send(Message::Binary(replay.encode()?.into())).await?;
                                }

                                log::info!(
                                    "Connection {conn_id} joined room {} ({peer_count} peers present)",
                                    frame.room_id
                                );
                            }

                            FrameKind::Frame => {
                                let Some(room_id) = joined_room else { continue };
                                let broadcast = {
                                    let rooms_r = rooms.read().await;
                                    rooms_r.get(&room_id).map(|room| room.broadcast.clone())
                                };
                                if let Some(broadcast) = broadcast {
                                    // Forward the raw bytes; the payload is ciphertext.
                                    broadcast.broadcast(conn_id, Arc::new(bytes));
                                }
                            }

                            FrameKind::Buffer => {
                                let Some(room_id) = joined_room else { continue };
                                let mut rooms_w = rooms.write().await;
                                if let Some(room) = rooms_w.get_mut(&room_id) {
                                    if room.buffering {
                                        room.buffered = Some(Arc::new(frame.payload));
                                        log::debug!("Room {room_id}: snapshot retained");
                                    }
                                }
                            }

                            FrameKind::Ping => {
                                let pong = RelayFrame::pong(frame.room_id);
                                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                            }

                            _ => {
                                log::debug!("Ignoring frame kind {:?} from {addr}", frame.kind);
                            }
                        }
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Close(_))) | None => break,

                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            outgoing = recv_or_pending(&mut broadcast_rx) => {
                match outgoing {
                    Ok((from_conn, frame)) => {
                        if from_conn == conn_id {
                            continue; // our own frame, fanned back
                        }
                        ws_sender.send(Message::Binary(frame.as_ref().clone().into())).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {conn_id} lagged by {n} frames");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    // Cleanup: detach from the room; drop empty non-buffering rooms.
    if let Some(room_id) = joined_room {
        let mut rooms_w = rooms.write().await;
        if let Some(room) = rooms_w.get_mut(&room_id) {
            room.broadcast.remove_connection(conn_id).await;
            if room.broadcast.connection_count().await == 0 && !room.buffering {
                rooms_w.remove(&room_id);
                log::info!("Room {room_id} removed (empty)");
            }
        }
    }

    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    Ok(())
}

/// Await the broadcast receiver if joined, or park forever.
async fn recv_or_pending(
    rx: &mut Option<tokio::sync::broadcast::Receiver<(u64, Arc<Vec<u8>>)>>,
) -> Result<(u64, Arc<Vec<u8>>), tokio::sync::broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9440");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_relay_creation() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.bind_addr(), "127.0.0.1:9440");
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let relay = RelayServer::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.denied_joins, 0);
    }
}
