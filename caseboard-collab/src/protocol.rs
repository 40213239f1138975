//! Binary wire protocol between clients and the relay.
//!
//! Two layers, both bincode-encoded:
//!
//! ```text
//! ┌───────────┬───────────────┬────────────────────────────┐
//! │ kind      │ room id       │ payload                    │
//! │ 1 byte    │ 32 bytes      │ variable                   │
//! └───────────┴───────────────┴────────────────────────────┘
//!              plaintext envelope — all the relay ever reads
//!
//! payload of Frame / Buffer / Buffered = sealed SyncMessage
//! payload of Join                      = plaintext JoinRequest
//! ```
//!
//! The relay routes on `(kind, room id)` and treats every other byte as
//! opaque. Sync semantics live in [`SyncMessage`], which only exists in
//! plaintext on the two endpoints.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::RoomId;
use crate::presence::PresenceUpdate;

/// Envelope kinds the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Client → relay: enter a room (payload: plaintext [`JoinRequest`]).
    Join = 1,
    /// Relay → client: join accepted (payload: [`WelcomeInfo`]).
    Welcome = 2,
    /// Relay → client: join rejected (payload: utf-8 reason).
    Deny = 3,
    /// Opaque sealed payload, fanned out to the room.
    Frame = 4,
    /// Opaque sealed snapshot the relay may retain for async joiners.
    Buffer = 5,
    /// Relay → client: replay of the retained snapshot on join.
    Buffered = 6,
    /// Transport liveness probe.
    Ping = 7,
    Pong = 8,
}

/// Join payload. The token proves knowledge of the share secret
/// without revealing it; `buffering` asks the relay to retain the most
/// recent snapshot for participants joining while nobody is online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub token: [u8; 32],
    pub buffering: bool,
}

/// Welcome payload: how many peers are already in the room, and
/// whether a buffered snapshot will follow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WelcomeInfo {
    pub peer_count: usize,
    pub has_buffered: bool,
}

/// The plaintext routing envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub kind: FrameKind,
    pub room_id: RoomId,
    pub payload: Vec<u8>,
}

impl RelayFrame {
    pub fn join(room_id: RoomId, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: FrameKind::Join,
            room_id,
            payload: encode(request)?,
        })
    }

    pub fn welcome(room_id: RoomId, info: WelcomeInfo) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: FrameKind::Welcome,
            room_id,
            payload: encode(&info)?,
        })
    }

    pub fn deny(room_id: RoomId, reason: &str) -> Self {
        Self {
            kind: FrameKind::Deny,
            room_id,
            payload: reason.as_bytes().to_vec(),
        }
    }

    pub fn frame(room_id: RoomId, sealed: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Frame,
            room_id,
            payload: sealed,
        }
    }

    pub fn buffer(room_id: RoomId, sealed: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Buffer,
            room_id,
            payload: sealed,
        }
    }

    pub fn buffered(room_id: RoomId, sealed: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Buffered,
            room_id,
            payload: sealed,
        }
    }

    pub fn ping(room_id: RoomId) -> Self {
        Self {
            kind: FrameKind::Ping,
            room_id,
            payload: Vec::new(),
        }
    }

    pub fn pong(room_id: RoomId) -> Self {
        Self {
            kind: FrameKind::Pong,
            room_id,
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Parse a Join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.kind != FrameKind::Join {
            return Err(ProtocolError::UnexpectedKind);
        }
        decode(&self.payload)
    }

    /// Parse a Welcome payload.
    pub fn welcome_info(&self) -> Result<WelcomeInfo, ProtocolError> {
        if self.kind != FrameKind::Welcome {
            return Err(ProtocolError::UnexpectedKind);
        }
        decode(&self.payload)
    }

    /// Read a Deny reason.
    pub fn deny_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// The encrypted inner message exchanged between participants.
///
/// `SyncRequest`/`SyncResponse` form the reconciliation handshake —
/// either side may initiate — and `Update` carries incremental deltas.
/// Presence rides the same channel but never touches the replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// "Here is my state vector; send me what I am missing."
    SyncRequest {
        participant_id: Uuid,
        state_vector: Vec<u8>,
    },
    /// The updates the requester was missing (or a full snapshot).
    SyncResponse {
        participant_id: Uuid,
        update: Vec<u8>,
    },
    /// One incremental replica update.
    Update {
        participant_id: Uuid,
        update: Vec<u8>,
    },
    /// Ephemeral participant state.
    Presence {
        participant_id: Uuid,
        update: PresenceUpdate,
    },
}

impl SyncMessage {
    pub fn participant_id(&self) -> Uuid {
        match self {
            SyncMessage::SyncRequest { participant_id, .. }
            | SyncMessage::SyncResponse { participant_id, .. }
            | SyncMessage::Update { participant_id, .. }
            | SyncMessage::Presence { participant_id, .. } => *participant_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    /// Payload accessor called on the wrong frame kind.
    UnexpectedKind,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "Serialization error: {e}"),
            ProtocolError::Decode(e) => write!(f, "Deserialization error: {e}"),
            ProtocolError::UnexpectedKind => write!(f, "Unexpected frame kind"),
        }
    }
}

impl std::error::Error for ProtocolError {}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{derive_room_id, Secret};

    fn room() -> RoomId {
        derive_room_id(Uuid::new_v4(), &Secret::generate())
    }

    #[test]
    fn test_join_roundtrip() {
        let room = room();
        let request = JoinRequest {
            token: [7u8; 32],
            buffering: true,
        };
        let frame = RelayFrame::join(room, &request).unwrap();
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Join);
        assert_eq!(decoded.room_id, room);
        let parsed = decoded.join_request().unwrap();
        assert_eq!(parsed.token, [7u8; 32]);
        assert!(parsed.buffering);
    }

    #[test]
    fn test_welcome_roundtrip() {
        let frame = RelayFrame::welcome(
            room(),
            WelcomeInfo {
                peer_count: 3,
                has_buffered: true,
            },
        )
        .unwrap();
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        let info = decoded.welcome_info().unwrap();
        assert_eq!(info.peer_count, 3);
        assert!(info.has_buffered);
    }

    #[test]
    fn test_deny_reason() {
        let frame = RelayFrame::deny(room(), "bad token");
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Deny);
        assert_eq!(decoded.deny_reason(), "bad token");
    }

    #[test]
    fn test_opaque_frame_roundtrip() {
        let room = room();
        let sealed = vec![9u8; 77];
        let frame = RelayFrame::frame(room, sealed.clone());
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Frame);
        assert_eq!(decoded.payload, sealed);
    }

    #[test]
    fn test_sync_message_roundtrip() {
        let participant = Uuid::new_v4();
        let msg = SyncMessage::Update {
            participant_id: participant,
            update: vec![1, 2, 3, 4],
        };
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.participant_id(), participant);
        match decoded {
            SyncMessage::Update { update, .. } => assert_eq!(update, vec![1, 2, 3, 4]),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_handshake_messages_roundtrip() {
        let participant = Uuid::new_v4();
        let request = SyncMessage::SyncRequest {
            participant_id: participant,
            state_vector: vec![10, 20],
        };
        let response = SyncMessage::SyncResponse {
            participant_id: participant,
            update: vec![30, 40, 50],
        };
        for msg in [request, response] {
            let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded.participant_id(), participant);
        }
    }

    #[test]
    fn test_accessor_on_wrong_kind() {
        let frame = RelayFrame::ping(RoomId::ZERO);
        assert!(frame.join_request().is_err());
        assert!(frame.welcome_info().is_err());
    }

    #[test]
    fn test_decode_garbage_rejected() {
        assert!(RelayFrame::decode(&[0xFF, 0xFE]).is_err());
        assert!(SyncMessage::decode(&[0xFF, 0xFE]).is_err());
    }
}
