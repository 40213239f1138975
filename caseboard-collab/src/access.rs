//! Room and access derivation.
//!
//! Pure, deterministic, one-way functions from `(document id, share
//! secret)` to the identifiers the relay sees. The relay never learns
//! the document id, the secret, or the payload key; regenerating the
//! secret yields an unlinkable new room and invalidates previously
//! distributed links.
//!
//! Derivation uses keyed blake3 with distinct context strings, so the
//! room id, the access token and the payload key live in independent
//! key domains.

use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use uuid::Uuid;

// Domain-separation contexts. Changing any of these is a protocol break.
const CTX_ROOM_ID: &str = "caseboard collab v1 room id";
const CTX_ACCESS_TOKEN: &str = "caseboard collab v1 access token";
const CTX_PAYLOAD_KEY: &str = "caseboard collab v1 payload key";

/// Errors decoding text forms of secrets / room ids / tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessError {
    /// Not valid base32.
    InvalidEncoding(String),
    /// Decoded to the wrong number of bytes.
    InvalidLength { expected: usize, got: usize },
}

impl std::fmt::Display for AccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessError::InvalidEncoding(e) => write!(f, "Invalid base32: {e}"),
            AccessError::InvalidLength { expected, got } => {
                write!(f, "Expected {expected} bytes, got {got}")
            }
        }
    }
}

impl std::error::Error for AccessError {}

fn encode_bytes(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

fn decode_bytes(input: &str) -> Result<[u8; 32], AccessError> {
    let decoded = BASE32_NOPAD
        .decode(input.to_ascii_uppercase().as_bytes())
        .map_err(|e| AccessError::InvalidEncoding(e.to_string()))?;
    let got = decoded.len();
    decoded
        .try_into()
        .map_err(|_| AccessError::InvalidLength { expected: 32, got })
}

/// The share secret. Distributed out-of-band (link fragment), never
/// sent to the relay.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    /// Mint a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base32 text form, as carried in share-link fragments.
    pub fn to_text(&self) -> String {
        encode_bytes(&self.0)
    }

    pub fn from_text(input: &str) -> Result<Self, AccessError> {
        decode_bytes(input).map(Self)
    }
}

// The secret never appears in logs.
impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Relay-visible room identifier, derived one-way from the document id
/// and the share secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RoomId([u8; 32]);

impl RoomId {
    /// Placeholder for frames sent before a room is bound (ping/pong).
    pub const ZERO: RoomId = RoomId([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_text(&self) -> String {
        encode_bytes(&self.0)
    }

    pub fn from_text(input: &str) -> Result<Self, AccessError> {
        decode_bytes(input).map(Self)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Per-room access proof, derived from the secret and the room id.
/// The relay stores only its blake3 fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken([u8; 32]);

impl AccessToken {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// What the relay pins and compares on join.
    pub fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(&self.0).as_bytes()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Everything a client needs to enter a room.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub room_id: RoomId,
    pub token: AccessToken,
}

/// Derive the relay-visible room id for `(document id, secret)`.
///
/// One-way: the relay cannot recover the document id, and two secrets
/// for the same document yield unlinkable rooms.
pub fn derive_room_id(document_id: Uuid, secret: &Secret) -> RoomId {
    let mut material = Vec::with_capacity(48);
    material.extend_from_slice(secret.as_bytes());
    material.extend_from_slice(document_id.as_bytes());
    RoomId(blake3::derive_key(CTX_ROOM_ID, &material))
}

/// Derive the access token presented to the relay for a room.
pub fn derive_access_token(secret: &Secret, room_id: &RoomId) -> AccessToken {
    let mut material = Vec::with_capacity(64);
    material.extend_from_slice(secret.as_bytes());
    material.extend_from_slice(room_id.as_bytes());
    AccessToken(blake3::derive_key(CTX_ACCESS_TOKEN, &material))
}

/// Derive the symmetric AEAD key protecting frame payloads.
/// This key never travels over the relay channel.
pub fn derive_payload_key(secret: &Secret) -> [u8; 32] {
    blake3::derive_key(CTX_PAYLOAD_KEY, secret.as_bytes())
}

/// Derive the full credential for `(document id, secret)`.
pub fn derive_credential(document_id: Uuid, secret: &Secret) -> AccessCredential {
    let room_id = derive_room_id(document_id, secret);
    let token = derive_access_token(secret, &room_id);
    AccessCredential { room_id, token }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let doc = Uuid::new_v4();
        let secret = Secret::generate();
        assert_eq!(derive_room_id(doc, &secret), derive_room_id(doc, &secret));
        let room = derive_room_id(doc, &secret);
        assert_eq!(
            derive_access_token(&secret, &room).as_bytes(),
            derive_access_token(&secret, &room).as_bytes()
        );
        assert_eq!(derive_payload_key(&secret), derive_payload_key(&secret));
    }

    #[test]
    fn test_distinct_secrets_yield_unlinkable_rooms() {
        let doc = Uuid::new_v4();
        let secret_a = Secret::generate();
        let secret_b = Secret::generate();
        assert_ne!(derive_room_id(doc, &secret_a), derive_room_id(doc, &secret_b));
    }

    #[test]
    fn test_distinct_documents_yield_distinct_rooms() {
        let secret = Secret::generate();
        assert_ne!(
            derive_room_id(Uuid::new_v4(), &secret),
            derive_room_id(Uuid::new_v4(), &secret)
        );
    }

    #[test]
    fn test_room_id_does_not_leak_document_id() {
        let doc = Uuid::new_v4();
        let secret = Secret::generate();
        let room = derive_room_id(doc, &secret).to_text();
        assert!(!room.contains(&doc.to_string()));
        assert!(!room.contains(&secret.to_text()));
    }

    #[test]
    fn test_derived_values_live_in_distinct_domains() {
        let doc = Uuid::new_v4();
        let secret = Secret::generate();
        let credential = derive_credential(doc, &secret);
        assert_ne!(credential.room_id.as_bytes(), credential.token.as_bytes());
        assert_ne!(credential.room_id.as_bytes(), &derive_payload_key(&secret));
    }

    #[test]
    fn test_secret_text_roundtrip() {
        let secret = Secret::generate();
        let text = secret.to_text();
        assert_eq!(Secret::from_text(&text).unwrap(), secret);
        // Lowercase and uppercase both accepted.
        assert_eq!(Secret::from_text(&text.to_ascii_uppercase()).unwrap(), secret);
    }

    #[test]
    fn test_room_id_text_roundtrip() {
        let room = derive_room_id(Uuid::new_v4(), &Secret::generate());
        assert_eq!(RoomId::from_text(&room.to_text()).unwrap(), room);
    }

    #[test]
    fn test_bad_text_rejected() {
        assert!(matches!(
            Secret::from_text("not base32 !!!"),
            Err(AccessError::InvalidEncoding(_))
        ));
        assert!(matches!(
            Secret::from_text("mfrgg"), // decodes, but far too short
            Err(AccessError::InvalidLength { expected: 32, .. })
        ));
    }

    #[test]
    fn test_fingerprint_differs_from_token() {
        let secret = Secret::generate();
        let room = derive_room_id(Uuid::new_v4(), &secret);
        let token = derive_access_token(&secret, &room);
        assert_ne!(&token.fingerprint(), token.as_bytes());
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::generate();
        assert_eq!(format!("{secret:?}"), "Secret(..)");
    }
}
