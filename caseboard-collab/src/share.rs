//! Share links.
//!
//! Format (compatibility-critical, shared with every other client):
//!
//! ```text
//! scheme://host/join/{roomId}?server={relayUrl}&async={0|1}
//!     #key={secret}&id={documentId}&name={displayName}
//! ```
//!
//! The secret, the raw document id and the display name live only in
//! the fragment: browsers and relays never see fragments, so nothing
//! identity-bearing leaves the client. A legacy form placing the raw
//! document id directly in the path (no fragment `id`) is still
//! accepted; its room id is re-derived from the secret.

use url::Url;
use uuid::Uuid;

use crate::access::{derive_room_id, AccessError, RoomId, Secret};

/// Share-link errors. These are configuration errors: surfaced
/// immediately to the caller, never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum ShareLinkError {
    /// Not a parseable URL.
    InvalidUrl(String),
    /// Path is not `/join/{id}`.
    UnexpectedPath,
    /// Fragment lacks the `key` entry.
    MissingSecret,
    /// Query lacks the `server` entry.
    MissingServer,
    /// The secret failed to decode.
    MalformedSecret(AccessError),
    /// The room id failed to decode (non-legacy form).
    MalformedRoomId(AccessError),
    /// The document id failed to parse.
    MalformedDocumentId(String),
}

impl std::fmt::Display for ShareLinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareLinkError::InvalidUrl(e) => write!(f, "Invalid share link: {e}"),
            ShareLinkError::UnexpectedPath => write!(f, "Share link path is not /join/..."),
            ShareLinkError::MissingSecret => write!(f, "Share link has no key in its fragment"),
            ShareLinkError::MissingServer => write!(f, "Share link has no relay server"),
            ShareLinkError::MalformedSecret(e) => write!(f, "Malformed secret: {e}"),
            ShareLinkError::MalformedRoomId(e) => write!(f, "Malformed room id: {e}"),
            ShareLinkError::MalformedDocumentId(e) => write!(f, "Malformed document id: {e}"),
        }
    }
}

impl std::error::Error for ShareLinkError {}

/// A fully resolved share link.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareLink {
    pub room_id: RoomId,
    pub relay_url: String,
    pub buffering: bool,
    pub secret: Secret,
    pub document_id: Uuid,
    pub display_name: Option<String>,
}

impl ShareLink {
    /// Render the link under the given base (`scheme://host`).
    pub fn to_url(&self, base: &str) -> Result<String, ShareLinkError> {
        let mut url =
            Url::parse(base).map_err(|e| ShareLinkError::InvalidUrl(e.to_string()))?;
        url.set_path(&format!("/join/{}", self.room_id.to_text()));
        url.query_pairs_mut()
            .clear()
            .append_pair("server", &self.relay_url)
            .append_pair("async", if self.buffering { "1" } else { "0" });

        let mut fragment = url::form_urlencoded::Serializer::new(String::new());
        fragment.append_pair("key", &self.secret.to_text());
        fragment.append_pair("id", &self.document_id.to_string());
        if let Some(name) = &self.display_name {
            fragment.append_pair("name", name);
        }
        url.set_fragment(Some(&fragment.finish()));

        Ok(url.to_string())
    }

    /// Parse a share link, accepting both the current and the legacy
    /// form.
    pub fn parse(input: &str) -> Result<Self, ShareLinkError> {
        let url = Url::parse(input).map_err(|e| ShareLinkError::InvalidUrl(e.to_string()))?;

        let path_id = {
            let mut segments = url
                .path_segments()
                .ok_or(ShareLinkError::UnexpectedPath)?;
            match (segments.next(), segments.next(), segments.next()) {
                (Some("join"), Some(id), None) if !id.is_empty() => id.to_string(),
                _ => return Err(ShareLinkError::UnexpectedPath),
            }
        };

        let mut relay_url = None;
        let mut buffering = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "server" => relay_url = Some(value.into_owned()),
                "async" => buffering = value == "1",
                _ => {}
            }
        }
        let relay_url = relay_url.ok_or(ShareLinkError::MissingServer)?;

        let mut secret_text = None;
        let mut fragment_doc_id = None;
        let mut display_name = None;
        if let Some(fragment) = url.fragment() {
            for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
                match key.as_ref() {
                    "key" => secret_text = Some(value.into_owned()),
                    "id" => fragment_doc_id = Some(value.into_owned()),
                    "name" => display_name = Some(value.into_owned()),
                    _ => {}
                }
            }
        }
        let secret = Secret::from_text(&secret_text.ok_or(ShareLinkError::MissingSecret)?)
            .map_err(ShareLinkError::MalformedSecret)?;

        let (room_id, document_id) = match fragment_doc_id {
            Some(doc_text) => {
                let document_id = Uuid::parse_str(&doc_text)
                    .map_err(|e| ShareLinkError::MalformedDocumentId(e.to_string()))?;
                let room_id =
                    RoomId::from_text(&path_id).map_err(ShareLinkError::MalformedRoomId)?;
                (room_id, document_id)
            }
            None => {
                // Legacy form: the path segment is the raw document id
                // and the room is derived on the spot.
                let document_id = Uuid::parse_str(&path_id)
                    .map_err(|e| ShareLinkError::MalformedDocumentId(e.to_string()))?;
                let room_id = derive_room_id(document_id, &secret);
                (room_id, document_id)
            }
        };

        Ok(Self {
            room_id,
            relay_url,
            buffering,
            secret,
            document_id,
            display_name,
        })
    }
}
