//! Presence and session records as stored in the presence store.
//!
//! Field names follow the document schema shared with browser peers
//! (`peerId`, `lastSeen`, `targetPeer`, ...). Timestamps are stored as
//! unix milliseconds so range filters compare numerically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::StoreError;
use crate::store::{Document, StoredDocument};

/// Collection holding one `PeerRecord` per peer id.
pub const PEERS: &str = "peers";
/// Collection holding one `SessionRecord` per negotiation attempt.
pub const SESSIONS: &str = "sessions";

/// Path of the candidate sub-collection of a session.
pub fn candidates_collection(session_id: &str) -> String {
    format!("{}/{}/candidates", SESSIONS, session_id)
}

/// Discovery-time label; carries no negotiation-order meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Navigator,
    Interface,
}

impl Role {
    /// The role a peer looks for during discovery.
    pub fn complement(self) -> Role {
        match self {
            Role::Navigator => Role::Interface,
            Role::Interface => Role::Navigator,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Navigator => "navigator",
            Role::Interface => "interface",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "navigator" => Ok(Role::Navigator),
            "interface" => Ok(Role::Interface),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Available,
    Offline,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Available => "available",
            PeerStatus::Offline => "offline",
        }
    }
}

/// Opaque offer/answer description produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Description(pub serde_json::Value);

/// Opaque network candidate produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub serde_json::Value);

/// Presence record of one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,
    pub role: Role,
    pub network_identity: String,
    pub status: PeerStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub registered_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(peer_id: &str, role: Role, network_identity: &str, now: DateTime<Utc>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            role,
            network_identity: network_identity.to_string(),
            status: PeerStatus::Available,
            registered_at: now,
            last_seen: now,
        }
    }

    /// Readers treat a record as stale once `lastSeen` leaves the window,
    /// whatever its stored status says.
    pub fn is_live(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.status != PeerStatus::Available {
            return false;
        }
        match chrono::Duration::from_std(window) {
            Ok(window) => self.last_seen > now - window,
            Err(_) => true,
        }
    }
}

/// The only session type ever written at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Offer,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        "offer"
    }
}

/// One negotiation attempt between exactly two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Store-assigned document id, not part of the stored body.
    #[serde(skip)]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub from_peer: String,
    pub target_peer: String,
    pub offer: Description,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Description>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub answered_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(from_peer: &str, target_peer: &str, offer: Description, now: DateTime<Utc>) -> Self {
        Self {
            session_id: String::new(),
            kind: SessionKind::Offer,
            from_peer: from_peer.to_string(),
            target_peer: target_peer.to_string(),
            offer,
            answer: None,
            created_at: now,
            answered_at: None,
        }
    }
}

/// One candidate appended to a session's candidate sub-collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRecord {
    pub candidate: Candidate,
    pub origin_peer: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Generate a peer id of the form `role_<unix millis>_<9 random chars>`.
pub fn generate_peer_id(role: Role) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        role.as_str(),
        Utc::now().timestamp_millis(),
        &random[..9]
    )
}

/// Serialize a record into a store document body.
pub fn to_document<T: Serialize>(record: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::InvalidDocument(format!(
            "expected an object, got {}",
            other
        ))),
        Err(e) => Err(StoreError::InvalidDocument(e.to_string())),
    }
}

/// Deserialize a store document body into a record.
pub fn from_document<T: for<'de> Deserialize<'de>>(doc: &StoredDocument) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::Object(doc.data.clone())).map_err(|e| {
        StoreError::InvalidDocument(format!("{}: {}", doc.id, e))
    })
}

/// Read a session document, filling in its store-assigned id.
pub fn session_from_document(doc: &StoredDocument) -> Result<SessionRecord, StoreError> {
    let mut session: SessionRecord = from_document(doc)?;
    session.session_id = doc.id.clone();
    Ok(session)
}
