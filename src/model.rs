// src/model.rs
// Core data model shared by every component (spec §3).
//
// The teacher keeps peers as loose `HashMap<String, T>` entries scattered
// across several managers (`signaling::PeerConnection`, `discovery::Peer`,
// `file_transfer::TransferState`, ...). Here each concept gets one typed
// home so invalid states — an empty room code, a peer id that never joined
// — are caught at construction rather than at use.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;

/// The 32-symbol unambiguous alphabet room codes are drawn from: no `0 O 1 I`.
pub const ROOM_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of characters in a room code.
pub const ROOM_CODE_LEN: usize = 6;

/// A validated, canonically-uppercased 6-character room code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    pub fn parse(raw: &str) -> Result<Self, HubError> {
        let upper = raw.to_uppercase();
        if upper.chars().count() != ROOM_CODE_LEN {
            return Err(HubError::InvalidRoomCode(raw.to_string()));
        }
        if !upper.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)) {
            return Err(HubError::InvalidRoomCode(raw.to_string()));
        }
        Ok(RoomCode(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a room code from a hex digest by mapping its first
    /// `ROOM_CODE_LEN` bytes into the unambiguous alphabet (spec §4.2).
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut out = String::with_capacity(ROOM_CODE_LEN);
        for byte in digest.iter().take(ROOM_CODE_LEN) {
            let idx = (*byte as usize) % ROOM_CODE_ALPHABET.len();
            out.push(ROOM_CODE_ALPHABET[idx] as char);
        }
        RoomCode(out)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = HubError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoomCode::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = HubError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        RoomCode::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(value: RoomCode) -> Self {
        value.0
    }
}

/// Opaque 128-bit peer identity, issued by the hub on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        PeerId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(Uuid::parse_str(s)?))
    }
}

/// `polite` is decided by lexicographic order of peer ids (spec §4.3):
/// the smaller id is polite. Comparing the formatted string matches the
/// spec's "lexicographically smaller" wording exactly (a numeric Uuid
/// comparison would not necessarily agree with a string comparison).
pub fn is_polite(local: &PeerId, remote: &PeerId) -> bool {
    local.to_string() < remote.to_string()
}

/// Device class as reported by the joining client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
}

/// The identity of another participant in the room (spec §3 "Peer").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub device_class: DeviceClass,
    pub browser_info: String,
}

/// Candidate kinds an ICE session can gather (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Host,
    Srflx,
    Prflx,
    Relay,
}

/// Observable connection states emitted to the external observer (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Slow,
    Relay,
    Connected,
}

/// Transfer transport mode (spec §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Direct,
    Relay,
}
