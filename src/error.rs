// src/error.rs
// Error taxonomy for the CloudDrop transfer engine (spec §7).
//
// Each variant corresponds to a row in the error table: crypto failures never
// retry for that chunk, transport/connection failures drive the state machine
// (ICE restart, relay commit), and protocol failures bubble up to whatever is
// driving the transfer (the caller decides abort vs. retry).

use thiserror::Error;

/// Failures from the crypto envelope (C1).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no shared key with peer {0}")]
    NoSharedKey(String),

    #[error("room key missing but chunk was encrypted with a room layer")]
    RoomKeyMissing,

    #[error("AEAD authentication failed — chunk was tampered with or the key is wrong")]
    DecryptionFailed,

    #[error("malformed chunk envelope: {0}")]
    MalformedEnvelope(&'static str),

    #[error("password too short (minimum 6 characters)")]
    PasswordTooShort,

    #[error("invalid peer public key encoding: {0}")]
    InvalidPublicKey(String),
}

/// Failures from the connection engine (C3).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ICE restart attempts exhausted for peer {0}")]
    IceRestartExhausted(String),

    #[error("no direct transport registered for peer {0}")]
    NoTransport(String),

    #[error("an offer is already in flight for peer {0}")]
    OfferInFlight(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures from the transfer protocol (C4).
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer did not respond to file-request within the timeout")]
    PeerDidNotRespond,

    #[error("peer declined the file transfer")]
    PeerDeclined,

    #[error("peer cancelled the transfer: {0}")]
    PeerCancelled(String),

    #[error("transfer cancelled locally")]
    UserCancelled,

    #[error("relay retransmission exhausted for chunk {0}")]
    RelayRetransmitExhausted(u32),

    #[error("relay transfer stalled — no ack progress")]
    RelayStalled,

    #[error("transfer {0} not found")]
    UnknownTransfer(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures from the signaling hub (C2).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("room password required")]
    PasswordRequired,

    #[error("room password incorrect")]
    PasswordIncorrect,

    #[error("a password hash is already set for this room")]
    PasswordAlreadySet,

    #[error("password too short (minimum 6 characters)")]
    PasswordTooShort,

    #[error("room code {0:?} is not a valid 6-character room code")]
    InvalidRoomCode(String),

    #[error("peer {0} is not a member of this room")]
    UnknownPeer(String),

    #[error("network disconnected")]
    NetworkDisconnected,
}

/// WebSocket close codes used by the hub (spec §4.2, §6).
pub mod close_code {
    pub const PASSWORD_REQUIRED: u16 = 4001;
    pub const PASSWORD_INCORRECT: u16 = 4002;
}
