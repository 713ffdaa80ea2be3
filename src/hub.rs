// src/hub.rs
// The Signaling Hub (C2): room membership, the password gate, and
// point-to-point frame forwarding between peers (spec §4.2).
//
// The teacher's `SignalingServer` binds a UDP socket and deserializes one
// flat `SignalingMessage` enum, forwarding by peer address. CloudDrop's
// peers dial in over a real network, so the hub is an axum WebSocket
// service instead (grounded on `other_examples`'s `tallow-relay`
// websocket.rs — upgrade, split sink/stream, bridge to a per-room channel
// map) — but the bookkeeping shape (`peers: RwLock<HashMap<PeerId, _>>`,
// forward-by-id, a stateless relay for payload it doesn't inspect) is the
// teacher's.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::{close_code, HubError};
use crate::model::{DeviceClass, Peer, PeerId, RoomCode, TransferMode};

/// How long a new connection has to send its `join` frame before the hub
/// gives up on it (grounded on `tallow-relay`'s `WS_HANDSHAKE_TIMEOUT`).
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The frame envelope exchanged over `/ws` (spec §4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Join {
        name: String,
        device_class: DeviceClass,
        browser_info: String,
    },
    #[serde(rename_all = "camelCase")]
    Joined {
        peer_id: PeerId,
        room_code: RoomCode,
        peers: Vec<Peer>,
    },
    PeerJoined { peer: Peer },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    Offer {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        candidate: String,
    },
    #[serde(rename_all = "camelCase")]
    KeyExchange {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        public_key: String,
    },
    #[serde(rename_all = "camelCase")]
    RelayData {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    FileRequest {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        file_id: Uuid,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        transfer_mode: TransferMode,
    },
    #[serde(rename_all = "camelCase")]
    FileResponse {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        file_id: Uuid,
        accepted: bool,
    },
    #[serde(rename_all = "camelCase")]
    FileCancel {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        file_id: Uuid,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    NameChanged {
        #[serde(default)]
        from: Option<PeerId>,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    Text {
        #[serde(default)]
        from: Option<PeerId>,
        to: PeerId,
        body: String,
    },
    Ping,
    Pong,
    Error { error: ErrorCode },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PasswordRequired,
    PasswordIncorrect,
}

impl Frame {
    /// The peer id this frame should be forwarded to, if any (spec §4.2's
    /// "everything with a `to` field is forwarded verbatim").
    fn to(&self) -> Option<PeerId> {
        match self {
            Frame::Offer { to, .. }
            | Frame::Answer { to, .. }
            | Frame::IceCandidate { to, .. }
            | Frame::KeyExchange { to, .. }
            | Frame::RelayData { to, .. }
            | Frame::FileRequest { to, .. }
            | Frame::FileResponse { to, .. }
            | Frame::FileCancel { to, .. }
            | Frame::Text { to, .. } => Some(*to),
            _ => None,
        }
    }

    fn set_from(&mut self, sender: PeerId) {
        match self {
            Frame::Offer { from, .. }
            | Frame::Answer { from, .. }
            | Frame::IceCandidate { from, .. }
            | Frame::KeyExchange { from, .. }
            | Frame::RelayData { from, .. }
            | Frame::FileRequest { from, .. }
            | Frame::FileResponse { from, .. }
            | Frame::FileCancel { from, .. }
            | Frame::Text { from, .. }
            | Frame::NameChanged { from, .. } => *from = Some(sender),
            _ => {}
        }
    }
}

struct Session {
    peer: Peer,
    outbox: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct RoomState {
    password_hash: RwLock<Option<String>>,
    members: RwLock<HashMap<PeerId, Session>>,
}

/// The hub's in-memory room registry. One `Hub` serves every room; rooms are
/// created lazily on first join and never explicitly destroyed (an empty
/// room is harmless dead weight, matching the teacher's own laissez-faire
/// peer-map lifecycle).
pub struct Hub {
    rooms: RwLock<HashMap<RoomCode, Arc<RoomState>>>,
}

impl Hub {
    pub fn new() -> Self {
        Hub { rooms: RwLock::new(HashMap::new()) }
    }

    fn room(&self, code: &RoomCode) -> Arc<RoomState> {
        if let Some(room) = self.rooms.read().unwrap().get(code) {
            return room.clone();
        }
        let mut rooms = self.rooms.write().unwrap();
        rooms
            .entry(code.clone())
            .or_insert_with(|| Arc::new(RoomState::default()))
            .clone()
    }

    /// Derives a deterministic 6-character room code from a client's
    /// network prefix when none was supplied explicitly (spec §4.2 "Room
    /// resolution"): IPv4 keeps its first three octets, IPv6 its first
    /// four 16-bit groups, loopback/unspecified maps to the literal
    /// `"localhost"`. The network part is SHA-256'd and the first 8 hex
    /// digits are mapped into the room-code alphabet.
    pub fn derive_room_code(addr: IpAddr) -> RoomCode {
        let network_part = match addr {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => {
                let o = v4.octets();
                format!("{}.{}.{}", o[0], o[1], o[2])
            }
            IpAddr::V6(v6) if !v6.is_loopback() && !v6.is_unspecified() => {
                let seg = v6.segments();
                format!("{:x}:{:x}:{:x}:{:x}", seg[0], seg[1], seg[2], seg[3])
            }
            _ => "localhost".to_string(),
        };

        let mut hasher = Sha256::new();
        hasher.update(network_part.as_bytes());
        let digest = hasher.finalize();
        RoomCode::from_digest(&digest)
    }

    /// Password gate (spec §4.2 "Password gate", invariant 6 for set-once).
    /// Hashes are compared in constant time so response timing can't leak
    /// how many leading bytes of a guess were correct.
    pub fn check_password(&self, code: &RoomCode, supplied_hash: Option<&str>) -> Result<(), HubError> {
        let room = self.room(code);
        let stored = room.password_hash.read().unwrap();
        match (&*stored, supplied_hash) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(HubError::PasswordRequired),
            (Some(expected), Some(given)) if expected.as_bytes().ct_eq(given.as_bytes()).into() => Ok(()),
            (Some(_), Some(_)) => Err(HubError::PasswordIncorrect),
        }
    }

    pub fn has_password(&self, code: &RoomCode) -> bool {
        self.room(code).password_hash.read().unwrap().is_some()
    }

    /// Sets a room's password hash. Once set, immutable for the room's
    /// lifetime (spec §3 invariant, §8 invariant 6).
    pub fn set_password(&self, code: &RoomCode, hash: String) -> Result<(), HubError> {
        let room = self.room(code);
        let mut stored = room.password_hash.write().unwrap();
        if stored.is_some() {
            return Err(HubError::PasswordAlreadySet);
        }
        *stored = Some(hash);
        Ok(())
    }

    /// Registers a new member, returning the existing membership list and
    /// broadcasting `peer-joined` to everyone already present.
    fn join(&self, code: &RoomCode, peer: Peer, outbox: mpsc::UnboundedSender<Frame>) -> Vec<Peer> {
        let room = self.room(code);
        let mut members = room.members.write().unwrap();
        let existing: Vec<Peer> = members.values().map(|s| s.peer.clone()).collect();
        for session in members.values() {
            let _ = session.outbox.send(Frame::PeerJoined { peer: peer.clone() });
        }
        members.insert(peer.id, Session { peer, outbox });
        existing
    }

    /// Removes a member and broadcasts `peer-left` (spec §8 invariant 7:
    /// no references to a left peer's state should remain anywhere).
    fn leave(&self, code: &RoomCode, peer_id: PeerId) {
        let room = self.room(code);
        let mut members = room.members.write().unwrap();
        if members.remove(&peer_id).is_some() {
            for session in members.values() {
                let _ = session.outbox.send(Frame::PeerLeft { peer_id });
            }
        }
    }

    /// Forwards a directed frame verbatim to its `to` peer, filling `from`.
    /// Never delivers to a session whose attached id doesn't match `to`
    /// (spec §8 invariant 5) — simply because delivery is keyed by exactly
    /// that id in the membership map, so misdelivery is not representable.
    fn forward(&self, code: &RoomCode, mut frame: Frame, sender: PeerId) -> Result<(), HubError> {
        let Some(to) = frame.to() else { return Ok(()) };
        frame.set_from(sender);
        let room = self.room(code);
        let members = room.members.read().unwrap();
        let session = members.get(&to).ok_or_else(|| HubError::UnknownPeer(to.to_string()))?;
        let _ = session.outbox.send(frame);
        Ok(())
    }

    /// Updates a member's display name and broadcasts the change (spec
    /// §4.2 `name-changed`).
    fn rename(&self, code: &RoomCode, peer_id: PeerId, name: String) {
        let room = self.room(code);
        let mut members = room.members.write().unwrap();
        if let Some(session) = members.get_mut(&peer_id) {
            session.peer.name = name.clone();
        }
        for (id, session) in members.iter() {
            if *id != peer_id {
                let _ = session.outbox.send(Frame::NameChanged {
                    from: Some(peer_id),
                    name: name.clone(),
                });
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct HubAppState {
    pub hub: Arc<Hub>,
    pub config: Arc<HubConfig>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    room: Option<String>,
    #[serde(rename = "passwordHash")]
    password_hash: Option<String>,
}

pub fn router(state: HubAppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/ice-servers", get(ice_servers_handler))
        .route("/api/room/check-password", get(check_password_handler))
        .route("/api/room/set-password", post(set_password_handler))
        .layer(cors)
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    State(state): State<HubAppState>,
) -> impl IntoResponse {
    let room_code = match query.room.as_deref().map(RoomCode::parse) {
        Some(Ok(code)) => code,
        Some(Err(_)) | None => Hub::derive_room_code(addr.ip()),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_code, query.password_hash))
}

async fn handle_socket(
    socket: WebSocket,
    state: HubAppState,
    room_code: RoomCode,
    password_hash: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();

    if let Err(code) = state.hub.check_password(&room_code, password_hash.as_deref()) {
        let error = match code {
            HubError::PasswordRequired => ErrorCode::PasswordRequired,
            _ => ErrorCode::PasswordIncorrect,
        };
        let close_code_val = match error {
            ErrorCode::PasswordRequired => close_code::PASSWORD_REQUIRED,
            ErrorCode::PasswordIncorrect => close_code::PASSWORD_INCORRECT,
        };
        if let Ok(text) = serde_json::to_string(&Frame::Error { error }) {
            let _ = sink.send(WsMessage::Text(text)).await;
        }
        let _ = sink
            .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                code: close_code_val,
                reason: "".into(),
            })))
            .await;
        return;
    }

    let join_frame = match tokio::time::timeout(JOIN_TIMEOUT, read_join_frame(&mut stream)).await {
        Ok(Some(frame)) => frame,
        _ => return,
    };
    let Frame::Join { name, device_class, browser_info } = join_frame else {
        return;
    };

    let peer_id = PeerId::new();
    let peer = Peer { id: peer_id, name, device_class, browser_info };
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let existing_peers = state.hub.join(&room_code, peer.clone(), tx.clone());

    let _ = tx.send(Frame::Joined {
        peer_id,
        room_code: room_code.clone(),
        peers: existing_peers,
    });
    info!(%peer_id, room = %room_code, "peer joined");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize outgoing frame"),
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Ping) => {
                    let _ = tx.send(Frame::Pong);
                }
                Ok(Frame::NameChanged { name, .. }) => {
                    state.hub.rename(&room_code, peer_id, name);
                }
                Ok(Frame::Join { .. }) => {
                    // Already joined; a second join frame is ignored.
                }
                Ok(frame) => {
                    if let Err(e) = state.hub.forward(&room_code, frame, peer_id) {
                        debug!(error = %e, "dropped undeliverable frame");
                    }
                }
                Err(e) => warn!(error = %e, "unparsable frame"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.hub.leave(&room_code, peer_id);
    send_task.abort();
    info!(%peer_id, room = %room_code, "peer left");
}

async fn read_join_frame(
    stream: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
) -> Option<Frame> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            WsMessage::Text(text) => {
                if let Ok(frame @ Frame::Join { .. }) = serde_json::from_str::<Frame>(&text) {
                    return Some(frame);
                }
            }
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

#[derive(Serialize)]
struct IceServerEntry {
    urls: String,
}

#[derive(Serialize)]
struct IceServersResponse {
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServerEntry>,
}

async fn ice_servers_handler(State(state): State<HubAppState>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state
            .config
            .fallback_ice_servers
            .iter()
            .map(|urls| IceServerEntry { urls: urls.clone() })
            .collect(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RoomQuery {
    room: String,
}

#[derive(Serialize)]
struct HasPasswordResponse {
    #[serde(rename = "hasPassword")]
    has_password: bool,
}

async fn check_password_handler(
    Query(query): Query<RoomQuery>,
    State(state): State<HubAppState>,
) -> Result<Json<HasPasswordResponse>, axum::http::StatusCode> {
    let code = RoomCode::parse(&query.room).map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;
    Ok(Json(HasPasswordResponse { has_password: state.hub.has_password(&code) }))
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordBody {
    #[serde(rename = "passwordHash")]
    password_hash: String,
}

#[derive(Serialize)]
struct SetPasswordResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn set_password_handler(
    Query(query): Query<RoomQuery>,
    State(state): State<HubAppState>,
    Json(body): Json<SetPasswordBody>,
) -> Result<Json<SetPasswordResponse>, axum::http::StatusCode> {
    let code = RoomCode::parse(&query.room).map_err(|_| axum::http::StatusCode::BAD_REQUEST)?;
    match state.hub.set_password(&code, body.password_hash) {
        Ok(()) => Ok(Json(SetPasswordResponse { success: true, error: None })),
        Err(e) => Ok(Json(SetPasswordResponse { success: false, error: Some(e.to_string()) })),
    }
}
