// src/transfer/mod.rs
// The Transfer Protocol (C4) — spec §4.4: the three-phase file transfer
// protocol (request, response, streaming) plus cancellation and the key
// exchange fallback (§4.5).
//
// The teacher's `file_transfer.rs` has the same three-phase shape
// (`FileTransferRequest`/`FileTransferResponse` then chunked delivery over
// UDP with an on-disk `downloads_dir`); this keeps that shape — request,
// response, streaming loop, progress callback — but drops the disk-backed
// delivery (assembled bytes go to an observer, never written to a path)
// and adds the relay windowing the teacher's LAN-only design never needed.
//
// Per the re-architecting note in SPEC_FULL §9, the several peer-id-keyed
// maps the source scatters this logic across (`pendingFiles`,
// `incomingTransfers`, ...) are collapsed here into the phase-tagged state
// owned by one `TransferManager`; outgoing/incoming are still kept as
// distinct types since they really are disjoint roles, not a shared enum.

pub mod relay;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{CHUNK_SIZE, DIRECT_BACKPRESSURE_HIGH_WATERMARK, DIRECT_BACKPRESSURE_POLL, FILE_REQUEST_TIMEOUT, KEY_EXCHANGE_TIMEOUT};
use crate::connection::{DataChannelMessage, DirectTransport};
use crate::crypto::CryptoManager;
use crate::error::TransferError;
use crate::model::{PeerId, TransferMode};

/// An in-flight outgoing file transfer (spec §3 `OutgoingTransfer`).
pub struct OutgoingTransfer {
    pub file_id: Uuid,
    pub peer_id: PeerId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub mode: TransferMode,
    cancelled: Arc<AtomicBool>,
}

impl OutgoingTransfer {
    fn new(peer_id: PeerId, name: String, size: u64, mime_type: String, mode: TransferMode) -> Self {
        let total_chunks = chunk_count(size);
        OutgoingTransfer {
            file_id: Uuid::new_v4(),
            peer_id,
            name,
            size,
            mime_type,
            total_chunks,
            mode,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// `ceil(size / ChunkSize)` (spec §4.4 Phase 1).
pub fn chunk_count(size: u64) -> u32 {
    if size == 0 {
        0
    } else {
        (((size - 1) / CHUNK_SIZE as u64) + 1) as u32
    }
}

/// Assembly state for one inbound file, whichever path it arrives on.
/// Chunks are keyed by index so relay retransmits and direct-path
/// sequential pushes share the same finalization logic (spec §4.4.2
/// "Integrity on completion", §8 invariant 4).
struct IncomingAssembly {
    peer_id: PeerId,
    name: String,
    size: u64,
    mime_type: String,
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
    next_direct_index: u32,
}

impl IncomingAssembly {
    fn new(peer_id: PeerId, name: String, size: u64, mime_type: String, total_chunks: u32) -> Self {
        IncomingAssembly {
            peer_id,
            name,
            size,
            mime_type,
            total_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            next_direct_index: 0,
        }
    }

    /// Inserts a chunk by explicit index (relay path). Duplicates are
    /// dropped but the caller still ACKs them (spec §4.4.2).
    fn insert(&mut self, index: u32, plaintext: Vec<u8>) {
        if let std::collections::btree_map::Entry::Vacant(entry) = self.chunks.entry(index) {
            self.received_bytes += plaintext.len() as u64;
            entry.insert(plaintext);
        }
    }

    /// Appends a chunk in arrival order (direct path — the transport
    /// already guarantees ordering, so no explicit index is sent).
    fn push_direct(&mut self, plaintext: Vec<u8>) {
        let idx = self.next_direct_index;
        self.next_direct_index += 1;
        self.insert(idx, plaintext);
    }

    fn missing_indices(&self) -> Vec<u32> {
        (0..self.total_chunks).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    fn assembled_bytes(&self) -> Vec<u8> {
        self.chunks.values().flat_map(|c| c.iter().copied()).collect()
    }
}

/// Control frames mirrored onto the direct data channel alongside raw
/// binary chunk frames (spec §4.4.1, §4.4 "Cancellation").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum DirectControlFrame {
    #[serde(rename_all = "camelCase")]
    FileStart { file_id: Uuid, name: String, size: u64, mime_type: String, total_chunks: u32 },
    #[serde(rename_all = "camelCase")]
    FileEnd { file_id: Uuid },
    #[serde(rename_all = "camelCase")]
    FileCancel { file_id: Uuid, reason: String },
}

enum FileResponseOutcome {
    Accepted,
    Declined,
    Cancelled(String),
}

/// Where control frames (request/response/cancel/relay chunk/ack/key
/// exchange) get sent — the hub, over `/ws`. Kept abstract for the same
/// reason `connection::SignalingSink` is: this module doesn't depend on
/// the hub's wire `Frame` type.
#[async_trait]
pub trait TransferSignaling: Send + Sync {
    async fn send_file_request(&self, to: PeerId, file_id: Uuid, name: String, size: u64, mime_type: String, total_chunks: u32, mode: TransferMode);
    async fn send_file_response(&self, to: PeerId, file_id: Uuid, accepted: bool);
    async fn send_file_cancel(&self, to: PeerId, file_id: Uuid, reason: String);
    async fn send_relay_start(&self, to: PeerId, file_id: Uuid, name: String, size: u64, mime_type: String, total_chunks: u32);
    async fn send_relay_chunk(&self, to: PeerId, file_id: Uuid, index: u32, data_b64: String, retry: bool);
    async fn send_relay_ack(&self, to: PeerId, file_id: Uuid, acks: Vec<u32>);
    async fn send_relay_end(&self, to: PeerId, file_id: Uuid, total_chunks: u32);
    async fn send_key_exchange(&self, to: PeerId, public_key_b64: String);
    async fn send_text(&self, to: PeerId, body: String);
}

/// Events delivered to whatever is presenting the transfer to a user
/// (spec §6 "External collaborator contracts").
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, peer: PeerId, file_id: Uuid, sent: u64, total: u64);
    fn on_incoming_request(&self, peer: PeerId, file_id: Uuid, name: String, size: u64, mime_type: String);
    fn on_file_received(&self, peer: PeerId, file_id: Uuid, name: String, mime_type: String, bytes: Vec<u8>, complete: bool, missing: Vec<u32>);
    fn on_text_received(&self, peer: PeerId, body: String);
    fn on_transfer_complete(&self, peer: PeerId, file_id: Uuid);
    fn on_transfer_failed(&self, peer: PeerId, file_id: Uuid, error: String);
    fn on_cancelled(&self, peer: PeerId, file_id: Uuid, reason: String);
}

/// Decides whether to accept an incoming file (spec §6: "a function used
/// by the transfer protocol to ask the user whether to accept"). A
/// trusted-device store can short-circuit this without the protocol
/// knowing the difference.
#[async_trait]
pub trait AcceptancePolicy: Send + Sync {
    async fn should_accept(&self, peer: PeerId, name: &str, size: u64, mime_type: &str) -> bool;
}

/// Governs what happens to a relay transfer missing chunks after the
/// completion grace period (spec §9 "Open questions in the source").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompletePolicy {
    /// Deliver the partial blob with a completion warning (the default).
    DeliverWithWarning,
    /// Reject the transfer outright; the caller never sees partial bytes.
    IntegrityFailed,
}

impl Default for IncompletePolicy {
    fn default() -> Self {
        IncompletePolicy::DeliverWithWarning
    }
}

/// The Transfer Protocol engine. One instance serves every peer and every
/// in-flight transfer; per-transfer state lives in `pending_responses` /
/// `incoming` / the relay maps in `relay.rs`, never in a global mutable
/// struct shared across transfers.
pub struct TransferManager {
    crypto: Arc<CryptoManager>,
    signaling: Arc<dyn TransferSignaling>,
    observer: Arc<dyn TransferObserver>,
    incomplete_policy: IncompletePolicy,

    pending_responses: Mutex<HashMap<Uuid, oneshot::Sender<FileResponseOutcome>>>,
    incoming: Mutex<HashMap<Uuid, Arc<Mutex<IncomingAssembly>>>>,
    active_direct_incoming: Mutex<HashMap<PeerId, Uuid>>,

    pending_key_exchange: Mutex<HashMap<PeerId, oneshot::Sender<()>>>,
    sent_key_to: Mutex<HashSet<PeerId>>,

    pub(crate) relay_ack_channels: Mutex<HashMap<Uuid, tokio::sync::mpsc::UnboundedSender<Vec<u32>>>>,
    pub(crate) relay_ack_pending: Mutex<HashMap<Uuid, Vec<u32>>>,
}

impl TransferManager {
    pub fn new(crypto: Arc<CryptoManager>, signaling: Arc<dyn TransferSignaling>, observer: Arc<dyn TransferObserver>) -> Self {
        Self::with_policy(crypto, signaling, observer, IncompletePolicy::default())
    }

    pub fn with_policy(
        crypto: Arc<CryptoManager>,
        signaling: Arc<dyn TransferSignaling>,
        observer: Arc<dyn TransferObserver>,
        incomplete_policy: IncompletePolicy,
    ) -> Self {
        TransferManager {
            crypto,
            signaling,
            observer,
            incomplete_policy,
            pending_responses: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            active_direct_incoming: Mutex::new(HashMap::new()),
            pending_key_exchange: Mutex::new(HashMap::new()),
            sent_key_to: Mutex::new(HashSet::new()),
            relay_ack_channels: Mutex::new(HashMap::new()),
            relay_ack_pending: Mutex::new(HashMap::new()),
        }
    }

    // ---- Phase 1/2: request & response (sender side) ----------------

    /// Spec §4.4 Phase 1/2: emits `file-request`, arms the 60 s timeout,
    /// and waits for the peer's decision.
    pub async fn request_transfer(
        &self,
        peer_id: PeerId,
        name: String,
        size: u64,
        mime_type: String,
        mode: TransferMode,
    ) -> Result<OutgoingTransfer, TransferError> {
        let transfer = OutgoingTransfer::new(peer_id, name.clone(), size, mime_type.clone(), mode);
        let (tx, rx) = oneshot::channel();
        self.pending_responses.lock().unwrap().insert(transfer.file_id, tx);

        self.signaling
            .send_file_request(peer_id, transfer.file_id, name, size, mime_type, transfer.total_chunks, mode)
            .await;

        let outcome = tokio::time::timeout(FILE_REQUEST_TIMEOUT, rx).await;
        self.pending_responses.lock().unwrap().remove(&transfer.file_id);

        match outcome {
            Ok(Ok(FileResponseOutcome::Accepted)) => Ok(transfer),
            Ok(Ok(FileResponseOutcome::Declined)) => Err(TransferError::PeerDeclined),
            Ok(Ok(FileResponseOutcome::Cancelled(reason))) => Err(TransferError::PeerCancelled(reason)),
            Ok(Err(_)) | Err(_) => Err(TransferError::PeerDidNotRespond),
        }
    }

    /// Fulfils a pending `request_transfer` call on receipt of
    /// `file-response`.
    pub fn on_file_response(&self, file_id: Uuid, accepted: bool) {
        if let Some(tx) = self.pending_responses.lock().unwrap().remove(&file_id) {
            let _ = tx.send(if accepted { FileResponseOutcome::Accepted } else { FileResponseOutcome::Declined });
        }
    }

    /// Receiver side of Phase 1/2: consults `policy`, replies, and (on
    /// acceptance) opens the assembly state for Phase 3.
    pub async fn handle_file_request(
        &self,
        peer_id: PeerId,
        file_id: Uuid,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        policy: &dyn AcceptancePolicy,
    ) {
        let accept = policy.should_accept(peer_id, &name, size, &mime_type).await;
        self.signaling.send_file_response(peer_id, file_id, accept).await;
        if accept {
            self.incoming.lock().unwrap().insert(
                file_id,
                Arc::new(Mutex::new(IncomingAssembly::new(peer_id, name.clone(), size, mime_type.clone(), total_chunks))),
            );
            self.observer.on_incoming_request(peer_id, file_id, name, size, mime_type);
        }
    }

    // ---- Cancellation (spec §4.4 "Cancellation") ---------------------

    /// Either the sender's still-waiting request or a receiver's in-flight
    /// assembly can be cancelled by the same control frame.
    pub fn on_file_cancel(&self, file_id: Uuid, reason: String) {
        if let Some(tx) = self.pending_responses.lock().unwrap().remove(&file_id) {
            let _ = tx.send(FileResponseOutcome::Cancelled(reason));
            return;
        }
        self.cancel_incoming(file_id, reason);
    }

    fn cancel_incoming(&self, file_id: Uuid, reason: String) {
        self.relay_ack_pending.lock().unwrap().remove(&file_id);
        if let Some(assembly) = self.incoming.lock().unwrap().remove(&file_id) {
            let peer_id = assembly.lock().unwrap().peer_id;
            self.observer.on_cancelled(peer_id, file_id, reason);
        }
    }

    /// Sends `file-cancel` over the hub, mirrored onto the data channel
    /// when one is open (spec §4.4 "Cancellation").
    pub async fn cancel_transfer(&self, transfer: &OutgoingTransfer, reason: String, transport: Option<&Arc<dyn DirectTransport>>) {
        transfer.cancel();
        self.signaling.send_file_cancel(transfer.peer_id, transfer.file_id, reason.clone()).await;
        if let Some(transport) = transport {
            let frame = DirectControlFrame::FileCancel { file_id: transfer.file_id, reason };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = transport.send_text(&json).await;
            }
        }
    }

    // ---- Phase 3: direct-path streaming (spec §4.4.1) -----------------

    pub async fn send_direct(
        &self,
        transport: &Arc<dyn DirectTransport>,
        transfer: &OutgoingTransfer,
        mut source: impl tokio::io::AsyncRead + Unpin,
    ) -> Result<(), TransferError> {
        let start = DirectControlFrame::FileStart {
            file_id: transfer.file_id,
            name: transfer.name.clone(),
            size: transfer.size,
            mime_type: transfer.mime_type.clone(),
            total_chunks: transfer.total_chunks,
        };
        transport
            .send_text(&serde_json::to_string(&start).expect("control frame always serializes"))
            .await
            .map_err(|_| TransferError::UnknownTransfer(transfer.file_id.to_string()))?;

        let mut offset: u64 = 0;
        while offset < transfer.size {
            if transfer.is_cancelled() {
                return Err(TransferError::UserCancelled);
            }
            let want = std::cmp::min(CHUNK_SIZE as u64, transfer.size - offset) as usize;
            let mut buf = vec![0u8; want];
            source
                .read_exact(&mut buf)
                .await
                .map_err(|_| TransferError::UnknownTransfer(transfer.file_id.to_string()))?;

            let wire = self.crypto.encrypt_chunk(transfer.peer_id, &buf)?;

            while transport.buffered_amount() > DIRECT_BACKPRESSURE_HIGH_WATERMARK {
                if transfer.is_cancelled() {
                    return Err(TransferError::UserCancelled);
                }
                tokio::time::sleep(DIRECT_BACKPRESSURE_POLL).await;
            }
            transport
                .send(&wire)
                .await
                .map_err(|_| TransferError::UnknownTransfer(transfer.file_id.to_string()))?;

            offset += want as u64;
            self.observer.on_progress(transfer.peer_id, transfer.file_id, offset, transfer.size);
        }

        let end = DirectControlFrame::FileEnd { file_id: transfer.file_id };
        let _ = transport.send_text(&serde_json::to_string(&end).expect("control frame always serializes")).await;
        self.observer.on_transfer_complete(transfer.peer_id, transfer.file_id);
        Ok(())
    }

    /// Drains a peer's direct data channel, dispatching control frames and
    /// binary chunks to the matching `IncomingAssembly`. One loop per
    /// connected peer; direct-path transfers are sequential (one active
    /// file-id per peer at a time), matching the wire format's lack of an
    /// explicit chunk `fileId`.
    pub async fn run_direct_receive_loop(self: Arc<Self>, peer_id: PeerId, transport: Arc<dyn DirectTransport>) {
        loop {
            match transport.recv().await {
                Some(DataChannelMessage::Text(json)) => {
                    let Ok(frame) = serde_json::from_str::<DirectControlFrame>(&json) else { continue };
                    match frame {
                        DirectControlFrame::FileStart { file_id, name, size, mime_type, total_chunks } => {
                            self.incoming.lock().unwrap().insert(
                                file_id,
                                Arc::new(Mutex::new(IncomingAssembly::new(peer_id, name.clone(), size, mime_type.clone(), total_chunks))),
                            );
                            self.active_direct_incoming.lock().unwrap().insert(peer_id, file_id);
                            self.observer.on_incoming_request(peer_id, file_id, name, size, mime_type);
                        }
                        DirectControlFrame::FileEnd { file_id } => {
                            self.active_direct_incoming.lock().unwrap().remove(&peer_id);
                            self.finalize_incoming(file_id, None).await;
                        }
                        DirectControlFrame::FileCancel { file_id, reason } => {
                            self.active_direct_incoming.lock().unwrap().remove(&peer_id);
                            self.cancel_incoming(file_id, reason);
                        }
                    }
                }
                Some(DataChannelMessage::Binary(wire)) => {
                    let file_id = self.active_direct_incoming.lock().unwrap().get(&peer_id).copied();
                    let Some(file_id) = file_id else { continue };
                    match self.crypto.decrypt_chunk(peer_id, &wire) {
                        Ok(plaintext) => {
                            let assembly = self.incoming.lock().unwrap().get(&file_id).cloned();
                            if let Some(assembly) = assembly {
                                let (sent, total) = {
                                    let mut a = assembly.lock().unwrap();
                                    a.push_direct(plaintext);
                                    (a.received_bytes, a.size)
                                };
                                self.observer.on_progress(peer_id, file_id, sent, total);
                            }
                        }
                        Err(e) => tracing::warn!(%peer_id, %file_id, error = %e, "dropping undecryptable direct chunk"),
                    }
                }
                None => break,
            }
        }
    }

    /// Common finalization for both streaming paths (spec §4.4.2
    /// "Integrity on completion", §8 invariants 3/4). `grace` is `Some`
    /// only for the relay path, which may still have chunks in flight.
    async fn finalize_incoming(&self, file_id: Uuid, grace: Option<std::time::Duration>) {
        let Some(assembly_arc) = self.incoming.lock().unwrap().get(&file_id).cloned() else { return };

        let mut missing = assembly_arc.lock().unwrap().missing_indices();
        if !missing.is_empty() {
            if let Some(grace) = grace {
                tokio::time::sleep(grace).await;
                missing = assembly_arc.lock().unwrap().missing_indices();
            }
        }

        if !missing.is_empty() && self.incomplete_policy == IncompletePolicy::IntegrityFailed {
            let peer_id = assembly_arc.lock().unwrap().peer_id;
            self.incoming.lock().unwrap().remove(&file_id);
            self.observer.on_transfer_failed(peer_id, file_id, format!("missing {} chunks", missing.len()));
            return;
        }

        let (peer_id, name, mime_type, size, bytes) = {
            let assembly = assembly_arc.lock().unwrap();
            (assembly.peer_id, assembly.name.clone(), assembly.mime_type.clone(), assembly.size, assembly.assembled_bytes())
        };
        if bytes.len() as u64 != size {
            tracing::warn!(%file_id, expected = size, actual = bytes.len(), "received file size mismatch");
        }
        self.incoming.lock().unwrap().remove(&file_id);
        self.observer.on_file_received(peer_id, file_id, name, mime_type, bytes, missing.is_empty(), missing);
    }

    // ---- Key exchange fallback (spec §4.5) ----------------------------

    /// Performs an explicit key exchange over the hub when a relay
    /// transfer must begin before any direct channel (and its implicit
    /// ECDH handshake) has opened.
    pub async fn ensure_peer_key(&self, peer_id: PeerId) -> Result<(), TransferError> {
        if self.crypto.has_peer_key(peer_id) {
            return Ok(());
        }
        let local_pub = self.crypto.export_local_public_key()?;
        let (tx, rx) = oneshot::channel();
        self.pending_key_exchange.lock().unwrap().insert(peer_id, tx);
        self.sent_key_to.lock().unwrap().insert(peer_id);
        self.signaling.send_key_exchange(peer_id, local_pub).await;

        match tokio::time::timeout(KEY_EXCHANGE_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.pending_key_exchange.lock().unwrap().remove(&peer_id);
                Err(TransferError::PeerDidNotRespond)
            }
        }
    }

    /// Handles an incoming `key-exchange{publicKey}` frame: imports the
    /// peer's key, and — if we haven't sent ours yet this session — sends
    /// it back (spec §4.5).
    pub async fn on_key_exchange(&self, peer_id: PeerId, public_key_b64: &str) {
        let already_sent = self.sent_key_to.lock().unwrap().contains(&peer_id);
        if self.crypto.import_peer_public_key(peer_id, public_key_b64).is_ok() {
            if let Some(tx) = self.pending_key_exchange.lock().unwrap().remove(&peer_id) {
                let _ = tx.send(());
            }
        }
        if !already_sent {
            if let Ok(local_pub) = self.crypto.export_local_public_key() {
                self.sent_key_to.lock().unwrap().insert(peer_id);
                self.signaling.send_key_exchange(peer_id, local_pub).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct LoopbackTransport {
        inbound: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<DataChannelMessage>>,
        outbound: tokio::sync::mpsc::UnboundedSender<DataChannelMessage>,
        open: AtomicBool,
    }

    #[async_trait]
    impl DirectTransport for LoopbackTransport {
        async fn create_offer(&self) -> Result<String, crate::error::EngineError> {
            Ok(String::new())
        }
        async fn create_answer(&self, _remote_sdp: &str) -> Result<String, crate::error::EngineError> {
            Ok(String::new())
        }
        async fn accept_answer(&self, _remote_sdp: &str) -> Result<(), crate::error::EngineError> {
            Ok(())
        }
        async fn rollback(&self) -> Result<(), crate::error::EngineError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: &str) -> Result<(), crate::error::EngineError> {
            Ok(())
        }
        async fn restart_ice(&self) -> Result<String, crate::error::EngineError> {
            Ok(String::new())
        }
        async fn set_ice_servers(&self, _servers: Vec<String>) -> Result<(), crate::error::EngineError> {
            Ok(())
        }
        fn gathered_candidates(&self) -> Vec<crate::model::CandidateKind> {
            vec![crate::model::CandidateKind::Host]
        }
        fn gathering_complete(&self) -> bool {
            true
        }
        fn ice_connection_state(&self) -> crate::connection::IceConnectionState {
            crate::connection::IceConnectionState::Connected
        }
        fn is_data_channel_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn send(&self, data: &[u8]) -> Result<(), crate::error::EngineError> {
            let _ = self.outbound.send(DataChannelMessage::Binary(data.to_vec()));
            Ok(())
        }
        async fn send_text(&self, text: &str) -> Result<(), crate::error::EngineError> {
            let _ = self.outbound.send(DataChannelMessage::Text(text.to_string()));
            Ok(())
        }
        async fn recv(&self) -> Option<DataChannelMessage> {
            self.inbound.lock().await.recv().await
        }
        fn buffered_amount(&self) -> usize {
            0
        }
        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn loopback_pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let (a_to_b_tx, a_to_b_rx) = tokio::sync::mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = tokio::sync::mpsc::unbounded_channel();
        let a = Arc::new(LoopbackTransport {
            inbound: tokio::sync::Mutex::new(b_to_a_rx),
            outbound: a_to_b_tx,
            open: AtomicBool::new(true),
        });
        let b = Arc::new(LoopbackTransport {
            inbound: tokio::sync::Mutex::new(a_to_b_rx),
            outbound: b_to_a_tx,
            open: AtomicBool::new(true),
        });
        (a, b)
    }

    struct NoopSignaling;
    #[async_trait]
    impl TransferSignaling for NoopSignaling {
        async fn send_file_request(&self, _to: PeerId, _file_id: Uuid, _name: String, _size: u64, _mime_type: String, _total_chunks: u32, _mode: TransferMode) {}
        async fn send_file_response(&self, _to: PeerId, _file_id: Uuid, _accepted: bool) {}
        async fn send_file_cancel(&self, _to: PeerId, _file_id: Uuid, _reason: String) {}
        async fn send_relay_start(&self, _to: PeerId, _file_id: Uuid, _name: String, _size: u64, _mime_type: String, _total_chunks: u32) {}
        async fn send_relay_chunk(&self, _to: PeerId, _file_id: Uuid, _index: u32, _data_b64: String, _retry: bool) {}
        async fn send_relay_ack(&self, _to: PeerId, _file_id: Uuid, _acks: Vec<u32>) {}
        async fn send_relay_end(&self, _to: PeerId, _file_id: Uuid, _total_chunks: u32) {}
        async fn send_key_exchange(&self, _to: PeerId, _public_key_b64: String) {}
        async fn send_text(&self, _to: PeerId, _body: String) {}
    }

    #[derive(Default)]
    struct RecordingObserver {
        received: Mutex<Vec<(String, Vec<u8>, bool)>>,
    }
    impl TransferObserver for RecordingObserver {
        fn on_progress(&self, _peer: PeerId, _file_id: Uuid, _sent: u64, _total: u64) {}
        fn on_incoming_request(&self, _peer: PeerId, _file_id: Uuid, _name: String, _size: u64, _mime_type: String) {}
        fn on_file_received(&self, _peer: PeerId, _file_id: Uuid, name: String, _mime_type: String, bytes: Vec<u8>, complete: bool, _missing: Vec<u32>) {
            self.received.lock().unwrap().push((name, bytes, complete));
        }
        fn on_text_received(&self, _peer: PeerId, _body: String) {}
        fn on_transfer_complete(&self, _peer: PeerId, _file_id: Uuid) {}
        fn on_transfer_failed(&self, _peer: PeerId, _file_id: Uuid, _error: String) {}
        fn on_cancelled(&self, _peer: PeerId, _file_id: Uuid, _reason: String) {}
    }

    /// End-to-end: a direct-path send streams file-start, one binary
    /// chunk, and file-end across a loopback transport, and the receiving
    /// manager assembles the exact original bytes (spec §4.4.1, §8 scenario 1).
    #[tokio::test]
    async fn direct_path_streams_and_reassembles_a_small_file() {
        let peer_a = PeerId::new();
        let peer_b = PeerId::new();

        let crypto_a = Arc::new(CryptoManager::new());
        let crypto_b = Arc::new(CryptoManager::new());
        crypto_a.generate_local_keypair();
        crypto_b.generate_local_keypair();
        crypto_a.import_peer_public_key(peer_b, &crypto_b.export_local_public_key().unwrap()).unwrap();
        crypto_b.import_peer_public_key(peer_a, &crypto_a.export_local_public_key().unwrap()).unwrap();

        let (transport_a, transport_b) = loopback_pair();
        let transport_a: Arc<dyn DirectTransport> = transport_a;
        let transport_b: Arc<dyn DirectTransport> = transport_b;

        let observer_b = Arc::new(RecordingObserver::default());
        let manager_b = Arc::new(TransferManager::new(crypto_b, Arc::new(NoopSignaling), observer_b.clone()));
        let manager_a = TransferManager::new(crypto_a, Arc::new(NoopSignaling), Arc::new(RecordingObserver::default()));

        let recv_loop = tokio::spawn(manager_b.clone().run_direct_receive_loop(peer_a, transport_b.clone()));

        let payload = b"hello clouddrop, this is a direct-path test payload".to_vec();
        let transfer = OutgoingTransfer::new(peer_b, "greeting.txt".to_string(), payload.len() as u64, "text/plain".to_string(), TransferMode::Direct);
        manager_a.send_direct(&transport_a, &transfer, std::io::Cursor::new(payload.clone())).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        recv_loop.abort();

        let received = observer_b.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "greeting.txt");
        assert_eq!(received[0].1, payload);
        assert!(received[0].2);
    }

    #[test]
    fn chunk_count_boundaries() {
        // Spec §8 boundary behaviors.
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(chunk_count(100 * 1024), 2); // 100 KiB -> 64 KiB + 36 KiB
    }

    #[test]
    fn incoming_assembly_drops_duplicate_indices_but_keeps_first_bytes() {
        let mut assembly = IncomingAssembly::new(PeerId::new(), "f".into(), 4, "application/octet-stream".into(), 2);
        assembly.insert(0, vec![1, 2]);
        assembly.insert(0, vec![9, 9]); // duplicate: dropped
        assembly.insert(1, vec![3, 4]);
        assert_eq!(assembly.assembled_bytes(), vec![1, 2, 3, 4]);
        assert!(assembly.missing_indices().is_empty());
    }

    #[test]
    fn incoming_assembly_reports_missing_indices() {
        let mut assembly = IncomingAssembly::new(PeerId::new(), "f".into(), 10, "text/plain".into(), 3);
        assembly.insert(0, vec![0; 4]);
        assembly.insert(2, vec![0; 2]);
        assert_eq!(assembly.missing_indices(), vec![1]);
    }

    #[test]
    fn direct_path_push_assigns_sequential_indices() {
        let mut assembly = IncomingAssembly::new(PeerId::new(), "f".into(), 4, "application/octet-stream".into(), 2);
        assembly.push_direct(vec![1, 2]);
        assembly.push_direct(vec![3, 4]);
        assert_eq!(assembly.assembled_bytes(), vec![1, 2, 3, 4]);
    }
}
