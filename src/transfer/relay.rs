// src/transfer/relay.rs
// Relay-path streaming (spec §4.4.2): a windowed, acknowledged,
// retransmitting chunk stream carried over the hub's WebSocket instead of
// a direct data channel.
//
// The teacher has nothing resembling this (LAN UDP broadcast has no
// relay concept); the shape — bounded in-flight window, per-chunk ACK
// timeout, batched ACKs, a stall timeout distinct from the per-chunk
// timeout — is grounded directly in the spec's own numbers (§5) since
// there's no example-repo analogue closer than "a TCP-like ARQ loop".

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::AsyncReadExt;

use super::{IncomingAssembly, OutgoingTransfer, TransferManager};
use crate::config::{CHUNK_SIZE, RELAY_ACK_BATCH_SIZE, RELAY_ACK_TIMEOUT, RELAY_CHUNK_INTERVAL, RELAY_COMPLETION_GRACE, RELAY_MAX_CHUNK_RETRIES, RELAY_WINDOW_SIZE, RELAY_TRANSFER_TIMEOUT};
use crate::error::TransferError;
use crate::model::PeerId;

struct PendingChunk {
    data_b64: String,
    retries: u32,
    sent_at: Instant,
}

impl TransferManager {
    /// Streams `source` to `transfer.peer_id` over the relay path: a
    /// sliding window of unacknowledged chunks, per-chunk retransmission
    /// on ACK timeout, and a stall timeout if the window stops draining
    /// entirely (spec §4.4.2).
    pub async fn send_relay(&self, transfer: &OutgoingTransfer, mut source: impl tokio::io::AsyncRead + Unpin) -> Result<(), TransferError> {
        self.signaling
            .send_relay_start(transfer.peer_id, transfer.file_id, transfer.name.clone(), transfer.size, transfer.mime_type.clone(), transfer.total_chunks)
            .await;

        let (ack_tx, mut ack_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u32>>();
        self.relay_ack_channels.lock().unwrap().insert(transfer.file_id, ack_tx);
        let cleanup = |manager: &TransferManager| {
            manager.relay_ack_channels.lock().unwrap().remove(&transfer.file_id);
        };

        let mut pending: BTreeMap<u32, PendingChunk> = BTreeMap::new();
        let mut next_index: u32 = 0;
        let mut offset: u64 = 0;
        let mut acked_count: u64 = 0;
        let mut last_progress = Instant::now();

        while next_index < transfer.total_chunks || !pending.is_empty() {
            if transfer.is_cancelled() {
                cleanup(self);
                return Err(TransferError::UserCancelled);
            }

            while let Ok(acks) = ack_rx.try_recv() {
                for idx in acks {
                    if pending.remove(&idx).is_some() {
                        acked_count += 1;
                    }
                }
                last_progress = Instant::now();
                self.observer
                    .on_progress(transfer.peer_id, transfer.file_id, acked_count * CHUNK_SIZE as u64, transfer.size);
            }

            if !pending.is_empty() && last_progress.elapsed() > RELAY_TRANSFER_TIMEOUT {
                cleanup(self);
                return Err(TransferError::RelayStalled);
            }

            if pending.len() < RELAY_WINDOW_SIZE && next_index < transfer.total_chunks {
                let want = std::cmp::min(CHUNK_SIZE as u64, transfer.size - offset) as usize;
                let mut buf = vec![0u8; want];
                if let Err(e) = source.read_exact(&mut buf).await {
                    cleanup(self);
                    return Err(TransferError::UnknownTransfer(format!("{}: {e}", transfer.file_id)));
                }
                offset += want as u64;

                let wire = match self.crypto.encrypt_chunk(transfer.peer_id, &buf) {
                    Ok(wire) => wire,
                    Err(e) => {
                        cleanup(self);
                        return Err(e.into());
                    }
                };
                let b64 = BASE64.encode(&wire);
                self.signaling.send_relay_chunk(transfer.peer_id, transfer.file_id, next_index, b64.clone(), false).await;
                pending.insert(next_index, PendingChunk { data_b64: b64, retries: 0, sent_at: Instant::now() });
                next_index += 1;
                tokio::time::sleep(RELAY_CHUNK_INTERVAL).await;
                continue;
            }

            let oldest = pending.keys().next().copied();
            let Some(oldest_idx) = oldest else { continue };
            let elapsed = pending[&oldest_idx].sent_at.elapsed();

            if elapsed >= RELAY_ACK_TIMEOUT {
                let chunk = pending.get_mut(&oldest_idx).expect("oldest index present");
                chunk.retries += 1;
                if chunk.retries > RELAY_MAX_CHUNK_RETRIES {
                    cleanup(self);
                    return Err(TransferError::RelayRetransmitExhausted(oldest_idx));
                }
                self.signaling
                    .send_relay_chunk(transfer.peer_id, transfer.file_id, oldest_idx, chunk.data_b64.clone(), true)
                    .await;
                chunk.sent_at = Instant::now();
            } else {
                let wait = RELAY_ACK_TIMEOUT - elapsed;
                tokio::select! {
                    acks = ack_rx.recv() => {
                        if let Some(acks) = acks {
                            for idx in acks {
                                if pending.remove(&idx).is_some() {
                                    acked_count += 1;
                                }
                            }
                            last_progress = Instant::now();
                            self.observer.on_progress(transfer.peer_id, transfer.file_id, acked_count * CHUNK_SIZE as u64, transfer.size);
                        }
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        cleanup(self);
        self.signaling.send_relay_end(transfer.peer_id, transfer.file_id, transfer.total_chunks).await;
        self.observer.on_transfer_complete(transfer.peer_id, transfer.file_id);
        Ok(())
    }

    /// Opens assembly state for an inbound relay transfer (spec §4.4.2).
    pub async fn on_relay_start(&self, peer_id: PeerId, file_id: uuid::Uuid, name: String, size: u64, mime_type: String, total_chunks: u32) {
        self.incoming.lock().unwrap().insert(
            file_id,
            Arc::new(std::sync::Mutex::new(IncomingAssembly::new(peer_id, name.clone(), size, mime_type.clone(), total_chunks))),
        );
        self.relay_ack_pending.lock().unwrap().insert(file_id, Vec::new());
        self.observer.on_incoming_request(peer_id, file_id, name, size, mime_type);
    }

    /// Decrypts and stores one relay chunk, batching its index into the
    /// next ACK (spec §4.4.2: "receiver batches ACKs ... sent every
    /// `AckBatchSize` chunks"). Duplicate chunks are dropped but still
    /// acked, since the sender only knows a chunk landed once it sees one.
    pub async fn on_relay_chunk(&self, peer_id: PeerId, file_id: uuid::Uuid, index: u32, data_b64: String) {
        let Some(assembly) = self.incoming.lock().unwrap().get(&file_id).cloned() else { return };
        let Ok(wire) = BASE64.decode(&data_b64) else { return };

        let already_have = assembly.lock().unwrap().chunks.contains_key(&index);
        if !already_have {
            match self.crypto.decrypt_chunk(peer_id, &wire) {
                Ok(plaintext) => {
                    let (sent, total) = {
                        let mut a = assembly.lock().unwrap();
                        a.insert(index, plaintext);
                        (a.received_bytes, a.size)
                    };
                    self.observer.on_progress(peer_id, file_id, sent, total);
                }
                Err(e) => tracing::warn!(%file_id, index, error = %e, "dropping undecryptable relay chunk"),
            }
        }

        let flush = {
            let mut pending_acks = self.relay_ack_pending.lock().unwrap();
            let batch = pending_acks.entry(file_id).or_default();
            batch.push(index);
            if batch.len() >= RELAY_ACK_BATCH_SIZE {
                Some(std::mem::take(batch))
            } else {
                None
            }
        };
        if let Some(acks) = flush {
            self.signaling.send_relay_ack(peer_id, file_id, acks).await;
        }
    }

    /// Notifies the sender side when one of our ACK batches should be
    /// considered delivered (wires `on_relay_ack` frames back into the
    /// waiting `send_relay` loop).
    pub fn on_relay_ack(&self, file_id: uuid::Uuid, acks: Vec<u32>) {
        if let Some(tx) = self.relay_ack_channels.lock().unwrap().get(&file_id) {
            let _ = tx.send(acks);
        }
    }

    /// Flushes any unbatched ACKs and finalizes the assembly after a grace
    /// period for straggling chunks (spec §4.4.2 "Integrity on completion").
    pub async fn on_relay_end(&self, peer_id: PeerId, file_id: uuid::Uuid, _total_chunks: u32) {
        let leftover = self.relay_ack_pending.lock().unwrap().remove(&file_id).unwrap_or_default();
        if !leftover.is_empty() {
            self.signaling.send_relay_ack(peer_id, file_id, leftover).await;
        }
        self.finalize_incoming(file_id, Some(RELAY_COMPLETION_GRACE)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoManager;
    use crate::error::TransferError;
    use crate::model::TransferMode;
    use crate::transfer::{AcceptancePolicy, TransferObserver, TransferSignaling};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct ChunkEvent {
        file_id: uuid::Uuid,
        index: u32,
        retry: bool,
    }

    /// Records every chunk `send_relay` hands to signaling; every other
    /// frame kind is a no-op since these tests only exercise the sender
    /// side of the relay path.
    struct RecordingSignaling {
        sent: tokio::sync::mpsc::UnboundedSender<ChunkEvent>,
    }

    #[async_trait]
    impl TransferSignaling for RecordingSignaling {
        async fn send_file_request(&self, _to: PeerId, _file_id: uuid::Uuid, _name: String, _size: u64, _mime_type: String, _total_chunks: u32, _mode: TransferMode) {}
        async fn send_file_response(&self, _to: PeerId, _file_id: uuid::Uuid, _accepted: bool) {}
        async fn send_file_cancel(&self, _to: PeerId, _file_id: uuid::Uuid, _reason: String) {}
        async fn send_relay_start(&self, _to: PeerId, _file_id: uuid::Uuid, _name: String, _size: u64, _mime_type: String, _total_chunks: u32) {}
        async fn send_relay_chunk(&self, _to: PeerId, file_id: uuid::Uuid, index: u32, _data_b64: String, retry: bool) {
            let _ = self.sent.send(ChunkEvent { file_id, index, retry });
        }
        async fn send_relay_ack(&self, _to: PeerId, _file_id: uuid::Uuid, _acks: Vec<u32>) {}
        async fn send_relay_end(&self, _to: PeerId, _file_id: uuid::Uuid, _total_chunks: u32) {}
        async fn send_key_exchange(&self, _to: PeerId, _public_key_b64: String) {}
        async fn send_text(&self, _to: PeerId, _body: String) {}
    }

    struct NoopObserver;
    impl TransferObserver for NoopObserver {
        fn on_progress(&self, _peer: PeerId, _file_id: uuid::Uuid, _sent: u64, _total: u64) {}
        fn on_incoming_request(&self, _peer: PeerId, _file_id: uuid::Uuid, _name: String, _size: u64, _mime_type: String) {}
        fn on_file_received(&self, _peer: PeerId, _file_id: uuid::Uuid, _name: String, _mime_type: String, _bytes: Vec<u8>, _complete: bool, _missing: Vec<u32>) {}
        fn on_text_received(&self, _peer: PeerId, _body: String) {}
        fn on_transfer_complete(&self, _peer: PeerId, _file_id: uuid::Uuid) {}
        fn on_transfer_failed(&self, _peer: PeerId, _file_id: uuid::Uuid, _error: String) {}
        fn on_cancelled(&self, _peer: PeerId, _file_id: uuid::Uuid, _reason: String) {}
    }

    #[allow(dead_code)]
    struct AlwaysAccept;
    #[async_trait]
    impl AcceptancePolicy for AlwaysAccept {
        async fn should_accept(&self, _peer: PeerId, _name: &str, _size: u64, _mime_type: &str) -> bool {
            true
        }
    }

    /// A sender-side `CryptoManager` with a key installed for `peer_b`, so
    /// `encrypt_chunk` succeeds without needing a matching receiver in
    /// these sender-only tests.
    fn sender_crypto(peer_b: PeerId) -> Arc<CryptoManager> {
        let sender = CryptoManager::new();
        sender.generate_local_keypair();
        let receiver = CryptoManager::new();
        receiver.generate_local_keypair();
        sender.import_peer_public_key(peer_b, &receiver.export_local_public_key().unwrap()).unwrap();
        Arc::new(sender)
    }

    fn make_manager(peer_b: PeerId) -> (Arc<TransferManager>, tokio::sync::mpsc::UnboundedReceiver<ChunkEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let signaling = Arc::new(RecordingSignaling { sent: tx });
        let manager = Arc::new(TransferManager::new(sender_crypto(peer_b), signaling, Arc::new(NoopObserver)));
        (manager, rx)
    }

    /// Spec §4.4.2 / §5: no more than `RelayWindowSize` chunks may be
    /// in flight unacknowledged at once. With nothing ever acked, the
    /// sender must stall at the window and retransmit the oldest chunk
    /// rather than push a fresh one past the cap.
    #[tokio::test(start_paused = true)]
    async fn window_cap_blocks_fresh_chunks_until_something_acks() {
        let peer_b = PeerId::new();
        let (manager, mut rx) = make_manager(peer_b);

        let total_chunks = (RELAY_WINDOW_SIZE as u32) * 2;
        let payload = vec![0u8; CHUNK_SIZE * total_chunks as usize];
        let transfer = OutgoingTransfer::new(peer_b, "big.bin".to_string(), payload.len() as u64, "application/octet-stream".to_string(), TransferMode::Relay);

        let handle = tokio::spawn(async move { manager.send_relay(&transfer, std::io::Cursor::new(payload)).await });

        let mut first_round = Vec::new();
        for _ in 0..RELAY_WINDOW_SIZE {
            let ev = rx.recv().await.expect("sender should fill the window");
            assert!(!ev.retry);
            first_round.push(ev.index);
        }
        assert_eq!(first_round, (0..RELAY_WINDOW_SIZE as u32).collect::<Vec<_>>());

        // Nothing has been acked, so the next event must be a retransmit of
        // the oldest chunk rather than chunk `RelayWindowSize` (which would
        // mean the cap was never enforced).
        let next = rx.recv().await.expect("sender should retransmit instead of advancing past the window");
        assert_eq!(next.index, 0);
        assert!(next.retry);

        handle.abort();
    }

    /// Spec §8 scenario 5: a single lost chunk is retransmitted once an ACK
    /// for it fails to arrive, and the transfer still completes.
    #[tokio::test(start_paused = true)]
    async fn a_single_dropped_chunk_is_retransmitted_and_then_acked() {
        let peer_b = PeerId::new();
        let (manager, mut rx) = make_manager(peer_b);

        let total_chunks = 5u32;
        let payload = vec![7u8; CHUNK_SIZE * total_chunks as usize];
        let transfer = OutgoingTransfer::new(peer_b, "f.bin".to_string(), payload.len() as u64, "application/octet-stream".to_string(), TransferMode::Relay);

        let log: Arc<Mutex<Vec<ChunkEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let acker_manager = manager.clone();
        let acker_log = log.clone();
        let acker = tokio::spawn(async move {
            let mut dropped_index_three_once = false;
            while let Some(ev) = rx.recv().await {
                acker_log.lock().unwrap().push(ev.clone());
                if ev.index == 3 && !ev.retry && !dropped_index_three_once {
                    dropped_index_three_once = true;
                    continue; // simulate the ack for this send never arriving
                }
                acker_manager.on_relay_ack(ev.file_id, vec![ev.index]);
            }
        });

        manager.send_relay(&transfer, std::io::Cursor::new(payload)).await.unwrap();
        acker.abort();

        let events = log.lock().unwrap();
        assert!(
            events.iter().any(|e| e.index == 3 && e.retry),
            "chunk 3 should have been retransmitted after the simulated drop"
        );
    }

    /// Spec §4.4.2: a chunk that never gets acked even after
    /// `RelayMaxChunkRetries` retransmissions surfaces as a hard failure
    /// rather than hanging forever.
    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_surfaces_relay_retransmit_exhausted() {
        let peer_b = PeerId::new();
        let (manager, _rx) = make_manager(peer_b);

        let payload = vec![1u8; CHUNK_SIZE];
        let transfer = OutgoingTransfer::new(peer_b, "f.bin".to_string(), payload.len() as u64, "application/octet-stream".to_string(), TransferMode::Relay);

        let err = manager.send_relay(&transfer, std::io::Cursor::new(payload)).await.unwrap_err();
        assert!(matches!(err, TransferError::RelayRetransmitExhausted(0)));
    }
}
