// src/connection/mod.rs
// The Connection Engine (C3) — spec §4.3, the hard part: per-peer racing
// between a direct WebRTC channel and a relay fallback, Perfect
// Negotiation, ICE restart policy, and silent background P2P recovery.
//
// The actual WebRTC/ICE machinery (SDP generation, candidate gathering,
// the browser's RTCPeerConnection) runs client-side and is out of scope
// here (spec §1 Non-goals). What belongs in this crate is the *state
// machine* that drives it: racing timers, collision resolution, restart
// counters, recovery scheduling. `DirectTransport` is the seam — it's the
// one piece of the corpus this module can't ground in an existing file
// (the teacher is LAN-UDP-only, no ICE at all), so the trait boundary and
// the tokio `select!`-based racing are grounded in the teacher's general
// pattern of "spawn a background task, talk to it over a channel/flag" as
// seen in `signaling.rs`'s listener thread, translated from OS threads to
// tokio tasks per the architecture note in SPEC_FULL.md §5.

pub mod ice;
pub mod negotiation;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::{
    BACKGROUND_RETRY_INITIAL_DELAY, BACKGROUND_RETRY_INTERVAL, BACKGROUND_RETRY_MAX_ATTEMPTS,
    CONNECTION_TIMEOUT, DISCONNECTED_TIMEOUT, FAST_FALLBACK_TIMEOUT, ICE_RESTART_DELAY,
    MAX_ICE_RESTARTS, PREWARM_DELAY_MAX, PREWARM_DELAY_MIN, SLOW_THRESHOLD,
};
use crate::crypto::CryptoManager;
use crate::error::EngineError;
use crate::model::{CandidateKind, ConnectionStatus, PeerId, TransferMode};
use negotiation::Negotiation;

use self::ice::{CandidatePrediction, IceServerRegistry};

/// Internal polling granularity for watching transport state. Not part of
/// the protocol (nothing on the wire depends on it); 50ms keeps the engine
/// responsive without busy-looping.
const DIRECT_STATE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Seam isolating the real WebRTC/ICE stack from the engine's state
/// machine. A production peer client implements this against its
/// platform's WebRTC bindings; tests implement it against an in-memory
/// stub.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Generates a local offer. Does not send it anywhere.
    async fn create_offer(&self) -> Result<String, EngineError>;
    /// Generates a local answer to a received remote offer.
    async fn create_answer(&self, remote_sdp: &str) -> Result<String, EngineError>;
    /// Applies a remote answer to a previously-sent local offer.
    async fn accept_answer(&self, remote_sdp: &str) -> Result<(), EngineError>;
    /// Rolls back a local offer that lost a Perfect Negotiation collision.
    async fn rollback(&self) -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), EngineError>;
    /// Issues a fresh offer with ICE-restart semantics.
    async fn restart_ice(&self) -> Result<String, EngineError>;
    /// Configures the RTCPeerConnection's ICE server list, ranked by
    /// `IceServerRegistry::ranked_servers` (spec §4.3 "ICE-server
    /// selection"). Called once, before the first offer of an attempt.
    async fn set_ice_servers(&self, servers: Vec<String>) -> Result<(), EngineError>;

    /// All candidates gathered so far, in gathering order.
    fn gathered_candidates(&self) -> Vec<CandidateKind>;
    fn gathering_complete(&self) -> bool;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn is_data_channel_open(&self) -> bool;

    /// Sends one binary frame (an encrypted file chunk).
    async fn send(&self, data: &[u8]) -> Result<(), EngineError>;
    /// Sends one text frame (`file-start`/`file-end`/`file-cancel` mirrored
    /// onto the data channel per spec §4.4.1 and §4.4 "Cancellation").
    async fn send_text(&self, text: &str) -> Result<(), EngineError>;
    /// Pulls the next inbound message, if any, without blocking
    /// indefinitely when the channel is idle (`None` means "nothing right
    /// now", not "closed").
    async fn recv(&self) -> Option<DataChannelMessage>;
    /// Approximate bytes queued for send but not yet flushed to the wire —
    /// the direct-path backpressure signal (spec §4.4.1).
    fn buffered_amount(&self) -> usize;
    async fn close(&self);
}

/// One inbound data-channel message (spec §4.4.1's text/binary framing).
#[derive(Debug, Clone)]
pub enum DataChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Where an offer/answer/ICE candidate gets sent — the hub, over `/ws`
/// (spec §4.2). Kept abstract so this module doesn't depend on the hub's
/// wire `Frame` type.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send_offer(&self, to: PeerId, sdp: String);
    async fn send_answer(&self, to: PeerId, sdp: String);
    async fn send_ice_candidate(&self, to: PeerId, candidate: String);
    async fn send_key_exchange(&self, to: PeerId, public_key_b64: String);
}

/// Connection state transitions delivered to the UI (spec §4.3
/// "Observable states").
pub trait ConnectionObserver: Send + Sync {
    fn on_status(&self, peer: PeerId, status: ConnectionStatus);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionMode {
    /// No connection attempt has been made yet.
    Idle,
    /// A direct attempt (or Perfect Negotiation exchange) is in flight.
    Negotiating,
    Direct,
    Relay,
}

struct PeerContext {
    id: PeerId,
    transport: tokio::sync::RwLock<Arc<dyn DirectTransport>>,
    negotiation: Mutex<Negotiation>,
    prediction: Mutex<CandidatePrediction>,
    mode: RwLock<ConnectionMode>,
    restart_count: AtomicU32,
    /// Serializes `ensure_connection` and prewarm attempts for one peer so
    /// they never race to open two direct channels at once (spec §9 design
    /// note on resolving the prewarm/real-transfer race).
    connect_lock: tokio::sync::Mutex<()>,
    left: std::sync::atomic::AtomicBool,
    recovery_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerContext {
    fn new(id: PeerId, local_id: &PeerId, transport: Arc<dyn DirectTransport>) -> Self {
        PeerContext {
            id,
            transport: tokio::sync::RwLock::new(transport),
            negotiation: Mutex::new(Negotiation::new(local_id, &id)),
            prediction: Mutex::new(CandidatePrediction::new()),
            mode: RwLock::new(ConnectionMode::Idle),
            restart_count: AtomicU32::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            left: std::sync::atomic::AtomicBool::new(false),
            recovery_handle: Mutex::new(None),
        }
    }
}

/// Classifies a raw ICE candidate SDP attribute line by its `typ` token
/// (spec GLOSSARY candidate kinds).
pub fn classify_candidate(candidate: &str) -> Option<CandidateKind> {
    let typ = candidate.split_whitespace().skip_while(|t| *t != "typ").nth(1)?;
    match typ {
        "host" => Some(CandidateKind::Host),
        "srflx" => Some(CandidateKind::Srflx),
        "prflx" => Some(CandidateKind::Prflx),
        "relay" => Some(CandidateKind::Relay),
        _ => None,
    }
}

enum RaceStage {
    BeforeSlow,
    BeforeFallback,
    BeforeCommit,
}

enum RaceOutcome {
    DirectFinished(Result<(), EngineError>),
    CommitToRelay,
}

/// The Connection Engine. One instance serves every peer the local client
/// knows about; state is keyed by `PeerId` in `peers`.
pub struct Engine {
    local_id: PeerId,
    crypto: Arc<CryptoManager>,
    signaling: Arc<dyn SignalingSink>,
    observer: Arc<dyn ConnectionObserver>,
    transport_factory: Box<dyn Fn(PeerId) -> Arc<dyn DirectTransport> + Send + Sync>,
    ice_servers: Arc<IceServerRegistry>,
    peers: RwLock<HashMap<PeerId, Arc<PeerContext>>>,
}

impl Engine {
    pub fn new(
        local_id: PeerId,
        crypto: Arc<CryptoManager>,
        signaling: Arc<dyn SignalingSink>,
        observer: Arc<dyn ConnectionObserver>,
        transport_factory: impl Fn(PeerId) -> Arc<dyn DirectTransport> + Send + Sync + 'static,
        ice_servers: Arc<IceServerRegistry>,
    ) -> Self {
        Engine {
            local_id,
            crypto,
            signaling,
            observer,
            transport_factory: Box::new(transport_factory),
            ice_servers,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a newly-discovered peer and, per spec §4.3 "Prewarming",
    /// schedules a silent direct-connection attempt.
    pub fn on_peer_discovered(self: &Arc<Self>, peer_id: PeerId) {
        {
            let mut peers = self.peers.write().unwrap();
            peers
                .entry(peer_id)
                .or_insert_with(|| Arc::new(PeerContext::new(peer_id, &self.local_id, (self.transport_factory)(peer_id))));
        }
        self.prewarm(peer_id);
    }

    /// Tears down all per-peer state on departure (spec §8 invariant 7).
    pub fn on_peer_left(&self, peer_id: PeerId) {
        if let Some(ctx) = self.peers.write().unwrap().remove(&peer_id) {
            ctx.left.store(true, Ordering::SeqCst);
            if let Some(handle) = ctx.recovery_handle.lock().unwrap().take() {
                handle.abort();
            }
        }
        self.crypto.forget_peer(peer_id);
    }

    fn peer_context(&self, peer_id: PeerId) -> Result<Arc<PeerContext>, EngineError> {
        self.peers
            .read()
            .unwrap()
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| EngineError::NoTransport(peer_id.to_string()))
    }

    pub fn current_mode(&self, peer_id: PeerId) -> Option<TransferMode> {
        let ctx = self.peers.read().unwrap().get(&peer_id)?.clone();
        match *ctx.mode.read().unwrap() {
            ConnectionMode::Direct => Some(TransferMode::Direct),
            ConnectionMode::Relay => Some(TransferMode::Relay),
            _ => None,
        }
    }

    async fn fast_path(&self, ctx: &Arc<PeerContext>) -> Option<TransferMode> {
        match *ctx.mode.read().unwrap() {
            ConnectionMode::Direct => {
                let transport = ctx.transport.read().await.clone();
                if transport.is_data_channel_open() && self.crypto.has_peer_key(ctx.id) {
                    return Some(TransferMode::Direct);
                }
                None
            }
            ConnectionMode::Relay => Some(TransferMode::Relay),
            _ => None,
        }
    }

    /// Spec §4.3 "Connection racing": obtain a usable channel as quickly
    /// as possible, preferring direct, never waiting too long.
    pub async fn ensure_connection(self: &Arc<Self>, peer_id: PeerId) -> Result<TransferMode, EngineError> {
        let ctx = self.peer_context(peer_id)?;

        if let Some(mode) = self.fast_path(&ctx).await {
            return Ok(mode);
        }

        // A direct attempt may already be pending (prewarm, or a concurrent
        // caller) — `connect_lock` makes the second caller wait for it
        // rather than start a redundant race.
        let _guard = ctx.connect_lock.lock().await;
        if let Some(mode) = self.fast_path(&ctx).await {
            return Ok(mode);
        }

        *ctx.mode.write().unwrap() = ConnectionMode::Negotiating;
        self.observer.on_status(peer_id, ConnectionStatus::Connecting);

        let engine = self.clone();
        let task_ctx = ctx.clone();
        let mut direct_handle: JoinHandle<Result<(), EngineError>> =
            tokio::spawn(async move { engine.run_direct_attempt(peer_id, task_ctx).await });

        let start = tokio::time::Instant::now();
        let mut stage = RaceStage::BeforeSlow;
        let outcome = loop {
            let deadline = start
                + match stage {
                    RaceStage::BeforeSlow => SLOW_THRESHOLD,
                    RaceStage::BeforeFallback => FAST_FALLBACK_TIMEOUT,
                    RaceStage::BeforeCommit => CONNECTION_TIMEOUT,
                };
            tokio::select! {
                res = &mut direct_handle => {
                    let result = res.map_err(|_| EngineError::NoTransport(peer_id.to_string()))?;
                    break RaceOutcome::DirectFinished(result);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    match stage {
                        RaceStage::BeforeSlow => {
                            self.observer.on_status(peer_id, ConnectionStatus::Slow);
                            stage = RaceStage::BeforeFallback;
                        }
                        RaceStage::BeforeFallback => {
                            let relay_only = ctx.prediction.lock().unwrap().relay_only_or_none();
                            if relay_only {
                                break RaceOutcome::CommitToRelay;
                            }
                            stage = RaceStage::BeforeCommit;
                        }
                        RaceStage::BeforeCommit => break RaceOutcome::CommitToRelay,
                    }
                }
            }
        };

        match outcome {
            RaceOutcome::DirectFinished(Ok(())) => {
                *ctx.mode.write().unwrap() = ConnectionMode::Direct;
                self.observer.on_status(peer_id, ConnectionStatus::Connected);
                Ok(TransferMode::Direct)
            }
            RaceOutcome::DirectFinished(Err(_)) => {
                *ctx.mode.write().unwrap() = ConnectionMode::Relay;
                self.observer.on_status(peer_id, ConnectionStatus::Relay);
                Ok(TransferMode::Relay)
            }
            RaceOutcome::CommitToRelay => {
                // The direct task keeps running; a miss here still has a
                // chance to quietly win later (spec §4.3 "Silent background
                // P2P recovery").
                *ctx.mode.write().unwrap() = ConnectionMode::Relay;
                self.observer.on_status(peer_id, ConnectionStatus::Relay);
                self.spawn_background_recovery(peer_id, ctx.clone(), direct_handle);
                Ok(TransferMode::Relay)
            }
        }
    }

    /// Drives one direct-connection attempt from offer to open data
    /// channel, applying ICE-restart policy along the way (spec §4.3 "ICE
    /// restart"). Returns `Ok(())` once the channel is open and a shared
    /// key is installed; returns `Err` once restarts are exhausted, P2P is
    /// impossible, or the peer has left.
    async fn run_direct_attempt(self: Arc<Self>, peer_id: PeerId, ctx: Arc<PeerContext>) -> Result<(), EngineError> {
        {
            let mut nego = ctx.negotiation.lock().unwrap();
            nego.begin_local_offer();
        }
        let transport = ctx.transport.read().await.clone();
        let ranked = self.ice_servers.ranked_servers(Vec::new()).await;
        transport.set_ice_servers(ranked.into_iter().map(|s| s.urls).collect()).await?;
        let offer_sdp = transport.create_offer().await?;
        {
            let mut nego = ctx.negotiation.lock().unwrap();
            nego.local_offer_sent();
        }
        self.signaling.send_offer(peer_id, offer_sdp).await;

        let mut observed_candidates = 0usize;
        loop {
            if ctx.left.load(Ordering::SeqCst) {
                return Err(EngineError::NoTransport(peer_id.to_string()));
            }

            let transport = ctx.transport.read().await.clone();
            let candidates = transport.gathered_candidates();
            if candidates.len() > observed_candidates {
                let mut pred = ctx.prediction.lock().unwrap();
                for kind in &candidates[observed_candidates..] {
                    pred.observe(*kind);
                }
                observed_candidates = candidates.len();
            }
            if transport.gathering_complete() {
                ctx.prediction.lock().unwrap().on_gathering_complete();
            }

            if transport.is_data_channel_open() && self.crypto.has_peer_key(peer_id) {
                ctx.restart_count.store(0, Ordering::SeqCst);
                return Ok(());
            }

            match transport.ice_connection_state() {
                IceConnectionState::Disconnected => {
                    tokio::time::sleep(DISCONNECTED_TIMEOUT).await;
                    if transport.ice_connection_state() == IceConnectionState::Disconnected {
                        return Err(EngineError::IceRestartExhausted(peer_id.to_string()));
                    }
                }
                IceConnectionState::Failed => {
                    let p2p_possible = ctx.prediction.lock().unwrap().p2p_possible;
                    let restarts = ctx.restart_count.load(Ordering::SeqCst);
                    if p2p_possible && restarts < MAX_ICE_RESTARTS {
                        tokio::time::sleep(ICE_RESTART_DELAY).await;
                        let ranked = self.ice_servers.ranked_servers(Vec::new()).await;
                        transport.set_ice_servers(ranked.into_iter().map(|s| s.urls).collect()).await?;
                        let restart_sdp = transport.restart_ice().await?;
                        ctx.restart_count.fetch_add(1, Ordering::SeqCst);
                        {
                            let mut nego = ctx.negotiation.lock().unwrap();
                            nego.begin_local_offer();
                            nego.local_offer_sent();
                        }
                        self.signaling.send_offer(peer_id, restart_sdp).await;
                    } else {
                        return Err(EngineError::IceRestartExhausted(peer_id.to_string()));
                    }
                }
                _ => {}
            }

            tokio::time::sleep(DIRECT_STATE_POLL).await;
        }
    }

    /// Spec §4.3 "Silent background P2P recovery". Lets the still-running
    /// direct attempt finish on its own terms; if it fails, tears down and
    /// retries fresh at the scheduled intervals.
    fn spawn_background_recovery(
        self: &Arc<Self>,
        peer_id: PeerId,
        ctx: Arc<PeerContext>,
        continuing: JoinHandle<Result<(), EngineError>>,
    ) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            if let Ok(Ok(())) = continuing.await {
                if !ctx.left.load(Ordering::SeqCst) {
                    *ctx.mode.write().unwrap() = ConnectionMode::Direct;
                    engine.observer.on_status(peer_id, ConnectionStatus::Connected);
                }
                return;
            }

            tokio::time::sleep(BACKGROUND_RETRY_INITIAL_DELAY).await;
            for _attempt in 0..BACKGROUND_RETRY_MAX_ATTEMPTS {
                if ctx.left.load(Ordering::SeqCst) {
                    return;
                }
                match engine.fresh_direct_attempt(peer_id, &ctx).await {
                    Ok(()) => {
                        if !ctx.left.load(Ordering::SeqCst) {
                            *ctx.mode.write().unwrap() = ConnectionMode::Direct;
                            engine.observer.on_status(peer_id, ConnectionStatus::Connected);
                        }
                        return;
                    }
                    Err(_) => tokio::time::sleep(BACKGROUND_RETRY_INTERVAL).await,
                }
            }
        });
        *ctx.recovery_handle.lock().unwrap() = Some(handle);
    }

    async fn fresh_direct_attempt(self: &Arc<Self>, peer_id: PeerId, ctx: &Arc<PeerContext>) -> Result<(), EngineError> {
        {
            let old = ctx.transport.read().await.clone();
            old.close().await;
        }
        *ctx.transport.write().await = (self.transport_factory)(peer_id);
        *ctx.negotiation.lock().unwrap() = Negotiation::new(&self.local_id, &peer_id);
        *ctx.prediction.lock().unwrap() = CandidatePrediction::new();
        ctx.restart_count.store(0, Ordering::SeqCst);
        self.clone().run_direct_attempt(peer_id, ctx.clone()).await
    }

    /// Spec §4.3 "Prewarming": a best-effort silent direct attempt that
    /// never commits the peer to relay on failure.
    fn prewarm(self: &Arc<Self>, peer_id: PeerId) {
        let engine = self.clone();
        tokio::spawn(async move {
            let delay_ms = {
                let mut rng = rand::thread_rng();
                rng.gen_range(PREWARM_DELAY_MIN.as_millis() as u64..=PREWARM_DELAY_MAX.as_millis() as u64)
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            let Ok(ctx) = engine.peer_context(peer_id) else { return };
            if ctx.left.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            let _guard = ctx.connect_lock.lock().await;
            if *ctx.mode.read().unwrap() != ConnectionMode::Idle {
                return;
            }
            *ctx.mode.write().unwrap() = ConnectionMode::Negotiating;
            match engine.clone().run_direct_attempt(peer_id, ctx.clone()).await {
                Ok(()) => {
                    *ctx.mode.write().unwrap() = ConnectionMode::Direct;
                    engine.observer.on_status(peer_id, ConnectionStatus::Connected);
                }
                Err(_) => {
                    *ctx.mode.write().unwrap() = ConnectionMode::Idle;
                }
            }
        });
    }

    /// Perfect Negotiation: handles an incoming offer (spec §4.3).
    /// Returns `None` if the offer was ignored (we are impolite and
    /// mid-collision), otherwise the local answer SDP to send back.
    pub async fn on_incoming_offer(&self, peer_id: PeerId, sdp: &str) -> Result<Option<String>, EngineError> {
        let ctx = self.peer_context(peer_id)?;
        let disposition = ctx.negotiation.lock().unwrap().on_incoming_offer();
        match disposition {
            negotiation::OfferDisposition::Ignore => Ok(None),
            negotiation::OfferDisposition::Accept { rollback_first } => {
                let transport = ctx.transport.read().await.clone();
                if rollback_first {
                    transport.rollback().await?;
                }
                let answer = transport.create_answer(sdp).await?;
                ctx.negotiation.lock().unwrap().answer_sent();
                Ok(Some(answer))
            }
        }
    }

    pub async fn on_incoming_answer(&self, peer_id: PeerId, sdp: &str) -> Result<(), EngineError> {
        let ctx = self.peer_context(peer_id)?;
        let transport = ctx.transport.read().await.clone();
        transport.accept_answer(sdp).await?;
        ctx.negotiation.lock().unwrap().answer_applied();
        Ok(())
    }

    pub async fn on_incoming_ice_candidate(&self, peer_id: PeerId, candidate: &str) -> Result<(), EngineError> {
        let ctx = self.peer_context(peer_id)?;
        if ctx.negotiation.lock().unwrap().should_ignore_candidate() {
            return Ok(());
        }
        let transport = ctx.transport.read().await.clone();
        transport.add_ice_candidate(candidate).await?;
        if let Some(kind) = classify_candidate(candidate) {
            ctx.prediction.lock().unwrap().observe(kind);
        }
        Ok(())
    }
}
