// src/config.rs
// Timing and sizing constants from spec §5, plus the runtime-configurable
// surface for the `clouddrop-hub` binary (spec §6 "Configuration surface").
//
// The teacher has no configuration layer at all (its constants are scattered
// `const`s in each file); CloudDrop collects the protocol constants in one
// place since they're cross-referenced by three different components, and
// adds a `clap`-driven `HubConfig` for the one thing that's genuinely
// deployment-specific: what address the hub binds to and what ICE servers it
// advertises.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Default file chunk size (spec §4.4): 64 KiB.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Direct-path backpressure ceiling on `bufferedAmount` (spec §4.4.1).
pub const DIRECT_BACKPRESSURE_HIGH_WATERMARK: usize = 1024 * 1024;
/// Poll interval while waiting for the data channel buffer to drain.
pub const DIRECT_BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

/// Relay-path sliding window size in chunks (spec §4.4.2).
pub const RELAY_WINDOW_SIZE: usize = 10;
/// Relay chunk ACK timeout before retransmission (spec §4.4.2, §5).
pub const RELAY_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Maximum retransmission attempts per relay chunk (spec §4.4.2).
pub const RELAY_MAX_CHUNK_RETRIES: u32 = 3;
/// Receiver ACK batch size (spec §4.4.2).
pub const RELAY_ACK_BATCH_SIZE: usize = 5;
/// Delay between successive relay chunk sends (spec §4.4.2, §5).
pub const RELAY_CHUNK_INTERVAL: Duration = Duration::from_millis(5);
/// No-ACK-progress stall timeout while the sender is mid-stream (spec §4.4.2).
pub const RELAY_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period to wait for late chunks at `file-end` before reporting
/// missing indices (spec §4.4.2 "Integrity on completion").
pub const RELAY_COMPLETION_GRACE: Duration = Duration::from_secs(3);

/// File-request response deadline (spec §4.4 Phase 1, §5).
pub const FILE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Key-exchange-over-hub wait when no direct channel is open yet (spec §4.5).
pub const KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection racing thresholds (spec §4.3 "Connection racing", §5).
pub const SLOW_THRESHOLD: Duration = Duration::from_secs(3);
pub const FAST_FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// ICE restart policy (spec §4.3 "ICE restart", §5).
pub const DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
pub const ICE_RESTART_DELAY: Duration = Duration::from_millis(500);
pub const MAX_ICE_RESTARTS: u32 = 2;

/// Silent background P2P recovery (spec §4.3, §5).
pub const BACKGROUND_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(10);
pub const BACKGROUND_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const BACKGROUND_RETRY_MAX_ATTEMPTS: u32 = 10;

/// Prewarm jitter bounds (spec §4.3 "Prewarming").
pub const PREWARM_DELAY_MIN: Duration = Duration::from_millis(300);
pub const PREWARM_DELAY_MAX: Duration = Duration::from_millis(600);

/// ICE server ranking cache TTL (spec §4.3 "ICE-server selection", §5).
pub const ICE_SERVER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Per-server STUN health-check cap (spec §4.3).
pub const ICE_SERVER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Room password minimum length (spec §6).
pub const MIN_ROOM_PASSWORD_LEN: usize = 6;

/// Runtime configuration for the `clouddrop-hub` signaling service.
#[derive(Debug, Clone, Parser)]
#[command(name = "clouddrop-hub", about = "CloudDrop signaling hub")]
pub struct HubConfig {
    /// Address the hub's HTTP/WebSocket server binds to.
    #[arg(long, env = "CLOUDDROP_BIND", default_value = "0.0.0.0:8787")]
    pub bind_addr: SocketAddr,

    /// Fallback ICE servers used when `/api/ice-servers` has nothing ranked
    /// yet, given as comma-separated STUN/TURN URLs.
    #[arg(
        long,
        env = "CLOUDDROP_ICE_SERVERS",
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    pub fallback_ice_servers: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            bind_addr: "0.0.0.0:8787".parse().unwrap(),
            fallback_ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}
