// src/connection/ice.rs
// ICE candidate quality prediction and STUN/TURN server ranking
// (spec §4.3 "ICE-server selection", "ICE candidate quality prediction").
//
// The teacher has no ICE layer at all (it's LAN-only UDP broadcast
// discovery in discovery.rs); this is grounded on the *shape* of that
// file's probe-and-rank pattern (parallel probes, a cached ranked list)
// generalized from "ping every LAN broadcast address" to "STUN-probe every
// candidate server".

use std::time::{Duration, Instant};

use crate::model::CandidateKind;

/// Continuously-updated classification of what kind of path is available
/// to a peer, derived from the candidates ICE has gathered so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidatePrediction {
    pub p2p_possible: bool,
    pub p2p_likely: bool,
    pub has_relay: bool,
    pub network_issue: bool,
    candidate_count: u32,
}

impl CandidatePrediction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one newly-gathered candidate.
    pub fn observe(&mut self, kind: CandidateKind) {
        self.candidate_count += 1;
        match kind {
            CandidateKind::Host | CandidateKind::Srflx | CandidateKind::Prflx => {
                self.p2p_possible = true;
            }
            CandidateKind::Relay => {}
        }
        if matches!(kind, CandidateKind::Srflx | CandidateKind::Prflx) {
            self.p2p_likely = true;
        }
        if matches!(kind, CandidateKind::Relay) {
            self.has_relay = true;
        }
    }

    /// Call once ICE gathering has completed to finalize `network_issue`.
    pub fn on_gathering_complete(&mut self) {
        self.network_issue = self.candidate_count == 0;
    }

    /// Only relay-type (or no) candidates — the fast-fallback decision's
    /// cue to commit to relay rather than grant the direct path an
    /// extension (spec §4.3 "Connection racing" step 4).
    pub fn relay_only_or_none(&self) -> bool {
        !self.p2p_possible
    }
}

/// A STUN/TURN server candidate as returned by `/api/ice-servers`, plus
/// whatever we've learned about it from probing.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: String,
    pub is_turn: bool,
    pub latency: Option<Duration>,
}

impl IceServer {
    pub fn from_urls(urls: String) -> Self {
        let is_turn = urls.starts_with("turn:") || urls.starts_with("turns:");
        IceServer { urls, is_turn, latency: None }
    }
}

/// Probes and caches a ranked ICE server list (spec §4.3). STUN servers are
/// probed in parallel and sorted ascending by round-trip latency; TURN
/// servers skip probing (auth makes it expensive) and are prepended as-is.
///
/// Held behind `Arc<dyn StunProbe>` rather than a generic parameter so
/// `Engine` can own one without becoming generic itself, the same reason
/// `DirectTransport`/`SignalingSink` are trait objects there.
pub struct IceServerRegistry {
    prober: std::sync::Arc<dyn StunProbe>,
    cache: std::sync::Mutex<Option<(Instant, Vec<IceServer>)>>,
    fallback: Vec<String>,
}

/// Seam for the actual STUN probe (opening a real UDP socket and reading
/// back a server-reflexive candidate). Production code wires this to the
/// platform's ICE/UDP stack; tests use a canned `StubProber`.
#[async_trait::async_trait]
pub trait StunProbe: Send + Sync {
    /// Returns the measured round-trip latency, or `None` if the server
    /// didn't answer within the probe timeout.
    async fn probe(&self, stun_url: &str) -> Option<Duration>;
}

const CACHE_TTL: Duration = crate::config::ICE_SERVER_CACHE_TTL;
const PROBE_TIMEOUT: Duration = crate::config::ICE_SERVER_PROBE_TIMEOUT;

impl IceServerRegistry {
    pub fn new(prober: std::sync::Arc<dyn StunProbe>, fallback: Vec<String>) -> Self {
        IceServerRegistry { prober, cache: std::sync::Mutex::new(None), fallback }
    }

    /// Returns the cached ranked list if still fresh, else re-probes.
    pub async fn ranked_servers(&self, candidates: Vec<String>) -> Vec<IceServer> {
        if let Some((fetched_at, servers)) = self.cache.lock().unwrap().clone() {
            if fetched_at.elapsed() < CACHE_TTL {
                return servers;
            }
        }

        let pool = if candidates.is_empty() { self.fallback.clone() } else { candidates };
        let entries: Vec<IceServer> = pool.into_iter().map(IceServer::from_urls).collect();

        let (turn, stun): (Vec<_>, Vec<_>) = entries.into_iter().partition(|s| s.is_turn);
        let probed = futures::future::join_all(stun.into_iter().map(|mut server| async {
            // A non-responding server must not block ranking past its cap
            // (spec §4.3 "each candidate server is probed with a timeout").
            server.latency = tokio::time::timeout(PROBE_TIMEOUT, self.prober.probe(&server.urls))
                .await
                .unwrap_or(None);
            server
        }))
        .await;

        let mut responsive: Vec<IceServer> = probed.into_iter().filter(|s| s.latency.is_some()).collect();
        responsive.sort_by_key(|s| s.latency.unwrap());

        let mut ranked = turn;
        ranked.extend(responsive);

        let ranked = if ranked.is_empty() {
            self.fallback.iter().cloned().map(IceServer::from_urls).collect()
        } else {
            ranked
        };

        *self.cache.lock().unwrap() = Some((Instant::now(), ranked.clone()));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[test]
    fn p2p_possible_set_by_host_srflx_or_prflx() {
        let mut pred = CandidatePrediction::new();
        assert!(!pred.p2p_possible);
        pred.observe(CandidateKind::Host);
        assert!(pred.p2p_possible);
        assert!(!pred.p2p_likely);
    }

    #[test]
    fn p2p_likely_requires_srflx_or_prflx() {
        let mut pred = CandidatePrediction::new();
        pred.observe(CandidateKind::Srflx);
        assert!(pred.p2p_possible);
        assert!(pred.p2p_likely);
    }

    #[test]
    fn has_relay_tracked_independently() {
        let mut pred = CandidatePrediction::new();
        pred.observe(CandidateKind::Relay);
        assert!(pred.has_relay);
        assert!(!pred.p2p_possible);
    }

    #[test]
    fn network_issue_only_when_nothing_gathered() {
        let mut pred = CandidatePrediction::new();
        pred.on_gathering_complete();
        assert!(pred.network_issue);

        let mut pred2 = CandidatePrediction::new();
        pred2.observe(CandidateKind::Host);
        pred2.on_gathering_complete();
        assert!(!pred2.network_issue);
    }

    #[test]
    fn relay_only_or_none_true_without_p2p_candidates() {
        let mut pred = CandidatePrediction::new();
        assert!(pred.relay_only_or_none());
        pred.observe(CandidateKind::Relay);
        assert!(pred.relay_only_or_none());
        pred.observe(CandidateKind::Host);
        assert!(!pred.relay_only_or_none());
    }

    struct StubProber(Mutex<HashMap<String, Option<Duration>>>);

    #[async_trait]
    impl StunProbe for StubProber {
        async fn probe(&self, stun_url: &str) -> Option<Duration> {
            self.0.lock().unwrap().get(stun_url).cloned().flatten()
        }
    }

    /// Never resolves, simulating a STUN server that never answers.
    struct HangingProber;

    #[async_trait]
    impl StunProbe for HangingProber {
        async fn probe(&self, _stun_url: &str) -> Option<Duration> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn turn_servers_are_prepended_without_probing() {
        let mut latencies = HashMap::new();
        latencies.insert("stun:a".to_string(), Some(Duration::from_millis(50)));
        let prober = Arc::new(StubProber(Mutex::new(latencies)));
        let registry = IceServerRegistry::new(prober, vec!["stun:fallback".to_string()]);

        let ranked = registry
            .ranked_servers(vec!["stun:a".to_string(), "turn:b".to_string()])
            .await;

        assert_eq!(ranked[0].urls, "turn:b");
        assert_eq!(ranked[1].urls, "stun:a");
    }

    #[tokio::test]
    async fn unresponsive_stun_servers_are_dropped() {
        let prober = Arc::new(StubProber(Mutex::new(HashMap::new())));
        let registry = IceServerRegistry::new(prober, vec!["stun:fallback".to_string()]);
        let ranked = registry.ranked_servers(vec!["stun:dead".to_string()]).await;
        // Nothing responded, so the registry falls back.
        assert_eq!(ranked[0].urls, "stun:fallback");
    }

    #[tokio::test]
    async fn ranking_is_cached_between_calls() {
        let mut latencies = HashMap::new();
        latencies.insert("stun:a".to_string(), Some(Duration::from_millis(10)));
        let prober = Arc::new(StubProber(Mutex::new(latencies)));
        let registry = IceServerRegistry::new(prober, vec![]);
        let first = registry.ranked_servers(vec!["stun:a".to_string()]).await;
        // Second call passes a different candidate set; cached result wins.
        let second = registry.ranked_servers(vec!["stun:b".to_string()]).await;
        assert_eq!(first.len(), second.len());
        assert_eq!(second[0].urls, "stun:a");
    }

    #[tokio::test(start_paused = true)]
    async fn a_hanging_probe_is_capped_at_the_probe_timeout_and_falls_back() {
        let registry = IceServerRegistry::new(Arc::new(HangingProber), vec!["stun:fallback".to_string()]);

        let handle = tokio::spawn(async move { registry.ranked_servers(vec!["stun:dead".to_string()]).await });
        tokio::time::advance(super::PROBE_TIMEOUT + Duration::from_millis(1)).await;
        let ranked = handle.await.unwrap();

        // The hung probe never answers, so ranking falls back rather than
        // blocking forever.
        assert_eq!(ranked[0].urls, "stun:fallback");
    }
}
