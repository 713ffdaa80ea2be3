// src/connection/negotiation.rs
// Perfect Negotiation (spec §4.3 "Perfect Negotiation"): a small, pure state
// machine that resolves simultaneous-offer collisions without the two peers
// needing to coordinate who goes first.
//
// This has no analogue in the teacher (vbmcoder-pingo trusts whichever
// offer arrives last), so it's grounded directly in the spec's own
// description of the pattern, expressed the way the teacher expresses its
// other small state enums (`ConnectionState` in signaling.rs): a plain enum
// plus an impl block, no trait objects.

use crate::model::{is_polite, PeerId};

/// Mirrors the browser RTCPeerConnection `signalingState` values relevant to
/// collision detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Per-peer negotiation bookkeeping. Not `Send`-shared directly; a
/// `PeerContext` keeps one of these behind its own lock.
#[derive(Debug, Clone)]
pub struct Negotiation {
    state: NegotiationState,
    making_offer: bool,
    ignore_offer: bool,
    polite: bool,
}

/// What the caller should do with an incoming remote offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Accept the offer normally (no collision, or we're polite and rolled back).
    Accept { rollback_first: bool },
    /// Drop the offer silently; we are impolite and mid-negotiation.
    Ignore,
}

impl Negotiation {
    pub fn new(local: &PeerId, remote: &PeerId) -> Self {
        Negotiation {
            state: NegotiationState::Stable,
            making_offer: false,
            ignore_offer: false,
            polite: is_polite(local, remote),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    /// Call before constructing a local offer. Sets `makingOffer`.
    pub fn begin_local_offer(&mut self) {
        self.making_offer = true;
        self.state = NegotiationState::HaveLocalOffer;
    }

    /// Call once the local offer has been sent and we're waiting on an answer.
    pub fn local_offer_sent(&mut self) {
        self.making_offer = false;
    }

    /// Call when a remote answer completes the exchange.
    pub fn answer_applied(&mut self) {
        self.state = NegotiationState::Stable;
        self.making_offer = false;
    }

    /// Decide what to do with an incoming offer (spec §4.3):
    /// `makingOffer || state != stable` is a collision. The impolite peer
    /// ignores; the polite peer rolls back and accepts.
    pub fn on_incoming_offer(&mut self) -> OfferDisposition {
        let collision = self.making_offer || self.state != NegotiationState::Stable;
        if collision && !self.polite {
            self.ignore_offer = true;
            return OfferDisposition::Ignore;
        }
        self.ignore_offer = false;
        let rollback_first = collision; // only the polite peer ever reaches here mid-collision
        self.state = NegotiationState::HaveRemoteOffer;
        self.making_offer = false;
        OfferDisposition::Accept { rollback_first }
    }

    /// Call once a local answer to a remote offer has been sent.
    pub fn answer_sent(&mut self) {
        self.state = NegotiationState::Stable;
    }

    /// An incoming ICE candidate should be dropped (not applied, not erred)
    /// if it arrived while we were ignoring a colliding offer.
    pub fn should_ignore_candidate(&self) -> bool {
        self.ignore_offer
    }
}
