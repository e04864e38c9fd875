//! Peers prove knowledge of a shared secret before reliable messages are tracked for them: the
//!  initiator (challenger) sends a random nonce, and the responder returns
//!  `SHA-256(secret || challenger addr || responder addr || nonce)`.
//!
//! The addresses bind a response to one direction between two specific nodes, so a response
//!  obtained from some node cannot be replayed as a response from another one. A node also never
//!  answers a challenge carrying one of its own outstanding nonces.
//!
//! Verification is one-directional. Each side that wants to send reliably to the other does its
//!  own handshake.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerState {
    Challenged { nonce: u64 },
    Verified,
}

pub struct Handshake {
    self_addr: SocketAddr,
    shared_secret: Vec<u8>,
    peers: Mutex<FxHashMap<SocketAddr, PeerState>>,
    /// bumped whenever a peer becomes verified, waking pending handshakes
    verified_counter: watch::Sender<u64>,
}

impl Handshake {
    pub fn new(self_addr: SocketAddr, shared_secret: &[u8]) -> Handshake {
        let (verified_counter, _) = watch::channel(0);
        Handshake {
            self_addr,
            shared_secret: shared_secret.to_vec(),
            peers: Default::default(),
            verified_counter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<SocketAddr, PeerState>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn digest(&self, challenger: SocketAddr, responder: SocketAddr, nonce: u64) -> [u8; 32] {
        fn update_addr(hasher: &mut Sha256, addr: SocketAddr) {
            match addr.ip() {
                IpAddr::V4(ip) => hasher.update(ip.octets()),
                IpAddr::V6(ip) => hasher.update(ip.octets()),
            }
            hasher.update(addr.port().to_be_bytes());
        }

        let mut hasher = Sha256::new();
        hasher.update(&self.shared_secret);
        update_addr(&mut hasher, challenger);
        update_addr(&mut hasher, responder);
        hasher.update(nonce.to_be_bytes());

        let mut result = [0u8; 32];
        result.copy_from_slice(&hasher.finalize());
        result
    }

    pub fn peer_state(&self, peer: SocketAddr) -> Option<PeerState> {
        self.lock().get(&peer).copied()
    }

    pub fn is_verified(&self, peer: SocketAddr) -> bool {
        self.peer_state(peer) == Some(PeerState::Verified)
    }

    /// Returns the nonce to challenge a peer with, or `None` if the peer is verified already.
    ///  Repeated challenges of a peer use the same nonce, so a late response is still accepted.
    pub fn challenge(&self, peer: SocketAddr) -> Option<u64> {
        let mut peers = self.lock();
        match peers.get(&peer).copied() {
            Some(PeerState::Verified) => None,
            Some(PeerState::Challenged { nonce }) => Some(nonce),
            None => {
                let nonce = rand::random::<u64>();
                debug!("starting handshake with {:?}", peer);
                peers.insert(peer, PeerState::Challenged { nonce });
                Some(nonce)
            }
        }
    }

    /// Returns the response to a peer's challenge, or `None` if the nonce is one this node is
    ///  waiting for a response to itself.
    pub fn respond(&self, challenger: SocketAddr, nonce: u64) -> Option<Frame> {
        let is_own_nonce = self.lock().values()
            .any(|state| *state == PeerState::Challenged { nonce });
        if is_own_nonce {
            warn!("challenge from {:?} reflects one of our own nonces - not answering", challenger);
            return None;
        }

        Some(Frame::ChallengeResponse {
            nonce,
            digest: self.digest(challenger, self.self_addr, nonce),
        })
    }

    /// Returns `true` if the response verifies the peer
    pub fn on_response(&self, peer: SocketAddr, nonce: u64, digest: &[u8; 32]) -> bool {
        let mut peers = self.lock();
        match peers.get(&peer).copied() {
            Some(PeerState::Verified) => {
                debug!("duplicate handshake response from {:?} - ignoring", peer);
                true
            }
            Some(PeerState::Challenged { nonce: expected }) if expected == nonce => {
                if *digest != self.digest(self.self_addr, peer, nonce) {
                    warn!("handshake response from {:?} has an invalid digest - is the shared secret configured the same on all nodes?", peer);
                    return false;
                }
                debug!("handshake with {:?} complete", peer);
                peers.insert(peer, PeerState::Verified);
                drop(peers);
                self.verified_counter.send_modify(|counter| *counter += 1);
                true
            }
            _ => {
                warn!("unsolicited handshake response from {:?} - ignoring", peer);
                false
            }
        }
    }

    pub fn forget(&self, peer: SocketAddr) {
        self.lock().remove(&peer);
    }

    /// Removes a pending challenge, leaving verified peers untouched
    pub fn abandon(&self, peer: SocketAddr) {
        let mut peers = self.lock();
        if let Some(PeerState::Challenged { .. }) = peers.get(&peer) {
            peers.remove(&peer);
        }
    }

    pub fn subscribe_verified(&self) -> watch::Receiver<u64> {
        self.verified_counter.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 9810))
    }

    fn response_digest(responder: &Handshake, challenger: SocketAddr, nonce: u64) -> [u8; 32] {
        match responder.respond(challenger, nonce) {
            Some(Frame::ChallengeResponse { nonce: n, digest }) => {
                assert_eq!(n, nonce);
                digest
            }
            other => panic!("expected challenge response, was {:?}", other),
        }
    }

    #[test]
    fn test_digest() {
        let handshake = Handshake::new(addr(1), b"secret");
        assert_eq!(handshake.digest(addr(1), addr(2), 1), handshake.digest(addr(1), addr(2), 1));
        assert_ne!(handshake.digest(addr(1), addr(2), 1), handshake.digest(addr(1), addr(2), 2));
        assert_ne!(handshake.digest(addr(1), addr(2), 1), handshake.digest(addr(2), addr(1), 1));
        assert_ne!(handshake.digest(addr(1), addr(2), 1), handshake.digest(addr(1), addr(3), 1));
        assert_ne!(handshake.digest(addr(1), addr(2), 1), Handshake::new(addr(1), b"other").digest(addr(1), addr(2), 1));
    }

    #[test]
    fn test_digest_vector() {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let digest = Handshake::new(unspecified, b"").digest(unspecified, unspecified, 0);
        // SHA-256 of twenty zero bytes: two zero IPv4 addresses with zero ports, zero nonce
        assert_eq!(digest[..8], [0xde, 0x47, 0xc9, 0xb2, 0x7e, 0xb8, 0xd3, 0x00]);
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let initiator = Handshake::new(addr(1), b"secret");
        let responder = Handshake::new(addr(2), b"secret");
        let verified = initiator.subscribe_verified();

        let nonce = initiator.challenge(addr(2)).unwrap();
        assert_eq!(initiator.challenge(addr(2)), Some(nonce));
        assert_eq!(initiator.peer_state(addr(2)), Some(PeerState::Challenged { nonce }));

        assert!(initiator.on_response(addr(2), nonce, &response_digest(&responder, addr(1), nonce)));
        assert!(initiator.is_verified(addr(2)));
        assert!(verified.has_changed().unwrap());
        assert!(initiator.challenge(addr(2)).is_none());

        // verification is one-directional
        assert!(!responder.is_verified(addr(1)));
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let initiator = Handshake::new(addr(1), b"secret");
        let responder = Handshake::new(addr(2), b"wrong");

        let nonce = initiator.challenge(addr(2)).unwrap();
        assert!(!initiator.on_response(addr(2), nonce, &response_digest(&responder, addr(1), nonce)));
        assert!(!initiator.is_verified(addr(2)));
    }

    #[tokio::test]
    async fn test_own_nonce_is_not_answered() {
        let victim = Handshake::new(addr(1), b"secret");
        let nonce = victim.challenge(addr(3)).unwrap();

        // an attacker at addr(3) sends the nonce back as a challenge of its own
        assert_eq!(victim.respond(addr(3), nonce), None);
        assert!(victim.respond(addr(3), nonce.wrapping_add(1)).is_some());
    }

    #[tokio::test]
    async fn test_response_from_other_node_is_rejected() {
        let victim = Handshake::new(addr(1), b"secret");
        let honest = Handshake::new(addr(2), b"secret");

        // the attacker at addr(3) obtains a response from an honest node for the victim's nonce
        let nonce = victim.challenge(addr(3)).unwrap();
        let relayed = response_digest(&honest, addr(3), nonce);
        assert!(!victim.on_response(addr(3), nonce, &relayed));

        // a response computed for the reverse direction does not verify either
        let reversed = victim.digest(addr(3), addr(1), nonce);
        assert!(!victim.on_response(addr(3), nonce, &reversed));
        assert!(!victim.is_verified(addr(3)));
    }

    #[tokio::test]
    async fn test_unsolicited_response() {
        let handshake = Handshake::new(addr(1), b"secret");
        assert!(!handshake.on_response(addr(2), 5, &handshake.digest(addr(1), addr(2), 5)));

        let nonce = handshake.challenge(addr(2)).unwrap();
        let other_nonce = nonce.wrapping_add(1);
        assert!(!handshake.on_response(addr(2), other_nonce, &handshake.digest(addr(1), addr(2), other_nonce)));
        assert!(!handshake.is_verified(addr(2)));
    }

    #[tokio::test]
    async fn test_forget_and_abandon() {
        let handshake = Handshake::new(addr(1), b"secret");

        assert!(handshake.challenge(addr(2)).is_some());
        handshake.abandon(addr(2));
        assert_eq!(handshake.peer_state(addr(2)), None);

        let nonce = handshake.challenge(addr(2)).unwrap();
        assert!(handshake.on_response(addr(2), nonce, &handshake.digest(addr(1), addr(2), nonce)));
        handshake.abandon(addr(2));
        assert!(handshake.is_verified(addr(2)));

        handshake.forget(addr(2));
        assert_eq!(handshake.peer_state(addr(2)), None);
    }
}
