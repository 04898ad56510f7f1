//! Peer connection tracking for the master server
//!
//! Every agent, client and spawned process talks to the master as a peer.
//! This module handles:
//! - Peer lifecycle (hello, goodbye, timeout)
//! - Address to peer lookup for incoming datagrams
//! - Connection health monitoring and capacity enforcement
//!
//! Losing a peer is the trigger for the disconnect cascades performed by
//! the orchestrator, so timeouts here must be reported, not just dropped.

use crate::auth::Identity;
use log::info;
use shared::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected peer and its authenticated identity
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this peer
    pub last_seen: Instant,
    pub identity: Identity,
}

impl Peer {
    pub fn new(addr: SocketAddr, identity: Identity) -> Self {
        Self {
            id: identity.peer_id,
            addr,
            last_seen: Instant::now(),
            identity,
        }
    }

    /// Checks if the peer has been silent longer than `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected peers
///
/// Peer IDs are handed out before authentication so the authenticator can
/// bind the identity to the id; an id is never reused within a process.
pub struct PeerManager {
    peers: HashMap<PeerId, Peer>,
    next_peer_id: PeerId,
    max_peers: usize,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
        }
    }

    /// Reserves the id the next peer will get
    pub fn next_id(&mut self) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        id
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    /// Adds an authenticated peer. Returns false if the server is at capacity.
    pub fn add_peer(&mut self, addr: SocketAddr, identity: Identity) -> bool {
        if self.is_full() {
            return false;
        }

        let peer = Peer::new(addr, identity);
        info!(
            "Peer {} connected from {} (privilege {})",
            peer.id, addr, peer.identity.privilege
        );
        self.peers.insert(peer.id, peer);
        true
    }

    /// Removes a peer, returning it if it was still connected
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&peer_id)?;
        info!("Peer {} disconnected", peer.id);
        Some(peer)
    }

    pub fn find_peer_by_addr(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers.values().find(|peer| peer.addr == addr)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    pub fn addr_of(&self, peer_id: PeerId) -> Option<SocketAddr> {
        self.peers.get(&peer_id).map(|peer| peer.addr)
    }

    /// Refreshes the activity timestamp of a peer
    pub fn touch(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.last_seen = Instant::now();
        }
    }

    /// Removes peers that have not been heard from within `timeout`
    ///
    /// Returns the removed peer IDs so the caller can run the disconnect
    /// cascade for each of them.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<PeerId> {
        let timed_out: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.id)
            .collect();

        for peer_id in &timed_out {
            self.remove_peer(*peer_id);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
