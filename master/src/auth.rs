//! Peer identity and the authentication boundary.
//!
//! Credentials are never interpreted outside an [`Authenticator`]; the rest
//! of the master only sees the resulting [`Identity`] and compares its
//! privilege level against configured thresholds.

use log::warn;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use shared::PeerId;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub peer_id: PeerId,
    pub username: String,
    pub privilege: u32,
}

/// Who submitted a spawn request.
///
/// Internal modules (lobbies, matchmakers running inside the master) are
/// trusted and skip privilege checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Requester {
    Internal(String),
    Peer(Identity),
}

impl Requester {
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            Requester::Internal(_) => None,
            Requester::Peer(identity) => Some(identity.peer_id),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Requester::Internal(module) => module,
            Requester::Peer(identity) => &identity.username,
        }
    }

    /// Whether `self` may act on a task submitted by `owner`.
    pub fn owns(&self, owner: &Requester) -> bool {
        match (self, owner) {
            (Requester::Internal(_), _) => true,
            (Requester::Peer(me), Requester::Peer(them)) => me.peer_id == them.peer_id,
            (Requester::Peer(_), Requester::Internal(_)) => false,
        }
    }
}

/// Turns the credentials a peer presents in its `Hello` into an identity.
pub trait Authenticator: Send + Sync {
    /// Returns `None` to refuse the connection.
    fn authenticate(
        &self,
        peer_id: PeerId,
        addr: SocketAddr,
        credentials: Option<&str>,
    ) -> Option<Identity>;
}

/// Grants the trusted privilege to peers presenting the shared master key,
/// and the default privilege to anonymous peers.
pub struct MasterKeyAuthenticator {
    master_key: Option<String>,
    default_privilege: u32,
    trusted_privilege: u32,
}

impl MasterKeyAuthenticator {
    pub fn new(master_key: Option<String>, default_privilege: u32, trusted_privilege: u32) -> Self {
        Self {
            master_key,
            default_privilege,
            trusted_privilege,
        }
    }
}

impl Authenticator for MasterKeyAuthenticator {
    fn authenticate(
        &self,
        peer_id: PeerId,
        addr: SocketAddr,
        credentials: Option<&str>,
    ) -> Option<Identity> {
        let privilege = match (credentials, self.master_key.as_deref()) {
            (None, _) => self.default_privilege,
            (Some(given), Some(key)) if constant_time_eq(given, key) => self.trusted_privilege,
            (Some(_), _) => {
                warn!("Peer {} from {} presented an invalid master key", peer_id, addr);
                return None;
            }
        };

        Some(Identity {
            peer_id,
            username: format!("peer-{}", peer_id),
            privilege,
        })
    }
}

/// Compares two secrets without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Random alphanumeric secret used for security codes and access tokens.
pub fn generate_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
