mod database;

pub use database::TrustDatabase;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current keystore file format version
pub const KEYSTORE_VERSION: u32 = 1;

/// A peer whose identity has been accepted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    pub fingerprint: String,
    /// Hex Ed25519 public key
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl TrustedPeer {
    pub fn new(fingerprint: String, public_key: String, name: Option<String>) -> Self {
        Self {
            fingerprint,
            public_key,
            name,
            added_at: Utc::now(),
        }
    }
}

/// A first-seen peer waiting for operator approval
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPeer {
    pub fingerprint: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub first_seen: DateTime<Utc>,
}

impl PendingPeer {
    pub fn new(fingerprint: String, public_key: String, name: Option<String>) -> Self {
        Self {
            fingerprint,
            public_key,
            name,
            first_seen: Utc::now(),
        }
    }
}

impl From<PendingPeer> for TrustedPeer {
    fn from(pending: PendingPeer) -> Self {
        TrustedPeer::new(pending.fingerprint, pending.public_key, pending.name)
    }
}

/// Persisted trust state.
///
/// A fingerprint is never both trusted and revoked, and a pending peer is
/// neither. Every mutator preserves this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreData {
    pub version: u32,
    #[serde(default)]
    pub trusted_peers: Vec<TrustedPeer>,
    #[serde(default)]
    pub revoked_fingerprints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_peers: Vec<PendingPeer>,
}

impl Default for KeystoreData {
    fn default() -> Self {
        Self {
            version: KEYSTORE_VERSION,
            trusted_peers: Vec::new(),
            revoked_fingerprints: Vec::new(),
            pending_peers: Vec::new(),
        }
    }
}

impl KeystoreData {
    pub fn trusted_peer(&self, fingerprint: &str) -> Option<&TrustedPeer> {
        self.trusted_peers.iter().find(|p| p.fingerprint == fingerprint)
    }

    pub fn pending_peer(&self, fingerprint: &str) -> Option<&PendingPeer> {
        self.pending_peers.iter().find(|p| p.fingerprint == fingerprint)
    }

    pub fn is_revoked(&self, fingerprint: &str) -> bool {
        self.revoked_fingerprints.iter().any(|f| f == fingerprint)
    }

    /// Trusted and not revoked
    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        !self.is_revoked(fingerprint) && self.trusted_peer(fingerprint).is_some()
    }

    /// Insert or replace a trusted peer, clearing revocation and pending state.
    /// The original `added_at` is kept when the peer was already trusted.
    pub fn upsert_trusted(&mut self, mut peer: TrustedPeer) {
        self.revoked_fingerprints.retain(|f| *f != peer.fingerprint);
        self.pending_peers.retain(|p| p.fingerprint != peer.fingerprint);

        match self.trusted_peers.iter_mut().find(|p| p.fingerprint == peer.fingerprint) {
            Some(existing) => {
                peer.added_at = existing.added_at;
                *existing = peer;
            }
            None => self.trusted_peers.push(peer),
        }
    }

    /// Returns true if the peer was trusted
    pub fn remove_trusted(&mut self, fingerprint: &str) -> bool {
        let before = self.trusted_peers.len();
        self.trusted_peers.retain(|p| p.fingerprint != fingerprint);
        self.trusted_peers.len() != before
    }

    /// Drop trust and pending state and record the revocation.
    /// Returns true if the fingerprint was not already revoked.
    pub fn revoke(&mut self, fingerprint: &str) -> bool {
        self.remove_trusted(fingerprint);
        self.pending_peers.retain(|p| p.fingerprint != fingerprint);
        if self.is_revoked(fingerprint) {
            return false;
        }
        self.revoked_fingerprints.push(fingerprint.to_string());
        true
    }

    /// Returns the number of revocations cleared
    pub fn clear_revoked(&mut self) -> usize {
        let count = self.revoked_fingerprints.len();
        self.revoked_fingerprints.clear();
        count
    }

    /// Queue a peer for approval. Trusted, revoked and already-pending peers
    /// are left alone and false is returned.
    pub fn add_pending(&mut self, peer: PendingPeer) -> bool {
        if self.is_revoked(&peer.fingerprint)
            || self.trusted_peer(&peer.fingerprint).is_some()
            || self.pending_peer(&peer.fingerprint).is_some()
        {
            return false;
        }
        self.pending_peers.push(peer);
        true
    }

    /// Remove and return a pending peer
    pub fn take_pending(&mut self, fingerprint: &str) -> Option<PendingPeer> {
        let index = self.pending_peers.iter().position(|p| p.fingerprint == fingerprint)?;
        Some(self.pending_peers.remove(index))
    }

    /// Repair a store that violates the exclusivity rules. Revocation wins.
    /// Returns true if anything changed.
    pub fn enforce_invariants(&mut self) -> bool {
        let before = (
            self.trusted_peers.len(),
            self.pending_peers.len(),
            self.revoked_fingerprints.len(),
        );

        let mut seen = std::collections::HashSet::new();
        self.revoked_fingerprints.retain(|f| seen.insert(f.clone()));

        let revoked = &self.revoked_fingerprints;
        self.trusted_peers.retain(|p| !revoked.contains(&p.fingerprint));

        let trusted = &self.trusted_peers;
        self.pending_peers.retain(|p| {
            !revoked.contains(&p.fingerprint) && !trusted.iter().any(|t| t.fingerprint == p.fingerprint)
        });

        before
            != (
                self.trusted_peers.len(),
                self.pending_peers.len(),
                self.revoked_fingerprints.len(),
            )
    }
}
