//! Signing of outbound discovery announcements and admission of inbound ones.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::security::constant_time::normalize_fingerprint;
use crate::security::error::{SecurityResult, SignatureError};
use crate::security::identity::{short_fingerprint, SignatureService, SignedData};
use crate::security::keystore::SecureKeystore;
use crate::security::policy::{DiscoveryMode, SecurityAuditor, SecurityEventType, SecurityPolicy};

/// Default lifetime of a signed announcement
pub const DEFAULT_ANNOUNCE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMessageType {
    Announce,
    Query,
    Response,
    Goodbye,
}

/// Base discovery message broadcast on the discovery channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    pub message_type: DiscoveryMessageType,
    pub host_id: String,
    pub host_name: String,
    pub address: String,
    pub port: u16,
    pub version: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl DiscoveryMessage {
    pub fn announce(host_id: &str, host_name: &str, address: &str, port: u16) -> Self {
        Self {
            message_type: DiscoveryMessageType::Announce,
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            address: address.to_string(),
            port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Discovery message with the signature fields flattened alongside it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedDiscoveryMessage {
    #[serde(flatten)]
    pub message: DiscoveryMessage,
    pub signature: String,
    pub public_key: String,
    pub fingerprint: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl From<SignedData<DiscoveryMessage>> for SignedDiscoveryMessage {
    fn from(signed: SignedData<DiscoveryMessage>) -> Self {
        Self {
            message: signed.payload,
            signature: signed.signature,
            public_key: signed.public_key,
            fingerprint: signed.fingerprint,
            signed_at: signed.signed_at,
            expires_at: signed.expires_at,
        }
    }
}

impl SignedDiscoveryMessage {
    pub fn to_signed_data(&self) -> SignedData<DiscoveryMessage> {
        SignedData {
            payload: self.message.clone(),
            signature: self.signature.clone(),
            public_key: self.public_key.clone(),
            fingerprint: self.fingerprint.clone(),
            signed_at: self.signed_at,
            expires_at: self.expires_at,
        }
    }
}

/// Why an inbound discovery message was dropped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryRejection {
    Malformed(String),
    Unsigned,
    InvalidSignature(SignatureError),
    Revoked,
    Untrusted,
}

impl fmt::Display for DiscoveryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryRejection::Malformed(e) => write!(f, "malformed message: {}", e),
            DiscoveryRejection::Unsigned => f.write_str("unsigned message"),
            DiscoveryRejection::InvalidSignature(e) => write!(f, "invalid signature: {}", e),
            DiscoveryRejection::Revoked => f.write_str("sender is revoked"),
            DiscoveryRejection::Untrusted => f.write_str("sender is not trusted"),
        }
    }
}

/// Outcome of evaluating an inbound discovery message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryDecision {
    /// Act on the message. `fingerprint` is `None` for unsigned messages.
    Accept {
        message: DiscoveryMessage,
        fingerprint: Option<String>,
        trusted: bool,
    },
    /// Authentic but unknown sender queued for manual approval; do not act yet
    Pending { fingerprint: String },
    Reject(DiscoveryRejection),
}

impl DiscoveryDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DiscoveryDecision::Accept { .. })
    }
}

/// Applies the discovery policy to announcements
pub struct DiscoveryGuard {
    signer: SignatureService,
    keystore: Arc<SecureKeystore>,
    policy: SecurityPolicy,
    auditor: Arc<SecurityAuditor>,
    announce_ttl: Duration,
}

impl DiscoveryGuard {
    pub fn new(
        signer: SignatureService,
        keystore: Arc<SecureKeystore>,
        policy: SecurityPolicy,
        auditor: Arc<SecurityAuditor>,
    ) -> Self {
        Self {
            signer,
            keystore,
            policy,
            auditor,
            announce_ttl: DEFAULT_ANNOUNCE_TTL,
        }
    }

    pub fn with_announce_ttl(mut self, ttl: Duration) -> Self {
        self.announce_ttl = ttl;
        self
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Sign an outbound message with the local identity
    pub fn sign_message(&self, message: DiscoveryMessage) -> SecurityResult<SignedDiscoveryMessage> {
        Ok(self.signer.sign_with_ttl(message, self.announce_ttl)?.into())
    }

    /// Evaluate a raw inbound message. Messages carrying a `signature` field
    /// are always verified, whatever the mode.
    pub async fn evaluate(&self, raw: &Value) -> DiscoveryDecision {
        if raw.get("signature").is_some() {
            return match serde_json::from_value::<SignedDiscoveryMessage>(raw.clone()) {
                Ok(signed) => self.evaluate_signed(&signed).await,
                Err(e) => self.reject(None, DiscoveryRejection::Malformed(e.to_string())),
            };
        }

        if self.policy.discovery.mode != DiscoveryMode::Open {
            return self.reject(None, DiscoveryRejection::Unsigned);
        }

        match serde_json::from_value::<DiscoveryMessage>(raw.clone()) {
            Ok(message) => DiscoveryDecision::Accept {
                message,
                fingerprint: None,
                trusted: false,
            },
            Err(e) => self.reject(None, DiscoveryRejection::Malformed(e.to_string())),
        }
    }

    /// Evaluate a signed inbound message against revocation, signature and
    /// the trust rules of the policy
    pub async fn evaluate_signed(&self, signed: &SignedDiscoveryMessage) -> DiscoveryDecision {
        let fingerprint = normalize_fingerprint(&signed.fingerprint);

        if self.keystore.is_revoked(&fingerprint).await {
            log::debug!("Dropped discovery message from revoked peer {}", short_fingerprint(&fingerprint));
            return self.reject(Some(&fingerprint), DiscoveryRejection::Revoked);
        }

        if let Err(e) = SignatureService::verify_signed_data(&signed.to_signed_data()) {
            return self.reject(Some(&fingerprint), DiscoveryRejection::InvalidSignature(e));
        }

        let accept = |trusted: bool| DiscoveryDecision::Accept {
            message: signed.message.clone(),
            fingerprint: Some(fingerprint.clone()),
            trusted,
        };

        if self.keystore.is_trusted(&fingerprint).await {
            return accept(true);
        }

        let name = Some(signed.message.host_name.clone());

        // pin the verified key of an allowlisted peer
        if self.policy.is_allowlisted(&fingerprint) {
            match self.keystore.add_trusted_peer(&fingerprint, &signed.public_key, name).await {
                Ok(()) => self.auditor.record(
                    SecurityEventType::PeerTrusted,
                    Some(&fingerprint),
                    "allowlisted",
                ),
                Err(e) => log::warn!("Failed to pin key of allowlisted peer {}: {}", short_fingerprint(&fingerprint), e),
            }
            return accept(true);
        }

        let trusted_only = self.policy.discovery.mode == DiscoveryMode::TrustedOnly;

        if !self.policy.trust.auto_trust_first {
            if trusted_only {
                return self.reject(Some(&fingerprint), DiscoveryRejection::Untrusted);
            }
            return accept(false);
        }

        if self.policy.trust.require_manual_approval {
            match self.keystore.add_pending_peer(&fingerprint, &signed.public_key, name).await {
                Ok(true) => self.auditor.record(
                    SecurityEventType::PeerPending,
                    Some(&fingerprint),
                    format!("first seen as {}", signed.message.host_name),
                ),
                Ok(false) => {}
                Err(e) => log::warn!("Failed to queue peer {}: {}", short_fingerprint(&fingerprint), e),
            }
            if trusted_only {
                return DiscoveryDecision::Pending { fingerprint };
            }
            return accept(false);
        }

        match self.keystore.add_trusted_peer(&fingerprint, &signed.public_key, name).await {
            Ok(()) => {
                self.auditor.record(
                    SecurityEventType::PeerTrusted,
                    Some(&fingerprint),
                    "trusted on first use",
                );
                accept(true)
            }
            Err(e) => {
                log::warn!("Failed to record first-use trust for {}: {}", short_fingerprint(&fingerprint), e);
                if trusted_only {
                    self.reject(Some(&fingerprint), DiscoveryRejection::Untrusted)
                } else {
                    accept(false)
                }
            }
        }
    }

    fn reject(&self, fingerprint: Option<&str>, reason: DiscoveryRejection) -> DiscoveryDecision {
        if reason != DiscoveryRejection::Revoked {
            log::info!(
                "Rejected discovery message from {}: {}",
                fingerprint.map(short_fingerprint).unwrap_or("unknown sender"),
                reason
            );
        }
        self.auditor
            .record(SecurityEventType::DiscoveryRejected, fingerprint, reason.to_string());
        DiscoveryDecision::Reject(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::PeerIdentity;
    use crate::security::keystore::KeystoreConfig;
    use crate::security::policy::SecurityPreset;
    use crate::security::secure_memory::Passphrase;

    struct Fixture {
        _dir: tempfile::TempDir,
        keystore: Arc<SecureKeystore>,
        auditor: Arc<SecurityAuditor>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let keystore = SecureKeystore::open(KeystoreConfig::new(dir.path()).with_passphrase(Passphrase::new("pw")))
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            keystore: Arc::new(keystore),
            auditor: Arc::new(SecurityAuditor::new()),
        }
    }

    impl Fixture {
        fn guard(&self, policy: SecurityPolicy) -> DiscoveryGuard {
            let local = SignatureService::new(Arc::new(PeerIdentity::generate()));
            DiscoveryGuard::new(local, self.keystore.clone(), policy, self.auditor.clone())
        }
    }

    fn remote() -> SignatureService {
        SignatureService::new(Arc::new(PeerIdentity::generate()))
    }

    fn signed_announce(signer: &SignatureService) -> Value {
        let signed: SignedDiscoveryMessage = signer
            .sign_with_ttl(announce(), DEFAULT_ANNOUNCE_TTL)
            .unwrap()
            .into();
        serde_json::to_value(signed).unwrap()
    }

    fn announce() -> DiscoveryMessage {
        DiscoveryMessage::announce("host-b", "node-b", "10.0.0.2", 7420)
    }

    #[tokio::test]
    async fn test_signed_message_wire_format_is_flat() {
        let f = fixture().await;
        let guard = f.guard(SecurityPreset::Signed.policy());
        let signed = guard.sign_message(announce()).unwrap();
        let json = serde_json::to_value(&signed).unwrap();

        assert_eq!(json["type"], "announce");
        assert_eq!(json["hostId"], "host-b");
        assert!(json["signature"].is_string());
        assert!(json["publicKey"].is_string());
        assert!(json["fingerprint"].is_string());
        assert!(json["expiresAt"].is_i64());
    }

    #[tokio::test]
    async fn test_open_mode_accepts_unsigned() {
        let f = fixture().await;
        let guard = f.guard(SecurityPreset::Development.policy());

        let raw = serde_json::to_value(announce()).unwrap();
        assert!(guard.evaluate(&raw).await.is_accepted());

        let signed_guard = f.guard(SecurityPreset::Signed.policy());
        assert_eq!(
            signed_guard.evaluate(&raw).await,
            DiscoveryDecision::Reject(DiscoveryRejection::Unsigned)
        );
    }

    #[tokio::test]
    async fn test_tampered_message_rejected_in_every_mode() {
        let f = fixture().await;
        let mut raw = signed_announce(&remote());
        raw["port"] = serde_json::json!(9999);

        for preset in SecurityPreset::ALL {
            let decision = f.guard(preset.policy()).evaluate(&raw).await;
            assert_eq!(
                decision,
                DiscoveryDecision::Reject(DiscoveryRejection::InvalidSignature(SignatureError::Invalid)),
                "{}",
                preset
            );
        }
    }

    #[tokio::test]
    async fn test_revoked_sender_dropped() {
        let f = fixture().await;
        let signer = remote();
        f.keystore.revoke_peer(signer.fingerprint()).await.unwrap();

        let raw = signed_announce(&signer);
        let decision = f.guard(SecurityPreset::Development.policy()).evaluate(&raw).await;
        assert_eq!(decision, DiscoveryDecision::Reject(DiscoveryRejection::Revoked));
    }

    #[tokio::test]
    async fn test_signed_mode_trusts_on_first_use() {
        let f = fixture().await;
        let signer = remote();
        let guard = f.guard(SecurityPreset::Signed.policy());

        let raw = signed_announce(&signer);
        match guard.evaluate(&raw).await {
            DiscoveryDecision::Accept { fingerprint, trusted, .. } => {
                assert_eq!(fingerprint.as_deref(), Some(signer.fingerprint()));
                assert!(trusted);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.keystore.is_trusted(signer.fingerprint()).await);
        assert_eq!(f.auditor.get_entries_by_type(SecurityEventType::PeerTrusted, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_strict_mode_queues_for_approval() {
        let f = fixture().await;
        let signer = remote();
        let guard = f.guard(SecurityPreset::Strict.policy());
        let raw = signed_announce(&signer);

        assert_eq!(
            guard.evaluate(&raw).await,
            DiscoveryDecision::Pending { fingerprint: signer.fingerprint().to_string() }
        );
        assert!(!f.keystore.is_trusted(signer.fingerprint()).await);
        assert_eq!(f.keystore.list_pending_peers().await.len(), 1);

        f.keystore.approve_pending_peer(signer.fingerprint()).await.unwrap();
        assert!(guard.evaluate(&raw).await.is_accepted());
    }

    #[tokio::test]
    async fn test_trusted_only_without_auto_trust() {
        let f = fixture().await;
        let signer = remote();
        let raw = signed_announce(&signer);

        let mut policy = SecurityPreset::Strict.policy();
        policy.trust.auto_trust_first = false;
        policy.trust.trusted_fingerprints = vec!["00".repeat(32)];
        assert_eq!(
            f.guard(policy.clone()).evaluate(&raw).await,
            DiscoveryDecision::Reject(DiscoveryRejection::Untrusted)
        );

        policy.trust.trusted_fingerprints.push(signer.fingerprint().to_uppercase());
        assert!(f.guard(policy).evaluate(&raw).await.is_accepted());
        assert!(f.keystore.list_pending_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_allowlisted_sender_key_is_pinned() {
        let f = fixture().await;
        let signer = remote();

        let mut policy = SecurityPreset::Strict.policy();
        policy.trust.auto_trust_first = false;
        policy.trust.trusted_fingerprints = vec![signer.fingerprint().to_string()];

        let decision = f.guard(policy).evaluate(&signed_announce(&signer)).await;
        assert!(matches!(decision, DiscoveryDecision::Accept { trusted: true, .. }));

        let peer = f.keystore.get_trusted_peer(signer.fingerprint()).await.unwrap();
        assert_eq!(peer.public_key, signer.identity().public_key_hex());
        assert_eq!(f.auditor.get_entries_by_type(SecurityEventType::PeerTrusted, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let f = fixture().await;
        let guard = f.guard(SecurityPreset::Development.policy());

        let decision = guard.evaluate(&serde_json::json!({"signature": 5})).await;
        assert!(matches!(decision, DiscoveryDecision::Reject(DiscoveryRejection::Malformed(_))));

        let decision = guard.evaluate(&serde_json::json!({"hello": "world"})).await;
        assert!(matches!(decision, DiscoveryDecision::Reject(DiscoveryRejection::Malformed(_))));
    }
}
