//! Policy enforcement for point-to-point mesh messages.
//!
//! Outbound payloads are sealed according to the transport policy: signed in
//! the clear, or encrypted to the recipient when encryption is required (or
//! optional and the recipient key is known). Inbound frames are only handed to
//! the application after authentication, revocation, freshness and replay
//! checks pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::security::auth::AuthManager;
use crate::security::constant_time::{normalize_fingerprint, ConstantTime};
use crate::security::encryption::{EncryptedTransportMessage, MessageEncryption};
use crate::security::error::{EncryptionError, SecurityResult, SignatureError};
use crate::security::identity::{short_fingerprint, SignatureService, SignedData};
use crate::security::keystore::SecureKeystore;
use crate::security::policy::{
    DiscoveryMode, SecurityAuditor, SecurityEventType, SecurityPolicy, TransportEncryption,
};

/// Signed body of a cleartext message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportBody {
    pub id: String,
    /// Recipient fingerprint
    pub to: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub payload: Value,
}

/// Cleartext message; the sender is the signer's fingerprint
pub type SecureTransportMessage = SignedData<TransportBody>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportMessage {
    Signed(SecureTransportMessage),
    Encrypted(EncryptedTransportMessage),
}

impl TransportMessage {
    /// Claimed sender fingerprint
    pub fn sender(&self) -> &str {
        match self {
            TransportMessage::Signed(m) => &m.fingerprint,
            TransportMessage::Encrypted(m) => &m.from,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            TransportMessage::Signed(m) => &m.payload.to,
            TransportMessage::Encrypted(m) => &m.to,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TransportMessage::Signed(m) => &m.payload.id,
            TransportMessage::Encrypted(m) => &m.id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            TransportMessage::Signed(m) => m.payload.timestamp,
            TransportMessage::Encrypted(m) => m.timestamp,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, TransportMessage::Encrypted(_))
    }
}

/// Unit exchanged between peers
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub message: TransportMessage,
}

/// Why an inbound frame was dropped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportRejection {
    Revoked,
    Unauthenticated(String),
    Untrusted,
    EncryptionRequired,
    Misaddressed,
    Stale,
    Replayed,
    InvalidSignature(SignatureError),
    UnknownSender,
    Undecryptable,
}

impl fmt::Display for TransportRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportRejection::Revoked => f.write_str("sender is revoked"),
            TransportRejection::Unauthenticated(e) => write!(f, "not authenticated: {}", e),
            TransportRejection::Untrusted => f.write_str("sender is not trusted"),
            TransportRejection::EncryptionRequired => f.write_str("cleartext message under required encryption"),
            TransportRejection::Misaddressed => f.write_str("message addressed to another host"),
            TransportRejection::Stale => f.write_str("timestamp outside the freshness window"),
            TransportRejection::Replayed => f.write_str("message id already seen"),
            TransportRejection::InvalidSignature(e) => write!(f, "invalid signature: {}", e),
            TransportRejection::UnknownSender => f.write_str("no public key known for sender"),
            TransportRejection::Undecryptable => f.write_str("decryption failed"),
        }
    }
}

/// Authenticated inbound payload
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub payload: Value,
    pub encrypted: bool,
}

/// Seals outbound payloads and admits inbound frames
pub struct TransportGuard {
    signer: SignatureService,
    encryption: MessageEncryption,
    keystore: Arc<SecureKeystore>,
    auth: Arc<AuthManager>,
    policy: SecurityPolicy,
    auditor: Arc<SecurityAuditor>,
    max_message_age: Duration,
    /// Message id to timestamp, pruned to the freshness window
    /// (sender, message id) of recently accepted messages
    seen: Mutex<HashMap<(String, String), i64>>,
}

impl TransportGuard {
    pub fn new(
        signer: SignatureService,
        keystore: Arc<SecureKeystore>,
        auth: Arc<AuthManager>,
        policy: SecurityPolicy,
        auditor: Arc<SecurityAuditor>,
        max_message_age: Duration,
    ) -> Self {
        let encryption = MessageEncryption::new(signer.identity().clone());
        Self {
            signer,
            encryption,
            keystore,
            auth,
            policy,
            auditor,
            max_message_age,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Seal a payload for a peer.
    ///
    /// `recipient_public_key` falls back to the keystore entry for the
    /// recipient. Required encryption without a known key is an error.
    pub async fn seal(
        &self,
        recipient_fingerprint: &str,
        recipient_public_key: Option<&str>,
        payload: &Value,
        auth_token: Option<String>,
    ) -> SecurityResult<TransportFrame> {
        let recipient = normalize_fingerprint(recipient_fingerprint);
        let public_key = match recipient_public_key {
            Some(pk) => Some(pk.to_string()),
            None => self.keystore.get_trusted_peer(&recipient).await.map(|p| p.public_key),
        };

        let message = match (self.policy.transport.encryption, public_key) {
            (TransportEncryption::None, _) | (TransportEncryption::Optional, None) => {
                TransportMessage::Signed(self.sign_body(recipient, payload)?)
            }
            (_, Some(public_key)) => {
                let encrypted = self.encryption.encrypt(&public_key, payload)?;
                if encrypted.to != recipient {
                    return Err(EncryptionError::KeyAgreementFailed(format!(
                        "public key does not belong to {}",
                        short_fingerprint(&recipient)
                    ))
                    .into());
                }
                TransportMessage::Encrypted(encrypted)
            }
            (TransportEncryption::Required, None) => {
                return Err(EncryptionError::KeyAgreementFailed(format!(
                    "no public key known for {}",
                    short_fingerprint(&recipient)
                ))
                .into());
            }
        };

        Ok(TransportFrame { auth_token, message })
    }

    fn sign_body(&self, recipient: String, payload: &Value) -> SecurityResult<SecureTransportMessage> {
        let body = TransportBody {
            id: uuid::Uuid::new_v4().to_string(),
            to: recipient,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload: payload.clone(),
        };
        self.signer.sign_with_ttl(body, self.max_message_age)
    }

    /// Run every inbound check and return the authenticated payload
    pub async fn open(&self, frame: &TransportFrame) -> Result<InboundMessage, TransportRejection> {
        let message = &frame.message;
        let sender = normalize_fingerprint(message.sender());

        let result = self.check(frame, &sender).await;
        match &result {
            Ok(_) => log::debug!("Accepted message {} from {}", message.id(), short_fingerprint(&sender)),
            Err(TransportRejection::Revoked) => {
                log::debug!("Dropped message from revoked peer {}", short_fingerprint(&sender));
                self.auditor
                    .record(SecurityEventType::MessageRejected, Some(&sender), TransportRejection::Revoked.to_string());
            }
            Err(reason) => {
                log::warn!("Rejected message from {}: {}", short_fingerprint(&sender), reason);
                let event_type = match reason {
                    TransportRejection::Unauthenticated(_) => SecurityEventType::AuthFailed,
                    TransportRejection::EncryptionRequired | TransportRejection::Untrusted => {
                        SecurityEventType::PolicyViolation
                    }
                    _ => SecurityEventType::MessageRejected,
                };
                self.auditor.record(event_type, Some(&sender), reason.to_string());
            }
        }
        result
    }

    async fn check(&self, frame: &TransportFrame, sender: &str) -> Result<InboundMessage, TransportRejection> {
        let message = &frame.message;

        if self.keystore.is_revoked(sender).await {
            return Err(TransportRejection::Revoked);
        }

        if self.policy.transport.require_auth {
            let token = frame
                .auth_token
                .as_deref()
                .ok_or_else(|| TransportRejection::Unauthenticated("no token".to_string()))?;
            let token = self
                .auth
                .verify_token(token)
                .await
                .map_err(|e| TransportRejection::Unauthenticated(e.to_string()))?;
            if !ConstantTime::compare_fingerprint(&token.fingerprint, sender) {
                return Err(TransportRejection::Unauthenticated(
                    "token issued to a different peer".to_string(),
                ));
            }
        }

        if self.policy.discovery.mode == DiscoveryMode::TrustedOnly
            && !self.keystore.is_trusted(sender).await
            && !self.policy.is_allowlisted(sender)
        {
            return Err(TransportRejection::Untrusted);
        }

        if self.policy.transport.encryption == TransportEncryption::Required && !message.is_encrypted() {
            return Err(TransportRejection::EncryptionRequired);
        }

        if !ConstantTime::compare_fingerprint(message.recipient(), self.signer.fingerprint()) {
            return Err(TransportRejection::Misaddressed);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let window = i64::try_from(self.max_message_age.as_millis()).unwrap_or(i64::MAX);
        if now.abs_diff(message.timestamp()) > window.unsigned_abs() {
            return Err(TransportRejection::Stale);
        }

        let payload = match message {
            TransportMessage::Signed(signed) => {
                SignatureService::verify_signed_data(signed).map_err(TransportRejection::InvalidSignature)?;
                signed.payload.payload.clone()
            }
            TransportMessage::Encrypted(encrypted) => {
                let peer = self
                    .keystore
                    .get_trusted_peer(sender)
                    .await
                    .ok_or(TransportRejection::UnknownSender)?;
                self.encryption
                    .decrypt(encrypted, &peer.public_key)
                    .map_err(|_| TransportRejection::Undecryptable)?
            }
        };

        // only authenticated messages enter the replay cache
        let mut seen = self.seen.lock().await;
        seen.retain(|_, ts| now.abs_diff(*ts) <= window.unsigned_abs());
        let key = (sender.to_string(), message.id().to_string());
        if seen.insert(key, message.timestamp()).is_some() {
            return Err(TransportRejection::Replayed);
        }

        Ok(InboundMessage {
            id: message.id().to_string(),
            from: sender.to_string(),
            payload,
            encrypted: message.is_encrypted(),
        })
    }
}
