//! Point-to-point payload encryption between two mesh identities.
//!
//! Both sides derive the same static key from their long-term Ed25519
//! identities (converted to X25519) without any handshake. There is no forward
//! secrecy: a leaked identity key exposes all past traffic with that peer.

use std::sync::Arc;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::security::error::{DecryptionError, EncryptionError, SecurityResult};
use crate::security::identity::{compute_fingerprint, parse_public_key_hex, PeerIdentity};
use crate::security::secure_memory::SecureKey;
use super::{IV_LEN, TAG_LEN};

type HmacSha256 = Hmac<Sha256>;

const TRANSPORT_KEY_LABEL: &[u8] = b"skillkit-mesh-transport-key-v1";

/// Encrypted point-to-point message as exchanged on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedTransportMessage {
    pub id: String,
    /// Sender fingerprint
    pub from: String,
    /// Recipient fingerprint
    pub to: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub encrypted: bool,
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
}

impl EncryptedTransportMessage {
    fn associated_data(&self) -> Vec<u8> {
        format!(
            "skillkit-mesh-transport-v1|{}|{}|{}|{}",
            self.id, self.from, self.to, self.timestamp
        )
        .into_bytes()
    }
}

/// Encrypts payloads for, and decrypts payloads from, a specific peer
pub struct MessageEncryption {
    identity: Arc<PeerIdentity>,
}

impl MessageEncryption {
    pub fn new(identity: Arc<PeerIdentity>) -> Self {
        Self { identity }
    }

    /// Fingerprint of the local identity
    pub fn local_fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    /// Static key shared with the holder of `peer_public_key_hex`
    fn shared_key(&self, peer_public_key_hex: &str) -> Result<SecureKey<32>, EncryptionError> {
        let peer_key = parse_public_key_hex(peer_public_key_hex)
            .map_err(|e| EncryptionError::KeyAgreementFailed(e.to_string()))?;
        let peer_x25519 = X25519PublicKey::from(peer_key.to_montgomery().to_bytes());

        let scalar = Zeroizing::new(self.identity.keypair().private_key().to_scalar_bytes());
        let secret = StaticSecret::from(*scalar);
        let shared = secret.diffie_hellman(&peer_x25519);
        if !shared.was_contributory() {
            return Err(EncryptionError::KeyAgreementFailed(
                "peer public key has low order".to_string(),
            ));
        }

        let peer_fingerprint = compute_fingerprint(peer_key.as_bytes());
        let local_fingerprint = self.identity.fingerprint();
        let (first, second) = if local_fingerprint <= peer_fingerprint.as_str() {
            (local_fingerprint, peer_fingerprint.as_str())
        } else {
            (peer_fingerprint.as_str(), local_fingerprint)
        };

        let mut mac = <HmacSha256 as Mac>::new_from_slice(shared.as_bytes())
            .map_err(|e| EncryptionError::KeyAgreementFailed(format!("HMAC init failed: {}", e)))?;
        mac.update(TRANSPORT_KEY_LABEL);
        mac.update(first.as_bytes());
        mac.update(second.as_bytes());
        let key: [u8; 32] = mac.finalize().into_bytes().into();

        Ok(SecureKey::new(key))
    }

    /// Encrypt a JSON payload for the peer owning `recipient_public_key_hex`
    pub fn encrypt(
        &self,
        recipient_public_key_hex: &str,
        payload: &serde_json::Value,
    ) -> SecurityResult<EncryptedTransportMessage> {
        let key = self.shared_key(recipient_public_key_hex)?;
        let recipient = parse_public_key_hex(recipient_public_key_hex)?;

        let mut message = EncryptedTransportMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from: self.identity.fingerprint().to_string(),
            to: compute_fingerprint(recipient.as_bytes()),
            timestamp: chrono::Utc::now().timestamp_millis(),
            encrypted: true,
            iv: String::new(),
            ciphertext: String::new(),
            auth_tag: String::new(),
        };

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        let aad = message.associated_data();
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), Payload { msg: &plaintext, aad: &aad })
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        message.iv = hex::encode(iv);
        message.ciphertext = hex::encode(sealed);
        message.auth_tag = hex::encode(tag);
        Ok(message)
    }

    /// Decrypt a message sent by the peer owning `sender_public_key_hex`.
    ///
    /// Fails with [`DecryptionError`] if the message is not addressed to us,
    /// was not sent by that key, or does not authenticate.
    pub fn decrypt(
        &self,
        message: &EncryptedTransportMessage,
        sender_public_key_hex: &str,
    ) -> Result<serde_json::Value, DecryptionError> {
        if !message.encrypted || message.to != self.identity.fingerprint() {
            return Err(DecryptionError);
        }
        let sender = parse_public_key_hex(sender_public_key_hex).map_err(|_| DecryptionError)?;
        if compute_fingerprint(sender.as_bytes()) != message.from {
            return Err(DecryptionError);
        }

        let key = self.shared_key(sender_public_key_hex).map_err(|_| DecryptionError)?;
        let iv: [u8; IV_LEN] = hex::decode(&message.iv)
            .map_err(|_| DecryptionError)?
            .try_into()
            .map_err(|_| DecryptionError)?;
        let mut sealed = hex::decode(&message.ciphertext).map_err(|_| DecryptionError)?;
        let tag = hex::decode(&message.auth_tag).map_err(|_| DecryptionError)?;
        if tag.len() != TAG_LEN {
            return Err(DecryptionError);
        }
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| DecryptionError)?;
        let aad = message.associated_data();
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), Payload { msg: &sealed, aad: &aad })
            .map(Zeroizing::new)
            .map_err(|_| DecryptionError)?;

        serde_json::from_slice(&plaintext).map_err(|_| DecryptionError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> (MessageEncryption, MessageEncryption) {
        let alice = Arc::new(PeerIdentity::generate());
        let bob = Arc::new(PeerIdentity::generate());
        (MessageEncryption::new(alice), MessageEncryption::new(bob))
    }

    #[test]
    fn test_both_sides_agree() {
        let (alice, bob) = pair();
        let alice_pk = alice.identity.public_key_hex();
        let bob_pk = bob.identity.public_key_hex();

        let k1 = alice.shared_key(&bob_pk).unwrap();
        let k2 = bob.shared_key(&alice_pk).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_encrypt_decrypt_between_peers() {
        let (alice, bob) = pair();
        let payload = json!({"skill": "deploy", "args": [1, 2]});

        let message = alice.encrypt(&bob.identity.public_key_hex(), &payload).unwrap();
        assert_eq!(message.from, alice.local_fingerprint());
        assert_eq!(message.to, bob.local_fingerprint());

        let decrypted = bob.decrypt(&message, &alice.identity.public_key_hex()).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_third_party_cannot_decrypt() {
        let (alice, bob) = pair();
        let eve = MessageEncryption::new(Arc::new(PeerIdentity::generate()));

        let message = alice.encrypt(&bob.identity.public_key_hex(), &json!("hi")).unwrap();
        assert!(eve.decrypt(&message, &alice.identity.public_key_hex()).is_err());
    }

    #[test]
    fn test_header_tampering_rejected() {
        let (alice, bob) = pair();
        let alice_pk = alice.identity.public_key_hex();
        let mut message = alice.encrypt(&bob.identity.public_key_hex(), &json!({"n": 1})).unwrap();

        message.timestamp += 1;
        assert!(bob.decrypt(&message, &alice_pk).is_err());
    }

    #[test]
    fn test_wrong_sender_key_rejected() {
        let (alice, bob) = pair();
        let mallory = PeerIdentity::generate();
        let message = alice.encrypt(&bob.identity.public_key_hex(), &json!(1)).unwrap();

        assert!(bob.decrypt(&message, &mallory.public_key_hex()).is_err());
    }
}
