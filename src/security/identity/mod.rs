pub mod signature;

#[cfg(test)]
mod test_identity;

pub use signature::{
    canonical_json, extract_signer_fingerprint, is_signed_data_expired, SignatureService,
    SignedData,
};

use std::fmt;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::security::error::IdentityError;

/// Length of an Ed25519 public or private key in bytes
pub const KEY_BYTES: usize = 32;

/// Hex SHA-256 of the raw public key bytes: the peer's durable identifier
pub fn compute_fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// First 16 hex characters of a fingerprint, for logs and display
pub fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..16).unwrap_or(fingerprint)
}

/// Parse a hex-encoded Ed25519 public key
pub fn parse_public_key_hex(public_key_hex: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes: [u8; KEY_BYTES] = hex::decode(public_key_hex)
        .map_err(|e| IdentityError::InvalidKey(format!("Invalid hex: {}", e)))?
        .try_into()
        .map_err(|_| IdentityError::InvalidKey(format!("Expected {} bytes", KEY_BYTES)))?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| IdentityError::InvalidKey(format!("Invalid public key: {}", e)))
}

/// Ed25519 keypair. The private half is wiped on drop.
#[derive(Clone)]
pub struct PeerKeypair {
    private_key: SigningKey,
    public_key: VerifyingKey,
}

impl PeerKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let private_key = SigningKey::generate(&mut OsRng);
        let public_key = private_key.verifying_key();
        Self { private_key, public_key }
    }

    /// Rebuild a keypair from its 32-byte private seed
    pub fn from_private_bytes(bytes: &[u8; KEY_BYTES]) -> Self {
        let private_key = SigningKey::from_bytes(bytes);
        let public_key = private_key.verifying_key();
        Self { private_key, public_key }
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Get the private key (use with caution)
    pub fn private_key(&self) -> &SigningKey {
        &self.private_key
    }
}

impl fmt::Debug for PeerKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerKeypair")
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Long-term identity of a mesh host.
///
/// Immutable once generated: a new keypair is a new identity with a new
/// fingerprint, and every peer that trusted the old one must re-trust.
#[derive(Clone)]
pub struct PeerIdentity {
    keypair: PeerKeypair,
    fingerprint: String,
    created_at: DateTime<Utc>,
}

impl PeerIdentity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self::from_keypair(PeerKeypair::generate())
    }

    pub fn from_keypair(keypair: PeerKeypair) -> Self {
        let fingerprint = compute_fingerprint(keypair.public_key().as_bytes());
        Self {
            keypair,
            fingerprint,
            created_at: Utc::now(),
        }
    }

    pub fn keypair(&self) -> &PeerKeypair {
        &self.keypair
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn short_fingerprint(&self) -> &str {
        short_fingerprint(&self.fingerprint)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public_key().as_bytes())
    }

    /// When this instance was generated or loaded
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sign raw bytes
    pub fn sign_bytes(&self, message: &[u8]) -> Signature {
        self.keypair.private_key().sign(message)
    }

    /// Storage form of the identity. Holds the private key: keep it encrypted.
    pub fn to_serialized(&self) -> SerializedIdentity {
        SerializedIdentity {
            public_key_hex: self.public_key_hex(),
            private_key_hex: hex::encode(self.keypair.private_key().to_bytes()),
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Restore an identity, checking that every field agrees with the private key
    pub fn from_serialized(serialized: &SerializedIdentity) -> Result<Self, IdentityError> {
        let private_bytes = Zeroizing::new(
            hex::decode(&serialized.private_key_hex)
                .map_err(|e| IdentityError::Corrupted(format!("Invalid private key hex: {}", e)))?,
        );
        let private_bytes: &[u8; KEY_BYTES] = private_bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Corrupted("Invalid private key length".to_string()))?;

        let keypair = PeerKeypair::from_private_bytes(private_bytes);

        let public_key = parse_public_key_hex(&serialized.public_key_hex)
            .map_err(|e| IdentityError::Corrupted(e.to_string()))?;
        if public_key != *keypair.public_key() {
            return Err(IdentityError::Corrupted(
                "Public key does not match private key".to_string(),
            ));
        }

        let identity = Self::from_keypair(keypair);
        if identity.fingerprint != serialized.fingerprint {
            return Err(IdentityError::Corrupted(
                "Stored fingerprint does not match public key".to_string(),
            ));
        }

        Ok(identity)
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Serialized identity as stored inside the encrypted keypair file
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct SerializedIdentity {
    pub public_key_hex: String,
    pub private_key_hex: String,
    pub fingerprint: String,
}

impl fmt::Debug for SerializedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedIdentity")
            .field("public_key_hex", &self.public_key_hex)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Public half of an identity, safe to share
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub fingerprint: String,
    pub public_key: String,
}

impl From<&PeerIdentity> for PublicIdentity {
    fn from(identity: &PeerIdentity) -> Self {
        Self {
            fingerprint: identity.fingerprint.clone(),
            public_key: identity.public_key_hex(),
        }
    }
}
