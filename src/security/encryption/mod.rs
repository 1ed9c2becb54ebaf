//! Passphrase-based encryption at rest.
//!
//! Envelopes are AES-256-GCM under a scrypt-derived key, with a fresh random
//! salt and IV for every encryption. Every decryption failure surfaces as the
//! single [`DecryptionError`].

mod kdf;
pub mod message;

#[cfg(test)]
mod test_encryption;

pub use kdf::{
    derive_key, derive_key_async, generate_salt, KdfOptions, KEY_LEN, SALT_LEN, SCRYPT_LOG_N,
    SCRYPT_P, SCRYPT_R,
};
pub use message::{EncryptedTransportMessage, MessageEncryption};

use std::path::Path;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::security::error::{DecryptionError, EncryptionError, SecurityError, SecurityResult};
use crate::security::secure_memory::{Passphrase, SecureKey};
use crate::security::storage;

/// Current envelope format version
pub const ENVELOPE_VERSION: u32 = 1;
pub const ALGORITHM: &str = "aes-256-gcm";
pub const KDF: &str = "scrypt";
/// AES-GCM nonce length (96 bits)
pub const IV_LEN: usize = 12;
/// AES-GCM tag length
pub const TAG_LEN: usize = 16;

const ENVELOPE_AAD: &[u8] = b"skillkit-mesh-envelope-v1";

/// On-disk encrypted envelope, all byte fields hex-encoded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedFile {
    pub version: u32,
    pub encrypted: bool,
    pub algorithm: String,
    pub kdf: String,
    pub salt: String,
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
}

impl EncryptedFile {
    /// Parse an envelope from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize the envelope as pretty JSON
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Check the header and decode the byte fields
    fn decode(&self) -> Result<DecodedEnvelope, DecryptionError> {
        if self.version != ENVELOPE_VERSION
            || !self.encrypted
            || self.algorithm != ALGORITHM
            || self.kdf != KDF
        {
            return Err(DecryptionError);
        }

        let salt = hex::decode(&self.salt).map_err(|_| DecryptionError)?;
        let iv: [u8; IV_LEN] = hex::decode(&self.iv)
            .map_err(|_| DecryptionError)?
            .try_into()
            .map_err(|_| DecryptionError)?;
        let mut sealed = hex::decode(&self.ciphertext).map_err(|_| DecryptionError)?;
        let tag = hex::decode(&self.auth_tag).map_err(|_| DecryptionError)?;

        if salt.len() != SALT_LEN || tag.len() != TAG_LEN {
            return Err(DecryptionError);
        }
        sealed.extend_from_slice(&tag);

        Ok(DecodedEnvelope { salt, iv, sealed })
    }
}

struct DecodedEnvelope {
    salt: Vec<u8>,
    iv: [u8; IV_LEN],
    /// ciphertext followed by the tag
    sealed: Vec<u8>,
}

fn seal_with_key(
    key: &SecureKey<KEY_LEN>,
    salt: &[u8],
    plaintext: &[u8],
) -> Result<EncryptedFile, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad: ENVELOPE_AAD })
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedFile {
        version: ENVELOPE_VERSION,
        encrypted: true,
        algorithm: ALGORITHM.to_string(),
        kdf: KDF.to_string(),
        salt: hex::encode(salt),
        iv: hex::encode(iv),
        ciphertext: hex::encode(sealed),
        auth_tag: hex::encode(tag),
    })
}

fn open_with_key(
    key: &SecureKey<KEY_LEN>,
    envelope: &DecodedEnvelope,
) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| DecryptionError)?;
    cipher
        .decrypt(
            Nonce::from_slice(&envelope.iv),
            Payload { msg: &envelope.sealed, aad: ENVELOPE_AAD },
        )
        .map(Zeroizing::new)
        .map_err(|_| DecryptionError)
}

/// Encrypt bytes under a passphrase. Blocks for the KDF.
pub fn encrypt_data(plaintext: &[u8], passphrase: &Passphrase) -> SecurityResult<EncryptedFile> {
    let salt = generate_salt();
    let key = derive_key(passphrase.as_bytes(), &salt)?;
    Ok(seal_with_key(&key, &salt, plaintext)?)
}

/// Decrypt an envelope. Blocks for the KDF.
pub fn decrypt_data(
    envelope: &EncryptedFile,
    passphrase: &Passphrase,
) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
    let decoded = envelope.decode()?;
    let key = derive_key(passphrase.as_bytes(), &decoded.salt).map_err(|_| DecryptionError)?;
    open_with_key(&key, &decoded)
}

/// Encrypt bytes with the KDF on the blocking pool
pub async fn encrypt_data_async(
    plaintext: &[u8],
    passphrase: &Passphrase,
    options: &KdfOptions,
) -> SecurityResult<EncryptedFile> {
    let salt = generate_salt();
    let key = derive_key_async(passphrase.as_bytes(), &salt, options).await?;
    Ok(seal_with_key(&key, &salt, plaintext)?)
}

/// Decrypt an envelope with the KDF on the blocking pool.
///
/// Cancellation and timeout surface as [`EncryptionError`]; every other
/// failure is a [`DecryptionError`].
pub async fn decrypt_data_async(
    envelope: &EncryptedFile,
    passphrase: &Passphrase,
    options: &KdfOptions,
) -> SecurityResult<Zeroizing<Vec<u8>>> {
    let decoded = envelope.decode()?;
    let key = match derive_key_async(passphrase.as_bytes(), &decoded.salt, options).await {
        Ok(key) => key,
        Err(SecurityError::Encryption(EncryptionError::KeyDerivation(_))) => {
            return Err(DecryptionError.into());
        }
        Err(e) => return Err(e),
    };
    Ok(open_with_key(&key, &decoded)?)
}

/// Encrypt any serializable value as JSON
pub fn encrypt_object<T: Serialize + ?Sized>(
    value: &T,
    passphrase: &Passphrase,
) -> SecurityResult<EncryptedFile> {
    let json = Zeroizing::new(serde_json::to_vec(value)?);
    encrypt_data(&json, passphrase)
}

/// Decrypt an envelope holding a JSON value
pub fn decrypt_object<T: DeserializeOwned>(
    envelope: &EncryptedFile,
    passphrase: &Passphrase,
) -> SecurityResult<T> {
    let plaintext = decrypt_data(envelope, passphrase)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Encrypt a value and write the envelope to `path` (mode 0600)
pub async fn encrypt_file<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    passphrase: &Passphrase,
    options: &KdfOptions,
) -> SecurityResult<()> {
    let json = Zeroizing::new(serde_json::to_vec(value)?);
    let envelope = encrypt_data_async(&json, passphrase, options).await?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            storage::ensure_private_dir(parent).await?;
        }
    }
    storage::write_atomic(path, &envelope.to_json()?, storage::PRIVATE_FILE_MODE).await?;
    Ok(())
}

/// Read an envelope from `path` and decrypt the value inside.
///
/// An unparsable envelope is reported as a [`DecryptionError`].
pub async fn decrypt_file<T: DeserializeOwned>(
    path: &Path,
    passphrase: &Passphrase,
    options: &KdfOptions,
) -> SecurityResult<T> {
    let bytes = tokio::fs::read(path).await?;
    let envelope = EncryptedFile::from_json(&bytes).map_err(|_| DecryptionError)?;
    let plaintext = decrypt_data_async(&envelope, passphrase, options).await?;
    Ok(serde_json::from_slice(&plaintext)?)
}
