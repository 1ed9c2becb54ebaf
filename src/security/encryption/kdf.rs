//! scrypt key derivation.
//!
//! The cost parameters are fixed and deliberately expensive: the keystore
//! passphrase may be machine-derived and low-entropy, so the KDF cost is the
//! defense against offline guessing.

use std::time::Duration;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio_util::sync::CancellationToken;

use crate::security::error::{EncryptionError, SecurityResult};
use crate::security::secure_memory::SecureKey;

/// log2(N) for scrypt, N = 2^14
pub const SCRYPT_LOG_N: u8 = 14;
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;
/// Derived key length (AES-256)
pub const KEY_LEN: usize = 32;
/// Salt length, fresh per encryption
pub const SALT_LEN: usize = 32;

/// Controls for running the KDF off the async worker threads
#[derive(Clone, Debug, Default)]
pub struct KdfOptions {
    /// Give up waiting after this long
    pub timeout: Option<Duration>,
    /// Give up waiting when cancelled
    pub cancel: Option<CancellationToken>,
}

impl KdfOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit key from a passphrase with scrypt (N=2^14, r=8, p=1).
///
/// CPU-bound; blocks the calling thread. Async callers use [`derive_key_async`].
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<SecureKey<KEY_LEN>, EncryptionError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| EncryptionError::KeyDerivation(e.to_string()))?;

    let mut output = [0u8; KEY_LEN];
    scrypt::scrypt(passphrase, salt, &params, &mut output)
        .map_err(|e| EncryptionError::KeyDerivation(e.to_string()))?;

    let key = SecureKey::new(output);
    zeroize::Zeroize::zeroize(&mut output);
    Ok(key)
}

/// Derive a key on the blocking pool, honoring timeout and cancellation.
///
/// The scrypt computation itself cannot be interrupted: on timeout or
/// cancellation the blocking task runs to completion and its key is dropped.
pub async fn derive_key_async(
    passphrase: &[u8],
    salt: &[u8],
    options: &KdfOptions,
) -> SecurityResult<SecureKey<KEY_LEN>> {
    let passphrase = zeroize::Zeroizing::new(passphrase.to_vec());
    let salt = salt.to_vec();
    let task = tokio::task::spawn_blocking(move || derive_key(&passphrase, &salt));

    let cancelled = async {
        match &options.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    let timed_out = async {
        match options.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(EncryptionError::KdfCancelled.into()),
        _ = timed_out => {
            // options.timeout is Some here: the pending branch never completes
            Err(EncryptionError::KdfTimedOut(options.timeout.unwrap_or_default()).into())
        }
        joined = task => {
            let key = joined
                .map_err(|e| EncryptionError::KeyDerivation(format!("KDF task failed: {}", e)))??;
            Ok(key)
        }
    }
}
