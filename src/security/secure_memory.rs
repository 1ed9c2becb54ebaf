//! Zeroizing wrappers for key material and passphrases.

use std::fmt;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// Environment variable consulted for the keystore passphrase
pub const PASSPHRASE_ENV: &str = "SKILLKIT_MESH_PASSPHRASE";

/// Fixed-size key that is wiped from memory on drop
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecureKey<const N: usize> {
    key: [u8; N],
}

impl<const N: usize> SecureKey<N> {
    pub fn new(key: [u8; N]) -> Self {
        Self { key }
    }

    /// Returns None if the slice length doesn't match N
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let key: [u8; N] = slice.try_into().ok()?;
        Some(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.key
    }
}

impl<const N: usize> fmt::Debug for SecureKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureKey<{}>([REDACTED])", N)
    }
}

/// Keystore passphrase.
///
/// The contents are zeroized on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct Passphrase {
    secret: Zeroizing<String>,
}

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Passphrase from `SKILLKIT_MESH_PASSPHRASE`, if set and non-empty
    pub fn from_env() -> Option<Self> {
        std::env::var(PASSPHRASE_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .map(Self::new)
    }

    /// Low-entropy passphrase derived from the machine.
    ///
    /// Built from the host name, the current user and the home directory.
    /// Anyone who can run code as this user on this machine can recompute it,
    /// so it only keeps the key file opaque to casual inspection (backups,
    /// copied directories, other users without access to those facts). The
    /// scrypt cost is the only thing slowing down a guess. Configure an
    /// explicit passphrase when the identity must resist a local attacker.
    pub fn machine_derived() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let user = whoami::username();
        let home = dirs::home_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(b"skillkit-mesh-machine-passphrase-v1");
        hasher.update(host.as_bytes());
        hasher.update([0u8]);
        hasher.update(user.as_bytes());
        hasher.update([0u8]);
        hasher.update(home.as_bytes());

        Self::new(hex::encode(hasher.finalize()))
    }

    /// Explicit passphrase, then the environment, then the machine-derived fallback
    pub fn resolve(explicit: Option<Passphrase>) -> Self {
        explicit
            .or_else(Self::from_env)
            .unwrap_or_else(Self::machine_derived)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.secret.as_bytes()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase([REDACTED])")
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_derived_is_stable() {
        let a = Passphrase::machine_derived();
        let b = Passphrase::machine_derived();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), 64);
    }

    #[test]
    fn test_debug_redacts() {
        let pass = Passphrase::new("hunter2");
        assert!(!format!("{:?}", pass).contains("hunter2"));

        let key = SecureKey::new([7u8; 32]);
        assert!(!format!("{:?}", key).contains('7'));
    }

    #[test]
    fn test_secure_key_from_slice_checks_length() {
        assert!(SecureKey::<32>::from_slice(&[0u8; 31]).is_none());
        assert!(SecureKey::<32>::from_slice(&[0u8; 32]).is_some());
    }

    #[test]
    fn test_resolve_prefers_explicit() {
        let pass = Passphrase::resolve(Some(Passphrase::new("explicit")));
        assert_eq!(pass.as_bytes(), b"explicit");
    }
}
