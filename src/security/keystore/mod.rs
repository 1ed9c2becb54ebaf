//! Host identity persistence and the trusted/revoked peer store.
//!
//! Layout under the base directory (mode 0700):
//!
//! ```text
//! identity/keypair.enc    encrypted identity envelope (0600)
//! identity/keystore.json  trust metadata, no secrets (0600)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::security::constant_time::normalize_fingerprint;
use crate::security::encryption::{self, decrypt_data_async, EncryptedFile, KdfOptions};
use crate::security::error::{IdentityError, SecurityError, SecurityResult, TrustError};
use crate::security::identity::{short_fingerprint, PeerIdentity, SerializedIdentity};
use crate::security::secure_memory::Passphrase;
use crate::security::storage;
use crate::security::trust::{KeystoreData, PendingPeer, TrustDatabase, TrustedPeer};

pub const IDENTITY_DIR: &str = "identity";
pub const KEYPAIR_FILE: &str = "keypair.enc";
pub const KEYSTORE_FILE: &str = "keystore.json";

/// Default per-host base directory, `~/.skillkit/mesh`
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".skillkit")
        .join("mesh")
}

/// Keystore construction options
#[derive(Clone, Debug)]
pub struct KeystoreConfig {
    pub base_dir: PathBuf,
    /// Falls back to the environment, then to the machine-derived passphrase
    pub passphrase: Option<Passphrase>,
    pub kdf: KdfOptions,
}

impl KeystoreConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            passphrase: None,
            kdf: KdfOptions::default(),
        }
    }

    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    pub fn with_kdf_options(mut self, kdf: KdfOptions) -> Self {
        self.kdf = kdf;
        self
    }
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self::new(default_base_dir())
    }
}

/// Owner of the host identity and the peer trust store
pub struct SecureKeystore {
    identity_dir: PathBuf,
    passphrase: Passphrase,
    kdf: KdfOptions,
    identity: Mutex<Option<Arc<PeerIdentity>>>,
    trust: TrustDatabase,
}

impl SecureKeystore {
    /// Open the keystore, creating the identity directory if needed
    pub async fn open(config: KeystoreConfig) -> SecurityResult<Self> {
        let identity_dir = config.base_dir.join(IDENTITY_DIR);
        storage::ensure_private_dir(&identity_dir).await?;

        let trust = TrustDatabase::open(identity_dir.join(KEYSTORE_FILE)).await?;

        Ok(Self {
            identity_dir,
            passphrase: Passphrase::resolve(config.passphrase),
            kdf: config.kdf,
            identity: Mutex::new(None),
            trust,
        })
    }

    pub fn identity_dir(&self) -> &Path {
        &self.identity_dir
    }

    pub fn keypair_path(&self) -> PathBuf {
        self.identity_dir.join(KEYPAIR_FILE)
    }

    pub fn keystore_path(&self) -> &Path {
        self.trust.path()
    }

    /// Load the persisted identity, or create one if none exists.
    ///
    /// Idempotent per keystore instance. A keypair file that is present but
    /// cannot be decrypted or parsed is an error and is never replaced; see
    /// [`reset_identity`](Self::reset_identity).
    pub async fn load_or_create_identity(&self) -> SecurityResult<Arc<PeerIdentity>> {
        let mut cached = self.identity.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let path = self.keypair_path();
        let bytes = storage::read_optional(&path)
            .await
            .map_err(|e| IdentityError::LoadFailed(format!("{}: {}", path.display(), e)))?;

        let identity = match bytes {
            Some(bytes) => {
                let identity = self.decode_identity(&bytes).await?;
                log::info!("Loaded mesh identity {}", identity.short_fingerprint());
                identity
            }
            None => {
                let identity = PeerIdentity::generate();
                self.persist_identity(&identity).await?;
                log::info!("Created mesh identity {}", identity.short_fingerprint());
                identity
            }
        };

        let identity = Arc::new(identity);
        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// Identity if already loaded
    pub async fn identity(&self) -> Option<Arc<PeerIdentity>> {
        self.identity.lock().await.clone()
    }

    /// Discard the stored identity and generate a new one.
    ///
    /// Every peer that trusted the old fingerprint must re-trust this host.
    pub async fn reset_identity(&self) -> SecurityResult<Arc<PeerIdentity>> {
        let mut cached = self.identity.lock().await;

        let identity = PeerIdentity::generate();
        self.persist_identity(&identity).await?;
        log::warn!(
            "Mesh identity reset; new fingerprint {}. Peers must re-trust this host",
            identity.short_fingerprint()
        );

        let identity = Arc::new(identity);
        *cached = Some(identity.clone());
        Ok(identity)
    }

    async fn decode_identity(&self, bytes: &[u8]) -> SecurityResult<PeerIdentity> {
        let envelope = EncryptedFile::from_json(bytes).map_err(|e| {
            IdentityError::Corrupted(format!("keypair file is not an encrypted envelope: {}", e))
        })?;

        let plaintext = decrypt_data_async(&envelope, &self.passphrase, &self.kdf).await?;

        let serialized: SerializedIdentity = serde_json::from_slice(&plaintext)
            .map_err(|e| IdentityError::Corrupted(format!("decrypted identity unreadable: {}", e)))?;
        Ok(PeerIdentity::from_serialized(&serialized)?)
    }

    async fn persist_identity(&self, identity: &PeerIdentity) -> SecurityResult<()> {
        let serialized = identity.to_serialized();
        encryption::encrypt_file(&self.keypair_path(), &serialized, &self.passphrase, &self.kdf)
            .await
            .map_err(|e| match e {
                SecurityError::Storage(msg) => IdentityError::SaveFailed(msg).into(),
                other => other,
            })
    }

    /// Trust a peer. Clears any revocation or pending entry for it.
    pub async fn add_trusted_peer(
        &self,
        fingerprint: &str,
        public_key: &str,
        name: Option<String>,
    ) -> SecurityResult<()> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let peer = TrustedPeer::new(fingerprint.clone(), public_key.to_string(), name);
        self.trust.mutate(|data| data.upsert_trusted(peer)).await?;
        log::info!("Trusted peer {}", short_fingerprint(&fingerprint));
        Ok(())
    }

    /// Forget a trusted peer without revoking it. Returns false if unknown.
    pub async fn remove_trusted_peer(&self, fingerprint: &str) -> SecurityResult<bool> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let removed = self.trust.mutate(|data| data.remove_trusted(&fingerprint)).await?;
        if removed {
            log::info!("Removed trusted peer {}", short_fingerprint(&fingerprint));
        }
        Ok(removed)
    }

    /// Revoke a peer. Sticky until [`clear_revoked_peers`](Self::clear_revoked_peers)
    /// or an explicit re-trust.
    pub async fn revoke_peer(&self, fingerprint: &str) -> SecurityResult<()> {
        let fingerprint = normalize_fingerprint(fingerprint);
        self.trust.mutate(|data| data.revoke(&fingerprint)).await?;
        log::warn!("Revoked peer {}", short_fingerprint(&fingerprint));
        Ok(())
    }

    pub async fn clear_revoked_peers(&self) -> SecurityResult<usize> {
        let cleared = self.trust.mutate(KeystoreData::clear_revoked).await?;
        log::info!("Cleared {} revoked peer(s)", cleared);
        Ok(cleared)
    }

    pub async fn is_trusted(&self, fingerprint: &str) -> bool {
        let fingerprint = normalize_fingerprint(fingerprint);
        self.trust.read(|data| data.is_trusted(&fingerprint)).await
    }

    pub async fn is_revoked(&self, fingerprint: &str) -> bool {
        let fingerprint = normalize_fingerprint(fingerprint);
        self.trust.read(|data| data.is_revoked(&fingerprint)).await
    }

    pub async fn get_trusted_peer(&self, fingerprint: &str) -> Option<TrustedPeer> {
        let fingerprint = normalize_fingerprint(fingerprint);
        self.trust
            .read(|data| {
                if data.is_revoked(&fingerprint) {
                    None
                } else {
                    data.trusted_peer(&fingerprint).cloned()
                }
            })
            .await
    }

    pub async fn list_trusted_peers(&self) -> Vec<TrustedPeer> {
        self.trust.read(|data| data.trusted_peers.clone()).await
    }

    pub async fn list_revoked(&self) -> Vec<String> {
        self.trust.read(|data| data.revoked_fingerprints.clone()).await
    }

    /// Queue a first-seen peer for manual approval.
    /// Returns false if the peer is already trusted, revoked or queued.
    pub async fn add_pending_peer(
        &self,
        fingerprint: &str,
        public_key: &str,
        name: Option<String>,
    ) -> SecurityResult<bool> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let peer = PendingPeer::new(fingerprint.clone(), public_key.to_string(), name);
        let added = self.trust.mutate(|data| data.add_pending(peer)).await?;
        if added {
            log::info!("Peer {} awaiting approval", short_fingerprint(&fingerprint));
        }
        Ok(added)
    }

    pub async fn list_pending_peers(&self) -> Vec<PendingPeer> {
        self.trust.read(|data| data.pending_peers.clone()).await
    }

    /// Move a pending peer into the trusted set
    pub async fn approve_pending_peer(&self, fingerprint: &str) -> SecurityResult<TrustedPeer> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let approved = self
            .trust
            .mutate(|data| {
                let pending = data.take_pending(&fingerprint)?;
                let peer = TrustedPeer::from(pending);
                data.upsert_trusted(peer.clone());
                Some(peer)
            })
            .await?;

        match approved {
            Some(peer) => {
                log::info!("Approved pending peer {}", short_fingerprint(&fingerprint));
                Ok(peer)
            }
            None => Err(TrustError::PeerNotFound(fingerprint).into()),
        }
    }

    /// Drop a pending peer without trusting or revoking it
    pub async fn reject_pending_peer(&self, fingerprint: &str) -> SecurityResult<bool> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let removed = self
            .trust
            .mutate(|data| data.take_pending(&fingerprint).is_some())
            .await?;
        if removed {
            log::info!("Rejected pending peer {}", short_fingerprint(&fingerprint));
        }
        Ok(removed)
    }

    /// Copy of the full trust state
    pub async fn trust_snapshot(&self) -> KeystoreData {
        self.trust.snapshot().await
    }

    /// Re-read the trust store from disk
    pub async fn reload(&self) -> SecurityResult<()> {
        self.trust.reload().await
    }
}
