use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use crate::security::error::{SecurityResult, TrustError};
use crate::security::storage;
use super::{KeystoreData, KEYSTORE_VERSION};

/// JSON-file trust database for trusted, revoked and pending peers.
///
/// Reads are served from an in-memory copy. Every mutation re-reads the file,
/// applies the change and atomically replaces the file, serialized by an
/// in-process lock. Two processes mutating the same file still race.
pub struct TrustDatabase {
    path: PathBuf,
    cache: RwLock<KeystoreData>,
    write_lock: Mutex<()>,
}

impl TrustDatabase {
    /// Open the database at `path`. A missing file is an empty store and is
    /// only created by the first mutation.
    pub async fn open(path: PathBuf) -> SecurityResult<Self> {
        let data = Self::read_file(&path).await?;
        Ok(Self {
            path,
            cache: RwLock::new(data),
            write_lock: Mutex::new(()),
        })
    }

    async fn read_file(path: &Path) -> SecurityResult<KeystoreData> {
        let Some(bytes) = storage::read_optional(path).await? else {
            return Ok(KeystoreData::default());
        };

        let mut data: KeystoreData = serde_json::from_slice(&bytes).map_err(|e| {
            TrustError::StoreError(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        if data.version > KEYSTORE_VERSION {
            log::warn!(
                "Keystore {} has newer version {} (supported {})",
                path.display(),
                data.version,
                KEYSTORE_VERSION
            );
        }
        if data.enforce_invariants() {
            log::warn!(
                "Keystore {} listed peers as both trusted and revoked; revocation kept",
                path.display()
            );
        }
        Ok(data)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only query against the cached state
    pub async fn read<R>(&self, f: impl FnOnce(&KeystoreData) -> R) -> R {
        let data = self.cache.read().await;
        f(&data)
    }

    /// Copy of the cached state
    pub async fn snapshot(&self) -> KeystoreData {
        self.cache.read().await.clone()
    }

    /// Read-modify-write of the backing file
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut KeystoreData) -> R) -> SecurityResult<R> {
        let _guard = self.write_lock.lock().await;

        let mut data = Self::read_file(&self.path).await?;
        if data.version > KEYSTORE_VERSION {
            return Err(TrustError::StoreError(format!(
                "Refusing to rewrite {}: version {} is newer than supported {}",
                self.path.display(),
                data.version,
                KEYSTORE_VERSION
            ))
            .into());
        }
        let result = f(&mut data);
        data.enforce_invariants();
        data.version = KEYSTORE_VERSION;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                storage::ensure_private_dir(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(&data)?;
        storage::write_atomic(&self.path, &json, storage::PRIVATE_FILE_MODE).await?;

        *self.cache.write().await = data;
        Ok(result)
    }

    /// Discard the cache and re-read the file
    pub async fn reload(&self) -> SecurityResult<()> {
        let _guard = self.write_lock.lock().await;
        let data = Self::read_file(&self.path).await?;
        *self.cache.write().await = data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::trust::TrustedPeer;

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let db = TrustDatabase::open(path.clone()).await.unwrap();

        assert_eq!(db.snapshot().await, KeystoreData::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_mutation_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity").join("keystore.json");
        let db = TrustDatabase::open(path.clone()).await.unwrap();

        db.mutate(|data| data.upsert_trusted(TrustedPeer::new("fp".into(), "pk".into(), None)))
            .await
            .unwrap();
        assert!(db.read(|data| data.is_trusted("fp")).await);

        let reopened = TrustDatabase::open(path).await.unwrap();
        assert!(reopened.read(|data| data.is_trusted("fp")).await);
    }

    #[tokio::test]
    async fn test_mutate_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let a = TrustDatabase::open(path.clone()).await.unwrap();
        let b = TrustDatabase::open(path.clone()).await.unwrap();

        a.mutate(|data| data.upsert_trusted(TrustedPeer::new("one".into(), "pk".into(), None)))
            .await
            .unwrap();
        b.mutate(|data| data.upsert_trusted(TrustedPeer::new("two".into(), "pk".into(), None)))
            .await
            .unwrap();

        // b saw a's write before applying its own
        assert!(b.read(|data| data.is_trusted("one") && data.is_trusted("two")).await);

        assert!(!a.read(|data| data.is_trusted("two")).await);
        a.reload().await.unwrap();
        assert!(a.read(|data| data.is_trusted("two")).await);
    }

    #[tokio::test]
    async fn test_newer_version_is_read_but_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let newer = br#"{"version": 2, "trustedPeers": [], "revokedFingerprints": ["fp"]}"#;
        tokio::fs::write(&path, newer).await.unwrap();

        let db = TrustDatabase::open(path.clone()).await.unwrap();
        assert!(db.read(|data| data.is_revoked("fp")).await);

        let result = db.mutate(|data| data.clear_revoked()).await;
        assert!(matches!(
            result,
            Err(crate::security::error::SecurityError::Trust(TrustError::StoreError(_)))
        ));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), newer.to_vec());
        assert!(db.read(|data| data.is_revoked("fp")).await);
    }

    #[tokio::test]
    async fn test_unparsable_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let result = TrustDatabase::open(path).await;
        assert!(matches!(
            result,
            Err(crate::security::error::SecurityError::Trust(TrustError::StoreError(_)))
        ));
    }
}
