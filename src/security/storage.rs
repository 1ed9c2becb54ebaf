//! Filesystem helpers for key material: private directories and atomic writes.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Mode for directories holding key material
pub const PRIVATE_DIR_MODE: u32 = 0o700;
/// Mode for secret files (private keys, encrypted identity)
pub const PRIVATE_FILE_MODE: u32 = 0o600;
/// Mode for public files (certificates, metadata)
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Create a directory (and parents) and restrict it to the owner
pub async fn ensure_private_dir(path: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    set_mode(path, PRIVATE_DIR_MODE).await
}

/// Replace `path` with `contents` via a temporary file and rename.
///
/// Readers never observe a half-written file. Concurrent writers from other
/// processes still race (last rename wins).
pub async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let tmp = temp_path(path);

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(mode);

        let mut file = options.open(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        set_mode(path, mode).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Read a file, mapping "not found" to `None`
pub async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        write_atomic(&path, b"first", PRIVATE_FILE_MODE).await.unwrap();
        write_atomic(&path, b"second", PRIVATE_FILE_MODE).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");

        // no temp files left behind
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_modes_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("identity");
        ensure_private_dir(&sub).await.unwrap();
        let file = sub.join("key");
        write_atomic(&file, b"k", PRIVATE_FILE_MODE).await.unwrap();

        let dir_mode = std::fs::metadata(&sub).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[tokio::test]
    async fn test_read_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("absent")).await.unwrap().is_none());
    }
}
