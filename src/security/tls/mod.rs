//! Per-host self-signed certificates and TLS configuration.
//!
//! Trust between mesh hosts is fingerprint pinning, not chain validation:
//! without a CA list the peer certificate is accepted by
//! [`FingerprintVerifier`] (pinned or trust-on-first-use).

mod verifier;

pub use verifier::FingerprintVerifier;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::security::constant_time::ConstantTime;
use crate::security::error::{CertificateError, SecurityResult};
use crate::security::identity::short_fingerprint;
use crate::security::storage;

pub const CERTS_DIR: &str = "certs";
pub const DEFAULT_VALID_DAYS: u32 = 365;

/// Hex SHA-256 of DER certificate bytes
pub fn compute_der_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Fingerprint of the first certificate in a PEM document
pub fn compute_cert_fingerprint(pem: &str) -> Result<String, CertificateError> {
    let certs = parse_certs(pem)?;
    let first = certs
        .first()
        .ok_or_else(|| CertificateError::Unreadable("no certificate in PEM".to_string()))?;
    Ok(compute_der_fingerprint(first.as_ref()))
}

/// Check a PEM certificate against an expected fingerprint.
/// Case and `:` separators in `expected` are ignored.
pub fn verify_cert_fingerprint(pem: &str, expected: &str) -> bool {
    match compute_cert_fingerprint(pem) {
        Ok(actual) => ConstantTime::compare_fingerprint(&actual, expected),
        Err(_) => false,
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Unreadable(format!("invalid certificate PEM: {}", e)))
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, CertificateError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| CertificateError::Unreadable(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| CertificateError::Unreadable("no private key in PEM".to_string()))
}

/// Host ids become file names, so they are restricted to a safe alphabet
fn validate_host_id(host_id: &str) -> Result<(), CertificateError> {
    let valid = !host_id.is_empty()
        && host_id.len() <= 128
        && host_id != "."
        && host_id != ".."
        && host_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CertificateError::InvalidHostId(host_id.to_string()))
    }
}

fn is_dns_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Certificate material for one host
#[derive(Clone)]
pub struct CertificateInfo {
    pub host_id: String,
    /// PEM certificate
    pub cert: String,
    /// PEM PKCS#8 private key
    pub key: String,
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject: String,
}

impl CertificateInfo {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.not_after
    }

    pub fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
        parse_certs(&self.cert)
    }

    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, CertificateError> {
        parse_private_key(&self.key)
    }

    fn metadata(&self) -> CertificateMetadata {
        CertificateMetadata {
            host_id: self.host_id.clone(),
            fingerprint: self.fingerprint.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            subject: self.subject.clone(),
        }
    }
}

impl std::fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("host_id", &self.host_id)
            .field("fingerprint", &self.fingerprint)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// `<hostId>.json` sidecar
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateMetadata {
    host_id: String,
    fingerprint: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    subject: String,
}

/// TLS context descriptor handed to the transport
#[derive(Clone)]
pub struct TlsContext {
    pub cert: String,
    pub key: String,
    /// PEM bundle of trusted CAs
    pub ca: Option<String>,
    /// Server side: ask the client for a certificate
    pub request_cert: bool,
    /// True only when a CA list is supplied
    pub reject_unauthorized: bool,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("ca", &self.ca.is_some())
            .field("request_cert", &self.request_cert)
            .field("reject_unauthorized", &self.reject_unauthorized)
            .finish_non_exhaustive()
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(e: impl std::fmt::Display) -> CertificateError {
    CertificateError::TlsConfig(e.to_string())
}

impl TlsContext {
    fn roots(&self) -> Result<Option<RootCertStore>, CertificateError> {
        let Some(ca) = &self.ca else {
            return Ok(None);
        };
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca)? {
            roots.add(cert).map_err(tls_err)?;
        }
        Ok(Some(roots))
    }

    /// rustls server configuration. Client certificates are checked against
    /// the CA list when present, otherwise against `pins` (empty = TOFU).
    pub fn server_config<S: AsRef<str>>(&self, pins: &[S]) -> SecurityResult<Arc<ServerConfig>> {
        let verifier = Arc::new(FingerprintVerifier::new(pins, crypto_provider()));
        self.server_config_with(verifier)
    }

    /// Server configuration using a caller-owned verifier, so accepted
    /// first-use fingerprints can be read back
    pub fn server_config_with(&self, verifier: Arc<FingerprintVerifier>) -> SecurityResult<Arc<ServerConfig>> {
        let provider = crypto_provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?;

        let builder = if !self.request_cert {
            builder.with_no_client_auth()
        } else if let Some(roots) = self.roots()? {
            let webpki = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(tls_err)?;
            builder.with_client_cert_verifier(webpki)
        } else {
            builder.with_client_cert_verifier(verifier)
        };

        let config = builder
            .with_single_cert(parse_certs(&self.cert)?, parse_private_key(&self.key)?)
            .map_err(tls_err)?;
        Ok(Arc::new(config))
    }

    /// rustls client configuration presenting our certificate. The server is
    /// checked against the CA list when present, otherwise against `pins`.
    pub fn client_config<S: AsRef<str>>(&self, pins: &[S]) -> SecurityResult<Arc<ClientConfig>> {
        let verifier = Arc::new(FingerprintVerifier::new(pins, crypto_provider()));
        self.client_config_with(verifier)
    }

    pub fn client_config_with(&self, verifier: Arc<FingerprintVerifier>) -> SecurityResult<Arc<ClientConfig>> {
        let builder = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?;

        let builder = match self.roots()? {
            Some(roots) => builder.with_root_certificates(roots),
            None => builder.dangerous().with_custom_certificate_verifier(verifier),
        };

        let config = builder
            .with_client_auth_cert(parse_certs(&self.cert)?, parse_private_key(&self.key)?)
            .map_err(tls_err)?;
        Ok(Arc::new(config))
    }
}

/// Owner of the per-host certificate files under `<base>/certs`
pub struct TlsManager {
    certs_dir: PathBuf,
    lock: Mutex<()>,
}

impl TlsManager {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            certs_dir: base_dir.as_ref().join(CERTS_DIR),
            lock: Mutex::new(()),
        }
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    fn paths(&self, host_id: &str) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.certs_dir.join(format!("{}.crt", host_id)),
            self.certs_dir.join(format!("{}.key", host_id)),
            self.certs_dir.join(format!("{}.json", host_id)),
        )
    }

    /// Generate and persist a new self-signed certificate, replacing any
    /// existing one for `host_id`
    pub async fn generate_certificate(
        &self,
        host_id: &str,
        host_name: &str,
        valid_days: u32,
    ) -> SecurityResult<CertificateInfo> {
        let _guard = self.lock.lock().await;
        self.generate_locked(host_id, host_name, valid_days).await
    }

    async fn generate_locked(
        &self,
        host_id: &str,
        host_name: &str,
        valid_days: u32,
    ) -> SecurityResult<CertificateInfo> {
        validate_host_id(host_id)?;
        let info = build_certificate(host_id, host_name, valid_days)?;

        storage::ensure_private_dir(&self.certs_dir).await?;
        let (crt, key, meta) = self.paths(host_id);
        storage::write_atomic(&key, info.key.as_bytes(), storage::PRIVATE_FILE_MODE).await?;
        storage::write_atomic(&crt, info.cert.as_bytes(), storage::PUBLIC_FILE_MODE).await?;
        let metadata = serde_json::to_vec_pretty(&info.metadata())?;
        storage::write_atomic(&meta, &metadata, storage::PUBLIC_FILE_MODE).await?;

        log::info!(
            "Generated TLS certificate for {} ({}), valid until {}",
            host_id,
            short_fingerprint(&info.fingerprint),
            info.not_after
        );
        Ok(info)
    }

    /// Load the stored certificate for `host_id`.
    ///
    /// Returns `None` when nothing is stored. Partially present or
    /// inconsistent material is a [`CertificateError`].
    pub async fn load_certificate(&self, host_id: &str) -> SecurityResult<Option<CertificateInfo>> {
        validate_host_id(host_id)?;
        let (crt, key, meta) = self.paths(host_id);

        let cert = storage::read_optional(&crt).await?;
        let key = storage::read_optional(&key).await?;
        let meta = storage::read_optional(&meta).await?;

        let (cert, key, meta) = match (cert, key, meta) {
            (None, None, None) => return Ok(None),
            (Some(cert), Some(key), Some(meta)) => (cert, key, meta),
            _ => {
                return Err(CertificateError::Unreadable(format!(
                    "incomplete certificate material for {}",
                    host_id
                ))
                .into());
            }
        };

        let cert = String::from_utf8(cert)
            .map_err(|_| CertificateError::Unreadable("certificate is not UTF-8".to_string()))?;
        let key = String::from_utf8(key)
            .map_err(|_| CertificateError::Unreadable("key is not UTF-8".to_string()))?;
        let metadata: CertificateMetadata = serde_json::from_slice(&meta)
            .map_err(|e| CertificateError::Unreadable(format!("certificate metadata: {}", e)))?;

        let fingerprint = compute_cert_fingerprint(&cert)?;
        if fingerprint != metadata.fingerprint {
            return Err(CertificateError::Unreadable(format!(
                "certificate for {} does not match its metadata",
                host_id
            ))
            .into());
        }
        parse_private_key(&key)?;

        Ok(Some(CertificateInfo {
            host_id: host_id.to_string(),
            cert,
            key,
            fingerprint,
            not_before: metadata.not_before,
            not_after: metadata.not_after,
            subject: metadata.subject,
        }))
    }

    /// Stored certificate, or a new one if none exists or it has expired
    pub async fn load_or_create_certificate(
        &self,
        host_id: &str,
        host_name: &str,
        valid_days: u32,
    ) -> SecurityResult<CertificateInfo> {
        let _guard = self.lock.lock().await;

        match self.load_certificate(host_id).await? {
            Some(info) if !info.is_expired() => Ok(info),
            Some(info) => {
                log::warn!(
                    "TLS certificate for {} expired at {}; regenerating",
                    host_id,
                    info.not_after
                );
                self.generate_locked(host_id, host_name, valid_days).await
            }
            None => self.generate_locked(host_id, host_name, valid_days).await,
        }
    }

    /// Server-side context. `reject_unauthorized` is true only with a CA list.
    pub fn create_server_context(
        &self,
        info: &CertificateInfo,
        ca: Option<String>,
        request_cert: bool,
    ) -> TlsContext {
        TlsContext {
            cert: info.cert.clone(),
            key: info.key.clone(),
            reject_unauthorized: ca.is_some(),
            ca,
            request_cert,
        }
    }

    /// Client-side context presenting this host's certificate
    pub fn create_client_context(&self, info: &CertificateInfo, ca: Option<String>) -> TlsContext {
        TlsContext {
            cert: info.cert.clone(),
            key: info.key.clone(),
            reject_unauthorized: ca.is_some(),
            ca,
            request_cert: false,
        }
    }
}

fn build_certificate(host_id: &str, host_name: &str, valid_days: u32) -> Result<CertificateInfo, CertificateError> {
    let today = Utc::now().date_naive();
    let expiry = today
        .checked_add_days(Days::new(u64::from(valid_days.max(1))))
        .ok_or_else(|| CertificateError::GenerationFailed("validity out of range".to_string()))?;

    let mut names = vec!["localhost".to_string()];
    if is_dns_name(host_name) && host_name != "localhost" {
        names.insert(0, host_name.to_string());
    }

    let mut params = rcgen::CertificateParams::new(names);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, host_name);
    params.distinguished_name.push(rcgen::DnType::OrganizationName, "skillkit mesh");
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    let key_pair = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertificateError::GenerationFailed(format!("key pair: {}", e)))?;
    params.key_pair = Some(key_pair);

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| CertificateError::GenerationFailed(e.to_string()))?;
    // every serialize call re-signs, so fingerprint the PEM that is stored
    let pem = cert
        .serialize_pem()
        .map_err(|e| CertificateError::GenerationFailed(e.to_string()))?;
    let fingerprint = compute_cert_fingerprint(&pem)?;

    Ok(CertificateInfo {
        host_id: host_id.to_string(),
        cert: pem,
        key: cert.serialize_private_key_pem(),
        fingerprint,
        not_before: today.and_time(NaiveTime::MIN).and_utc(),
        not_after: expiry.and_time(NaiveTime::MIN).and_utc(),
        subject: format!("CN={}", host_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());

        let info = manager.generate_certificate("host-1", "node-a.local", 30).await.unwrap();
        assert!(info.cert.contains("BEGIN CERTIFICATE"));
        assert!(info.key.contains("PRIVATE KEY"));
        assert_eq!(info.subject, "CN=node-a.local");
        assert!(!info.is_expired());
        assert_eq!(compute_cert_fingerprint(&info.cert).unwrap(), info.fingerprint);

        let loaded = manager.load_certificate("host-1").await.unwrap().unwrap();
        assert_eq!(loaded.fingerprint, info.fingerprint);
        assert_eq!(loaded.not_after, info.not_after);

        assert!(manager.load_certificate("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());

        let first = manager.load_or_create_certificate("h", "h", 10).await.unwrap();
        let second = manager.load_or_create_certificate("h", "h", 10).await.unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);

        let other = TlsManager::new(dir.path());
        let third = other.load_or_create_certificate("h", "h", 10).await.unwrap();
        assert_eq!(first.fingerprint, third.fingerprint);
    }

    #[tokio::test]
    async fn test_expired_certificate_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        let original = manager.generate_certificate("h", "h", 10).await.unwrap();

        let mut metadata = original.metadata();
        metadata.not_after = Utc::now() - chrono::Duration::days(1);
        let (_, _, meta_path) = manager.paths("h");
        tokio::fs::write(&meta_path, serde_json::to_vec(&metadata).unwrap()).await.unwrap();

        let renewed = manager.load_or_create_certificate("h", "h", 10).await.unwrap();
        assert_ne!(renewed.fingerprint, original.fingerprint);
        assert!(!renewed.is_expired());
    }

    #[tokio::test]
    async fn test_partial_material_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        manager.generate_certificate("h", "h", 10).await.unwrap();

        let (_, key_path, _) = manager.paths("h");
        tokio::fs::remove_file(&key_path).await.unwrap();

        assert!(manager.load_certificate("h").await.is_err());
        assert!(manager.load_or_create_certificate("h", "h", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_host_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        for bad in ["", "..", "a/b", "../escape", "x\\y"] {
            assert!(manager.generate_certificate(bad, "h", 1).await.is_err(), "{}", bad);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        manager.generate_certificate("h", "h", 1).await.unwrap();

        let (crt, key, _) = manager.paths("h");
        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&crt), 0o644);
        assert_eq!(mode(&key), 0o600);
        assert_eq!(mode(manager.certs_dir()), 0o700);
    }

    #[tokio::test]
    async fn test_fingerprint_verification() {
        let dir = tempfile::tempdir().unwrap();
        let info = TlsManager::new(dir.path()).generate_certificate("h", "h", 1).await.unwrap();

        let colon_upper = info
            .fingerprint
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap().to_uppercase())
            .collect::<Vec<_>>()
            .join(":");
        assert!(verify_cert_fingerprint(&info.cert, &colon_upper));
        assert!(!verify_cert_fingerprint(&info.cert, &"0".repeat(64)));
        assert!(!verify_cert_fingerprint("not a pem", &info.fingerprint));
    }

    #[tokio::test]
    async fn test_contexts_and_rustls_configs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        let server_info = manager.generate_certificate("server", "server", 1).await.unwrap();
        let client_info = manager.generate_certificate("client", "client", 1).await.unwrap();

        let server = manager.create_server_context(&server_info, None, true);
        assert!(server.request_cert);
        assert!(!server.reject_unauthorized);
        assert!(server.server_config(&[client_info.fingerprint.as_str()]).is_ok());

        let client = manager.create_client_context(&client_info, None);
        assert!(!client.reject_unauthorized);
        assert!(client.client_config::<&str>(&[]).is_ok());

        let with_ca = manager.create_client_context(&client_info, Some(server_info.cert.clone()));
        assert!(with_ca.reject_unauthorized);
        assert!(with_ca.client_config::<&str>(&[]).is_ok());
    }
}
