use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use serde_json::Value;

use crate::security::{Security, SecurityResult};
use crate::security::auth::{AuthManager, AuthToken};
use crate::security::constant_time::normalize_fingerprint;
use crate::security::discovery::DiscoveryGuard;
use crate::security::identity::{short_fingerprint, PeerIdentity, SignatureService, SignedData};
use crate::security::keystore::{KeystoreConfig, SecureKeystore};
use crate::security::policy::{
    describe_security_level, AuditConfig, SecurityAuditor, SecurityConfig, SecurityEventType,
    SecurityPolicy, SecurityPolicyOverrides, SecurityPreset, TlsMode,
};
use crate::security::secure_memory::Passphrase;
use crate::security::tls::{CertificateInfo, TlsContext, TlsManager};
use crate::security::transport::TransportGuard;
use crate::security::trust::TrustedPeer;

/// Security layer of one mesh host.
///
/// Owns the keystore, certificates, authentication state and the guards that
/// apply the resolved policy. Several systems may coexist in one process.
pub struct SecuritySystem {
    config: SecurityConfig,
    policy: SecurityPolicy,
    keystore: Arc<SecureKeystore>,
    signer: SignatureService,
    tls: TlsManager,
    auth: Arc<AuthManager>,
    auditor: Arc<SecurityAuditor>,
    discovery: DiscoveryGuard,
    transport: TransportGuard,
}

impl SecuritySystem {
    /// Build a system from configuration, loading or creating the identity
    pub async fn from_config(config: SecurityConfig) -> SecurityResult<Self> {
        SecuritySystemBuilder::new().config(config).build().await
    }

    async fn assemble(config: SecurityConfig, passphrase: Option<Passphrase>) -> SecurityResult<Self> {
        let policy = config.resolve()?;
        for warning in crate::security::policy::validate_security_config(&policy) {
            log::debug!("Security policy note: {}", warning);
        }

        let base_dir = config.base_dir();
        let mut keystore_config = KeystoreConfig::new(&base_dir).with_kdf_options(config.kdf.to_options());
        if let Some(passphrase) = passphrase {
            keystore_config = keystore_config.with_passphrase(passphrase);
        }

        let auditor = Arc::new(SecurityAuditor::with_config(AuditConfig {
            log_file_path: config.audit_log.clone(),
            ..AuditConfig::default()
        }));

        let keystore = Arc::new(SecureKeystore::open(keystore_config).await?);
        let existed = tokio::fs::try_exists(keystore.keypair_path()).await.unwrap_or(false);
        let identity = keystore.load_or_create_identity().await?;
        if !existed {
            auditor.record(
                SecurityEventType::IdentityCreated,
                Some(identity.fingerprint()),
                "new host identity",
            );
        }

        let signer = SignatureService::new(identity);
        let auth = Arc::new(AuthManager::new(keystore.clone(), config.auth));
        let discovery = DiscoveryGuard::new(signer.clone(), keystore.clone(), policy.clone(), auditor.clone());
        let transport = TransportGuard::new(
            signer.clone(),
            keystore.clone(),
            auth.clone(),
            policy.clone(),
            auditor.clone(),
            config.transport.max_message_age(),
        );

        log::info!(
            "Security system ready for {} ({} preset, {})",
            short_fingerprint(signer.fingerprint()),
            config.preset,
            describe_security_level(&policy)
        );

        Ok(Self {
            tls: TlsManager::new(&base_dir),
            config,
            policy,
            keystore,
            signer,
            auth,
            auditor,
            discovery,
            transport,
        })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Resolved and validated policy
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn security_level(&self) -> &'static str {
        describe_security_level(&self.policy)
    }

    pub fn identity(&self) -> &Arc<PeerIdentity> {
        self.signer.identity()
    }

    pub fn signer(&self) -> &SignatureService {
        &self.signer
    }

    pub fn keystore(&self) -> Arc<SecureKeystore> {
        Arc::clone(&self.keystore)
    }

    pub fn auth(&self) -> Arc<AuthManager> {
        Arc::clone(&self.auth)
    }

    pub fn auditor(&self) -> Arc<SecurityAuditor> {
        Arc::clone(&self.auditor)
    }

    pub fn tls_manager(&self) -> &TlsManager {
        &self.tls
    }

    pub fn discovery(&self) -> &DiscoveryGuard {
        &self.discovery
    }

    pub fn transport(&self) -> &TransportGuard {
        &self.transport
    }

    /// Certificate for `host_id`, generated on first use
    pub async fn host_certificate(&self, host_id: &str) -> SecurityResult<CertificateInfo> {
        let existed = self.tls.load_certificate(host_id).await?.is_some_and(|c| !c.is_expired());
        let info = self
            .tls
            .load_or_create_certificate(host_id, &self.config.tls.host_name(), self.config.tls.valid_days)
            .await?;
        if !existed {
            self.auditor.record(
                SecurityEventType::CertificateGenerated,
                None,
                format!("{} (sha256 {})", host_id, info.fingerprint),
            );
        }
        Ok(info)
    }

    /// Server TLS context as the policy dictates, `None` when TLS is off
    pub async fn server_tls_context(&self, host_id: &str) -> SecurityResult<Option<TlsContext>> {
        if self.policy.transport.tls == TlsMode::None {
            return Ok(None);
        }
        let info = self.host_certificate(host_id).await?;
        Ok(Some(self.tls.create_server_context(&info, None, true)))
    }

    /// Client TLS context as the policy dictates, `None` when TLS is off
    pub async fn client_tls_context(&self, host_id: &str) -> SecurityResult<Option<TlsContext>> {
        if self.policy.transport.tls == TlsMode::None {
            return Ok(None);
        }
        let info = self.host_certificate(host_id).await?;
        Ok(Some(self.tls.create_client_context(&info, None)))
    }

    pub async fn trust_peer(&self, fingerprint: &str, public_key: &str, name: Option<String>) -> SecurityResult<()> {
        self.keystore.add_trusted_peer(fingerprint, public_key, name).await?;
        self.auditor.record(
            SecurityEventType::PeerTrusted,
            Some(&normalize_fingerprint(fingerprint)),
            "trusted manually",
        );
        Ok(())
    }

    /// Revoke a peer and drop its outstanding tokens
    pub async fn revoke_peer(&self, fingerprint: &str) -> SecurityResult<()> {
        self.keystore.revoke_peer(fingerprint).await?;
        let dropped = self.auth.revoke_tokens_for(fingerprint).await;
        self.auditor.record(
            SecurityEventType::PeerRevoked,
            Some(&normalize_fingerprint(fingerprint)),
            format!("{} token(s) dropped", dropped),
        );
        Ok(())
    }

    pub async fn approve_pending_peer(&self, fingerprint: &str) -> SecurityResult<TrustedPeer> {
        let peer = self.keystore.approve_pending_peer(fingerprint).await?;
        self.auditor
            .record(SecurityEventType::PeerTrusted, Some(&peer.fingerprint), "approved");
        Ok(peer)
    }

    /// Server side of the challenge flow, audited
    pub async fn authenticate_peer(
        &self,
        fingerprint: &str,
        signed_nonce: &SignedData<String>,
    ) -> SecurityResult<AuthToken> {
        let fingerprint = normalize_fingerprint(fingerprint);
        match self.auth.complete_challenge(&fingerprint, signed_nonce).await {
            Ok(token) => {
                self.auditor
                    .record(SecurityEventType::AuthSucceeded, Some(&fingerprint), "challenge completed");
                Ok(token)
            }
            Err(e) => {
                log::warn!("Authentication of {} failed: {}", short_fingerprint(&fingerprint), e);
                self.auditor
                    .record(SecurityEventType::AuthFailed, Some(&fingerprint), e.to_string());
                Err(e)
            }
        }
    }

    pub async fn list_trusted_peers(&self) -> Vec<TrustedPeer> {
        self.keystore.list_trusted_peers().await
    }

    /// Drop expired challenges and tokens
    pub async fn cleanup_expired(&self) -> usize {
        self.auth.cleanup_expired().await
    }
}

#[async_trait]
impl Security for SecuritySystem {
    fn fingerprint(&self) -> &str {
        self.signer.fingerprint()
    }

    fn public_key_hex(&self) -> String {
        self.signer.identity().public_key_hex()
    }

    fn sign_value(&self, payload: Value) -> SecurityResult<SignedData<Value>> {
        self.signer.sign(payload)
    }

    async fn is_trusted(&self, fingerprint: &str) -> bool {
        // revocation overrides the allowlist
        !self.keystore.is_revoked(fingerprint).await
            && (self.keystore.is_trusted(fingerprint).await || self.policy.is_allowlisted(fingerprint))
    }

    async fn is_revoked(&self, fingerprint: &str) -> bool {
        self.keystore.is_revoked(fingerprint).await
    }

    async fn trust_peer(&self, fingerprint: &str, public_key: &str, name: Option<String>) -> SecurityResult<()> {
        SecuritySystem::trust_peer(self, fingerprint, public_key, name).await
    }

    async fn revoke_peer(&self, fingerprint: &str) -> SecurityResult<()> {
        SecuritySystem::revoke_peer(self, fingerprint).await
    }
}

/// Builder for SecuritySystem
pub struct SecuritySystemBuilder {
    config: SecurityConfig,
    passphrase: Option<Passphrase>,
}

impl SecuritySystemBuilder {
    pub fn new() -> Self {
        Self {
            config: SecurityConfig::default(),
            passphrase: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: SecurityConfig) -> Self {
        self.config = config;
        self
    }

    pub fn preset(mut self, preset: SecurityPreset) -> Self {
        self.config.preset = preset;
        self
    }

    /// Base directory for identity and certificates
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.identity_path = Some(path.into());
        self
    }

    pub fn policy_overrides(mut self, overrides: SecurityPolicyOverrides) -> Self {
        self.config.policy = overrides;
        self
    }

    /// Identity passphrase; otherwise taken from the environment or derived
    /// from the machine
    pub fn passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    pub fn audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.audit_log = Some(path.into());
        self
    }

    pub async fn build(self) -> SecurityResult<SecuritySystem> {
        SecuritySystem::assemble(self.config, self.passphrase).await
    }
}

impl Default for SecuritySystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
