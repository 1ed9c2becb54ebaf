use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::security::auth::AuthConfig;
use crate::security::encryption::KdfOptions;
use crate::security::error::{PolicyValidationError, SecurityError, SecurityResult};
use crate::security::keystore::default_base_dir;
use crate::security::tls::DEFAULT_VALID_DAYS;
use super::{merge_security_config, SecurityPolicy, SecurityPolicyOverrides, SecurityPreset};

/// Security configuration file (TOML)
///
/// ```toml
/// preset = "strict"
/// identity_path = "/var/lib/skillkit/mesh"
///
/// [policy.trust]
/// trusted_fingerprints = ["3f2a..."]
///
/// [auth]
/// token_ttl_secs = 900
///
/// [tls]
/// valid_days = 90
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub preset: SecurityPreset,
    /// Base directory for identity and certificates
    pub identity_path: Option<PathBuf>,
    /// Append audit events to this file as JSON lines
    pub audit_log: Option<PathBuf>,
    /// Per-field overrides applied on top of the preset
    #[serde(default)]
    pub policy: SecurityPolicyOverrides,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub kdf: KdfSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Certificate subject; defaults to the machine host name
    pub host_name: Option<String>,
    #[serde(default = "default_valid_days")]
    pub valid_days: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfSettings {
    /// Upper bound on one key derivation
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Inbound messages older than this (or this far in the future) are dropped
    #[serde(default = "default_max_message_age_secs")]
    pub max_message_age_secs: u64,
}

fn default_valid_days() -> u32 { DEFAULT_VALID_DAYS }
fn default_max_message_age_secs() -> u64 { 300 }

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            host_name: None,
            valid_days: default_valid_days(),
        }
    }
}

impl TlsSettings {
    pub fn host_name(&self) -> String {
        self.host_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string())
        })
    }
}

impl KdfSettings {
    pub fn to_options(&self) -> KdfOptions {
        match self.timeout_secs {
            Some(secs) => KdfOptions::with_timeout(Duration::from_secs(secs)),
            None => KdfOptions::default(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_message_age_secs: default_max_message_age_secs(),
        }
    }
}

impl TransportSettings {
    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age_secs)
    }
}

impl SecurityConfig {
    pub fn with_preset(preset: SecurityPreset) -> Self {
        Self {
            preset,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> SecurityResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            SecurityError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> SecurityResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> SecurityResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| SecurityError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Base directory, defaulting to `~/.skillkit/mesh`
    pub fn base_dir(&self) -> PathBuf {
        self.identity_path.clone().unwrap_or_else(default_base_dir)
    }

    /// Effective policy: preset plus overrides, validated
    pub fn resolve(&self) -> Result<SecurityPolicy, PolicyValidationError> {
        let policy = merge_security_config(&self.preset.policy(), &self.policy);
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::policy::{DiscoveryMode, TlsMode, TransportEncryption};

    #[test]
    fn test_empty_config_is_secure_default() {
        let config = SecurityConfig::from_toml_str("").unwrap();
        assert_eq!(config.preset, SecurityPreset::Secure);
        assert_eq!(config.auth, AuthConfig::default());
        assert_eq!(config.tls.valid_days, DEFAULT_VALID_DAYS);
        assert_eq!(config.transport.max_message_age(), Duration::from_secs(300));
        assert_eq!(config.resolve().unwrap(), SecurityPolicy::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = SecurityConfig::from_toml_str(
            r#"
            preset = "strict"
            identity_path = "/tmp/mesh"

            [policy.trust]
            auto_trust_first = false
            trusted_fingerprints = ["abc"]

            [auth]
            token_ttl_secs = 900

            [tls]
            host_name = "node-a"
            valid_days = 30

            [kdf]
            timeout_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.base_dir(), PathBuf::from("/tmp/mesh"));
        assert_eq!(config.auth.token_ttl, Duration::from_secs(900));
        assert_eq!(config.auth.challenge_ttl, AuthConfig::default().challenge_ttl);
        assert_eq!(config.tls.host_name(), "node-a");
        assert_eq!(config.kdf.to_options().timeout, Some(Duration::from_secs(10)));

        let policy = config.resolve().unwrap();
        assert_eq!(policy.discovery.mode, DiscoveryMode::TrustedOnly);
        assert!(!policy.trust.auto_trust_first);
        assert!(policy.is_allowlisted("abc"));
    }

    #[test]
    fn test_resolve_reports_violations() {
        let config = SecurityConfig::from_toml_str(
            r#"
            [policy.transport]
            encryption = "required"
            tls = "none"
            "#,
        )
        .unwrap();
        let err = config.resolve().unwrap_err();
        assert_eq!(err.violations.len(), 1);
    }

    #[test]
    fn test_unknown_preset_rejected() {
        assert!(matches!(
            SecurityConfig::from_toml_str(r#"preset = "paranoid""#),
            Err(SecurityError::Config(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.toml");

        let mut config = SecurityConfig::with_preset(SecurityPreset::Signed);
        config.policy.transport = Some(crate::security::policy::TransportOverrides {
            encryption: Some(TransportEncryption::Required),
            tls: Some(TlsMode::SelfSigned),
            require_auth: None,
        });
        config.save_to_file(&path).unwrap();

        let loaded = SecurityConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.preset, SecurityPreset::Signed);
        assert_eq!(loaded.resolve().unwrap().transport.tls, TlsMode::SelfSigned);
    }
}
