//! Declarative security posture: presets, overrides and validation.

mod audit;
mod config;

pub use audit::{AuditConfig, AuditLogEntry, SecurityAuditor, SecurityEvent, SecurityEventType, Severity};
pub use config::{KdfSettings, SecurityConfig, TlsSettings, TransportSettings};

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::security::constant_time::ConstantTime;
use crate::security::error::{PolicyValidationError, SecurityError};

/// How inbound discovery announcements are admitted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    /// Unsigned announcements accepted
    Open,
    /// Valid signature required
    Signed,
    /// Valid signature from a trusted or allowlisted peer required
    TrustedOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportEncryption {
    None,
    Optional,
    Required,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    None,
    SelfSigned,
    CaSigned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPolicy {
    pub mode: DiscoveryMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPolicy {
    pub encryption: TransportEncryption,
    pub tls: TlsMode,
    pub require_auth: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    /// Accept the first key seen for an unknown fingerprint
    pub auto_trust_first: bool,
    /// First-seen peers wait in the pending queue instead of being trusted
    pub require_manual_approval: bool,
    /// Fingerprints trusted by configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_fingerprints: Vec<String>,
}

/// Complete security posture of a host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub discovery: DiscoveryPolicy,
    pub transport: TransportPolicy,
    pub trust: TrustPolicy,
}

/// Named policy presets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityPreset {
    Development,
    Signed,
    #[default]
    Secure,
    Strict,
}

impl SecurityPreset {
    pub const ALL: [SecurityPreset; 4] = [
        SecurityPreset::Development,
        SecurityPreset::Signed,
        SecurityPreset::Secure,
        SecurityPreset::Strict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityPreset::Development => "development",
            SecurityPreset::Signed => "signed",
            SecurityPreset::Secure => "secure",
            SecurityPreset::Strict => "strict",
        }
    }

    pub fn policy(&self) -> SecurityPolicy {
        SecurityPolicy::preset(*self)
    }
}

impl fmt::Display for SecurityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityPreset {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SecurityPreset::ALL
            .into_iter()
            .find(|preset| preset.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SecurityError::Config(format!("Unknown security preset: {}", s)))
    }
}

impl SecurityPolicy {
    pub fn preset(preset: SecurityPreset) -> Self {
        let (mode, encryption, tls, require_auth) = match preset {
            SecurityPreset::Development => (
                DiscoveryMode::Open,
                TransportEncryption::None,
                TlsMode::None,
                false,
            ),
            SecurityPreset::Signed => (
                DiscoveryMode::Signed,
                TransportEncryption::Optional,
                TlsMode::None,
                false,
            ),
            SecurityPreset::Secure => (
                DiscoveryMode::Signed,
                TransportEncryption::Required,
                TlsMode::SelfSigned,
                true,
            ),
            SecurityPreset::Strict => (
                DiscoveryMode::TrustedOnly,
                TransportEncryption::Required,
                TlsMode::SelfSigned,
                true,
            ),
        };

        // strict admits first-seen peers only into the manual approval queue
        let strict = preset == SecurityPreset::Strict;
        SecurityPolicy {
            discovery: DiscoveryPolicy { mode },
            transport: TransportPolicy {
                encryption,
                tls,
                require_auth,
            },
            trust: TrustPolicy {
                auto_trust_first: preset != SecurityPreset::Development,
                require_manual_approval: strict,
                trusted_fingerprints: Vec::new(),
            },
        }
    }

    /// True if `fingerprint` is on the configured allowlist
    pub fn is_allowlisted(&self, fingerprint: &str) -> bool {
        self.trust
            .trusted_fingerprints
            .iter()
            .fold(false, |found, entry| ConstantTime::compare_fingerprint(entry, fingerprint) | found)
    }

    /// All violations, or `Ok` for a consistent policy
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        let violations = validate_security_config(self);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(PolicyValidationError { violations })
        }
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        SecurityPolicy::preset(SecurityPreset::default())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryOverrides {
    pub mode: Option<DiscoveryMode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOverrides {
    pub encryption: Option<TransportEncryption>,
    pub tls: Option<TlsMode>,
    pub require_auth: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustOverrides {
    pub auto_trust_first: Option<bool>,
    pub require_manual_approval: Option<bool>,
    pub trusted_fingerprints: Option<Vec<String>>,
}

/// Partial policy; every field that is set replaces the base value
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicyOverrides {
    #[serde(default)]
    pub discovery: Option<DiscoveryOverrides>,
    #[serde(default)]
    pub transport: Option<TransportOverrides>,
    #[serde(default)]
    pub trust: Option<TrustOverrides>,
}

/// Apply `overrides` on top of `base`, section by section and field by field
pub fn merge_security_config(base: &SecurityPolicy, overrides: &SecurityPolicyOverrides) -> SecurityPolicy {
    let mut merged = base.clone();

    if let Some(discovery) = &overrides.discovery {
        if let Some(mode) = discovery.mode {
            merged.discovery.mode = mode;
        }
    }

    if let Some(transport) = &overrides.transport {
        if let Some(encryption) = transport.encryption {
            merged.transport.encryption = encryption;
        }
        if let Some(tls) = transport.tls {
            merged.transport.tls = tls;
        }
        if let Some(require_auth) = transport.require_auth {
            merged.transport.require_auth = require_auth;
        }
    }

    if let Some(trust) = &overrides.trust {
        if let Some(auto_trust_first) = trust.auto_trust_first {
            merged.trust.auto_trust_first = auto_trust_first;
        }
        if let Some(manual) = trust.require_manual_approval {
            merged.trust.require_manual_approval = manual;
        }
        if let Some(fingerprints) = &trust.trusted_fingerprints {
            merged.trust.trusted_fingerprints = fingerprints.clone();
        }
    }

    merged
}

/// Human-readable violations of the cross-field rules; empty when valid
pub fn validate_security_config(policy: &SecurityPolicy) -> Vec<String> {
    let mut violations = Vec::new();

    if policy.transport.encryption == TransportEncryption::Required && policy.transport.tls == TlsMode::None {
        violations.push("transport.encryption = required needs transport.tls other than none".to_string());
    }

    if policy.discovery.mode == DiscoveryMode::TrustedOnly
        && !policy.trust.auto_trust_first
        && policy.trust.trusted_fingerprints.is_empty()
    {
        violations.push(
            "discovery.mode = trusted-only needs trust.auto_trust_first or a non-empty trust.trusted_fingerprints"
                .to_string(),
        );
    }

    for (index, fingerprint) in policy.trust.trusted_fingerprints.iter().enumerate() {
        if fingerprint.trim().is_empty() {
            violations.push(format!("trust.trusted_fingerprints[{}] is empty", index));
        }
    }

    violations
}

/// Preset name whose discovery mode, encryption and TLS mode match, or `custom`
pub fn describe_security_level(policy: &SecurityPolicy) -> &'static str {
    SecurityPreset::ALL
        .into_iter()
        .find(|preset| {
            let reference = preset.policy();
            reference.discovery.mode == policy.discovery.mode
                && reference.transport.encryption == policy.transport.encryption
                && reference.transport.tls == policy.transport.tls
        })
        .map(|preset| preset.as_str())
        .unwrap_or("custom")
}
