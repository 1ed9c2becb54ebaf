use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::security::error::SecurityResult;

/// Security-relevant event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    /// Fingerprint of the peer involved, if any
    pub fingerprint: Option<String>,
    pub details: String,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, fingerprint: Option<&str>, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            fingerprint: fingerprint.map(str::to_string),
            details: details.into(),
        }
    }
}

/// Types of security events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    IdentityCreated,
    CertificateGenerated,
    PeerTrusted,
    PeerPending,
    PeerRevoked,
    DiscoveryRejected,
    AuthSucceeded,
    AuthFailed,
    MessageRejected,
    PolicyViolation,
}

/// Severity level for audit events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Audit log entry with its severity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub event: SecurityEvent,
    pub severity: Severity,
}

/// Audit log configuration
#[derive(Clone, Debug)]
pub struct AuditConfig {
    /// Maximum number of entries kept in memory
    pub max_memory_entries: usize,
    /// Append entries as JSON lines to this file
    pub log_file_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: 1000,
            log_file_path: None,
        }
    }
}

/// In-memory ring buffer of security events, optionally mirrored to disk
pub struct SecurityAuditor {
    config: AuditConfig,
    entries: RwLock<VecDeque<AuditLogEntry>>,
}

impl SecurityAuditor {
    pub fn new() -> Self {
        Self::with_config(AuditConfig::default())
    }

    pub fn with_config(config: AuditConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Record an event. Persistence failures are logged, never returned, so
    /// auditing cannot break the operation being audited.
    pub fn record(&self, event_type: SecurityEventType, fingerprint: Option<&str>, details: impl Into<String>) {
        let event = SecurityEvent::new(event_type, fingerprint, details);
        if let Err(e) = self.log_event(event) {
            log::warn!("Failed to persist audit entry: {}", e);
        }
    }

    /// Record an event, returning persistence errors
    pub fn log_event(&self, event: SecurityEvent) -> SecurityResult<()> {
        let entry = AuditLogEntry {
            severity: Self::determine_severity(event.event_type),
            event,
        };

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.push_back(entry.clone());
            while entries.len() > self.config.max_memory_entries {
                entries.pop_front();
            }
        }

        if let Some(path) = &self.config.log_file_path {
            Self::persist_entry(&entry, path)?;
        }
        Ok(())
    }

    fn persist_entry(entry: &AuditLogEntry, path: &PathBuf) -> SecurityResult<()> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let json = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    fn determine_severity(event_type: SecurityEventType) -> Severity {
        match event_type {
            SecurityEventType::IdentityCreated
            | SecurityEventType::CertificateGenerated
            | SecurityEventType::PeerTrusted
            | SecurityEventType::PeerPending
            | SecurityEventType::AuthSucceeded => Severity::Info,
            SecurityEventType::DiscoveryRejected
            | SecurityEventType::MessageRejected
            | SecurityEventType::AuthFailed
            | SecurityEventType::PolicyViolation => Severity::Warning,
            SecurityEventType::PeerRevoked => Severity::Critical,
        }
    }

    /// Most recent entries first
    pub fn get_recent_entries(&self, limit: usize) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn get_entries_for_peer(&self, fingerprint: &str, limit: usize) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .filter(|entry| entry.event.fingerprint.as_deref() == Some(fingerprint))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_entries_by_type(&self, event_type: SecurityEventType, limit: usize) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .filter(|entry| entry.event.event_type == event_type)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_entries_by_severity(&self, severity: Severity, limit: usize) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .filter(|entry| entry.severity == severity)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for SecurityAuditor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let auditor = SecurityAuditor::new();
        auditor.record(SecurityEventType::PeerTrusted, Some("peer1"), "trusted");
        auditor.record(SecurityEventType::DiscoveryRejected, Some("peer2"), "bad signature");
        auditor.record(SecurityEventType::PeerRevoked, Some("peer1"), "revoked");

        assert_eq!(auditor.entry_count(), 3);
        assert_eq!(auditor.get_entries_for_peer("peer1", 10).len(), 2);
        assert_eq!(
            auditor.get_recent_entries(1)[0].event.event_type,
            SecurityEventType::PeerRevoked
        );
        assert_eq!(auditor.get_entries_by_type(SecurityEventType::DiscoveryRejected, 10).len(), 1);
        assert_eq!(auditor.get_entries_by_severity(Severity::Critical, 10).len(), 1);
    }

    #[test]
    fn test_circular_buffer() {
        let auditor = SecurityAuditor::with_config(AuditConfig {
            max_memory_entries: 5,
            log_file_path: None,
        });

        for i in 0..10 {
            auditor.record(SecurityEventType::AuthFailed, None, format!("attempt {}", i));
        }

        assert_eq!(auditor.entry_count(), 5);
        assert_eq!(auditor.get_recent_entries(1)[0].event.details, "attempt 9");

        auditor.clear();
        assert_eq!(auditor.entry_count(), 0);
    }

    #[test]
    fn test_persist_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let auditor = SecurityAuditor::with_config(AuditConfig {
            max_memory_entries: 10,
            log_file_path: Some(path.clone()),
        });

        auditor.record(SecurityEventType::IdentityCreated, None, "created");
        auditor.record(SecurityEventType::PeerTrusted, Some("fp"), "trusted");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let entry: AuditLogEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(entry.event.fingerprint.as_deref(), Some("fp"));
    }
}
