use thiserror::Error;

/// Result type for security operations
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Unified error type for the mesh security layer
#[derive(Error, Debug)]
pub enum SecurityError {
    /// Envelope could not be decrypted (any cause)
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// Errors related to encryption operations and key derivation
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Errors related to identity management
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Errors related to trust management
    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),

    /// Invalid, expired or mismatched signatures
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    /// Inconsistent security policy
    #[error(transparent)]
    Policy(#[from] PolicyValidationError),

    /// Certificate material errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Challenge/response and token errors
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Filesystem errors outside the identity and certificate paths
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Decryption failure.
///
/// Wrong passphrase, corrupted envelope and tag mismatch all collapse into
/// this one error so callers cannot be used as a decryption oracle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Decryption failed: wrong passphrase or corrupted data")]
pub struct DecryptionError;

/// Encryption and key derivation errors
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Key derivation cancelled")]
    KdfCancelled,

    #[error("Key derivation timed out after {0:?}")]
    KdfTimedOut(std::time::Duration),

    #[error("Encryption operation failed: {0}")]
    EncryptionFailed(String),

    #[error("Key agreement failed: {0}")]
    KeyAgreementFailed(String),
}

/// Identity-related errors
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to generate identity: {0}")]
    GenerationFailed(String),

    #[error("Failed to load identity from storage: {0}")]
    LoadFailed(String),

    #[error("Failed to save identity to storage: {0}")]
    SaveFailed(String),

    #[error("Identity store is present but unreadable: {0}")]
    Corrupted(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

/// Trust management errors
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Peer is revoked: {0}")]
    Revoked(String),

    #[error("Peer is not trusted: {0}")]
    NotTrusted(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Trust store error: {0}")]
    StoreError(String),
}

/// Signature verification errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature does not verify")]
    Invalid,

    #[error("Signed data expired")]
    Expired,

    #[error("Fingerprint does not match embedded public key")]
    FingerprintMismatch,

    #[error("Malformed signed data: {0}")]
    Malformed(String),

    #[error("Message is not signed")]
    Missing,
}

/// Security policy validation failure with every violation found
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid security policy: {}", violations.join("; "))]
pub struct PolicyValidationError {
    pub violations: Vec<String>,
}

/// Certificate material errors
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Certificate material missing for host {0}")]
    Missing(String),

    #[error("Certificate material unreadable: {0}")]
    Unreadable(String),

    #[error("Invalid host id: {0}")]
    InvalidHostId(String),

    #[error("TLS configuration failed: {0}")]
    TlsConfig(String),
}

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthenticationError {
    #[error("No pending challenge for {0}")]
    NoChallenge(String),

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Too many outstanding challenges for {0}")]
    TooManyChallenges(String),

    #[error("Challenge response does not match the issued nonce")]
    NonceMismatch,

    #[error("Signer {signer} does not match claimed fingerprint {claimed}")]
    SignerMismatch { signer: String, claimed: String },

    #[error("Public key differs from the one pinned for {0}")]
    KeyMismatch(String),

    #[error("Unknown token")]
    UnknownToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Authentication required")]
    Required,
}

impl From<std::io::Error> for SecurityError {
    fn from(err: std::io::Error) -> Self {
        SecurityError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        SecurityError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SecurityError {
    fn from(err: toml::de::Error) -> Self {
        SecurityError::Config(err.to_string())
    }
}
