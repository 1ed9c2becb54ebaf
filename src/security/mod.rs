pub mod api;
pub mod auth;
pub mod constant_time;
pub mod discovery;
pub mod encryption;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod policy;
pub mod secure_memory;
pub mod storage;
pub mod tls;
pub mod transport;
pub mod trust;

pub use error::{SecurityError, SecurityResult};
pub use api::{SecuritySystem, SecuritySystemBuilder};
pub use auth::{AuthConfig, AuthManager, AuthToken, Challenge};
pub use discovery::{DiscoveryDecision, DiscoveryGuard, DiscoveryMessage, SignedDiscoveryMessage};
pub use encryption::{EncryptedFile, EncryptedTransportMessage, MessageEncryption};
pub use identity::{PeerIdentity, SignatureService, SignedData};
pub use keystore::{KeystoreConfig, SecureKeystore};
pub use policy::{
    SecurityAuditor, SecurityConfig, SecurityEvent, SecurityEventType, SecurityPolicy, SecurityPreset,
};
pub use secure_memory::Passphrase;
pub use tls::{CertificateInfo, TlsContext, TlsManager};
pub use transport::{TransportFrame, TransportGuard};
pub use trust::{PendingPeer, TrustedPeer};

use async_trait::async_trait;
use serde_json::Value;

/// Core security trait for the layers built on top of the mesh
#[async_trait]
pub trait Security: Send + Sync {
    /// Fingerprint of the local identity
    fn fingerprint(&self) -> &str;

    /// Hex public key of the local identity
    fn public_key_hex(&self) -> String;

    /// Sign a JSON payload with the local identity
    fn sign_value(&self, payload: Value) -> SecurityResult<SignedData<Value>>;

    /// Check if a peer is trusted, by keystore or by configuration
    async fn is_trusted(&self, fingerprint: &str) -> bool;

    async fn is_revoked(&self, fingerprint: &str) -> bool;

    /// Add a trusted peer
    async fn trust_peer(&self, fingerprint: &str, public_key: &str, name: Option<String>) -> SecurityResult<()>;

    /// Revoke a peer; revocation overrides trust
    async fn revoke_peer(&self, fingerprint: &str) -> SecurityResult<()>;
}
