//! Self-contained signed payloads.
//!
//! A [`SignedData`] embeds the signer's public key and fingerprint so any
//! receiver can check authenticity without a prior key exchange. Whether the
//! signer is *trusted* is a separate decision made against the keystore.

use std::sync::Arc;
use std::time::Duration;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::security::constant_time::ConstantTime;
use crate::security::error::{SecurityResult, SignatureError};
use super::{compute_fingerprint, parse_public_key_hex, PeerIdentity};

/// Payload plus detached signature and signer identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedData<T> {
    pub payload: T,
    /// Hex Ed25519 signature
    pub signature: String,
    /// Hex Ed25519 public key of the signer
    pub public_key: String,
    /// Claimed signer fingerprint; must equal hash(public_key)
    pub fingerprint: String,
    /// Unix milliseconds
    pub signed_at: i64,
    /// Unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

/// Deterministic JSON: object keys sorted, no insignificant whitespace
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Digest that is actually signed: payload bound together with its timestamps
fn signing_digest<T: Serialize>(
    payload: &T,
    signed_at: i64,
    expires_at: Option<i64>,
) -> Result<[u8; 32], SignatureError> {
    let payload = serde_json::to_value(payload)
        .map_err(|e| SignatureError::Malformed(format!("Payload not serializable: {}", e)))?;
    let document = serde_json::json!({
        "payload": payload,
        "signedAt": signed_at,
        "expiresAt": expires_at,
    });
    Ok(Sha256::digest(canonical_json(&document).as_bytes()).into())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// True once the current time is past `expires_at`
pub fn is_signed_data_expired<T>(signed: &SignedData<T>) -> bool {
    match signed.expires_at {
        Some(expires_at) => now_millis() > expires_at,
        None => false,
    }
}

/// Claimed signer fingerprint, without verifying anything
pub fn extract_signer_fingerprint<T>(signed: &SignedData<T>) -> &str {
    &signed.fingerprint
}

/// Claimed signer fingerprint from raw JSON, for cheap pre-filtering
pub fn extract_signer_fingerprint_value(value: &Value) -> Option<&str> {
    value.get("fingerprint").and_then(Value::as_str)
}

/// Signs payloads with the local identity and verifies signed payloads
#[derive(Clone)]
pub struct SignatureService {
    identity: Arc<PeerIdentity>,
}

impl SignatureService {
    pub fn new(identity: Arc<PeerIdentity>) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &Arc<PeerIdentity> {
        &self.identity
    }

    pub fn fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    /// Sign a payload with no expiry
    pub fn sign<T: Serialize>(&self, payload: T) -> SecurityResult<SignedData<T>> {
        self.sign_inner(payload, None)
    }

    /// Sign a payload that expires `ttl` from now
    pub fn sign_with_ttl<T: Serialize>(&self, payload: T, ttl: Duration) -> SecurityResult<SignedData<T>> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_millis().saturating_add(ttl_ms);
        self.sign_inner(payload, Some(expires_at))
    }

    /// Sign a payload with an explicit expiry (Unix milliseconds)
    pub fn sign_until<T: Serialize>(&self, payload: T, expires_at: i64) -> SecurityResult<SignedData<T>> {
        self.sign_inner(payload, Some(expires_at))
    }

    fn sign_inner<T: Serialize>(&self, payload: T, expires_at: Option<i64>) -> SecurityResult<SignedData<T>> {
        let signed_at = now_millis();
        let digest = signing_digest(&payload, signed_at, expires_at)?;
        let signature = self.identity.sign_bytes(&digest);

        Ok(SignedData {
            payload,
            signature: hex::encode(signature.to_bytes()),
            public_key: self.identity.public_key_hex(),
            fingerprint: self.identity.fingerprint().to_string(),
            signed_at,
            expires_at,
        })
    }

    /// Full verification of signed data from any source.
    ///
    /// Checks that the fingerprint matches the embedded key, that the
    /// signature covers the payload and timestamps, and that the data has not
    /// expired. Malformed input yields an error, never a panic.
    pub fn verify_signed_data<T: Serialize>(signed: &SignedData<T>) -> Result<(), SignatureError> {
        let public_key = parse_public_key_hex(&signed.public_key)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;

        let derived = compute_fingerprint(public_key.as_bytes());
        if !ConstantTime::compare_str(&derived, &signed.fingerprint) {
            return Err(SignatureError::FingerprintMismatch);
        }

        let signature_bytes: [u8; 64] = hex::decode(&signed.signature)
            .map_err(|e| SignatureError::Malformed(format!("Invalid signature hex: {}", e)))?
            .try_into()
            .map_err(|_| SignatureError::Malformed("Invalid signature length".to_string()))?;
        let signature = Signature::from_bytes(&signature_bytes);

        let digest = signing_digest(&signed.payload, signed.signed_at, signed.expires_at)?;
        public_key
            .verify_strict(&digest, &signature)
            .map_err(|_| SignatureError::Invalid)?;

        if is_signed_data_expired(signed) {
            return Err(SignatureError::Expired);
        }

        Ok(())
    }

    /// Boolean form of [`verify_signed_data`](Self::verify_signed_data)
    pub fn is_valid<T: Serialize>(signed: &SignedData<T>) -> bool {
        Self::verify_signed_data(signed).is_ok()
    }
}
