//! Challenge/response authentication and short-lived bearer tokens.
//!
//! A peer proves possession of the private key behind its fingerprint by
//! signing a fresh nonce. Tokens minted on success are re-checked against the
//! keystore's revocation list on every use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::security::constant_time::{normalize_fingerprint, ConstantTime};
use crate::security::error::{AuthenticationError, SecurityResult, TrustError};
use crate::security::identity::{short_fingerprint, SignatureService, SignedData};
use crate::security::keystore::SecureKeystore;

pub const NONCE_BYTES: usize = 32;
pub const TOKEN_BYTES: usize = 32;
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
/// Live challenges one fingerprint may hold at once
pub const MAX_CHALLENGES_PER_PEER: usize = 4;
/// Live challenges across all fingerprints
pub const MAX_PENDING_CHALLENGES: usize = 1024;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Challenge and token lifetimes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "challenge_ttl_secs", with = "duration_secs")]
    pub challenge_ttl: Duration,
    #[serde(rename = "token_ttl_secs", with = "duration_secs")]
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Nonce issued to a peer claiming `fingerprint`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Hex random nonce
    pub nonce: String,
    pub fingerprint: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl Challenge {
    pub fn is_expired(&self) -> bool {
        now_millis() > self.expires_at
    }

    /// Client side: sign the nonce with our identity. The signature expires
    /// with the challenge.
    pub fn respond(&self, signer: &SignatureService) -> SecurityResult<SignedData<String>> {
        signer.sign_until(self.nonce.clone(), self.expires_at)
    }
}

/// Bearer token scoped to one fingerprint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub token: String,
    pub fingerprint: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl AuthToken {
    pub fn is_expired(&self) -> bool {
        now_millis() > self.expires_at
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("fingerprint", &self.fingerprint)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Issues challenges and tokens for one host
pub struct AuthManager {
    keystore: Arc<SecureKeystore>,
    config: AuthConfig,
    /// Outstanding challenges keyed by nonce
    challenges: Mutex<HashMap<String, Challenge>>,
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl AuthManager {
    pub fn new(keystore: Arc<SecureKeystore>, config: AuthConfig) -> Self {
        Self {
            keystore,
            config,
            challenges: Mutex::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Issue a nonce for a peer claiming `fingerprint`.
    ///
    /// Earlier challenges stay valid until they expire or are answered, so a
    /// second request for the same fingerprint cannot cancel the first.
    pub async fn issue_challenge(&self, fingerprint: &str) -> SecurityResult<Challenge> {
        let fingerprint = normalize_fingerprint(fingerprint);
        if self.keystore.is_revoked(&fingerprint).await {
            log::warn!("Refused challenge for revoked peer {}", short_fingerprint(&fingerprint));
            return Err(TrustError::Revoked(fingerprint).into());
        }

        let mut challenges = self.challenges.lock().await;
        challenges.retain(|_, c| !c.is_expired());

        let outstanding = challenges.values().filter(|c| c.fingerprint == fingerprint).count();
        if outstanding >= MAX_CHALLENGES_PER_PEER || challenges.len() >= MAX_PENDING_CHALLENGES {
            log::warn!(
                "Refused challenge for {}: {} outstanding for peer, {} in total",
                short_fingerprint(&fingerprint),
                outstanding,
                challenges.len()
            );
            return Err(AuthenticationError::TooManyChallenges(fingerprint).into());
        }

        let issued_at = now_millis();
        let challenge = Challenge {
            nonce: random_hex::<NONCE_BYTES>(),
            fingerprint: fingerprint.clone(),
            issued_at,
            expires_at: issued_at.saturating_add(ttl_millis(self.config.challenge_ttl)),
        };

        challenges.insert(challenge.nonce.clone(), challenge.clone());
        Ok(challenge)
    }

    /// Verify a signed nonce and mint a token.
    ///
    /// The challenge the nonce names is consumed whether or not verification
    /// succeeds. A nonce issued to another fingerprint is left untouched.
    pub async fn complete_challenge(
        &self,
        fingerprint: &str,
        signed_nonce: &SignedData<String>,
    ) -> SecurityResult<AuthToken> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let challenge = {
            let mut challenges = self.challenges.lock().await;
            let issued_to_claimant = challenges
                .get(&signed_nonce.payload)
                .is_some_and(|c| ConstantTime::compare_str(&c.fingerprint, &fingerprint));
            if !issued_to_claimant {
                return Err(if challenges.values().any(|c| c.fingerprint == fingerprint) {
                    AuthenticationError::NonceMismatch
                } else {
                    AuthenticationError::NoChallenge(fingerprint)
                }
                .into());
            }
            challenges
                .remove(&signed_nonce.payload)
                .ok_or_else(|| AuthenticationError::NoChallenge(fingerprint.clone()))?
        };

        if challenge.is_expired() {
            return Err(AuthenticationError::ChallengeExpired.into());
        }

        SignatureService::verify_signed_data(signed_nonce)?;

        if !ConstantTime::compare_fingerprint(&signed_nonce.fingerprint, &fingerprint) {
            return Err(AuthenticationError::SignerMismatch {
                signer: signed_nonce.fingerprint.clone(),
                claimed: fingerprint,
            }
            .into());
        }

        if self.keystore.is_revoked(&fingerprint).await {
            return Err(TrustError::Revoked(fingerprint).into());
        }

        if let Some(peer) = self.keystore.get_trusted_peer(&fingerprint).await {
            let pinned = peer.public_key.to_ascii_lowercase();
            let presented = signed_nonce.public_key.to_ascii_lowercase();
            if !ConstantTime::compare_str(&pinned, &presented) {
                return Err(AuthenticationError::KeyMismatch(fingerprint).into());
            }
        }

        let issued_at = now_millis();
        let token = AuthToken {
            token: random_hex::<TOKEN_BYTES>(),
            fingerprint: fingerprint.clone(),
            issued_at,
            expires_at: issued_at.saturating_add(ttl_millis(self.config.token_ttl)),
        };
        self.tokens.write().await.insert(token.token.clone(), token.clone());

        log::info!("Authenticated peer {}", short_fingerprint(&fingerprint));
        Ok(token)
    }

    /// Check a bearer token. Expired tokens and tokens of peers revoked since
    /// issue are rejected and forgotten.
    pub async fn verify_token(&self, token: &str) -> SecurityResult<AuthToken> {
        let entry = self
            .tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(AuthenticationError::UnknownToken)?;

        if entry.is_expired() {
            self.tokens.write().await.remove(token);
            return Err(AuthenticationError::TokenExpired.into());
        }

        if self.keystore.is_revoked(&entry.fingerprint).await {
            self.tokens.write().await.remove(token);
            log::warn!(
                "Rejected token of revoked peer {}",
                short_fingerprint(&entry.fingerprint)
            );
            return Err(TrustError::Revoked(entry.fingerprint).into());
        }

        Ok(entry)
    }

    /// Drop every token issued to `fingerprint`
    pub async fn revoke_tokens_for(&self, fingerprint: &str) -> usize {
        let fingerprint = normalize_fingerprint(fingerprint);
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.fingerprint != fingerprint);
        before - tokens.len()
    }

    /// Drop expired challenges and tokens. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        {
            let mut challenges = self.challenges.lock().await;
            let before = challenges.len();
            challenges.retain(|_, c| !c.is_expired());
            removed += before - challenges.len();
        }
        {
            let mut tokens = self.tokens.write().await;
            let before = tokens.len();
            tokens.retain(|_, t| !t.is_expired());
            removed += before - tokens.len();
        }
        if removed > 0 {
            log::debug!("Removed {} expired challenge(s)/token(s)", removed);
        }
        removed
    }
}
