//! Certificate verification by fingerprint instead of chain validation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme};

use crate::security::constant_time::{normalize_fingerprint, ConstantTime};
use crate::security::identity::short_fingerprint;
use super::compute_der_fingerprint;

/// Accepts peer certificates whose SHA-256 fingerprint is pinned.
///
/// With no pins the verifier runs in trust-on-first-use mode: every
/// certificate is accepted and its fingerprint recorded in
/// [`observed`](Self::observed) so the caller can decide whether to pin it.
/// Handshake signatures are always checked against the presented certificate.
#[derive(Debug)]
pub struct FingerprintVerifier {
    pins: RwLock<HashSet<String>>,
    observed: Mutex<Vec<String>>,
    provider: Arc<CryptoProvider>,
    root_hints: Vec<DistinguishedName>,
}

impl FingerprintVerifier {
    pub fn new<S: AsRef<str>>(pins: &[S], provider: Arc<CryptoProvider>) -> Self {
        Self {
            pins: RwLock::new(pins.iter().map(|p| normalize_fingerprint(p.as_ref())).collect()),
            observed: Mutex::new(Vec::new()),
            provider,
            root_hints: Vec::new(),
        }
    }

    /// Trust-on-first-use verifier with no pins
    pub fn trust_on_first_use(provider: Arc<CryptoProvider>) -> Self {
        Self::new::<&str>(&[], provider)
    }

    pub fn add_pin(&self, fingerprint: &str) {
        self.pins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_fingerprint(fingerprint));
    }

    pub fn is_pinning(&self) -> bool {
        !self.pins.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Fingerprints of certificates accepted so far, in order
    pub fn observed(&self) -> Vec<String> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
        let fingerprint = compute_der_fingerprint(end_entity.as_ref());
        let pins = self.pins.read().unwrap_or_else(PoisonError::into_inner);

        if !pins.is_empty() {
            // scan every pin so timing does not reveal which one matched
            let matched = pins
                .iter()
                .fold(false, |found, pin| ConstantTime::compare_str(pin, &fingerprint) | found);
            if !matched {
                log::warn!("Rejected certificate {}: not pinned", short_fingerprint(&fingerprint));
                return Err(TlsError::InvalidCertificate(rustls::CertificateError::UnknownIssuer));
            }
        } else {
            log::info!("Accepting first-use certificate {}", short_fingerprint(&fingerprint));
        }

        let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        if !observed.contains(&fingerprint) {
            observed.push(fingerprint);
        }
        Ok(())
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for FingerprintVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn der(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn test_pinned_accepts_only_pins() {
        let good = der(b"certificate one");
        let bad = der(b"certificate two");
        let pin = compute_der_fingerprint(good.as_ref()).to_uppercase();

        let verifier = FingerprintVerifier::new(&[pin], provider());
        assert!(verifier.is_pinning());
        assert!(verifier.check(&good).is_ok());
        assert!(verifier.check(&bad).is_err());
        assert_eq!(verifier.observed(), vec![compute_der_fingerprint(good.as_ref())]);
    }

    #[test]
    fn test_trust_on_first_use_records() {
        let verifier = FingerprintVerifier::trust_on_first_use(provider());
        assert!(!verifier.is_pinning());

        let cert = der(b"first seen");
        assert!(verifier.check(&cert).is_ok());
        assert!(verifier.check(&cert).is_ok());
        assert_eq!(verifier.observed().len(), 1);

        verifier.add_pin(&verifier.observed()[0]);
        assert!(verifier.is_pinning());
        assert!(verifier.check(&der(b"someone else")).is_err());
    }
}
