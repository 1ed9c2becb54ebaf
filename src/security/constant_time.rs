//! Constant-time comparisons for nonces, tokens and fingerprints.

/// Constant-time helpers
pub struct ConstantTime;

impl ConstantTime {
    /// Compare two byte slices without an early exit on the first difference.
    ///
    /// A length mismatch still walks a fixed-size dummy comparison so the
    /// expected length is not leaked through timing.
    ///
    /// ```
    /// use skillkit_mesh::security::constant_time::ConstantTime;
    ///
    /// assert!(ConstantTime::compare(b"nonce", b"nonce"));
    /// assert!(!ConstantTime::compare(b"nonce", b"nonse"));
    /// ```
    pub fn compare(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            let _ = Self::accumulate(&[0u8; 32], &[1u8; 32]);
            return false;
        }

        Self::accumulate(a, b) == 0
    }

    /// Compare two strings in constant time
    pub fn compare_str(a: &str, b: &str) -> bool {
        Self::compare(a.as_bytes(), b.as_bytes())
    }

    /// Compare two hex fingerprints, ignoring case and `:` separators
    pub fn compare_fingerprint(a: &str, b: &str) -> bool {
        let a = normalize_fingerprint(a);
        let b = normalize_fingerprint(b);
        Self::compare(a.as_bytes(), b.as_bytes())
    }

    fn accumulate(a: &[u8], b: &[u8]) -> u8 {
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        // keep the accumulator from being optimized into an early return
        std::hint::black_box(diff)
    }
}

/// Lowercase a fingerprint and strip `:` separators
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
