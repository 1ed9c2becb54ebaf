#[cfg(test)]
mod tests {
    use super::super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_generate_identity() {
        let identity = PeerIdentity::generate();

        assert_eq!(identity.fingerprint().len(), 64);
        assert!(identity.fingerprint().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(identity.public_key_hex().len(), 64);
    }

    #[test]
    fn test_fingerprint_is_hash_of_public_key() {
        let identity = PeerIdentity::generate();
        let expected = hex::encode(Sha256::digest(identity.keypair().public_key().as_bytes()));
        assert_eq!(identity.fingerprint(), expected);
    }

    #[test]
    fn test_distinct_identities() {
        let a = PeerIdentity::generate();
        let b = PeerIdentity::generate();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_serialized_roundtrip() {
        let identity = PeerIdentity::generate();
        let serialized = identity.to_serialized();

        let json = serde_json::to_string(&serialized).unwrap();
        assert!(json.contains("publicKeyHex"));
        assert!(json.contains("privateKeyHex"));

        let parsed: SerializedIdentity = serde_json::from_str(&json).unwrap();
        let restored = PeerIdentity::from_serialized(&parsed).unwrap();
        assert_eq!(restored.fingerprint(), identity.fingerprint());
        assert_eq!(restored.public_key_hex(), identity.public_key_hex());
    }

    #[test]
    fn test_from_serialized_rejects_inconsistent_fields() {
        let identity = PeerIdentity::generate();
        let other = PeerIdentity::generate();

        let mut bad_fp = identity.to_serialized();
        bad_fp.fingerprint = other.fingerprint().to_string();
        assert!(matches!(
            PeerIdentity::from_serialized(&bad_fp),
            Err(IdentityError::Corrupted(_))
        ));

        let mut bad_pk = identity.to_serialized();
        bad_pk.public_key_hex = other.public_key_hex();
        assert!(matches!(
            PeerIdentity::from_serialized(&bad_pk),
            Err(IdentityError::Corrupted(_))
        ));

        let mut bad_sk = identity.to_serialized();
        bad_sk.private_key_hex = "abcd".to_string();
        assert!(matches!(
            PeerIdentity::from_serialized(&bad_sk),
            Err(IdentityError::Corrupted(_))
        ));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let identity = PeerIdentity::generate();
        let serialized = identity.to_serialized();
        let debug = format!("{:?} {:?} {:?}", identity, identity.keypair(), serialized);
        assert!(!debug.contains(&serialized.private_key_hex));
    }

    #[test]
    fn test_short_fingerprint() {
        let identity = PeerIdentity::generate();
        assert_eq!(identity.short_fingerprint().len(), 16);
        assert!(identity.fingerprint().starts_with(identity.short_fingerprint()));
        assert_eq!(short_fingerprint("abc"), "abc");
    }

    #[test]
    fn test_parse_public_key_hex() {
        let identity = PeerIdentity::generate();
        let parsed = parse_public_key_hex(&identity.public_key_hex()).unwrap();
        assert_eq!(&parsed, identity.keypair().public_key());

        assert!(matches!(parse_public_key_hex("xyz"), Err(IdentityError::InvalidKey(_))));
        assert!(matches!(parse_public_key_hex("abcd"), Err(IdentityError::InvalidKey(_))));
    }

    #[test]
    fn test_public_identity() {
        let identity = PeerIdentity::generate();
        let public = PublicIdentity::from(&identity);
        assert_eq!(public.fingerprint, identity.fingerprint());
        assert_eq!(public.public_key, identity.public_key_hex());
    }
}
