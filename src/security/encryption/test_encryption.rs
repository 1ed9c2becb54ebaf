#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::security::error::{DecryptionError, SecurityError};
    use crate::security::secure_memory::Passphrase;
    use serde_json::json;

    fn flip_hex_byte(hex_str: &str) -> String {
        let mut bytes = hex::decode(hex_str).unwrap();
        bytes[0] ^= 0x01;
        hex::encode(bytes)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let pass = Passphrase::new("correct horse");
        let envelope = encrypt_data(b"identity secrets", &pass).unwrap();

        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert!(envelope.encrypted);
        assert_eq!(envelope.algorithm, "aes-256-gcm");
        assert_eq!(envelope.kdf, "scrypt");
        assert_eq!(hex::decode(&envelope.salt).unwrap().len(), 32);
        assert_eq!(hex::decode(&envelope.iv).unwrap().len(), 12);
        assert_eq!(hex::decode(&envelope.auth_tag).unwrap().len(), 16);

        let decrypted = decrypt_data(&envelope, &pass).unwrap();
        assert_eq!(decrypted.as_slice(), b"identity secrets");
    }

    #[test]
    fn test_wrong_passphrase_fails_closed() {
        let envelope = encrypt_data(b"secret", &Passphrase::new("pw1")).unwrap();
        let result = decrypt_data(&envelope, &Passphrase::new("pw2"));
        assert_eq!(result.unwrap_err(), DecryptionError);
    }

    #[test]
    fn test_tampering_is_detected() {
        let pass = Passphrase::new("pw");
        let envelope = encrypt_data(b"some longer secret payload", &pass).unwrap();

        let mut bad_tag = envelope.clone();
        bad_tag.auth_tag = flip_hex_byte(&envelope.auth_tag);
        assert!(decrypt_data(&bad_tag, &pass).is_err());

        let mut bad_ct = envelope.clone();
        bad_ct.ciphertext = flip_hex_byte(&envelope.ciphertext);
        assert!(decrypt_data(&bad_ct, &pass).is_err());

        let mut bad_iv = envelope.clone();
        bad_iv.iv = flip_hex_byte(&envelope.iv);
        assert!(decrypt_data(&bad_iv, &pass).is_err());

        let mut bad_hex = envelope.clone();
        bad_hex.ciphertext = "zz".to_string();
        assert!(decrypt_data(&bad_hex, &pass).is_err());

        let mut short_tag = envelope.clone();
        short_tag.auth_tag = "00".to_string();
        assert!(decrypt_data(&short_tag, &pass).is_err());

        let mut wrong_alg = envelope;
        wrong_alg.algorithm = "aes-128-cbc".to_string();
        assert!(decrypt_data(&wrong_alg, &pass).is_err());
    }

    #[test]
    fn test_fresh_salt_and_iv_per_call() {
        let pass = Passphrase::new("pw");
        let a = encrypt_data(b"same", &pass).unwrap();
        let b = encrypt_data(b"same", &pass).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_object_roundtrip() {
        let pass = Passphrase::new("pw");
        let value = json!({"a": 1, "nested": {"list": [1, 2, 3]}});
        let envelope = encrypt_object(&value, &pass).unwrap();
        let restored: serde_json::Value = decrypt_object(&envelope, &pass).unwrap();
        assert_eq!(restored, value);

        let wrong: Result<serde_json::Value, _> = decrypt_object(&envelope, &Passphrase::new("no"));
        assert!(matches!(wrong, Err(SecurityError::Decryption(_))));
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = encrypt_data(b"x", &Passphrase::new("pw")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        for field in ["version", "encrypted", "algorithm", "kdf", "salt", "iv", "ciphertext", "authTag"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.enc");
        let pass = Passphrase::new("file-pass");
        let options = KdfOptions::default();

        encrypt_file(&path, &json!({"k": "v"}), &pass, &options).await.unwrap();
        let restored: serde_json::Value = decrypt_file(&path, &pass, &options).await.unwrap();
        assert_eq!(restored, json!({"k": "v"}));

        let wrong: SecurityResult<serde_json::Value> =
            decrypt_file(&path, &Passphrase::new("other"), &options).await;
        assert!(matches!(wrong, Err(SecurityError::Decryption(_))));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[tokio::test]
    async fn test_garbage_file_is_decryption_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.enc");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let result: SecurityResult<serde_json::Value> =
            decrypt_file(&path, &Passphrase::new("pw"), &KdfOptions::default()).await;
        assert!(matches!(result, Err(SecurityError::Decryption(_))));
    }
}
