//! Credential vault
//!
//! Seals database connection parameters with AES-256-GCM. Ciphertexts
//! are self-describing: a version/algorithm tag followed by the nonce
//! and the sealed payload, so a future re-encryption job can recognize
//! and migrate old material.
//!
//! The key is read once at construction from configuration. Outside
//! development mode a missing key is a startup failure.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use shared::config::{EnvMode, GatewayConfig};
use shared::{GatewayError, Result};

/// Ciphertext format tag: version 1, AES-256-GCM
const FORMAT_TAG: &str = "qg1.gcm256";

/// Nonce length for AES-GCM
const NONCE_LEN: usize = 12;

/// Symmetric vault for connection credentials
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish()
    }
}

impl CredentialVault {
    /// Build the vault from gateway configuration
    ///
    /// The key must be 32 bytes, base64-encoded. In development mode a
    /// fixed throwaway key is derived so local runs need no setup.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        match &config.encryption_key {
            Some(key) => Self::from_key(key),
            None if config.env_mode == EnvMode::Development => {
                tracing::warn!(
                    "No encryption key configured; using development key. \
                     DO NOT use in production!"
                );
                Ok(Self::from_raw_key(&[0x51; 32]))
            }
            None => Err(GatewayError::config(
                "encryption key is required outside development mode",
            )),
        }
    }

    /// Build the vault from a base64-encoded 256-bit key
    pub fn from_key(key: &SecretString) -> Result<Self> {
        let raw = BASE64
            .decode(key.expose_secret())
            .map_err(|_| GatewayError::config("encryption key is not valid base64"))?;
        if raw.len() != 32 {
            return Err(GatewayError::config(format!(
                "encryption key must be 32 bytes, got {}",
                raw.len()
            )));
        }
        Ok(Self::from_raw_key(&raw))
    }

    fn from_raw_key(raw: &[u8]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(raw).expect("key length checked above");
        Self { cipher }
    }

    /// Seal plaintext into a self-describing ciphertext string
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| GatewayError::internal("credential encryption failed"))?;

        Ok(format!(
            "{}.{}.{}",
            FORMAT_TAG,
            BASE64.encode(nonce),
            BASE64.encode(sealed)
        ))
    }

    /// Open a ciphertext produced by [`encrypt`](Self::encrypt)
    ///
    /// The plaintext comes back wrapped so accidental logging shows
    /// nothing.
    pub fn decrypt(&self, ciphertext: &str) -> Result<SecretString> {
        let rest = ciphertext.strip_prefix(FORMAT_TAG).ok_or_else(|| {
            GatewayError::internal("ciphertext does not carry a recognized format tag")
        })?;

        let mut parts = rest.trim_start_matches('.').splitn(2, '.');
        let nonce_b64 = parts.next().unwrap_or_default();
        let sealed_b64 = parts
            .next()
            .ok_or_else(|| GatewayError::internal("truncated ciphertext"))?;

        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|_| GatewayError::internal("corrupt ciphertext nonce"))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(GatewayError::internal("unexpected nonce length"));
        }
        let sealed = BASE64
            .decode(sealed_b64)
            .map_err(|_| GatewayError::internal("corrupt ciphertext payload"))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
            .map_err(|_| GatewayError::internal("credential decryption failed"))?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| GatewayError::internal("decrypted credential is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        let key = SecretString::from(BASE64.encode([7u8; 32]));
        CredentialVault::from_key(&key).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let vault = vault();
        let sealed = vault
            .encrypt(r#"{"host":"db.internal","password":"hunter2"}"#)
            .unwrap();
        let opened = vault.decrypt(&sealed).unwrap();
        assert_eq!(
            opened.expose_secret(),
            r#"{"host":"db.internal","password":"hunter2"}"#
        );
    }

    #[test]
    fn test_ciphertext_is_self_describing() {
        let vault = vault();
        let sealed = vault.encrypt("secret").unwrap();
        assert!(sealed.starts_with("qg1.gcm256."));
        // Three dot-separated sections after the two-part tag
        assert_eq!(sealed.split('.').count(), 4);
    }

    #[test]
    fn test_ciphertexts_differ_per_encryption() {
        let vault = vault();
        let a = vault.encrypt("same input").unwrap();
        let b = vault.encrypt("same input").unwrap();
        // Random nonce means no two ciphertexts ever match
        assert_ne!(a, b);
    }

    #[test]
    fn test_plaintext_never_in_ciphertext() {
        let vault = vault();
        let sealed = vault.encrypt("very-secret-password").unwrap();
        assert!(!sealed.contains("very-secret-password"));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let vault = vault();
        let sealed = vault.encrypt("payload").unwrap();
        let mut tampered = sealed.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(vault.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_wrong_key_cannot_decrypt() {
        let vault_a = vault();
        let other_key = SecretString::from(BASE64.encode([9u8; 32]));
        let vault_b = CredentialVault::from_key(&other_key).unwrap();

        let sealed = vault_a.encrypt("payload").unwrap();
        assert!(vault_b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_unrecognized_format_rejected() {
        let vault = vault();
        assert!(vault.decrypt("qg0.xor.AAAA.BBBB").is_err());
        assert!(vault.decrypt("not a ciphertext").is_err());
    }

    #[test]
    fn test_invalid_key_material_rejected() {
        let short = SecretString::from(BASE64.encode([1u8; 16]));
        assert!(CredentialVault::from_key(&short).is_err());

        let not_b64 = SecretString::from("!!!not-base64!!!".to_string());
        assert!(CredentialVault::from_key(&not_b64).is_err());
    }

    #[test]
    fn test_production_requires_key() {
        let mut config = GatewayConfig::for_development();
        config.env_mode = EnvMode::Production;
        config.encryption_key = None;
        let err = CredentialVault::from_config(&config).unwrap_err();
        assert_eq!(err.kind(), shared::ErrorKind::Config);
    }

    #[test]
    fn test_development_falls_back_to_dev_key() {
        let config = GatewayConfig::for_development();
        assert!(CredentialVault::from_config(&config).is_ok());
    }
}
