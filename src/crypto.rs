//! Field-level encryption for PHI columns.
//!
//! Every value is sealed with AES-256-GCM under a key derived from the master
//! key with PBKDF2-HMAC-SHA256. The derivation input mixes in a purpose string,
//! so a profile ciphertext can never be opened as a health record and vice
//! versa. The 16-byte GCM tag is carried at the end of the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

// AES key size for AES256-GCM
const AES_KEY_SIZE: usize = 32; // 256 bits
const NONCE_SIZE: usize = 12; // 96 bits for GCM
const SALT_SIZE: usize = 16;
const ENVELOPE_VERSION: &str = "v1";

pub const ALGORITHM: &str = "AES-256-GCM";
pub const KDF: &str = "PBKDF2-HMAC-SHA256";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid AES key size: {0} bytes")]
    InvalidKeySize(usize),

    #[error("invalid nonce size: {0} bytes")]
    InvalidNonceSize(usize),

    #[error("invalid salt size: {0} bytes")]
    InvalidSaltSize(usize),

    #[error("failed to encrypt data")]
    Encrypt,

    #[error("failed to decrypt data")]
    Decrypt,

    #[error("failed to decode base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("malformed encrypted envelope")]
    MalformedEnvelope,

    #[error("decrypted data is not valid UTF-8")]
    Utf8,

    #[error("data was sealed with a retired encryption key")]
    RetiredKey,

    #[error("master key error: {0}")]
    MasterKey(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// What a derived key is used for. Mixed into the KDF input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    UserProfile,
    HealthRecord,
    HealthSummary,
    Document,
    FhirResource,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::UserProfile => "user_profile",
            KeyPurpose::HealthRecord => "health_record",
            KeyPurpose::HealthSummary => "health_summary",
            KeyPurpose::Document => "document",
            KeyPurpose::FhirResource => "fhir_resource",
        }
    }
}

/// Ciphertext plus everything needed to open it again (except the master key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub salt: Vec<u8>,
}

impl EncryptedPayload {
    /// Rebuild a payload from the column triple stored in the database.
    pub fn from_parts(ciphertext: Vec<u8>, iv_b64: &str, salt_b64: &str) -> Result<Self> {
        let iv = decode_base64(iv_b64)?;
        if iv.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceSize(iv.len()));
        }
        let salt = decode_base64(salt_b64)?;
        if salt.len() != SALT_SIZE {
            return Err(CryptoError::InvalidSaltSize(salt.len()));
        }
        Ok(Self {
            ciphertext,
            iv,
            salt,
        })
    }

    pub fn iv_b64(&self) -> String {
        encode_base64(&self.iv)
    }

    pub fn salt_b64(&self) -> String {
        encode_base64(&self.salt)
    }

    /// Single-string form used for small text columns: `v1:<salt>:<iv>:<ciphertext>`.
    pub fn to_envelope(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            ENVELOPE_VERSION,
            encode_base64(&self.salt),
            encode_base64(&self.iv),
            encode_base64(&self.ciphertext)
        )
    }

    pub fn from_envelope(envelope: &str) -> Result<Self> {
        let mut parts = envelope.split(':');
        let (Some(version), Some(salt), Some(iv), Some(ciphertext), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(CryptoError::MalformedEnvelope);
        };
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::MalformedEnvelope);
        }
        Self::from_parts(decode_base64(ciphertext)?, iv, salt)
    }
}

pub struct EncryptionService {
    master_key: [u8; AES_KEY_SIZE],
    iterations: u32,
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService")
            .field("master_key", &"<redacted>")
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl EncryptionService {
    /// Load the master key from `path`, generating a fresh one when the file
    /// is missing or holds a key of the wrong size.
    pub fn load_or_create(path: &Path, iterations: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            let key = fs::read(path)?;
            if key.len() == AES_KEY_SIZE {
                tracing::info!(path = %path.display(), "Loaded existing master key");
                return Self::from_key(&key, iterations);
            }
            tracing::warn!(
                path = %path.display(),
                size = key.len(),
                "Invalid master key size, generating new one"
            );
            fs::remove_file(path)?;
        }

        let key = generate_aes_key();
        fs::write(path, &key)?;
        restrict_permissions(path)?;
        tracing::info!(path = %path.display(), "Generated new master key");
        Self::from_key(&key, iterations)
    }

    pub fn from_key(key: &[u8], iterations: u32) -> Result<Self> {
        let master_key: [u8; AES_KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeySize(key.len()))?;
        Ok(Self {
            master_key,
            iterations: iterations.max(1),
        })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// SHA-256 of the master key, hex encoded. Identifies the key without revealing it.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.master_key))
    }

    /// Derive a purpose-specific key. A new random salt is drawn when none is given.
    pub fn derive_key(
        &self,
        purpose: KeyPurpose,
        salt: Option<&[u8]>,
    ) -> ([u8; AES_KEY_SIZE], Vec<u8>) {
        let salt = match salt {
            Some(salt) => salt.to_vec(),
            None => random_bytes(SALT_SIZE),
        };

        let mut input = Vec::with_capacity(AES_KEY_SIZE + purpose.as_str().len());
        input.extend_from_slice(&self.master_key);
        input.extend_from_slice(purpose.as_str().as_bytes());

        let mut key = [0u8; AES_KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(&input, &salt, self.iterations, &mut key);
        (key, salt)
    }

    pub fn encrypt(&self, plaintext: &str, purpose: KeyPurpose) -> Result<EncryptedPayload> {
        self.encrypt_bytes(plaintext.as_bytes(), purpose)
    }

    pub fn decrypt(&self, payload: &EncryptedPayload, purpose: KeyPurpose) -> Result<String> {
        let bytes = self.decrypt_bytes(payload, purpose)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Utf8)
    }

    pub fn encrypt_bytes(&self, data: &[u8], purpose: KeyPurpose) -> Result<EncryptedPayload> {
        let (key, salt) = self.derive_key(purpose, None);
        let (ciphertext, iv) = encrypt_data(data, &key)?;
        Ok(EncryptedPayload {
            ciphertext,
            iv,
            salt,
        })
    }

    pub fn decrypt_bytes(&self, payload: &EncryptedPayload, purpose: KeyPurpose) -> Result<Vec<u8>> {
        if payload.salt.len() != SALT_SIZE {
            return Err(CryptoError::InvalidSaltSize(payload.salt.len()));
        }
        let (key, _) = self.derive_key(purpose, Some(&payload.salt));
        decrypt_data(&payload.ciphertext, &key, &payload.iv)
    }

    /// Encrypt a short text value into its envelope string.
    pub fn encrypt_field(&self, plaintext: &str, purpose: KeyPurpose) -> Result<String> {
        Ok(self.encrypt(plaintext, purpose)?.to_envelope())
    }

    pub fn decrypt_field(&self, envelope: &str, purpose: KeyPurpose) -> Result<String> {
        self.decrypt(&EncryptedPayload::from_envelope(envelope)?, purpose)
    }
}

// Generates a new AES key
pub fn generate_aes_key() -> Vec<u8> {
    random_bytes(AES_KEY_SIZE)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// Encrypts data using AES-GCM, returns (ciphertext || tag, nonce)
fn encrypt_data(data: &[u8], key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize(key.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize(key.len()))?;

    let nonce_bytes = random_bytes(NONCE_SIZE);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, data).map_err(|_| CryptoError::Encrypt)?;

    Ok((ciphertext, nonce_bytes))
}

// Decrypts data using AES-GCM
fn decrypt_data(ciphertext: &[u8], key: &[u8], nonce_bytes: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize(key.len()));
    }
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceSize(nonce_bytes.len()));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize(key.len()))?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::Decrypt)
}

// Encode bytes to base64
pub fn encode_base64(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

// Decode base64 to bytes
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(data)?)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::from_key(&[7u8; 32], 1_000).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_text() {
        let crypto = service();
        let plaintext = "This is sensitive medical data";
        let payload = crypto.encrypt(plaintext, KeyPurpose::HealthRecord).unwrap();

        assert_ne!(payload.ciphertext, plaintext.as_bytes());
        assert_eq!(payload.iv.len(), NONCE_SIZE);
        assert_eq!(payload.salt.len(), SALT_SIZE);
        // GCM tag travels with the ciphertext
        assert_eq!(payload.ciphertext.len(), plaintext.len() + 16);

        let decrypted = crypto.decrypt(&payload, KeyPurpose::HealthRecord).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn binary_payloads_roundtrip() {
        let crypto = service();
        let data = b"%PDF-1.7 binary medical data \x00\x01\x02";
        let payload = crypto.encrypt_bytes(data, KeyPurpose::Document).unwrap();
        assert_eq!(crypto.decrypt_bytes(&payload, KeyPurpose::Document).unwrap(), data);
    }

    #[test]
    fn fresh_iv_and_salt_per_encryption() {
        let crypto = service();
        let a = crypto.encrypt("same", KeyPurpose::UserProfile).unwrap();
        let b = crypto.encrypt("same", KeyPurpose::UserProfile).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_purpose_fails_authentication() {
        let crypto = service();
        let payload = crypto.encrypt("Jane", KeyPurpose::UserProfile).unwrap();
        let err = crypto.decrypt(&payload, KeyPurpose::HealthSummary).unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt));
    }

    #[test]
    fn wrong_master_key_fails_authentication() {
        let payload = service().encrypt("Jane", KeyPurpose::UserProfile).unwrap();
        let other = EncryptionService::from_key(&[9u8; 32], 1_000).unwrap();
        assert!(other.decrypt(&payload, KeyPurpose::UserProfile).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let crypto = service();
        let mut payload = crypto.encrypt("allergy: penicillin", KeyPurpose::HealthRecord).unwrap();
        payload.ciphertext[0] ^= 0x01;
        assert!(matches!(
            crypto.decrypt(&payload, KeyPurpose::HealthRecord),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn derive_key_is_deterministic_for_same_salt() {
        let crypto = service();
        let (key, salt) = crypto.derive_key(KeyPurpose::Document, None);
        let (again, same_salt) = crypto.derive_key(KeyPurpose::Document, Some(&salt));
        assert_eq!(key, again);
        assert_eq!(salt, same_salt);

        let (other_purpose, _) = crypto.derive_key(KeyPurpose::FhirResource, Some(&salt));
        assert_ne!(key, other_purpose);
    }

    #[test]
    fn envelope_roundtrip_and_rejections() {
        let crypto = service();
        let envelope = crypto.encrypt_field("1990-01-01", KeyPurpose::UserProfile).unwrap();
        assert!(envelope.starts_with("v1:"));
        assert_eq!(envelope.split(':').count(), 4);
        assert_eq!(
            crypto.decrypt_field(&envelope, KeyPurpose::UserProfile).unwrap(),
            "1990-01-01"
        );

        assert!(matches!(
            EncryptedPayload::from_envelope("v2:a:b:c"),
            Err(CryptoError::MalformedEnvelope)
        ));
        assert!(matches!(
            EncryptedPayload::from_envelope("v1:only:three"),
            Err(CryptoError::MalformedEnvelope)
        ));
    }

    #[test]
    fn from_parts_checks_iv_length() {
        let bad_iv = encode_base64(&[0u8; 8]);
        let salt = encode_base64(&[0u8; SALT_SIZE]);
        assert!(matches!(
            EncryptedPayload::from_parts(vec![1, 2, 3], &bad_iv, &salt),
            Err(CryptoError::InvalidNonceSize(8))
        ));
    }

    #[test]
    fn rejects_short_master_key() {
        assert!(matches!(
            EncryptionService::from_key(&[1u8; 16], 10),
            Err(CryptoError::InvalidKeySize(16))
        ));
    }

    #[test]
    fn master_key_file_is_created_then_reused() {
        let dir = std::env::temp_dir().join(format!("medivault-key-{}", uuid::Uuid::new_v4()));
        let path = dir.join("master.key");

        let first = EncryptionService::load_or_create(&path, 1_000).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), AES_KEY_SIZE);

        let second = EncryptionService::load_or_create(&path, 1_000).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());

        let payload = first.encrypt("persisted", KeyPurpose::HealthRecord).unwrap();
        assert_eq!(second.decrypt(&payload, KeyPurpose::HealthRecord).unwrap(), "persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o400);
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn debug_output_redacts_master_key() {
        let rendered = format!("{:?}", service());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("[7, 7"));
    }
}
