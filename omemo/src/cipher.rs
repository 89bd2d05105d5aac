//! Symmetric encryption for OMEMO
//!
//! Two layers share this module: the ratchet encrypts 32-byte key material
//! with AES-256-GCM message keys, and the message payload itself is
//! AES-128-GCM with the key/tag pair carried inside the ratchet envelope.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use crate::error::{OmemoError, Result};

/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Payload content-key length (legacy AES-128 format)
pub const CONTENT_KEY_LEN: usize = 16;

/// Payload nonce length
pub const IV_LEN: usize = 12;

/// AEAD cipher for ratchet message encryption
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    /// Create cipher from a 32-byte message key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(key).expect("32-byte key"),
        }
    }

    /// Encrypt plaintext with associated data
    ///
    /// Returns nonce || ciphertext || tag
    pub fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: associated_data })
            .map_err(|_| OmemoError::Encryption("AES-GCM encryption failed".to_string()))?;

        let mut result = Vec::with_capacity(IV_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt nonce || ciphertext || tag with associated data
    pub fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < IV_LEN + TAG_LEN {
            return Err(OmemoError::AeadFailure);
        }

        let nonce = Nonce::from_slice(&ciphertext[..IV_LEN]);
        let encrypted = &ciphertext[IV_LEN..];

        self.cipher
            .decrypt(nonce, Payload { msg: encrypted, aad: associated_data })
            .map_err(|_| OmemoError::AeadFailure)
    }
}

/// Result of encrypting a message payload.
///
/// `key || tag` forms the 32-byte key material handed to the per-device
/// sessions; the payload element carries `ciphertext` without the tag.
pub struct EncryptedPayload {
    pub key: [u8; CONTENT_KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl EncryptedPayload {
    /// The 32-byte blob the Signal sessions encrypt for each device
    pub fn key_material(&self) -> [u8; CONTENT_KEY_LEN + TAG_LEN] {
        let mut out = [0u8; CONTENT_KEY_LEN + TAG_LEN];
        out[..CONTENT_KEY_LEN].copy_from_slice(&self.key);
        out[CONTENT_KEY_LEN..].copy_from_slice(&self.tag);
        out
    }
}

impl Drop for EncryptedPayload {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Encrypt a message body with a fresh content key and nonce
pub fn encrypt_payload(plaintext: &[u8]) -> Result<EncryptedPayload> {
    let mut key = [0u8; CONTENT_KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes128Gcm::new_from_slice(&key).expect("16-byte key");
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| OmemoError::Encryption("AES-128-GCM encryption failed".to_string()))?;

    if sealed.len() < TAG_LEN {
        return Err(OmemoError::Encryption("ciphertext shorter than tag".to_string()));
    }
    let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok(EncryptedPayload { key, iv, ciphertext: sealed, tag })
}

/// Decrypt a message payload from recovered key material.
///
/// Auto-detects the format at the application-crypto boundary: the legacy
/// shape packs a 16-byte AES-128 key and the 16-byte tag into the 32-byte
/// material (payload carries ciphertext without tag); the newer shape uses
/// the full 32 bytes as an AES-256 key with the tag appended to the payload.
pub fn decrypt_payload(key_material: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LEN {
        return Err(OmemoError::InvalidKey(format!("bad iv length {}", iv.len())));
    }
    let nonce = Nonce::from_slice(iv);

    match key_material.len() {
        32 => {
            let cipher = Aes128Gcm::new_from_slice(&key_material[..CONTENT_KEY_LEN])
                .expect("16-byte key");
            let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
            sealed.extend_from_slice(ciphertext);
            sealed.extend_from_slice(&key_material[CONTENT_KEY_LEN..]);

            if let Ok(plaintext) = cipher.decrypt(nonce, sealed.as_slice()) {
                return Ok(plaintext);
            }

            // Newer 32-byte-key format: tag is already appended to the payload.
            let cipher = Aes256Gcm::new_from_slice(key_material).expect("32-byte key");
            cipher
                .decrypt(nonce, ciphertext)
                .map_err(|_| OmemoError::AeadFailure)
        }
        16 => {
            let cipher = Aes128Gcm::new_from_slice(key_material).expect("16-byte key");
            cipher
                .decrypt(nonce, ciphertext)
                .map_err(|_| OmemoError::AeadFailure)
        }
        n => Err(OmemoError::InvalidKey(format!("bad key material length {n}"))),
    }
}

/// Derive a 32-byte key from input material using HKDF-SHA256
pub fn derive_key(input: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hkdf = Hkdf::<Sha256>::new(Some(salt), input);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .expect("HKDF expand should not fail for 32 bytes");
    key
}
