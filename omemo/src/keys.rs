//! Key material for OMEMO
//!
//! The identity key is an Ed25519 signing key with a derived X25519 half;
//! everything else (signed pre-keys, one-time pre-keys, X3DH ephemerals,
//! ratchet steps) is a plain Curve25519 pair. Pairs store only the secret
//! and derive the public half on demand, so persistence and the ratchet
//! state serialize them as a single base64 field.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{OmemoError, Result};

/// A Curve25519 public key as it travels in bundles, envelopes and
/// ratchet headers
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Curve25519Public([u8; 32]);

impl Curve25519Public {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OmemoError::InvalidKey(format!("bad public key length {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        Self::from_bytes(&BASE64.decode(text)?)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub(crate) fn as_x25519(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl Serialize for Curve25519Public {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Curve25519Public {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_base64(&text).map_err(de::Error::custom)
    }
}

/// A Curve25519 key pair.
///
/// Only the secret half lives in memory; [`DhKeyPair::public`] derives
/// the public half when a bundle or envelope needs it. Agreements come
/// out zeroizing so X3DH legs never outlive their key derivation.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: StaticSecret,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(*bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public(&self) -> Curve25519Public {
        Curve25519Public(PublicKey::from(&self.secret).to_bytes())
    }

    /// X25519 agreement with a peer key
    pub fn agree(&self, peer: &Curve25519Public) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.diffie_hellman(&peer.as_x25519()).to_bytes())
    }
}

impl Serialize for DhKeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.secret.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for DhKeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&text).map_err(de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom("bad secret key length"))?;
        Ok(Self::from_bytes(&arr))
    }
}

/// Long-term identity key pair.
///
/// The published identity key is an Ed25519 verifying key: peers use it to
/// check the signed pre-key signature and convert it to its birational
/// X25519 form for the X3DH legs. Our own X25519 secret is the clamped
/// SHA-512 expansion of the Ed25519 seed, so the derived Montgomery public
/// key equals `VerifyingKey::to_montgomery()` of the published key.
#[derive(Clone)]
pub struct IdentityKeyPair {
    seed: [u8; 32],
    signing: SigningKey,
    dh_secret: StaticSecret,
}

impl IdentityKeyPair {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Rebuild the identity from its stored seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let hash = Sha512::digest(seed);
        let mut dh_bytes = [0u8; 32];
        dh_bytes.copy_from_slice(&hash[..32]);
        let dh_secret = StaticSecret::from(dh_bytes);
        dh_bytes.zeroize();
        Self { seed, signing, dh_secret }
    }

    /// The seed bytes, for persistence
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.seed
    }

    /// The public identity key as published in bundles
    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message with the identity key (signed pre-key signatures)
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// X25519 agreement between our identity secret and a peer key
    pub fn agree(&self, peer: &Curve25519Public) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.dh_secret.diffie_hellman(&peer.as_x25519()).to_bytes())
    }
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

/// A peer's published identity key (Ed25519 form)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey(pub [u8; 32]);

impl IdentityPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OmemoError::InvalidKey("invalid identity key length".to_string()))?;
        Ok(Self(arr))
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        Self::from_bytes(&BASE64.decode(text)?)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Verify an identity-key signature (signed pre-key publication)
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| OmemoError::InvalidKey("invalid signature length".to_string()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        let vk = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| OmemoError::InvalidKey(e.to_string()))?;
        vk.verify(message, &sig).map_err(|_| OmemoError::BadSignature)
    }

    /// The X25519 form of the identity key, for the X3DH legs
    pub fn to_curve(&self) -> Result<Curve25519Public> {
        let vk = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| OmemoError::InvalidKey(e.to_string()))?;
        Ok(Curve25519Public(vk.to_montgomery().to_bytes()))
    }
}

/// Signed pre-key with its identity-key signature
#[derive(Clone)]
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: DhKeyPair,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl SignedPreKey {
    /// Generate and sign a fresh signed pre-key
    pub fn generate(identity: &IdentityKeyPair) -> Self {
        let key_pair = DhKeyPair::generate();
        let signature = identity.sign(key_pair.public().as_bytes());
        Self {
            id: random_key_id(),
            key_pair,
            signature,
            created_at: Utc::now(),
        }
    }
}

/// One-time pre-key, consumed during a single inbound session build
#[derive(Clone)]
pub struct OneTimePreKey {
    pub id: u32,
    pub key_pair: DhKeyPair,
}

/// Random 31-bit non-zero device identifier
pub fn random_device_id() -> u32 {
    OsRng.gen_range(1..=0x7FFF_FFFFu32)
}

/// Random 24-bit non-zero key identifier
pub fn random_key_id() -> u32 {
    OsRng.gen_range(1..=0x00FF_FFFFu32)
}

/// Registration identifier as chosen by Signal-family libraries
pub fn random_registration_id() -> u32 {
    OsRng.gen_range(1..16384u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let ours = DhKeyPair::generate();
        let theirs = DhKeyPair::generate();

        assert_eq!(
            *ours.agree(&theirs.public()),
            *theirs.agree(&ours.public())
        );
    }

    #[test]
    fn test_keypair_serde_roundtrip() {
        let pair = DhKeyPair::generate();
        let json = serde_json::to_string(&pair).unwrap();
        let restored: DhKeyPair = serde_json::from_str(&json).unwrap();

        assert_eq!(pair.public(), restored.public());
        assert_eq!(pair.secret_bytes(), restored.secret_bytes());
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let public = DhKeyPair::generate().public();
        assert_eq!(Curve25519Public::from_base64(&public.to_base64()).unwrap(), public);
        assert!(Curve25519Public::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_identity_signature_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(&identity);

        identity
            .public()
            .verify(spk.key_pair.public().as_bytes(), &spk.signature)
            .unwrap();

        let mut bad = spk.signature.clone();
        bad[0] ^= 0xFF;
        assert!(identity
            .public()
            .verify(spk.key_pair.public().as_bytes(), &bad)
            .is_err());
    }

    #[test]
    fn test_identity_dh_matches_published_key() {
        // Agreement against the converted published key must match the
        // agreement done with our internal X25519 secret.
        let identity = IdentityKeyPair::generate();
        let other = DhKeyPair::generate();

        let ours = identity.agree(&other.public());
        let converted = identity.public().to_curve().unwrap();
        let theirs = other.agree(&converted);

        assert_eq!(*ours, *theirs);
    }

    #[test]
    fn test_identity_from_seed_stable() {
        let identity = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_seed(identity.seed_bytes());
        assert_eq!(identity.public(), restored.public());
    }

    #[test]
    fn test_device_id_range() {
        for _ in 0..64 {
            let id = random_device_id();
            assert!(id >= 1 && id <= 0x7FFF_FFFF);
        }
    }
}
