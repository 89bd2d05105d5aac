//! Error types for the OMEMO core.

use thiserror::Error;

/// Errors that can occur in OMEMO key and session operations
#[derive(Error, Debug)]
pub enum OmemoError {
    /// No identity material has been initialized for the account
    #[error("identity store not initialized")]
    NotInitialized,

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Snapshot could not be written
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// Invalid key format
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Signed pre-key signature did not verify
    #[error("bad signed pre-key signature")]
    BadSignature,

    /// No session established for the peer device
    #[error("no session for {0}")]
    NoSession(String),

    /// Session state could not be decoded
    #[error("session state corrupted: {0}")]
    SessionCorrupted(String),

    /// Both pre-key and regular decryption attempts failed
    #[error("signal decryption failed for {0}")]
    SignalFailure(String),

    /// Referenced one-time pre-key is not in the pool
    #[error("unknown pre-key id {0}")]
    UnknownPreKey(u32),

    /// Referenced signed pre-key id does not match any we hold
    #[error("unknown signed pre-key id {0}")]
    UnknownSignedPreKey(u32),

    /// Bundle carried no one-time pre-keys
    #[error("bundle has no one-time pre-keys")]
    EmptyBundle,

    /// AEAD encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AEAD authentication check failed
    #[error("payload authentication failed")]
    AeadFailure,

    /// Ratchet message arrived too far ahead of the receiving chain
    #[error("out of order message: expected {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for OmemoError {
    fn from(e: serde_json::Error) -> Self {
        OmemoError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for OmemoError {
    fn from(e: base64::DecodeError) -> Self {
        OmemoError::InvalidKey(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OmemoError>;
