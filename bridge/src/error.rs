//! Bridge error types
//!
//! Typed failure kinds for the encryption orchestration. Cryptographic and
//! I/O failures propagate to the immediate caller; only the encryptor's
//! send path converts failures into the user-visible warning stanza.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Omemo(#[from] omemo::OmemoError),

    #[error(transparent)]
    Stanza(#[from] stanza::StanzaError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("pubsub error on {node}: {condition}")]
    PubSub { node: String, condition: String },

    /// Bundle fetch returned nothing; the device is skipped in fan-out
    #[error("no bundle available for {jid}:{device}")]
    BundleUnavailable { jid: String, device: u32 },

    /// Device-list fetch failed; fatal to this encryption attempt
    #[error("device list unavailable for {0}")]
    DeviceListUnavailable(String),

    /// Recipient has no devices at all
    #[error("{0} has no OMEMO devices")]
    NoDevices(String),

    /// Every per-device encryption failed
    #[error("no device could be encrypted to")]
    NoEncryptableDevices,

    /// Room is anonymous or has no tracked occupants
    #[error("room {0} is not OMEMO-capable")]
    RoomNotCapable(String),

    /// Inbound encrypted stanza carries no key for our device
    #[error("encrypted message is not addressed to this device")]
    NotForUs,

    /// Room message from a nick with no resolvable real JID
    #[error("cannot resolve sender {0}")]
    UnknownSender(String),

    /// Both decryption variants failed
    #[error("signal decryption failed for {jid}:{device}")]
    SignalFailure { jid: String, device: u32 },

    /// Payload failed the AES-GCM authentication check
    #[error("payload authentication failed")]
    AesFailure,

    /// Operation refused because the account is tearing down
    #[error("account is shutting down")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
