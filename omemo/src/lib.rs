//! OMEMO cryptographic core
//!
//! This crate owns everything between key material and wire bytes for the
//! OMEMO (XEP-0384) encryption scheme:
//! - long-term identity keys, signed pre-keys, one-time pre-key pool
//! - X3DH key agreement and Double Ratchet sessions per peer device
//! - AES-GCM payload encryption with the key/tag split the wire uses
//! - the identity store and its human-inspectable snapshot file
//!
//! Nothing in here touches the network: bundles and device lists come in
//! from the pubsub layer, sessions and envelopes go back out as bytes.
//!
//! # Example
//!
//! ```rust,ignore
//! use omemo::{DeviceAddress, IdentityStore, MessageKind, SessionCipher};
//!
//! let mut alice = IdentityStore::generate("alice@example.org", None)?;
//! let mut bob = IdentityStore::generate("bob@example.org", None)?;
//!
//! // Alice fetched Bob's bundle out of band.
//! let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());
//! let mut cipher = SessionCipher::new(&mut alice, bob_addr);
//! cipher.build_session(&bundle)?;
//! let (wire, kind) = cipher.encrypt(&key_material)?;
//! ```

pub mod cipher;
pub mod error;
pub mod identity;
pub mod keys;
pub mod persistence;
pub mod ratchet;
pub mod session;

// Re-export main types
pub use cipher::{decrypt_payload, encrypt_payload, EncryptedPayload};
pub use error::{OmemoError, Result};
pub use identity::{Direction, IdentityStore, LocalBundle, PRE_KEY_MINIMUM, PRE_KEY_TARGET};
pub use keys::{Curve25519Public, DhKeyPair, IdentityKeyPair, IdentityPublicKey, SignedPreKey};
pub use persistence::{FileStore, SessionRecord, Snapshot};
pub use session::{own_bundle, DeviceAddress, MessageKind, PreKeyBundle, SessionCipher};
