//! Inbound message decryption
//!
//! Identifies encrypted stanzas, selects the key element addressed to our
//! device, recovers the content key through the Signal session and
//! decrypts the payload. Room senders are resolved to their real JIDs
//! through the occupant tracker.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use omemo::{DeviceAddress, IdentityStore, MessageKind, OmemoError, SessionCipher};
use stanza::element::Element;
use stanza::omemo::{find_encrypted, EncryptedElement};

use crate::error::{BridgeError, Result};
use crate::jid;
use crate::rooms::RoomOccupantTracker;

/// Result of running a stanza through the decryptor
#[derive(Clone, Debug)]
pub enum DecryptOutcome {
    /// The stanza carries no encrypted element
    NotEncrypted,
    /// An encrypted envelope without payload: session establishment or
    /// fan-out without content
    KeyTransport { sender: DeviceAddress },
    /// A decrypted message body
    Message { sender: DeviceAddress, plaintext: String },
}

/// Orchestrator for inbound decryption
pub struct MessageDecryptor {
    store: Arc<Mutex<IdentityStore>>,
    rooms: Arc<RoomOccupantTracker>,
    device_id: u32,
}

impl MessageDecryptor {
    pub fn new(
        store: Arc<Mutex<IdentityStore>>,
        rooms: Arc<RoomOccupantTracker>,
        device_id: u32,
    ) -> Self {
        Self { store, rooms, device_id }
    }

    /// Decrypt one inbound message stanza.
    ///
    /// `Ok(NotEncrypted)` for plain stanzas; typed failures follow the
    /// severity policy: not-for-us is silent, unknown senders and signal
    /// failures warn, a failed payload authentication is an error.
    pub async fn decrypt(&self, stanza: &Element) -> Result<DecryptOutcome> {
        let Some(encrypted_el) = find_encrypted(stanza) else {
            return Ok(DecryptOutcome::NotEncrypted);
        };
        let encrypted = EncryptedElement::parse(encrypted_el)?;

        let Some(key) = encrypted.key_for(self.device_id) else {
            debug!(sid = encrypted.sid, "encrypted message carries no key for this device");
            return Err(BridgeError::NotForUs);
        };

        let from = stanza
            .get_attr("from")
            .ok_or_else(|| BridgeError::UnknownSender("<missing from>".to_string()))?;
        let is_groupchat = stanza.get_attr("type") == Some("groupchat");

        let sender_jid = if is_groupchat {
            let (room, nick) = jid::split(from);
            let Some(nick) = nick else {
                warn!(from = %from, "room message without nickname");
                return Err(BridgeError::UnknownSender(from.to_string()));
            };
            match self.rooms.occupant_real_jid_by_nick(room, nick) {
                Some(real) => real,
                None => {
                    warn!(from = %from, "cannot resolve room sender to a real JID, dropping stanza");
                    return Err(BridgeError::UnknownSender(from.to_string()));
                }
            }
        } else {
            jid::bare(from).to_lowercase()
        };

        let sender = DeviceAddress::new(&sender_jid, encrypted.sid);

        // The key element's attribute is the primary hint; the leading
        // ciphertext byte settles it when the attribute is absent.
        let hint = if key.prekey {
            MessageKind::PreKey
        } else {
            MessageKind::from_leading_byte(&key.data)
        };

        let key_material = {
            let mut store = self.store.lock().await;
            SessionCipher::new(&mut store, sender.clone())
                .decrypt(&key.data, hint)
                .map_err(|e| match e {
                    OmemoError::SignalFailure(_) => {
                        warn!(sender = %sender, "both decryption variants failed");
                        BridgeError::SignalFailure {
                            jid: sender.jid.clone(),
                            device: sender.device_id,
                        }
                    }
                    other => other.into(),
                })?
        };

        let Some(payload) = &encrypted.payload else {
            debug!(sender = %sender, "key-transport message");
            return Ok(DecryptOutcome::KeyTransport { sender });
        };

        let plaintext = omemo::decrypt_payload(&key_material, &encrypted.iv, payload).map_err(|e| {
            match e {
                OmemoError::AeadFailure => {
                    error!(sender = %sender, "payload failed AES-GCM authentication");
                    BridgeError::AesFailure
                }
                other => other.into(),
            }
        })?;

        Ok(DecryptOutcome::Message {
            sender,
            plaintext: String::from_utf8_lossy(&plaintext).into_owned(),
        })
    }
}
