//! Outbound message encryption
//!
//! Resolves the recipient device set, encrypts the payload once with a
//! fresh content key, wraps the key material with every recipient
//! device's Signal session (building sessions on demand from fetched
//! bundles) and assembles the composite encrypted element.
//!
//! Fan-out policy: direct chats address the peer's devices plus our
//! *other* devices; rooms address every occupant's devices plus *all* of
//! our devices, because the server reflects room messages back and the
//! local device must decrypt its own echo.

use std::collections::HashMap;
use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use omemo::{own_bundle, DeviceAddress, IdentityStore, MessageKind, SessionCipher};
use stanza::element::Element;
use stanza::message::{encrypted_message, warning_message, MessageType};
use stanza::omemo::{EncryptedElement, KeyElement};

use crate::bundles::{to_crypto, BundleManager};
use crate::devices::DeviceListManager;
use crate::error::{BridgeError, Result};
use crate::jid;
use crate::rooms::RoomOccupantTracker;

/// Fallback body attached to every encrypted stanza for clients that
/// cannot decrypt
pub const FALLBACK_NOTICE: &str =
    "I sent you an OMEMO encrypted message but your client doesn't seem to support that.";

/// Body of the warning stanza sent when encryption fails. The original
/// plaintext is never included.
pub const WARNING_NOTICE: &str =
    "This message could not be encrypted and was withheld for security reasons.";

/// Orchestrator for outbound encryption
pub struct MessageEncryptor {
    store: Arc<Mutex<IdentityStore>>,
    devices: Arc<DeviceListManager>,
    bundles: Arc<BundleManager>,
    rooms: Arc<RoomOccupantTracker>,
    account: String,
    device_id: u32,
}

impl MessageEncryptor {
    pub fn new(
        store: Arc<Mutex<IdentityStore>>,
        devices: Arc<DeviceListManager>,
        bundles: Arc<BundleManager>,
        rooms: Arc<RoomOccupantTracker>,
        account: &str,
        device_id: u32,
    ) -> Self {
        Self {
            store,
            devices,
            bundles,
            rooms,
            account: jid::bare(account).to_lowercase(),
            device_id,
        }
    }

    /// Encrypt a direct-chat message for a bare peer JID
    pub async fn encrypt_direct(
        &self,
        to: &str,
        plaintext: &str,
        force_refresh: bool,
    ) -> Result<EncryptedElement> {
        let targets = self.direct_targets(to, force_refresh).await?;
        self.encrypt_to_targets(&targets, Some(plaintext)).await
    }

    /// Encrypt a room message for every occupant device and all own devices
    pub async fn encrypt_room(
        &self,
        room: &str,
        plaintext: &str,
        force_refresh: bool,
    ) -> Result<EncryptedElement> {
        let targets = self.room_targets(room, force_refresh).await?;
        self.encrypt_to_targets(&targets, Some(plaintext)).await
    }

    /// Encrypt a key-transport message (no payload) for a peer; used to
    /// move sessions forward without content
    pub async fn encrypt_key_transport(&self, to: &str, force_refresh: bool) -> Result<EncryptedElement> {
        let targets = self.direct_targets(to, force_refresh).await?;
        self.encrypt_to_targets(&targets, None).await
    }

    /// Wrap an encrypted element into a sendable message stanza
    pub fn wrap_as_stanza(
        &self,
        to: &str,
        encrypted: &EncryptedElement,
        message_type: MessageType,
    ) -> Element {
        encrypted_message(to, message_type, encrypted.to_element(), FALLBACK_NOTICE)
    }

    /// The warning stanza emitted when encryption failed
    pub fn warning_stanza(&self, to: &str, message_type: MessageType) -> Element {
        warning_message(to, message_type, WARNING_NOTICE)
    }

    async fn direct_targets(&self, to: &str, force_refresh: bool) -> Result<Vec<DeviceAddress>> {
        let peer = jid::bare(to).to_lowercase();

        let peer_devices = self.devices.get_device_list(&peer, force_refresh).await?;
        if peer_devices.is_empty() {
            return Err(BridgeError::NoDevices(peer));
        }

        let mut targets: Vec<DeviceAddress> = peer_devices
            .iter()
            .map(|d| DeviceAddress::new(&peer, d.id))
            .collect();

        // Our other devices get a copy too; our own current device does
        // not, because the server never reflects direct messages.
        match self.devices.get_device_list(&self.account, force_refresh).await {
            Ok(own) => {
                for device in own {
                    if device.id != self.device_id {
                        targets.push(DeviceAddress::new(&self.account, device.id));
                    }
                }
            }
            Err(e) => warn!(error = %e, "own device list unavailable, skipping own-device fan-out"),
        }

        Ok(dedup(targets))
    }

    async fn room_targets(&self, room: &str, force_refresh: bool) -> Result<Vec<DeviceAddress>> {
        let room = jid::bare(room).to_lowercase();
        if !self.rooms.room_omemo_capable(&room) {
            return Err(BridgeError::RoomNotCapable(room));
        }
        let occupants = self
            .rooms
            .occupant_real_jids(&room, true)
            .ok_or_else(|| BridgeError::RoomNotCapable(room.clone()))?;

        let mut targets = Vec::new();
        for occupant in occupants {
            if occupant == self.account {
                continue;
            }
            match self.devices.get_device_list(&occupant, force_refresh).await {
                Ok(devices) => {
                    targets.extend(devices.iter().map(|d| DeviceAddress::new(&occupant, d.id)));
                }
                Err(e) => warn!(occupant = %occupant, error = %e, "occupant device list unavailable"),
            }
        }

        // All own devices, including this one: the reflected copy must
        // decrypt locally.
        let mut own_ids: Vec<u32> = match self.devices.get_device_list(&self.account, force_refresh).await {
            Ok(own) => own.iter().map(|d| d.id).collect(),
            Err(e) => {
                warn!(error = %e, "own device list unavailable, falling back to local device only");
                Vec::new()
            }
        };
        if !own_ids.contains(&self.device_id) {
            own_ids.push(self.device_id);
        }
        targets.extend(own_ids.into_iter().map(|id| DeviceAddress::new(&self.account, id)));

        Ok(dedup(targets))
    }

    async fn encrypt_to_targets(
        &self,
        targets: &[DeviceAddress],
        plaintext: Option<&str>,
    ) -> Result<EncryptedElement> {
        // One fresh content key and nonce per message; key || tag is the
        // 32-byte blob every session encrypts.
        let (key_material, iv, payload) = match plaintext {
            Some(text) => {
                let sealed = omemo::encrypt_payload(text.as_bytes())?;
                (
                    sealed.key_material().to_vec(),
                    sealed.iv.to_vec(),
                    Some(sealed.ciphertext.clone()),
                )
            }
            None => {
                let mut km = [0u8; 32];
                let mut iv = [0u8; 12];
                OsRng.fill_bytes(&mut km);
                OsRng.fill_bytes(&mut iv);
                (km.to_vec(), iv.to_vec(), None)
            }
        };

        // Figure out which devices still need a session, then fetch their
        // bundles without holding the store.
        let need_sessions: Vec<DeviceAddress> = {
            let store = self.store.lock().await;
            targets
                .iter()
                .filter(|addr| self.is_self_address(addr) || !store.has_session(addr))
                .cloned()
                .collect()
        };

        let mut fetched = HashMap::new();
        for addr in &need_sessions {
            if self.is_self_address(addr) {
                continue;
            }
            match self.bundles.fetch(&addr.jid, addr.device_id).await {
                Ok(Some(wire)) => match to_crypto(&wire) {
                    Ok(bundle) => {
                        fetched.insert(addr.key(), bundle);
                    }
                    Err(e) => warn!(address = %addr, error = %e, "unusable bundle, skipping device"),
                },
                Ok(None) => {
                    let err = BridgeError::BundleUnavailable {
                        jid: addr.jid.clone(),
                        device: addr.device_id,
                    };
                    warn!(address = %addr, error = %err, "skipping device");
                }
                Err(e) => warn!(address = %addr, error = %e, "bundle fetch failed, skipping device"),
            }
        }

        let mut keys = Vec::new();
        let mut store = self.store.lock().await;
        for addr in targets {
            // Sessions to our own current device never leave the pre-key
            // phase: the reflected room copy rebuilds the inbound half on
            // every message, so each outbound copy is a fresh build.
            let needs_build = self.is_self_address(addr) || !store.has_session(addr);
            if needs_build {
                let bundle = if self.is_self_address(addr) {
                    Some(own_bundle(&store))
                } else {
                    fetched.get(&addr.key()).cloned()
                };
                let Some(bundle) = bundle else { continue };
                if let Err(e) = SessionCipher::new(&mut store, addr.clone()).build_session(&bundle) {
                    warn!(address = %addr, error = %e, "session build failed, skipping device");
                    continue;
                }
            }

            match SessionCipher::new(&mut store, addr.clone()).encrypt(&key_material) {
                Ok((data, kind)) => keys.push(KeyElement {
                    rid: addr.device_id,
                    prekey: kind == MessageKind::PreKey,
                    data,
                }),
                Err(e) => warn!(address = %addr, error = %e, "per-device encryption failed"),
            }
        }
        drop(store);

        if keys.is_empty() {
            return Err(BridgeError::NoEncryptableDevices);
        }

        debug!(recipients = keys.len(), key_transport = payload.is_none(), "assembled encrypted element");
        Ok(EncryptedElement {
            sid: self.device_id,
            keys,
            iv,
            payload,
        })
    }

    fn is_self_address(&self, addr: &DeviceAddress) -> bool {
        addr.jid == self.account && addr.device_id == self.device_id
    }
}

fn dedup(targets: Vec<DeviceAddress>) -> Vec<DeviceAddress> {
    let mut seen = std::collections::HashSet::new();
    targets.into_iter().filter(|t| seen.insert(t.key())).collect()
}
