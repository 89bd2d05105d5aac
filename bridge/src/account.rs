//! Per-account OMEMO facade
//!
//! The surface the agent runtime talks to: initialize once, feed every
//! inbound stanza through [`OmemoAccount::handle_inbound`], and send
//! outbound text through the encrypting send paths. One instance per
//! local account; all session mutation is serialized through the store
//! lock, matching the one-logical-context model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use omemo::{FileStore, IdentityStore};
use stanza::element::Element;
use stanza::message::MessageType;
use stanza::ns;
use stanza::omemo::EncryptedElement;

use crate::bundles::BundleManager;
use crate::config::BridgeConfig;
use crate::decryptor::{DecryptOutcome, MessageDecryptor};
use crate::devices::DeviceListManager;
use crate::encryptor::MessageEncryptor;
use crate::error::{BridgeError, Result};
use crate::pubsub::{parse_event, PubSubClient};
use crate::rooms::RoomOccupantTracker;
use crate::transport::XmppTransport;

/// What an inbound stanza turned out to be
#[derive(Clone, Debug)]
pub enum Inbound {
    /// Room presence, consumed by the occupant tracker
    Presence,
    /// A pubsub notification; device-list pushes refreshed the cache
    Notification,
    /// A message stanza, run through the decryptor
    Message(DecryptOutcome),
    /// Anything else
    Ignored,
}

/// One local account's OMEMO state and operations
pub struct OmemoAccount {
    config: BridgeConfig,
    account: String,
    device_id: u32,
    store: Arc<Mutex<IdentityStore>>,
    transport: Arc<dyn XmppTransport>,
    pubsub: Arc<PubSubClient>,
    devices: Arc<DeviceListManager>,
    bundles: Arc<BundleManager>,
    rooms: Arc<RoomOccupantTracker>,
    encryptor: MessageEncryptor,
    decryptor: MessageDecryptor,
    shutting_down: AtomicBool,
}

impl OmemoAccount {
    /// Restore or generate the account identity, publish device list and
    /// bundle, and return the ready facade.
    pub async fn initialize(
        config: BridgeConfig,
        transport: Arc<dyn XmppTransport>,
    ) -> Result<Self> {
        let account = crate::jid::bare(&config.account_jid).to_lowercase();

        let persister = FileStore::for_account(config.data_dir.as_deref(), &account);
        let (store, first_init) = IdentityStore::open(&account, persister)?;
        let device_id = store.device_id();
        let local_bundle = store.local_bundle();
        info!(account = %account, device_id, first_init, "identity store ready");

        let store = Arc::new(Mutex::new(store));
        let pubsub = Arc::new(PubSubClient::new(transport.clone()));
        let devices = Arc::new(DeviceListManager::new(
            pubsub.clone(),
            &account,
            device_id,
            config.device_label.clone(),
        ));
        let bundles = Arc::new(BundleManager::new(pubsub.clone()));
        let rooms = Arc::new(RoomOccupantTracker::new());

        devices.publish_own(first_init).await?;
        bundles.publish_own(&local_bundle, device_id).await?;

        let encryptor = MessageEncryptor::new(
            store.clone(),
            devices.clone(),
            bundles.clone(),
            rooms.clone(),
            &account,
            device_id,
        );
        let decryptor = MessageDecryptor::new(store.clone(), rooms.clone(), device_id);

        Ok(Self {
            config,
            account,
            device_id,
            store,
            transport,
            pubsub,
            devices,
            bundles,
            rooms,
            encryptor,
            decryptor,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Route one inbound stanza: presence to the room tracker, pubsub
    /// events to the device-list cache, messages through the decryptor.
    pub async fn handle_inbound(&self, stanza: &Element) -> Result<Inbound> {
        self.ensure_running()?;
        match stanza.name() {
            "presence" => {
                self.rooms.handle_presence(stanza);
                Ok(Inbound::Presence)
            }
            "message" => {
                if let Some(event) = parse_event(stanza) {
                    self.devices.handle_event(&event).await?;
                    return Ok(Inbound::Notification);
                }
                let outcome = self.decryptor.decrypt(stanza).await?;
                Ok(Inbound::Message(outcome))
            }
            _ => Ok(Inbound::Ignored),
        }
    }

    /// Decrypt one message stanza without the routing wrapper
    pub async fn decrypt(&self, stanza: &Element) -> Result<DecryptOutcome> {
        self.ensure_running()?;
        self.decryptor.decrypt(stanza).await
    }

    /// Encrypt a direct-chat message, returning the encrypted element
    pub async fn encrypt_direct(&self, to: &str, plaintext: &str) -> Result<EncryptedElement> {
        self.ensure_running()?;
        self.encryptor.encrypt_direct(to, plaintext, false).await
    }

    /// Encrypt a room message, returning the encrypted element
    pub async fn encrypt_room(&self, room: &str, plaintext: &str) -> Result<EncryptedElement> {
        self.ensure_running()?;
        self.encryptor.encrypt_room(room, plaintext, false).await
    }

    /// Encrypt a payload-less key-transport message for a peer
    pub async fn encrypt_key_transport(&self, to: &str) -> Result<EncryptedElement> {
        self.ensure_running()?;
        self.encryptor.encrypt_key_transport(to, false).await
    }

    /// Wrap an encrypted element into a sendable message stanza
    pub fn wrap_as_stanza(
        &self,
        to: &str,
        encrypted: &EncryptedElement,
        message_type: MessageType,
    ) -> Element {
        self.encryptor.wrap_as_stanza(to, encrypted, message_type)
    }

    /// Encrypt and send a direct-chat message.
    ///
    /// Encryption failures are retried once with refreshed device lists;
    /// if that also fails, a short plaintext warning stanza is sent in
    /// place of the message. The original plaintext is never transmitted
    /// unencrypted.
    pub async fn send_direct(&self, to: &str, plaintext: &str) -> Result<()> {
        self.ensure_running()?;
        self.send_encrypted(to, plaintext, MessageType::Chat).await
    }

    /// Encrypt and send a room message, same contract as [`send_direct`]
    ///
    /// [`send_direct`]: OmemoAccount::send_direct
    pub async fn send_room(&self, room: &str, plaintext: &str) -> Result<()> {
        self.ensure_running()?;
        self.send_encrypted(room, plaintext, MessageType::Groupchat).await
    }

    async fn send_encrypted(
        &self,
        to: &str,
        plaintext: &str,
        message_type: MessageType,
    ) -> Result<()> {
        let encrypted = match self.encrypt_for(to, plaintext, message_type, false).await {
            Ok(encrypted) => encrypted,
            Err(first_err) => {
                warn!(to = %to, error = %first_err, "encryption failed, retrying with refreshed device lists");
                match self.encrypt_for(to, plaintext, message_type, true).await {
                    Ok(encrypted) => encrypted,
                    Err(e) => {
                        if self.config.omemo_required {
                            let stanza = self.encryptor.warning_stanza(to, message_type);
                            if let Err(send_err) = self.transport.send_stanza(stanza).await {
                                warn!(to = %to, error = %send_err, "failed to deliver encryption warning");
                            }
                        }
                        return Err(e);
                    }
                }
            }
        };

        let stanza = self.encryptor.wrap_as_stanza(to, &encrypted, message_type);
        self.transport
            .send_stanza(stanza)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    async fn encrypt_for(
        &self,
        to: &str,
        plaintext: &str,
        message_type: MessageType,
        force_refresh: bool,
    ) -> Result<EncryptedElement> {
        match message_type {
            MessageType::Chat => self.encryptor.encrypt_direct(to, plaintext, force_refresh).await,
            MessageType::Groupchat => self.encryptor.encrypt_room(to, plaintext, force_refresh).await,
        }
    }

    /// Subscribe to a peer's device-list node so pushes reach us
    pub async fn subscribe_device_list(&self, peer: &str) -> Result<()> {
        self.ensure_running()?;
        self.pubsub
            .subscribe(crate::jid::bare(peer), ns::LEGACY_DEVICELIST_NODE, &self.account)
            .await
    }

    /// Rotate the signed pre-key and republish the bundle
    pub async fn rotate_signed_pre_key(&self) -> Result<()> {
        self.ensure_running()?;
        let local_bundle = {
            let mut store = self.store.lock().await;
            store.rotate_signed_pre_key()?;
            store.local_bundle()
        };
        self.bundles.publish_own(&local_bundle, self.device_id).await
    }

    /// Begin teardown: subsequent operations are refused, caches and room
    /// state are dropped. In-flight queries complete or time out.
    pub fn shutdown(&self) {
        info!(account = %self.account, "account shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.devices.clear();
        self.rooms.clear();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::ShutdownInProgress);
        }
        Ok(())
    }
}
