//! Identity store
//!
//! Exclusive owner of the account's persistent key material: identity key
//! pair, device and registration identifiers, signed pre-key, one-time
//! pre-key pool, per-peer-device sessions and peer identity keys. Every
//! mutating operation persists its snapshot before reporting success.

use std::collections::{BTreeMap, HashMap};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, warn};

use crate::error::{OmemoError, Result};
use crate::keys::{
    random_device_id, random_key_id, random_registration_id, Curve25519Public, DhKeyPair,
    IdentityKeyPair, IdentityPublicKey, OneTimePreKey, SignedPreKey,
};
use crate::persistence::{
    FileStore, PreKeySnapshot, SessionRecord, SignedPreKeySnapshot, Snapshot,
};
use crate::session::DeviceAddress;

/// One-time pre-key pool is regenerated up to this size
pub const PRE_KEY_TARGET: usize = 100;

/// Regeneration triggers when the pool falls below this size
pub const PRE_KEY_MINIMUM: usize = 20;

/// Which way a session is being used when trust is evaluated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Public bundle material for publication
#[derive(Clone, Debug)]
pub struct LocalBundle {
    pub identity_key: String,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: String,
    pub signed_pre_key_signature: String,
    pub pre_keys: Vec<(u32, String)>,
}

/// Persistent holder of all OMEMO key material for one account
pub struct IdentityStore {
    account: String,
    device_id: u32,
    registration_id: u32,
    identity: IdentityKeyPair,
    signed_pre_key: SignedPreKey,
    retired_signed_pre_keys: Vec<SignedPreKey>,
    pre_keys: BTreeMap<u32, OneTimePreKey>,
    /// Next pre-key id to issue; never reused, so a consumed id can never
    /// come back with different key material.
    next_pre_key_id: u32,
    sessions: HashMap<String, SessionRecord>,
    identities: HashMap<String, String>,
    persister: Option<FileStore>,
}

impl IdentityStore {
    /// Generate a fresh identity for `account`.
    ///
    /// The result is persisted through `persister` (when given) before
    /// this returns.
    pub fn generate(account: &str, persister: Option<FileStore>) -> Result<Self> {
        let identity = IdentityKeyPair::generate();
        let signed_pre_key = SignedPreKey::generate(&identity);

        let mut pre_keys = BTreeMap::new();
        let start = random_key_id();
        for offset in 0..PRE_KEY_TARGET as u32 {
            let id = start.wrapping_add(offset).max(1);
            pre_keys.insert(id, OneTimePreKey { id, key_pair: DhKeyPair::generate() });
        }

        let store = Self {
            account: account.to_string(),
            device_id: random_device_id(),
            registration_id: random_registration_id(),
            identity,
            signed_pre_key,
            retired_signed_pre_keys: Vec::new(),
            pre_keys,
            next_pre_key_id: start.wrapping_add(PRE_KEY_TARGET as u32).max(1),
            sessions: HashMap::new(),
            identities: HashMap::new(),
            persister,
        };
        store.persist()?;
        Ok(store)
    }

    /// Open the store for `account`: restore the persisted snapshot when
    /// one exists, otherwise generate a fresh identity. The boolean is
    /// true when this was the account's first initialization.
    pub fn open(account: &str, persister: FileStore) -> Result<(Self, bool)> {
        match persister.load()? {
            Some(snapshot) => {
                let mut store = Self::restore(snapshot)?;
                store.persister = Some(persister);
                Ok((store, false))
            }
            None => Ok((Self::generate(account, Some(persister))?, true)),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn signed_pre_key(&self) -> &SignedPreKey {
        &self.signed_pre_key
    }

    /// Current or retired signed pre-key by id. Old private components are
    /// kept as long as an outstanding pre-key message could reference them.
    pub fn signed_pre_key_by_id(&self, id: u32) -> Option<&SignedPreKey> {
        if self.signed_pre_key.id == id {
            return Some(&self.signed_pre_key);
        }
        self.retired_signed_pre_keys.iter().find(|spk| spk.id == id)
    }

    /// Replace the current signed pre-key, retiring the old one
    pub fn rotate_signed_pre_key(&mut self) -> Result<()> {
        let fresh = SignedPreKey::generate(&self.identity);
        let old = std::mem::replace(&mut self.signed_pre_key, fresh);
        self.retired_signed_pre_keys.push(old);
        self.persist()
    }

    pub fn pool_size(&self) -> usize {
        self.pre_keys.len()
    }

    pub fn load_pre_key(&self, id: u32) -> Option<&OneTimePreKey> {
        self.pre_keys.get(&id)
    }

    /// Add a one-time pre-key to the pool (restores and tests)
    pub fn store_pre_key(&mut self, pre_key: OneTimePreKey) -> Result<()> {
        self.pre_keys.insert(pre_key.id, pre_key);
        self.persist()
    }

    /// Public halves of the one-time pre-key pool
    pub fn pre_key_publics(&self) -> Vec<(u32, Curve25519Public)> {
        self.pre_keys
            .values()
            .map(|pk| (pk.id, pk.key_pair.public()))
            .collect()
    }

    /// Remove a consumed one-time pre-key. Refills the pool to the target
    /// size when it drops below the minimum.
    pub fn remove_pre_key(&mut self, id: u32) -> Result<()> {
        if self.pre_keys.remove(&id).is_none() {
            return Err(OmemoError::UnknownPreKey(id));
        }
        if self.pre_keys.len() < PRE_KEY_MINIMUM {
            while self.pre_keys.len() < PRE_KEY_TARGET {
                let next = self.next_pre_key_id;
                self.next_pre_key_id = self.next_pre_key_id.wrapping_add(1).max(1);
                self.pre_keys
                    .insert(next, OneTimePreKey { id: next, key_pair: DhKeyPair::generate() });
            }
            debug!(pool = self.pre_keys.len(), "regenerated one-time pre-key pool");
        }
        self.persist()
    }

    /// The session record for a peer device, if one was established
    pub fn load_session(&self, address: &DeviceAddress) -> Option<SessionRecord> {
        self.sessions.get(&address.key()).cloned()
    }

    pub fn has_session(&self, address: &DeviceAddress) -> bool {
        self.sessions.contains_key(&address.key())
    }

    /// Write back a session record.
    ///
    /// Empty or structurally invalid records are dropped silently: some
    /// engines emit spurious empty writes, and persisting them would
    /// corrupt future loads.
    pub fn store_session(&mut self, address: &DeviceAddress, record: SessionRecord) -> Result<()> {
        if record.is_empty() {
            debug!(address = %address, "ignoring empty session write");
            return Ok(());
        }
        if let SessionRecord::Text(text) = &record {
            if serde_json::from_str::<serde_json::Value>(text).is_err() {
                debug!(address = %address, "ignoring structurally invalid session write");
                return Ok(());
            }
        }
        self.sessions.insert(address.key(), record);
        self.persist()
    }

    /// Remove every session for a peer JID
    pub fn remove_peer(&mut self, jid: &str) -> Result<()> {
        let prefix = format!("{jid}.");
        self.sessions.retain(|k, _| !k.starts_with(&prefix));
        self.identities.retain(|k, _| !k.starts_with(&prefix));
        self.persist()
    }

    /// Blind-trust policy: any identity key is accepted, in either
    /// direction. The key is still recorded so changes can be observed.
    pub fn is_trusted_identity(
        &mut self,
        address: &DeviceAddress,
        key: &IdentityPublicKey,
        _direction: Direction,
    ) -> Result<bool> {
        self.save_identity(address, key)?;
        Ok(true)
    }

    /// Record a peer identity key. Returns true iff it differed from the
    /// previously stored key.
    pub fn save_identity(&mut self, address: &DeviceAddress, key: &IdentityPublicKey) -> Result<bool> {
        let encoded = key.to_base64();
        let changed = match self.identities.insert(address.key(), encoded.clone()) {
            Some(previous) => {
                if previous != encoded {
                    warn!(address = %address, "peer identity key changed");
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        self.persist()?;
        Ok(changed)
    }

    pub fn known_identity(&self, address: &DeviceAddress) -> Option<String> {
        self.identities.get(&address.key()).cloned()
    }

    /// Public bundle material for publication on our bundle node
    pub fn local_bundle(&self) -> LocalBundle {
        LocalBundle {
            identity_key: self.identity.public().to_base64(),
            signed_pre_key_id: self.signed_pre_key.id,
            signed_pre_key_public: self.signed_pre_key.key_pair.public().to_base64(),
            signed_pre_key_signature: BASE64.encode(&self.signed_pre_key.signature),
            pre_keys: self
                .pre_keys
                .values()
                .map(|pk| (pk.id, pk.key_pair.public().to_base64()))
                .collect(),
        }
    }

    /// Serializable image of the complete store
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            account: self.account.clone(),
            device_id: self.device_id,
            registration_id: self.registration_id,
            identity_seed: BASE64.encode(self.identity.seed_bytes()),
            identity_public: self.identity.public().to_base64(),
            signed_pre_key: export_signed(&self.signed_pre_key),
            retired_signed_pre_keys: self.retired_signed_pre_keys.iter().map(export_signed).collect(),
            pre_keys: self
                .pre_keys
                .values()
                .map(|pk| PreKeySnapshot {
                    id: pk.id,
                    public: pk.key_pair.public().to_base64(),
                    private: BASE64.encode(pk.key_pair.secret_bytes()),
                })
                .collect(),
            next_pre_key_id: self.next_pre_key_id,
            sessions: self.sessions.clone(),
            identities: self.identities.clone(),
        }
    }

    /// Rebuild a store from its snapshot. Zero-length session records are
    /// dropped so the session engine never decodes empty state.
    pub fn restore(snapshot: Snapshot) -> Result<Self> {
        let seed_bytes = BASE64.decode(&snapshot.identity_seed)?;
        let seed: [u8; 32] = seed_bytes
            .as_slice()
            .try_into()
            .map_err(|_| OmemoError::InvalidKey("bad identity seed length".to_string()))?;
        let identity = IdentityKeyPair::from_seed(seed);

        let mut pre_keys = BTreeMap::new();
        for pk in &snapshot.pre_keys {
            pre_keys.insert(pk.id, OneTimePreKey { id: pk.id, key_pair: import_pair(&pk.private)? });
        }

        let sessions = snapshot
            .sessions
            .into_iter()
            .filter(|(_, record)| !record.is_empty())
            .collect();

        // Older snapshots predate the counter; resume past every key ever
        // listed so ids are still never reused.
        let next_pre_key_id = if snapshot.next_pre_key_id != 0 {
            snapshot.next_pre_key_id
        } else {
            pre_keys
                .keys()
                .max()
                .copied()
                .unwrap_or_else(random_key_id)
                .wrapping_add(1)
                .max(1)
        };

        Ok(Self {
            account: snapshot.account,
            device_id: snapshot.device_id,
            registration_id: snapshot.registration_id,
            identity,
            signed_pre_key: import_signed(&snapshot.signed_pre_key)?,
            retired_signed_pre_keys: snapshot
                .retired_signed_pre_keys
                .iter()
                .map(import_signed)
                .collect::<Result<Vec<_>>>()?,
            pre_keys,
            next_pre_key_id,
            sessions,
            identities: snapshot.identities,
            persister: None,
        })
    }

    /// Write the snapshot through the persister, when one is attached.
    /// In-memory stores (tests) skip this.
    fn persist(&self) -> Result<()> {
        if let Some(persister) = &self.persister {
            persister.save(&self.snapshot())?;
        }
        Ok(())
    }
}

fn export_signed(spk: &SignedPreKey) -> SignedPreKeySnapshot {
    SignedPreKeySnapshot {
        id: spk.id,
        public: spk.key_pair.public().to_base64(),
        private: BASE64.encode(spk.key_pair.secret_bytes()),
        signature: BASE64.encode(&spk.signature),
        created_at: spk.created_at,
    }
}

fn import_signed(snapshot: &SignedPreKeySnapshot) -> Result<SignedPreKey> {
    Ok(SignedPreKey {
        id: snapshot.id,
        key_pair: import_pair(&snapshot.private)?,
        signature: BASE64.decode(&snapshot.signature)?,
        created_at: snapshot.created_at,
    })
}

fn import_pair(private_b64: &str) -> Result<DhKeyPair> {
    let bytes = BASE64.decode(private_b64)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| OmemoError::InvalidKey("bad secret key length".to_string()))?;
    Ok(DhKeyPair::from_bytes(&arr))
}
