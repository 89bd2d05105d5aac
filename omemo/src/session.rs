//! Per-device Signal sessions
//!
//! X3DH key agreement against a published bundle, plus the session cipher
//! that encrypts and decrypts 32-byte key material for one peer device.
//! Two wire variants exist: pre-key messages carry the key-agreement
//! material and establish the session on the receiving side; regular
//! messages ride the established ratchet. Every envelope is sealed under
//! associated data binding both identity keys, so a ciphertext cannot be
//! replayed between sessions.

use rand::{rngs::OsRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cipher::derive_key;
use crate::error::{OmemoError, Result};
use crate::identity::{Direction, IdentityStore};
use crate::keys::{Curve25519Public, DhKeyPair, IdentityKeyPair, IdentityPublicKey};
use crate::persistence::SessionRecord;
use crate::ratchet::RatchetState;

/// Leading byte of a serialized pre-key message (version nibbles 3/3)
pub const PREKEY_MESSAGE_VERSION: u8 = 0x33;

/// Leading byte of a serialized regular message
pub const RATCHET_MESSAGE_VERSION: u8 = 0x32;

/// One peer device, addressed by bare JID and device id
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub jid: String,
    pub device_id: u32,
}

impl DeviceAddress {
    /// Address a device. The JID is normalized to its bare form.
    pub fn new(jid: &str, device_id: u32) -> Self {
        let bare = match jid.find('/') {
            Some(pos) => &jid[..pos],
            None => jid,
        };
        Self { jid: bare.to_lowercase(), device_id }
    }

    /// Storage key, `"peer-jid.device-id"`
    pub fn key(&self) -> String {
        format!("{}.{}", self.jid, self.device_id)
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.jid, self.device_id)
    }
}

/// Which wire variant a ciphertext is (or is assumed to be)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    PreKey,
    Regular,
}

impl MessageKind {
    /// Variant hinted by a ciphertext's leading version byte: a low nibble
    /// of 3 makes the pre-key variant probable.
    pub fn from_leading_byte(bytes: &[u8]) -> Self {
        match bytes.first() {
            Some(b) if b & 0x0F == 3 => MessageKind::PreKey,
            _ => MessageKind::Regular,
        }
    }

    fn other(self) -> Self {
        match self {
            MessageKind::PreKey => MessageKind::Regular,
            MessageKind::Regular => MessageKind::PreKey,
        }
    }
}

/// A peer's published bundle, as consumed by session building
#[derive(Clone)]
pub struct PreKeyBundle {
    pub identity_key: IdentityPublicKey,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: Curve25519Public,
    pub signed_pre_key_signature: Vec<u8>,
    /// (id, public) pairs; one is chosen uniformly at random per build
    pub pre_keys: Vec<(u32, Curve25519Public)>,
}

/// The ratchet step as it travels inside a `<key>` element: the sender's
/// current ratchet key, the chain counters, and the sealed key material.
#[derive(Serialize, Deserialize)]
struct SealedEnvelope {
    ratchet_key: Curve25519Public,
    counter: u32,
    previous_counter: u32,
    #[serde(with = "b64_bytes")]
    ciphertext: Vec<u8>,
}

/// Pre-key message envelope: key-agreement material plus the first
/// sealed ratchet step.
#[derive(Serialize, Deserialize)]
struct PreKeyEnvelope {
    registration_id: u32,
    identity_key: String,
    ephemeral_key: String,
    signed_pre_key_id: u32,
    pre_key_id: u32,
    message: SealedEnvelope,
}

/// Material retained while the outgoing session is in the pre-key phase
#[derive(Serialize, Deserialize, Clone)]
struct PendingPreKey {
    ephemeral_key: String,
    signed_pre_key_id: u32,
    pre_key_id: u32,
}

/// Serialized per-device session state
#[derive(Serialize, Deserialize)]
pub struct SessionState {
    /// The peer's identity key, bound into every envelope's AAD
    peer_identity: String,
    ratchet: RatchetState,
    pending: Option<PendingPreKey>,
}

impl SessionState {
    /// Decode a stored record, tolerating both textual and binary shapes
    fn decode(record: &SessionRecord) -> Result<Self> {
        serde_json::from_slice(record.as_bytes())
            .map_err(|e| OmemoError::SessionCorrupted(e.to_string()))
    }

    fn encode(&self) -> Result<SessionRecord> {
        Ok(SessionRecord::Text(serde_json::to_string(self)?))
    }
}

/// Session cipher for one (peer JID, peer device) pair.
///
/// Operations on one address must be serialized by the caller; the ratchet
/// is stateful and every step is written back through the store.
pub struct SessionCipher<'a> {
    store: &'a mut IdentityStore,
    address: DeviceAddress,
}

impl<'a> SessionCipher<'a> {
    pub fn new(store: &'a mut IdentityStore, address: DeviceAddress) -> Self {
        Self { store, address }
    }

    /// Initialize an outbound session from a fetched bundle.
    ///
    /// Consumes the bundle: verifies the signed pre-key signature, draws
    /// one one-time pre-key uniformly at random, runs X3DH as initiator
    /// and writes the pre-key-phase session.
    pub fn build_session(&mut self, bundle: &PreKeyBundle) -> Result<()> {
        bundle
            .identity_key
            .verify(bundle.signed_pre_key.as_bytes(), &bundle.signed_pre_key_signature)?;

        let (pre_key_id, pre_key_public) = bundle
            .pre_keys
            .choose(&mut OsRng)
            .ok_or(OmemoError::EmptyBundle)?;

        let ephemeral = DhKeyPair::generate();
        let shared_secret = x3dh_initiator(
            self.store.identity(),
            &ephemeral,
            &bundle.identity_key,
            &bundle.signed_pre_key,
            pre_key_public,
        )?;

        let state = SessionState {
            peer_identity: bundle.identity_key.to_base64(),
            ratchet: RatchetState::initiator(shared_secret, bundle.signed_pre_key.clone()),
            pending: Some(PendingPreKey {
                ephemeral_key: ephemeral.public().to_base64(),
                signed_pre_key_id: bundle.signed_pre_key_id,
                pre_key_id: *pre_key_id,
            }),
        };

        self.store
            .is_trusted_identity(&self.address, &bundle.identity_key, Direction::Sending)?;
        let record = state.encode()?;
        self.store.store_session(&self.address, record)?;
        debug!(address = %self.address, "built outbound session");
        Ok(())
    }

    /// Encrypt 32-byte key material for this device.
    ///
    /// Returns the wire bytes and the emitted variant: pre-key while the
    /// outgoing session has not yet seen a reply, regular afterwards.
    pub fn encrypt(&mut self, key_material: &[u8]) -> Result<(Vec<u8>, MessageKind)> {
        let record = self
            .store
            .load_session(&self.address)
            .ok_or_else(|| OmemoError::NoSession(self.address.to_string()))?;
        let mut state = SessionState::decode(&record)?;

        let ours = self.store.identity().public();
        let theirs = IdentityPublicKey::from_base64(&state.peer_identity)?;
        let aad = envelope_aad(&ours, &theirs);

        let step = state.ratchet.seal(key_material, &aad)?;
        let message = SealedEnvelope {
            ratchet_key: step.ratchet_key,
            counter: step.counter,
            previous_counter: step.previous_counter,
            ciphertext: step.ciphertext,
        };

        let (bytes, kind) = match &state.pending {
            Some(pending) => {
                let envelope = PreKeyEnvelope {
                    registration_id: self.store.registration_id(),
                    identity_key: ours.to_base64(),
                    ephemeral_key: pending.ephemeral_key.clone(),
                    signed_pre_key_id: pending.signed_pre_key_id,
                    pre_key_id: pending.pre_key_id,
                    message,
                };
                let mut bytes = vec![PREKEY_MESSAGE_VERSION];
                bytes.extend_from_slice(&serde_json::to_vec(&envelope)?);
                (bytes, MessageKind::PreKey)
            }
            None => {
                let mut bytes = vec![RATCHET_MESSAGE_VERSION];
                bytes.extend_from_slice(&serde_json::to_vec(&message)?);
                (bytes, MessageKind::Regular)
            }
        };

        let record = state.encode()?;
        self.store.store_session(&self.address, record)?;
        Ok((bytes, kind))
    }

    /// Decrypt wire bytes back into key material.
    ///
    /// Tries the hinted variant first and falls back to the other; when
    /// both fail the typed signal failure is returned.
    pub fn decrypt(&mut self, bytes: &[u8], hint: MessageKind) -> Result<Vec<u8>> {
        if bytes.len() < 2 {
            return Err(OmemoError::SignalFailure(self.address.to_string()));
        }

        match self.decrypt_variant(bytes, hint) {
            Ok(plaintext) => Ok(plaintext),
            Err(first_err) => {
                debug!(address = %self.address, error = %first_err, "hinted variant failed, trying the other");
                self.decrypt_variant(bytes, hint.other())
                    .map_err(|_| OmemoError::SignalFailure(self.address.to_string()))
            }
        }
    }

    fn decrypt_variant(&mut self, bytes: &[u8], kind: MessageKind) -> Result<Vec<u8>> {
        let body = &bytes[1..];
        match kind {
            MessageKind::PreKey => {
                let envelope: PreKeyEnvelope = serde_json::from_slice(body)
                    .map_err(|e| OmemoError::Serialization(e.to_string()))?;
                self.decrypt_pre_key(envelope)
            }
            MessageKind::Regular => {
                let message: SealedEnvelope = serde_json::from_slice(body)
                    .map_err(|e| OmemoError::Serialization(e.to_string()))?;
                self.decrypt_regular(&message)
            }
        }
    }

    fn decrypt_pre_key(&mut self, envelope: PreKeyEnvelope) -> Result<Vec<u8>> {
        // A session may already exist: the peer resends pre-key messages
        // until our first reply arrives. Prefer the established ratchet.
        if let Some(record) = self.store.load_session(&self.address) {
            if let Ok(mut state) = SessionState::decode(&record) {
                if let Ok(plaintext) = self.open_with(&mut state, &envelope.message) {
                    let record = state.encode()?;
                    self.store.store_session(&self.address, record)?;
                    return Ok(plaintext);
                }
            }
        }

        let their_identity = IdentityPublicKey::from_base64(&envelope.identity_key)?;
        let their_ephemeral = Curve25519Public::from_base64(&envelope.ephemeral_key)?;

        let signed_pre_key = self
            .store
            .signed_pre_key_by_id(envelope.signed_pre_key_id)
            .ok_or(OmemoError::UnknownSignedPreKey(envelope.signed_pre_key_id))?
            .key_pair
            .clone();
        let one_time = self
            .store
            .load_pre_key(envelope.pre_key_id)
            .ok_or(OmemoError::UnknownPreKey(envelope.pre_key_id))?
            .key_pair
            .clone();

        let shared_secret = x3dh_responder(
            self.store.identity(),
            &signed_pre_key,
            &one_time,
            &their_identity,
            &their_ephemeral,
        )?;

        let mut state = SessionState {
            peer_identity: their_identity.to_base64(),
            ratchet: RatchetState::responder(shared_secret, signed_pre_key),
            pending: None,
        };
        let plaintext = self.open_with(&mut state, &envelope.message)?;

        // Session established: record the identity, consume the one-time
        // pre-key (refilling the pool if needed), then persist the session.
        self.store
            .is_trusted_identity(&self.address, &their_identity, Direction::Receiving)?;
        self.store.remove_pre_key(envelope.pre_key_id)?;
        let record = state.encode()?;
        self.store.store_session(&self.address, record)?;
        debug!(address = %self.address, "built inbound session from pre-key message");
        Ok(plaintext)
    }

    fn decrypt_regular(&mut self, message: &SealedEnvelope) -> Result<Vec<u8>> {
        let record = self
            .store
            .load_session(&self.address)
            .ok_or_else(|| OmemoError::NoSession(self.address.to_string()))?;
        let mut state = SessionState::decode(&record)?;

        let plaintext = self.open_with(&mut state, message)?;

        // Any regular message proves the peer holds the session; stop
        // emitting pre-key envelopes.
        state.pending = None;
        let record = state.encode()?;
        self.store.store_session(&self.address, record)?;
        Ok(plaintext)
    }

    /// Open one sealed envelope against a session, with the AAD oriented
    /// for reception (the peer sealed it, we receive it).
    fn open_with(&self, state: &mut SessionState, message: &SealedEnvelope) -> Result<Vec<u8>> {
        let theirs = IdentityPublicKey::from_base64(&state.peer_identity)?;
        let aad = envelope_aad(&theirs, &self.store.identity().public());
        state.ratchet.open(
            &message.ratchet_key,
            message.counter,
            message.previous_counter,
            &message.ciphertext,
            &aad,
        )
    }
}

/// Associated data binding an envelope to its sender and recipient
/// identity keys, in sending order.
fn envelope_aad(sender: &IdentityPublicKey, recipient: &IdentityPublicKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(64);
    aad.extend_from_slice(&sender.0);
    aad.extend_from_slice(&recipient.0);
    aad
}

/// X3DH as initiator:
/// DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B),
/// DH3 = DH(EK_A, SPK_B), DH4 = DH(EK_A, OPK_B)
fn x3dh_initiator(
    our_identity: &IdentityKeyPair,
    our_ephemeral: &DhKeyPair,
    their_identity: &IdentityPublicKey,
    their_signed_pre_key: &Curve25519Public,
    their_one_time_pre_key: &Curve25519Public,
) -> Result<[u8; 32]> {
    let their_identity_dh = their_identity.to_curve()?;

    let dh1 = our_identity.agree(their_signed_pre_key);
    let dh2 = our_ephemeral.agree(&their_identity_dh);
    let dh3 = our_ephemeral.agree(their_signed_pre_key);
    let dh4 = our_ephemeral.agree(their_one_time_pre_key);

    Ok(derive_shared(&[&dh1, &dh2, &dh3, &dh4]))
}

/// X3DH as responder, mirroring the initiator's legs
fn x3dh_responder(
    our_identity: &IdentityKeyPair,
    our_signed_pre_key: &DhKeyPair,
    our_one_time_pre_key: &DhKeyPair,
    their_identity: &IdentityPublicKey,
    their_ephemeral: &Curve25519Public,
) -> Result<[u8; 32]> {
    let their_identity_dh = their_identity.to_curve()?;

    let dh1 = our_signed_pre_key.agree(&their_identity_dh);
    let dh2 = our_identity.agree(their_ephemeral);
    let dh3 = our_signed_pre_key.agree(their_ephemeral);
    let dh4 = our_one_time_pre_key.agree(their_ephemeral);

    Ok(derive_shared(&[&dh1, &dh2, &dh3, &dh4]))
}

fn derive_shared(agreements: &[&[u8; 32]]) -> [u8; 32] {
    let mut concat = Vec::with_capacity(agreements.len() * 32);
    for agreement in agreements {
        concat.extend_from_slice(*agreement);
    }
    derive_key(&concat, &[0u8; 32], b"omemo-x3dh")
}

/// Build the crypto-level bundle view for our own published material.
/// Used when encrypting to our own device id (room self-echo).
pub fn own_bundle(store: &IdentityStore) -> PreKeyBundle {
    let spk = store.signed_pre_key();
    PreKeyBundle {
        identity_key: store.identity().public(),
        signed_pre_key_id: spk.id,
        signed_pre_key: spk.key_pair.public(),
        signed_pre_key_signature: spk.signature.clone(),
        pre_keys: store.pre_key_publics(),
    }
}

mod b64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityStore;

    fn store(account: &str) -> IdentityStore {
        IdentityStore::generate(account, None).unwrap()
    }

    fn bundle_for(peer: &IdentityStore) -> PreKeyBundle {
        own_bundle(peer)
    }

    #[test]
    fn test_x3dh_agreement() {
        let alice_identity = IdentityKeyPair::generate();
        let alice_ephemeral = DhKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_spk = DhKeyPair::generate();
        let bob_otpk = DhKeyPair::generate();

        let alice_secret = x3dh_initiator(
            &alice_identity,
            &alice_ephemeral,
            &bob_identity.public(),
            &bob_spk.public(),
            &bob_otpk.public(),
        )
        .unwrap();

        let bob_secret = x3dh_responder(
            &bob_identity,
            &bob_spk,
            &bob_otpk,
            &alice_identity.public(),
            &alice_ephemeral.public(),
        )
        .unwrap();

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn test_session_establishment_and_roundtrip() {
        let mut alice = store("alice@example.org");
        let mut bob = store("bob@example.org");

        let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());
        let alice_addr = DeviceAddress::new("alice@example.org", alice.device_id());

        let key_material = [7u8; 32];

        let mut cipher = SessionCipher::new(&mut alice, bob_addr.clone());
        cipher.build_session(&bundle_for(&bob)).unwrap();
        let (bytes, kind) = cipher.encrypt(&key_material).unwrap();
        assert_eq!(kind, MessageKind::PreKey);
        assert_eq!(MessageKind::from_leading_byte(&bytes), MessageKind::PreKey);

        let mut bob_cipher = SessionCipher::new(&mut bob, alice_addr.clone());
        let recovered = bob_cipher
            .decrypt(&bytes, MessageKind::from_leading_byte(&bytes))
            .unwrap();
        assert_eq!(recovered, key_material);
        assert!(bob.has_session(&alice_addr));
    }

    #[test]
    fn test_regular_after_reply() {
        let mut alice = store("alice@example.org");
        let mut bob = store("bob@example.org");

        let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());
        let alice_addr = DeviceAddress::new("alice@example.org", alice.device_id());

        // Alice -> Bob (pre-key)
        let mut cipher = SessionCipher::new(&mut alice, bob_addr.clone());
        cipher.build_session(&bundle_for(&bob)).unwrap();
        let (bytes, _) = cipher.encrypt(&[1u8; 32]).unwrap();
        SessionCipher::new(&mut bob, alice_addr.clone())
            .decrypt(&bytes, MessageKind::PreKey)
            .unwrap();

        // Bob -> Alice reply (regular already on Bob's side)
        let (reply, kind) = SessionCipher::new(&mut bob, alice_addr.clone())
            .encrypt(&[2u8; 32])
            .unwrap();
        assert_eq!(kind, MessageKind::Regular);
        let recovered = SessionCipher::new(&mut alice, bob_addr.clone())
            .decrypt(&reply, MessageKind::from_leading_byte(&reply))
            .unwrap();
        assert_eq!(recovered, [2u8; 32]);

        // Alice's next message leaves the pre-key phase.
        let (bytes, kind) = SessionCipher::new(&mut alice, bob_addr.clone())
            .encrypt(&[3u8; 32])
            .unwrap();
        assert_eq!(kind, MessageKind::Regular);
        let recovered = SessionCipher::new(&mut bob, alice_addr)
            .decrypt(&bytes, MessageKind::Regular)
            .unwrap();
        assert_eq!(recovered, [3u8; 32]);
    }

    #[test]
    fn test_pre_key_consumed_once() {
        let mut alice = store("alice@example.org");
        let mut carol = store("carol@example.org");
        let mut bob = store("bob@example.org");

        let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());
        let pool_before = bob.pool_size();

        // Two peers each establish a session with Bob.
        let mut cipher = SessionCipher::new(&mut alice, bob_addr.clone());
        cipher.build_session(&bundle_for(&bob)).unwrap();
        let (a_bytes, _) = cipher.encrypt(&[1u8; 32]).unwrap();

        let mut cipher = SessionCipher::new(&mut carol, bob_addr.clone());
        cipher.build_session(&bundle_for(&bob)).unwrap();
        let (c_bytes, _) = cipher.encrypt(&[2u8; 32]).unwrap();

        let alice_addr = DeviceAddress::new("alice@example.org", alice.device_id());
        let carol_addr = DeviceAddress::new("carol@example.org", carol.device_id());

        SessionCipher::new(&mut bob, alice_addr).decrypt(&a_bytes, MessageKind::PreKey).unwrap();
        SessionCipher::new(&mut bob, carol_addr).decrypt(&c_bytes, MessageKind::PreKey).unwrap();

        // Pool shrank (or was refilled past the target); the consumed ids
        // are gone either way.
        assert!(bob.pool_size() >= pool_before - 2);
    }

    #[test]
    fn test_decrypt_garbage_is_signal_failure() {
        let mut bob = store("bob@example.org");
        let addr = DeviceAddress::new("alice@example.org", 1);
        let result = SessionCipher::new(&mut bob, addr).decrypt(&[0x32, 0x7b, 0x7d], MessageKind::Regular);
        assert!(matches!(result, Err(OmemoError::SignalFailure(_))));
    }

    #[test]
    fn test_wrong_hint_falls_back() {
        let mut alice = store("alice@example.org");
        let mut bob = store("bob@example.org");

        let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());
        let alice_addr = DeviceAddress::new("alice@example.org", alice.device_id());

        let mut cipher = SessionCipher::new(&mut alice, bob_addr);
        cipher.build_session(&bundle_for(&bob)).unwrap();
        let (bytes, _) = cipher.encrypt(&[9u8; 32]).unwrap();

        // Deliberately wrong hint: the other variant is tried.
        let recovered = SessionCipher::new(&mut bob, alice_addr)
            .decrypt(&bytes, MessageKind::Regular)
            .unwrap();
        assert_eq!(recovered, [9u8; 32]);
    }

    #[test]
    fn test_envelope_bound_to_identities() {
        // A pre-key envelope for Bob must not decrypt at a device that
        // holds a different identity, even with Bob's key material.
        let mut alice = store("alice@example.org");
        let mut bob = store("bob@example.org");

        let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());
        let mut cipher = SessionCipher::new(&mut alice, bob_addr);
        cipher.build_session(&bundle_for(&bob)).unwrap();
        let (bytes, _) = cipher.encrypt(&[6u8; 32]).unwrap();

        // Splice Bob's session material into a store with another identity.
        let mut mallory = store("mallory@example.org");
        let mallory_snapshot = mallory.snapshot();
        let mut stolen = bob.snapshot();
        stolen.identity_seed = mallory_snapshot.identity_seed;
        stolen.identity_public = mallory_snapshot.identity_public;
        let mut spliced = IdentityStore::restore(stolen).unwrap();

        let alice_addr = DeviceAddress::new("alice@example.org", alice.device_id());
        let result = SessionCipher::new(&mut spliced, alice_addr).decrypt(&bytes, MessageKind::PreKey);
        assert!(result.is_err());
    }

    #[test]
    fn test_session_survives_snapshot_restore() {
        let mut alice = store("alice@example.org");
        let mut bob = store("bob@example.org");

        let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());
        let alice_addr = DeviceAddress::new("alice@example.org", alice.device_id());

        let mut cipher = SessionCipher::new(&mut alice, bob_addr.clone());
        cipher.build_session(&bundle_for(&bob)).unwrap();
        let (bytes, _) = cipher.encrypt(&[4u8; 32]).unwrap();
        SessionCipher::new(&mut bob, alice_addr.clone())
            .decrypt(&bytes, MessageKind::PreKey)
            .unwrap();

        // Restore both stores from snapshots mid-conversation.
        let mut alice = IdentityStore::restore(alice.snapshot()).unwrap();
        let mut bob = IdentityStore::restore(bob.snapshot()).unwrap();

        let (bytes, _) = SessionCipher::new(&mut bob, alice_addr).encrypt(&[5u8; 32]).unwrap();
        let recovered = SessionCipher::new(&mut alice, bob_addr)
            .decrypt(&bytes, MessageKind::from_leading_byte(&bytes))
            .unwrap();
        assert_eq!(recovered, [5u8; 32]);
    }
}
