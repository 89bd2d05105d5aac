//! Ratchet state for one OMEMO device session
//!
//! Message keys come off per-direction chains; every new remote ratchet
//! key folds a fresh agreement into the root key and starts both chains
//! over. The session layer owns the wire envelope and passes the
//! identity-binding associated data in; this module only tracks key
//! state. Out-of-order messages are served from a bounded cache of
//! skipped message keys.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::cipher::{derive_key, MessageCipher};
use crate::error::{OmemoError, Result};
use crate::keys::{Curve25519Public, DhKeyPair};

/// Upper bound on cached skipped message keys per session
const MAX_CACHED_KEYS: usize = 1000;

/// Furthest a counter may run ahead of the receiving chain
const MAX_FORWARD_SKIP: u32 = 1000;

/// One direction's key chain. Each step yields a message key and
/// replaces the chain key, so spent keys are unrecoverable.
#[derive(Serialize, Deserialize, Clone)]
struct Chain {
    key: [u8; 32],
    index: u32,
}

impl Chain {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    fn take_message_key(&mut self) -> [u8; 32] {
        let message_key = derive_key(&self.key, &[], b"omemo-chain-msg");
        self.key = derive_key(&self.key, &[], b"omemo-chain-step");
        self.index += 1;
        message_key
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// A message key put aside for an out-of-order message
#[derive(Serialize, Deserialize, Clone)]
struct CachedKey {
    ratchet_key: Curve25519Public,
    counter: u32,
    message_key: [u8; 32],
}

impl Drop for CachedKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

/// The envelope fields produced by sealing one message; the session
/// layer serializes them into its wire format.
pub struct SealedStep {
    pub ratchet_key: Curve25519Public,
    pub counter: u32,
    pub previous_counter: u32,
    pub ciphertext: Vec<u8>,
}

/// Ratchet state for one (peer JID, peer device) session
#[derive(Serialize, Deserialize)]
pub struct RatchetState {
    dh_self: DhKeyPair,
    dh_remote: Option<Curve25519Public>,
    root_key: [u8; 32],
    sender_chain: Option<Chain>,
    receiver_chain: Option<Chain>,
    previous_counter: u32,
    cached_keys: Vec<CachedKey>,
}

impl RatchetState {
    /// Session initiator: ratchet against the base key from the peer's
    /// bundle (their signed pre-key) and open a sending chain at once.
    pub fn initiator(shared_secret: [u8; 32], remote_base: Curve25519Public) -> Self {
        let dh_self = DhKeyPair::generate();
        let (root_key, chain_key) = root_step(&shared_secret, &dh_self.agree(&remote_base));
        Self {
            dh_self,
            dh_remote: Some(remote_base),
            root_key,
            sender_chain: Some(Chain::new(chain_key)),
            receiver_chain: None,
            previous_counter: 0,
            cached_keys: Vec::new(),
        }
    }

    /// Session responder: holds the base key pair the initiator ratcheted
    /// against. Chains open on the first inbound message.
    pub fn responder(shared_secret: [u8; 32], base: DhKeyPair) -> Self {
        Self {
            dh_self: base,
            dh_remote: None,
            root_key: shared_secret,
            sender_chain: None,
            receiver_chain: None,
            previous_counter: 0,
            cached_keys: Vec::new(),
        }
    }

    /// Seal key material for the peer under the given associated data
    pub fn seal(&mut self, key_material: &[u8], aad: &[u8]) -> Result<SealedStep> {
        let chain = self
            .sender_chain
            .as_mut()
            .ok_or_else(|| OmemoError::SessionCorrupted("no sending chain".to_string()))?;

        let counter = chain.index;
        let message_key = chain.take_message_key();
        let ciphertext = MessageCipher::new(&message_key).encrypt(key_material, aad)?;

        Ok(SealedStep {
            ratchet_key: self.dh_self.public(),
            counter,
            previous_counter: self.previous_counter,
            ciphertext,
        })
    }

    /// Open a sealed step from the peer.
    ///
    /// The associated data must match what the sender sealed under, or
    /// the AEAD check fails.
    pub fn open(
        &mut self,
        ratchet_key: &Curve25519Public,
        counter: u32,
        previous_counter: u32,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        if let Some(message_key) = self.take_cached(ratchet_key, counter) {
            return MessageCipher::new(&message_key).decrypt(ciphertext, aad);
        }

        if self.dh_remote.as_ref() != Some(ratchet_key) {
            // Finish the chain the peer closed before rotating to the new
            // ratchet key, so its stragglers stay decryptable.
            self.cache_until(previous_counter)?;
            self.rotate(ratchet_key.clone());
        }

        self.cache_until(counter)?;

        let chain = self
            .receiver_chain
            .as_mut()
            .ok_or_else(|| OmemoError::SessionCorrupted("no receiving chain".to_string()))?;
        if chain.index != counter {
            // Behind the chain with no cached key: spent or evicted.
            return Err(OmemoError::OutOfOrder {
                expected: chain.index as u64,
                actual: counter as u64,
            });
        }

        let message_key = chain.take_message_key();
        MessageCipher::new(&message_key).decrypt(ciphertext, aad)
    }

    /// Fold a new remote ratchet key into the root: the receiving chain
    /// comes from our current key pair, then a fresh pair opens the next
    /// sending chain.
    fn rotate(&mut self, remote: Curve25519Public) {
        self.previous_counter = self.sender_chain.as_ref().map(|c| c.index).unwrap_or(0);

        let (root_key, receive_key) = root_step(&self.root_key, &self.dh_self.agree(&remote));
        let next_pair = DhKeyPair::generate();
        let (root_key, send_key) = root_step(&root_key, &next_pair.agree(&remote));

        self.root_key = root_key;
        self.receiver_chain = Some(Chain::new(receive_key));
        self.sender_chain = Some(Chain::new(send_key));
        self.dh_self = next_pair;
        self.dh_remote = Some(remote);
    }

    /// Advance the receiving chain up to `target`, caching every skipped
    /// message key for later out-of-order delivery.
    fn cache_until(&mut self, target: u32) -> Result<()> {
        let Some(remote) = self.dh_remote.clone() else {
            return Ok(());
        };
        let Some(chain) = self.receiver_chain.as_mut() else {
            return Ok(());
        };

        if target > chain.index.saturating_add(MAX_FORWARD_SKIP) {
            return Err(OmemoError::OutOfOrder {
                expected: chain.index as u64,
                actual: target as u64,
            });
        }

        while chain.index < target {
            let counter = chain.index;
            let message_key = chain.take_message_key();
            self.cached_keys.push(CachedKey {
                ratchet_key: remote.clone(),
                counter,
                message_key,
            });
        }
        if self.cached_keys.len() > MAX_CACHED_KEYS {
            let excess = self.cached_keys.len() - MAX_CACHED_KEYS;
            self.cached_keys.drain(..excess);
        }
        Ok(())
    }

    fn take_cached(&mut self, ratchet_key: &Curve25519Public, counter: u32) -> Option<[u8; 32]> {
        let pos = self
            .cached_keys
            .iter()
            .position(|c| &c.ratchet_key == ratchet_key && c.counter == counter)?;
        Some(self.cached_keys.remove(pos).message_key)
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

/// One root-key step: HKDF the agreement under the current root into a
/// 64-byte block, split into the next root key and a chain key.
fn root_step(root_key: &[u8; 32], agreement: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), agreement);
    let mut okm = [0u8; 64];
    hkdf.expand(b"omemo-root-step", &mut okm)
        .expect("HKDF expand should not fail for 64 bytes");

    let mut next_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (next_root, chain_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AAD: &[u8] = b"identity-binding";

    fn pair() -> (RatchetState, RatchetState) {
        let shared_secret = [42u8; 32];
        let base = DhKeyPair::generate();

        let alice = RatchetState::initiator(shared_secret, base.public());
        let bob = RatchetState::responder(shared_secret, base);
        (alice, bob)
    }

    fn send(from: &mut RatchetState, to: &mut RatchetState, body: &[u8]) -> Vec<u8> {
        let step = from.seal(body, AAD).unwrap();
        to.open(&step.ratchet_key, step.counter, step.previous_counter, &step.ciphertext, AAD)
            .unwrap()
    }

    #[test]
    fn test_ping_pong() {
        let (mut alice, mut bob) = pair();

        assert_eq!(send(&mut alice, &mut bob, b"to bob"), b"to bob");
        assert_eq!(send(&mut bob, &mut alice, b"to alice"), b"to alice");

        for i in 0..4u8 {
            assert_eq!(send(&mut alice, &mut bob, &[i; 32]), [i; 32]);
        }
        assert_eq!(send(&mut bob, &mut alice, b"still fine"), b"still fine");
    }

    #[test]
    fn test_out_of_order_within_chain() {
        let (mut alice, mut bob) = pair();

        let first = alice.seal(b"first", AAD).unwrap();
        let second = alice.seal(b"second", AAD).unwrap();

        let opened = bob
            .open(&second.ratchet_key, second.counter, second.previous_counter, &second.ciphertext, AAD)
            .unwrap();
        assert_eq!(opened, b"second");

        // The skipped key was cached.
        let opened = bob
            .open(&first.ratchet_key, first.counter, first.previous_counter, &first.ciphertext, AAD)
            .unwrap();
        assert_eq!(opened, b"first");
    }

    #[test]
    fn test_straggler_across_rotation() {
        let (mut alice, mut bob) = pair();

        let straggler = alice.seal(b"late", AAD).unwrap();
        assert_eq!(send(&mut alice, &mut bob, b"on time"), b"on time");
        assert_eq!(send(&mut bob, &mut alice, b"reply"), b"reply");
        assert_eq!(send(&mut alice, &mut bob, b"new chain"), b"new chain");

        // The pre-rotation message still opens from the cache.
        let opened = bob
            .open(
                &straggler.ratchet_key,
                straggler.counter,
                straggler.previous_counter,
                &straggler.ciphertext,
                AAD,
            )
            .unwrap();
        assert_eq!(opened, b"late");
    }

    #[test]
    fn test_wrong_aad_rejected() {
        let (mut alice, mut bob) = pair();

        let step = alice.seal(b"bound", AAD).unwrap();
        let result = bob.open(
            &step.ratchet_key,
            step.counter,
            step.previous_counter,
            &step.ciphertext,
            b"other-identities",
        );
        assert!(matches!(result, Err(OmemoError::AeadFailure)));
    }

    #[test]
    fn test_replayed_counter_rejected() {
        let (mut alice, mut bob) = pair();

        let step = alice.seal(b"once", AAD).unwrap();
        bob.open(&step.ratchet_key, step.counter, step.previous_counter, &step.ciphertext, AAD)
            .unwrap();

        // The chain advanced past the counter and no key is cached.
        let replay = bob.open(&step.ratchet_key, step.counter, step.previous_counter, &step.ciphertext, AAD);
        assert!(matches!(replay, Err(OmemoError::OutOfOrder { .. })));
    }

    #[test]
    fn test_serde_roundtrip_mid_conversation() {
        let (mut alice, mut bob) = pair();

        assert_eq!(send(&mut alice, &mut bob, b"before"), b"before");

        let json = serde_json::to_string(&bob).unwrap();
        let mut restored: RatchetState = serde_json::from_str(&json).unwrap();

        let step = alice.seal(b"after", AAD).unwrap();
        let opened = restored
            .open(&step.ratchet_key, step.counter, step.previous_counter, &step.ciphertext, AAD)
            .unwrap();
        assert_eq!(opened, b"after");
    }

    #[test]
    fn test_excessive_skip_rejected() {
        let (mut alice, mut bob) = pair();

        // Establish the receiving chain first.
        assert_eq!(send(&mut alice, &mut bob, b"hello"), b"hello");

        let step = alice.seal(b"far away", AAD).unwrap();
        let result = bob.open(
            &step.ratchet_key,
            step.counter + MAX_FORWARD_SKIP + 1,
            step.previous_counter,
            &step.ciphertext,
            AAD,
        );
        assert!(matches!(result, Err(OmemoError::OutOfOrder { .. })));
    }
}
