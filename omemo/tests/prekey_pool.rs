//! Pre-key pool lifecycle across real inbound session builds

use std::collections::HashSet;

use omemo::{own_bundle, DeviceAddress, IdentityStore, MessageKind, SessionCipher, PRE_KEY_TARGET};

#[test]
fn pool_refills_after_inbound_consumption() {
    let mut bob = IdentityStore::generate("bob@example.org", None).unwrap();
    let mut alice = IdentityStore::generate("alice@example.org", None).unwrap();
    let mut carol = IdentityStore::generate("carol@example.org", None).unwrap();

    // Drain the pool down to 21 without crossing the refill threshold.
    let ids: Vec<u32> = own_bundle(&bob).pre_keys.iter().map(|(id, _)| *id).collect();
    for id in &ids[..PRE_KEY_TARGET - 21] {
        bob.remove_pre_key(*id).unwrap();
    }
    assert_eq!(bob.pool_size(), 21);
    let before: HashSet<u32> = own_bundle(&bob).pre_keys.iter().map(|(id, _)| *id).collect();

    let bob_addr = DeviceAddress::new("bob@example.org", bob.device_id());

    // First inbound pre-key message consumes one key; no refill yet.
    let mut cipher = SessionCipher::new(&mut alice, bob_addr.clone());
    cipher.build_session(&own_bundle(&bob)).unwrap();
    let (first, _) = cipher.encrypt(&[1u8; 32]).unwrap();
    SessionCipher::new(&mut bob, DeviceAddress::new("alice@example.org", alice.device_id()))
        .decrypt(&first, MessageKind::PreKey)
        .unwrap();
    assert_eq!(bob.pool_size(), 20);

    // The second session builds against the *current* bundle, so it draws
    // from the remaining keys and cannot collide with the consumed one.
    let mut cipher = SessionCipher::new(&mut carol, bob_addr);
    cipher.build_session(&own_bundle(&bob)).unwrap();
    let (second, _) = cipher.encrypt(&[2u8; 32]).unwrap();
    SessionCipher::new(&mut bob, DeviceAddress::new("carol@example.org", carol.device_id()))
        .decrypt(&second, MessageKind::PreKey)
        .unwrap();

    // Crossing below 20 regenerated the pool.
    assert!(bob.pool_size() >= PRE_KEY_TARGET);

    // Both consumed ids are gone for good.
    let after: HashSet<u32> = own_bundle(&bob).pre_keys.iter().map(|(id, _)| *id).collect();
    let consumed: Vec<u32> = before.difference(&after).copied().collect();
    assert_eq!(consumed.len(), 2);
    for id in consumed {
        assert!(bob.load_pre_key(id).is_none());
    }
}
