//! Bundle manager
//!
//! Publishes our key bundle on the device-specific bundle node and fetches
//! peer bundles on demand. Bundles are never cached: a fresh fetch per
//! session build draws the random one-time pre-key from the currently
//! advertised set.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, info};

use omemo::{Curve25519Public, IdentityPublicKey, LocalBundle, PreKeyBundle};
use stanza::ns;
use stanza::omemo::{DeviceBundle, PreKeyEntry};
use stanza::pubsub::PublishOptions;

use crate::error::{BridgeError, Result};
use crate::jid;
use crate::pubsub::PubSubClient;

/// Manager for bundle publication and retrieval
pub struct BundleManager {
    pubsub: Arc<PubSubClient>,
}

impl BundleManager {
    pub fn new(pubsub: Arc<PubSubClient>) -> Self {
        Self { pubsub }
    }

    /// Publish our bundle on the node derived from our device id
    pub async fn publish_own(&self, bundle: &LocalBundle, device_id: u32) -> Result<()> {
        let wire = to_wire(bundle)?;
        let node = ns::bundle_node(device_id);
        info!(node = %node, pre_keys = wire.pre_keys.len(), "publishing key bundle");
        self.pubsub
            .publish(
                &node,
                "current",
                wire.to_element(),
                Some(&PublishOptions::open_persistent_single()),
            )
            .await
    }

    /// Fetch one peer device's bundle, trying the legacy node first and
    /// the current-namespace node second. Returns None when neither node
    /// has a parseable bundle.
    pub async fn fetch(&self, peer: &str, device_id: u32) -> Result<Option<DeviceBundle>> {
        let peer = jid::bare(peer);
        for node in [
            ns::bundle_node(device_id),
            format!("{}:{device_id}", ns::OMEMO_2_BUNDLES_PREFIX),
        ] {
            let items = self.pubsub.fetch(peer, &node, None).await?;
            for (_, payload) in items {
                if let Ok(bundle) = DeviceBundle::parse(&payload) {
                    debug!(peer = %peer, device_id, node = %node, "fetched bundle");
                    return Ok(Some(bundle));
                }
            }
        }
        Ok(None)
    }
}

/// Convert our store's bundle material into its wire form
fn to_wire(bundle: &LocalBundle) -> Result<DeviceBundle> {
    let decode = |field: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|_| BridgeError::Transport(format!("undecodable local bundle field {field}")))
    };
    Ok(DeviceBundle {
        identity_key: decode("identity_key", &bundle.identity_key)?,
        signed_pre_key_id: bundle.signed_pre_key_id,
        signed_pre_key_public: decode("signed_pre_key_public", &bundle.signed_pre_key_public)?,
        signed_pre_key_signature: decode("signed_pre_key_signature", &bundle.signed_pre_key_signature)?,
        pre_keys: bundle
            .pre_keys
            .iter()
            .map(|(id, public)| Ok(PreKeyEntry { id: *id, public: decode("pre_key", public)? }))
            .collect::<Result<Vec<_>>>()?,
    })
}

/// Convert a fetched wire bundle into the crypto-level view the session
/// engine consumes
pub fn to_crypto(wire: &DeviceBundle) -> Result<PreKeyBundle> {
    let signed_pre_key =
        Curve25519Public::from_bytes(&wire.signed_pre_key_public).map_err(BridgeError::Omemo)?;

    let mut pre_keys = Vec::with_capacity(wire.pre_keys.len());
    for entry in &wire.pre_keys {
        if let Ok(public) = Curve25519Public::from_bytes(&entry.public) {
            pre_keys.push((entry.id, public));
        }
    }

    Ok(PreKeyBundle {
        identity_key: IdentityPublicKey::from_bytes(&wire.identity_key).map_err(BridgeError::Omemo)?,
        signed_pre_key_id: wire.signed_pre_key_id,
        signed_pre_key,
        signed_pre_key_signature: wire.signed_pre_key_signature.clone(),
        pre_keys,
    })
}
