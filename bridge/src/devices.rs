//! Device-list manager
//!
//! Publishes our device id on the well-known device-list node, fetches
//! peer lists on demand and keeps a bounded, time-limited cache keyed by
//! (local account, bare peer JID). Push notifications overwrite cache
//! entries eagerly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use stanza::ns;
use stanza::omemo::{DeviceEntry, DeviceList};
use stanza::pubsub::{PubSubEvent, PublishOptions};

use crate::error::{BridgeError, Result};
use crate::jid;
use crate::pubsub::{PubSubClient, DISCOVERY_TIMEOUT};

/// Cache entries are authoritative for this long
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Entries older than this are treated as absent even on the stale path
pub const CACHE_HARD_EXPIRY: Duration = Duration::from_secs(15 * 60);

struct CachedList {
    devices: Vec<DeviceEntry>,
    fetched_at: Instant,
}

/// Manager for device-list publication, fetching and cache coherence
pub struct DeviceListManager {
    pubsub: Arc<PubSubClient>,
    account: String,
    device_id: u32,
    device_label: Option<String>,
    cache: DashMap<(String, String), CachedList>,
}

impl DeviceListManager {
    pub fn new(
        pubsub: Arc<PubSubClient>,
        account: &str,
        device_id: u32,
        device_label: Option<String>,
    ) -> Self {
        Self {
            pubsub,
            account: jid::bare(account).to_string(),
            device_id,
            device_label,
            cache: DashMap::new(),
        }
    }

    /// Publish our device id on the device-list node.
    ///
    /// On the account's very first initialization the server's previous
    /// list is replaced wholesale: it can only contain stale identifiers
    /// from prior incarnations. On subsequent starts our id is merged
    /// into the current server list, read back first.
    pub async fn publish_own(&self, first_init: bool) -> Result<()> {
        let mut ids = BTreeSet::new();
        if !first_init {
            for (_, payload) in self
                .pubsub
                .fetch(&self.account, ns::LEGACY_DEVICELIST_NODE, None)
                .await?
            {
                if let Ok(list) = DeviceList::parse(&payload) {
                    ids.extend(list.ids());
                }
            }
        }
        ids.insert(self.device_id);

        let mut list = DeviceList::new(ids.iter().copied());
        if let Some(label) = &self.device_label {
            for device in &mut list.devices {
                if device.id == self.device_id {
                    device.label = Some(label.clone());
                }
            }
        }

        info!(devices = ?list.ids(), first_init, "publishing device list");
        self.pubsub
            .publish(
                ns::LEGACY_DEVICELIST_NODE,
                "current",
                list.to_element(),
                Some(&PublishOptions::open_persistent_single()),
            )
            .await?;

        self.store_cached(&self.account, list.devices);
        Ok(())
    }

    /// The device list for a peer.
    ///
    /// Serves from the cache while the entry is fresh; on a miss, a forced
    /// refresh, or TTL expiry the list is fetched from the peer's node.
    /// When the fetch fails, an entry younger than the hard expiry is
    /// still served; anything older is treated as absent.
    pub async fn get_device_list(&self, peer: &str, force_refresh: bool) -> Result<Vec<DeviceEntry>> {
        let peer = jid::bare(peer).to_string();
        let key = (self.account.clone(), peer.clone());

        if !force_refresh {
            if let Some(entry) = self.cache.get(&key) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    debug!(peer = %peer, "device list served from cache");
                    return Ok(entry.devices.clone());
                }
            }
        }

        match self.fetch_remote(&peer).await {
            Ok(devices) => {
                self.store_cached(&peer, devices.clone());
                Ok(devices)
            }
            Err(e) => {
                if let Some(entry) = self.cache.get(&key) {
                    if entry.fetched_at.elapsed() < CACHE_HARD_EXPIRY {
                        warn!(peer = %peer, error = %e, "device list fetch failed, serving stale cache");
                        return Ok(entry.devices.clone());
                    }
                }
                Err(BridgeError::DeviceListUnavailable(peer))
            }
        }
    }

    async fn fetch_remote(&self, peer: &str) -> Result<Vec<DeviceEntry>> {
        let items = self
            .pubsub
            .fetch_with_timeout(peer, ns::LEGACY_DEVICELIST_NODE, None, DISCOVERY_TIMEOUT)
            .await?;
        let mut devices = Vec::new();
        for (_, payload) in items {
            if let Ok(list) = DeviceList::parse(&payload) {
                devices.extend(list.devices);
            }
        }
        devices.dedup_by_key(|d| d.id);
        Ok(devices)
    }

    /// Route an incoming pubsub notification.
    ///
    /// Device-list pushes overwrite the cache entry and reset its
    /// timestamp. A push for our own account that lost our device id
    /// triggers a republication of the corrected list.
    pub async fn handle_event(&self, event: &PubSubEvent) -> Result<bool> {
        if !ns::DEVICELIST_NODES.contains(&event.node.as_str()) {
            return Ok(false);
        }

        let peer = jid::bare(&event.from).to_string();
        let mut devices = Vec::new();
        for (_, payload) in &event.items {
            if let Ok(list) = DeviceList::parse(payload) {
                devices.extend(list.devices);
            }
        }

        debug!(peer = %peer, devices = ?devices.iter().map(|d| d.id).collect::<Vec<_>>(), "device list push");
        let own_list_missing_us =
            peer == self.account && !devices.iter().any(|d| d.id == self.device_id);
        self.store_cached(&peer, devices);

        if own_list_missing_us {
            warn!("own device list push lost our device id, republishing");
            self.publish_own(false).await?;
        }
        Ok(true)
    }

    /// Drop the cache entry for a peer
    pub fn invalidate(&self, peer: &str) {
        let key = (self.account.clone(), jid::bare(peer).to_string());
        self.cache.remove(&key);
    }

    /// Drop every cache entry for this account
    pub fn clear(&self) {
        self.cache.clear();
    }

    fn store_cached(&self, peer: &str, devices: Vec<DeviceEntry>) {
        self.cache.insert(
            (self.account.clone(), peer.to_string()),
            CachedList {
                devices,
                fetched_at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn cached_ids(&self, peer: &str) -> Option<Vec<u32>> {
        let key = (self.account.clone(), jid::bare(peer).to_string());
        self.cache.get(&key).map(|e| e.devices.iter().map(|d| d.id).collect())
    }
}
