//! Publish-subscribe client
//!
//! Generic request/response over the iq channel using the pubsub
//! namespaces. Every query carries a unique request id and a timeout:
//! 30 seconds for standard operations, 10 seconds for discovery-type
//! fetches that gate encryption attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::OsRng, Rng};
use tracing::debug;

use stanza::element::Element;
use stanza::message::{iq_error_condition, iq_get, iq_set};
use stanza::pubsub::{self, PublishOptions};

use crate::error::{BridgeError, Result};
use crate::transport::XmppTransport;

/// Standard query timeout
pub const STANDARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for discovery-type fetches
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub use stanza::pubsub::{parse_event, PubSubEvent};

/// Client for the server's user-centric publish-subscribe layer
pub struct PubSubClient {
    transport: Arc<dyn XmppTransport>,
    counter: AtomicU64,
}

impl PubSubClient {
    pub fn new(transport: Arc<dyn XmppTransport>) -> Self {
        Self {
            transport,
            counter: AtomicU64::new(1),
        }
    }

    /// Unique request id: prefix + monotonic counter + random suffix
    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = OsRng.gen();
        format!("{prefix}-{n}-{suffix:08x}")
    }

    async fn request(&self, iq: Element, node: &str, timeout: Duration) -> Result<Element> {
        let response = tokio::time::timeout(timeout, self.transport.send_iq(iq))
            .await
            .map_err(|_| BridgeError::Timeout(node.to_string()))?
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        if let Some(condition) = iq_error_condition(&response) {
            return Err(BridgeError::PubSub {
                node: node.to_string(),
                condition,
            });
        }
        Ok(response)
    }

    /// Publish an item to a node on our own pubsub service
    pub async fn publish(
        &self,
        node: &str,
        item_id: &str,
        payload: Element,
        options: Option<&PublishOptions>,
    ) -> Result<()> {
        let id = self.next_id("pub");
        let iq = iq_set(None, &id, pubsub::publish(node, item_id, payload, options));
        debug!(node, item_id, "publishing pubsub item");
        self.request(iq, node, STANDARD_TIMEOUT).await?;
        Ok(())
    }

    /// Fetch items from a (jid, node) pair.
    ///
    /// A missing node (`item-not-found`) is an empty result, not an error.
    pub async fn fetch(
        &self,
        jid: &str,
        node: &str,
        item_ids: Option<&[&str]>,
    ) -> Result<Vec<(String, Element)>> {
        self.fetch_with_timeout(jid, node, item_ids, STANDARD_TIMEOUT).await
    }

    /// Fetch with an explicit timeout (discovery-type fetches use the
    /// shorter one)
    pub async fn fetch_with_timeout(
        &self,
        jid: &str,
        node: &str,
        item_ids: Option<&[&str]>,
        timeout: Duration,
    ) -> Result<Vec<(String, Element)>> {
        let id = self.next_id("items");
        let iq = iq_get(Some(jid), &id, pubsub::items(node, item_ids));

        let response = match self.request(iq, node, timeout).await {
            Ok(response) => response,
            Err(BridgeError::PubSub { condition, .. }) if condition == "item-not-found" => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        if let Some(items) = response
            .find_child("pubsub")
            .and_then(|p| p.find_child("items"))
        {
            for item in items.children_named("item") {
                let item_id = item.get_attr("id").unwrap_or("current").to_string();
                if let Some(payload) = item.children().next() {
                    out.push((item_id, payload.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Subscribe our account to a node on a peer's service
    pub async fn subscribe(&self, jid: &str, node: &str, our_jid: &str) -> Result<()> {
        let id = self.next_id("sub");
        let iq = iq_set(Some(jid), &id, pubsub::subscribe(node, our_jid));
        self.request(iq, node, STANDARD_TIMEOUT).await?;
        Ok(())
    }

    /// Retract one item from our own node
    pub async fn retract(&self, node: &str, item_id: &str) -> Result<()> {
        let id = self.next_id("retract");
        let iq = iq_set(None, &id, pubsub::retract(node, item_id));
        self.request(iq, node, STANDARD_TIMEOUT).await?;
        Ok(())
    }

    /// Delete one of our own nodes
    pub async fn delete_node(&self, node: &str) -> Result<()> {
        let id = self.next_id("del");
        let iq = iq_set(None, &id, pubsub::delete_node(node));
        self.request(iq, node, STANDARD_TIMEOUT).await?;
        Ok(())
    }

    /// Fetch the configuration form of one of our own nodes
    pub async fn node_config(&self, node: &str) -> Result<Element> {
        let id = self.next_id("conf");
        let iq = iq_get(None, &id, pubsub::node_config(node));
        self.request(iq, node, STANDARD_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::transport::TransportError;

    struct RecordingTransport {
        sent: Mutex<Vec<Element>>,
        reply: Element,
    }

    #[async_trait]
    impl XmppTransport for RecordingTransport {
        async fn send_iq(&self, stanza: Element) -> std::result::Result<Element, TransportError> {
            self.sent.lock().unwrap().push(stanza);
            Ok(self.reply.clone())
        }

        async fn send_stanza(&self, _stanza: Element) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn client_with_reply(reply: Element) -> (Arc<RecordingTransport>, PubSubClient) {
        let transport = Arc::new(RecordingTransport {
            sent: Mutex::new(Vec::new()),
            reply,
        });
        let client = PubSubClient::new(transport.clone());
        (transport, client)
    }

    #[test]
    fn test_request_ids_unique() {
        let (_, client) = client_with_reply(Element::new("iq").attr("type", "result"));
        let a = client.next_id("pub");
        let b = client.next_id("pub");
        assert_ne!(a, b);
        assert!(a.starts_with("pub-"));
    }

    #[tokio::test]
    async fn test_publish_builds_set_iq() {
        let (transport, client) = client_with_reply(Element::new("iq").attr("type", "result"));
        client
            .publish("some.node", "current", Element::new("list"), None)
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get_attr("type"), Some("set"));
        assert!(sent[0].to_xml().contains("publish node=\"some.node\""));
    }

    #[tokio::test]
    async fn test_item_not_found_is_empty_fetch() {
        let reply = Element::parse(
            "<iq type=\"error\" id=\"x\"><error type=\"cancel\">\
             <item-not-found xmlns=\"urn:ietf:params:xml:ns:xmpp-stanzas\"/></error></iq>",
        )
        .unwrap();
        let (_, client) = client_with_reply(reply);

        let items = client.fetch("peer@example.org", "missing.node", None).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_other_error_propagates() {
        let reply = Element::parse(
            "<iq type=\"error\" id=\"x\"><error type=\"auth\">\
             <forbidden xmlns=\"urn:ietf:params:xml:ns:xmpp-stanzas\"/></error></iq>",
        )
        .unwrap();
        let (_, client) = client_with_reply(reply);

        let result = client.fetch("peer@example.org", "node", None).await;
        assert!(matches!(result, Err(BridgeError::PubSub { condition, .. }) if condition == "forbidden"));
    }
}
