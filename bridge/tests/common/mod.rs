//! In-memory loopback XMPP service for integration tests
//!
//! Implements just enough of the pubsub protocol for the bridge: item
//! publication with replace semantics, item fetches, retraction and node
//! deletion. Message stanzas are captured in a per-connection outbox so
//! tests can assert on exactly what would have hit the wire.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use bridge::transport::{TransportError, XmppTransport};
use bridge::{BridgeConfig, OmemoAccount};
use stanza::element::Element;
use stanza::ns;

pub struct LoopbackServer {
    nodes: Mutex<HashMap<(String, String), Vec<(String, Element)>>>,
}

impl LoopbackServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Connect a new account to the service
    pub fn connect(self: &Arc<Self>, jid: &str) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            server: self.clone(),
            jid: jid.to_string(),
            outbox: Mutex::new(Vec::new()),
        })
    }

    /// Drop a node outright (simulates a peer with no published bundle)
    pub fn remove_node(&self, jid: &str, node: &str) {
        self.nodes.lock().unwrap().remove(&(jid.to_string(), node.to_string()));
    }

    fn handle_iq(&self, from_jid: &str, iq: &Element) -> Element {
        let target = iq.get_attr("to").unwrap_or(from_jid).to_string();
        let Some(pubsub) = iq.find_child("pubsub") else {
            return error_iq("bad-request");
        };

        if let Some(publish) = pubsub.find_child("publish") {
            let node = publish.get_attr("node").unwrap_or_default().to_string();
            let mut items = Vec::new();
            for item in publish.children_named("item") {
                let id = item.get_attr("id").unwrap_or("current").to_string();
                if let Some(payload) = item.children().next() {
                    items.push((id, payload.clone()));
                }
            }
            // max_items=1 on every OMEMO node: publication replaces.
            self.nodes
                .lock()
                .unwrap()
                .insert((from_jid.to_string(), node), items);
            return result_iq();
        }

        if let Some(items_el) = pubsub.find_child("items") {
            let node = items_el.get_attr("node").unwrap_or_default().to_string();
            let stored = self.nodes.lock().unwrap().get(&(target, node.clone())).cloned();
            let Some(stored) = stored else {
                return error_iq("item-not-found");
            };

            let mut items = Element::new("items").attr("node", node);
            for (id, payload) in stored {
                items = items.child(Element::new("item").attr("id", id).child(payload));
            }
            return Element::new("iq")
                .attr("type", "result")
                .child(Element::new("pubsub").ns(ns::PUBSUB).child(items));
        }

        if let Some(retract) = pubsub.find_child("retract") {
            let node = retract.get_attr("node").unwrap_or_default().to_string();
            if let Some(items) = self
                .nodes
                .lock()
                .unwrap()
                .get_mut(&(from_jid.to_string(), node))
            {
                for item in retract.children_named("item") {
                    if let Some(id) = item.get_attr("id") {
                        items.retain(|(stored_id, _)| stored_id != id);
                    }
                }
            }
            return result_iq();
        }

        if let Some(delete) = pubsub.find_child("delete") {
            let node = delete.get_attr("node").unwrap_or_default().to_string();
            self.remove_node(from_jid, &node);
            return result_iq();
        }

        // subscribe / configure: acknowledged, nothing tracked.
        result_iq()
    }
}

fn result_iq() -> Element {
    Element::new("iq").attr("type", "result")
}

fn error_iq(condition: &str) -> Element {
    Element::new("iq").attr("type", "error").child(
        Element::new("error").attr("type", "cancel").child(
            Element::new(condition).ns("urn:ietf:params:xml:ns:xmpp-stanzas"),
        ),
    )
}

pub struct LoopbackTransport {
    server: Arc<LoopbackServer>,
    jid: String,
    outbox: Mutex<Vec<Element>>,
}

impl LoopbackTransport {
    /// Stanzas this connection has sent
    pub fn sent(&self) -> Vec<Element> {
        self.outbox.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.outbox.lock().unwrap().clear();
    }
}

#[async_trait]
impl XmppTransport for LoopbackTransport {
    async fn send_iq(&self, stanza: Element) -> Result<Element, TransportError> {
        Ok(self.server.handle_iq(&self.jid, &stanza))
    }

    async fn send_stanza(&self, stanza: Element) -> Result<(), TransportError> {
        self.outbox.lock().unwrap().push(stanza);
        Ok(())
    }
}

/// Spin up an initialized account against the loopback service
pub async fn account(
    server: &Arc<LoopbackServer>,
    jid: &str,
    data_dir: &Path,
) -> (Arc<LoopbackTransport>, OmemoAccount) {
    let transport = server.connect(jid);
    let mut config = BridgeConfig::new(jid);
    config.data_dir = Some(data_dir.to_path_buf());
    let dyn_transport: Arc<dyn XmppTransport> = transport.clone();
    let account = OmemoAccount::initialize(config, dyn_transport)
        .await
        .expect("account initialization");
    (transport, account)
}
