//! Publish-subscribe payload builders and event parsing
//!
//! Builds the `<pubsub>` children for iq stanzas and extracts event
//! notifications from inbound message stanzas. The surrounding iq framing
//! lives in [`crate::message`].

use crate::element::Element;
use crate::ns;

/// Node access model for publish options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessModel {
    Open,
    Presence,
    Whitelist,
    Roster,
}

impl AccessModel {
    fn as_str(self) -> &'static str {
        match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Whitelist => "whitelist",
            AccessModel::Roster => "roster",
        }
    }
}

/// Publish options serialized as a standard data form
#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub access_model: AccessModel,
    pub persist_items: bool,
    pub max_items: Option<u32>,
}

impl PublishOptions {
    /// Open access, persistent, one item: the options every OMEMO node uses
    pub fn open_persistent_single() -> Self {
        Self {
            access_model: AccessModel::Open,
            persist_items: true,
            max_items: Some(1),
        }
    }

    fn to_form(&self) -> Element {
        let mut form = Element::new("x")
            .ns(ns::DATA_FORMS)
            .attr("type", "submit")
            .child(form_field("FORM_TYPE", Some("hidden"), ns::PUBLISH_OPTIONS));
        form = form.child(form_field(
            "pubsub#access_model",
            None,
            self.access_model.as_str(),
        ));
        form = form.child(form_field(
            "pubsub#persist_items",
            None,
            if self.persist_items { "true" } else { "false" },
        ));
        if let Some(max) = self.max_items {
            form = form.child(form_field("pubsub#max_items", None, &max.to_string()));
        }
        form
    }
}

fn form_field(var: &str, field_type: Option<&str>, value: &str) -> Element {
    let mut field = Element::new("field").attr("var", var);
    if let Some(t) = field_type {
        field = field.attr("type", t);
    }
    field.child(Element::new("value").text(value))
}

/// `<pubsub><publish node=…><item id=…>payload</item></publish>…</pubsub>`
pub fn publish(node: &str, item_id: &str, payload: Element, options: Option<&PublishOptions>) -> Element {
    let mut pubsub = Element::new("pubsub").ns(ns::PUBSUB).child(
        Element::new("publish")
            .attr("node", node)
            .child(Element::new("item").attr("id", item_id).child(payload)),
    );
    if let Some(options) = options {
        pubsub = pubsub.child(Element::new("publish-options").child(options.to_form()));
    }
    pubsub
}

/// `<pubsub><items node=…>[<item id=…/>]</items></pubsub>`
pub fn items(node: &str, item_ids: Option<&[&str]>) -> Element {
    let mut items = Element::new("items").attr("node", node);
    if let Some(ids) = item_ids {
        for id in ids {
            items = items.child(Element::new("item").attr("id", *id));
        }
    }
    Element::new("pubsub").ns(ns::PUBSUB).child(items)
}

/// `<pubsub><subscribe node=… jid=…/></pubsub>`
pub fn subscribe(node: &str, jid: &str) -> Element {
    Element::new("pubsub")
        .ns(ns::PUBSUB)
        .child(Element::new("subscribe").attr("node", node).attr("jid", jid))
}

/// `<pubsub><retract node=…><item id=…/></retract></pubsub>`
pub fn retract(node: &str, item_id: &str) -> Element {
    Element::new("pubsub").ns(ns::PUBSUB).child(
        Element::new("retract")
            .attr("node", node)
            .child(Element::new("item").attr("id", item_id)),
    )
}

/// Owner-side node deletion
pub fn delete_node(node: &str) -> Element {
    Element::new("pubsub")
        .ns(ns::PUBSUB_OWNER)
        .child(Element::new("delete").attr("node", node))
}

/// Owner-side node configuration request
pub fn node_config(node: &str) -> Element {
    Element::new("pubsub")
        .ns(ns::PUBSUB_OWNER)
        .child(Element::new("configure").attr("node", node))
}

/// Parsed pubsub event notification
#[derive(Clone, Debug)]
pub struct PubSubEvent {
    /// Bare JID the event originated from
    pub from: String,
    /// Node the items were published on
    pub node: String,
    /// Published items as (item id, payload)
    pub items: Vec<(String, Element)>,
    /// Retracted item ids
    pub retracted: Vec<String>,
}

/// Recognize an incoming event message, or return None for anything else
pub fn parse_event(message: &Element) -> Option<PubSubEvent> {
    if message.name() != "message" {
        return None;
    }
    let from = message.get_attr("from")?;
    let bare = from.split('/').next().unwrap_or(from).to_string();

    let event = message.find_child_in("event", &[ns::PUBSUB_EVENT])?;
    let items_el = event.find_child("items")?;
    let node = items_el.get_attr("node")?.to_string();

    let mut items = Vec::new();
    let mut retracted = Vec::new();
    for child in items_el.children() {
        match child.name() {
            "item" => {
                let id = child.get_attr("id").unwrap_or("current").to_string();
                if let Some(payload) = child.children().next() {
                    items.push((id, payload.clone()));
                }
            }
            "retract" => {
                if let Some(id) = child.get_attr("id") {
                    retracted.push(id.to_string());
                }
            }
            _ => {}
        }
    }

    Some(PubSubEvent { from: bare, node, items, retracted })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_with_options() {
        let payload = Element::new("list").ns(ns::OMEMO_LEGACY);
        let el = publish(
            ns::LEGACY_DEVICELIST_NODE,
            "current",
            payload,
            Some(&PublishOptions::open_persistent_single()),
        );
        let xml = el.to_xml();
        assert!(xml.contains("publish node=\"eu.siacs.conversations.axolotl.devicelist\""));
        assert!(xml.contains("publish-options"));
        assert!(xml.contains("pubsub#access_model"));
        assert!(xml.contains(">open<"));
        assert!(xml.contains("pubsub#max_items"));
    }

    #[test]
    fn test_items_request() {
        let el = items("some.node", Some(&["current"]));
        let xml = el.to_xml();
        assert!(xml.contains("items node=\"some.node\""));
        assert!(xml.contains("item id=\"current\""));
    }

    #[test]
    fn test_parse_event() {
        let xml = format!(
            "<message from=\"peer@example.org/res\"><event xmlns=\"{}\">\
             <items node=\"{}\"><item id=\"current\">\
             <list xmlns=\"{}\"><device id=\"42\"/></list>\
             </item><retract id=\"old\"/></items></event></message>",
            ns::PUBSUB_EVENT,
            ns::LEGACY_DEVICELIST_NODE,
            ns::OMEMO_LEGACY,
        );
        let message = Element::parse(&xml).unwrap();
        let event = parse_event(&message).unwrap();
        assert_eq!(event.from, "peer@example.org");
        assert_eq!(event.node, ns::LEGACY_DEVICELIST_NODE);
        assert_eq!(event.items.len(), 1);
        assert_eq!(event.items[0].0, "current");
        assert_eq!(event.retracted, vec!["old".to_string()]);
    }

    #[test]
    fn test_parse_event_rejects_plain_message() {
        let message = Element::parse("<message from=\"a@b\"><body>hi</body></message>").unwrap();
        assert!(parse_event(&message).is_none());
    }
}
