//! Message and iq stanza assembly

use uuid::Uuid;

use crate::element::Element;
use crate::ns;

/// Message stanza type relevant to the encryption paths
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Groupchat,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Groupchat => "groupchat",
        }
    }
}

/// Fresh stanza id
pub fn unique_id() -> String {
    Uuid::new_v4().to_string()
}

/// An iq stanza of type get with a unique id
pub fn iq_get(to: Option<&str>, id: &str, child: Element) -> Element {
    iq("get", to, id, child)
}

/// An iq stanza of type set with a unique id
pub fn iq_set(to: Option<&str>, id: &str, child: Element) -> Element {
    iq("set", to, id, child)
}

fn iq(iq_type: &str, to: Option<&str>, id: &str, child: Element) -> Element {
    let mut iq = Element::new("iq").attr("type", iq_type).attr("id", id);
    if let Some(to) = to {
        iq = iq.attr("to", to);
    }
    iq.child(child)
}

/// Whether an iq response reports an error, and the error condition name
pub fn iq_error_condition(response: &Element) -> Option<String> {
    if response.get_attr("type") != Some("error") {
        return None;
    }
    let condition = response
        .find_child("error")
        .and_then(|error| error.children().next())
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    Some(condition)
}

/// Wrap an encrypted element into a full message stanza.
///
/// Adds the encryption-method advertisement, the store processing hint and
/// a plaintext fallback body for clients that cannot decrypt.
pub fn encrypted_message(to: &str, message_type: MessageType, encrypted: Element, fallback_body: &str) -> Element {
    Element::new("message")
        .attr("id", unique_id())
        .attr("to", to)
        .attr("type", message_type.as_str())
        .child(encrypted)
        .child(
            Element::new("encryption")
                .ns(ns::EME)
                .attr("namespace", ns::OMEMO_LEGACY)
                .attr("name", "OMEMO"),
        )
        .child(Element::new("store").ns(ns::HINTS))
        .child(Element::new("body").text(fallback_body))
}

/// Short plaintext warning stanza used when encryption fails.
///
/// Never carries the original plaintext; only the fixed notice.
pub fn warning_message(to: &str, message_type: MessageType, notice: &str) -> Element {
    Element::new("message")
        .attr("id", unique_id())
        .attr("to", to)
        .attr("type", message_type.as_str())
        .child(Element::new("store").ns(ns::HINTS))
        .child(Element::new("body").text(notice))
}
