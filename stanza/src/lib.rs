//! Wire payloads for the XMPP OMEMO bridge
//!
//! A minimal XML element tree plus the typed codecs for everything the
//! OMEMO core reads and writes on the wire: pubsub requests and events,
//! device lists, key bundles, the `<encrypted>` element and the message
//! stanza framing around it. Stream-level XML is out of scope; every
//! function here deals in complete stanzas.

pub mod element;
pub mod error;
pub mod message;
pub mod ns;
pub mod omemo;
pub mod pubsub;

pub use element::{Element, Node};
pub use error::{Result, StanzaError};
