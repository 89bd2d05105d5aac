//! The seam to the XMPP wire
//!
//! The agent runtime owns the socket, stream negotiation and
//! authentication; the bridge only needs two primitives: send an iq and
//! await its correlated reply, and fire a one-way stanza.

use async_trait::async_trait;
use thiserror::Error;

use stanza::Element;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The underlying stream is gone
    #[error("connection closed: {0}")]
    Closed(String),

    /// The stanza could not be written
    #[error("send failed: {0}")]
    Send(String),
}

/// XMPP send primitives supplied by the runtime
#[async_trait]
pub trait XmppTransport: Send + Sync {
    /// Send an iq stanza and await the reply correlated by its id
    async fn send_iq(&self, stanza: Element) -> Result<Element, TransportError>;

    /// Send a message or presence stanza, fire and forget
    async fn send_stanza(&self, stanza: Element) -> Result<(), TransportError>;
}
