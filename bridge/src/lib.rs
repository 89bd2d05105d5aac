//! OMEMO orchestration for an XMPP agent bridge
//!
//! Everything between the agent runtime and the wire for end-to-end
//! encrypted messaging: the publish-subscribe client, device-list and
//! bundle distribution, room occupant tracking, and the outbound/inbound
//! encryption orchestrators, tied together by the per-account
//! [`OmemoAccount`] facade.
//!
//! The runtime supplies the socket through [`transport::XmppTransport`]
//! and feeds every inbound stanza to [`OmemoAccount::handle_inbound`];
//! the bridge handles the rest.

pub mod account;
pub mod bundles;
pub mod config;
pub mod decryptor;
pub mod devices;
pub mod encryptor;
pub mod error;
pub mod jid;
pub mod logging;
pub mod pubsub;
pub mod rooms;
pub mod transport;

pub use account::{Inbound, OmemoAccount};
pub use config::BridgeConfig;
pub use decryptor::DecryptOutcome;
pub use error::{BridgeError, Result};
pub use transport::{TransportError, XmppTransport};
