//! Small JID helpers
//!
//! Enough address handling for the encryption paths: bare/full splitting.
//! Full JID validation is the runtime's concern.

/// Bare form of a JID (resource stripped)
pub fn bare(jid: &str) -> &str {
    match jid.find('/') {
        Some(pos) => &jid[..pos],
        None => jid,
    }
}

/// The resource portion, if any
pub fn resource(jid: &str) -> Option<&str> {
    jid.find('/').map(|pos| &jid[pos + 1..]).filter(|r| !r.is_empty())
}

/// Split into (bare, resource)
pub fn split(jid: &str) -> (&str, Option<&str>) {
    (bare(jid), resource(jid))
}
