//! Room occupant tracker
//!
//! Consumes every presence stanza observed for the account, tracks
//! per-room occupants with their real JIDs where the room discloses them,
//! and classifies room anonymity. The encryption paths use it to resolve
//! fan-out targets and inbound senders.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use stanza::element::Element;
use stanza::ns;

use crate::jid;

/// Room anonymity as learned from presence status codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomAnonymity {
    NonAnonymous,
    SemiAnonymous,
    Unknown,
}

/// One tracked occupant
#[derive(Clone, Debug)]
pub struct Occupant {
    /// Occupant JID inside the room (`room@service/nick`)
    pub full_jid: String,
    /// Real bare JID, when the room discloses it
    pub real_jid: Option<String>,
    pub affiliation: String,
    pub role: String,
}

/// Tracked state for one room
#[derive(Clone, Debug)]
pub struct RoomState {
    pub anonymity: RoomAnonymity,
    /// Occupants keyed by nickname
    pub occupants: HashMap<String, Occupant>,
    pub own_nick: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            anonymity: RoomAnonymity::Unknown,
            occupants: HashMap::new(),
            own_nick: None,
            updated_at: Utc::now(),
        }
    }
}

/// Per-account occupant tracker; single writer (the presence handler),
/// read by both encryption paths
pub struct RoomOccupantTracker {
    rooms: DashMap<String, RoomState>,
}

impl Default for RoomOccupantTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomOccupantTracker {
    pub fn new() -> Self {
        Self { rooms: DashMap::new() }
    }

    /// Consume one presence stanza. Non-room presences are ignored.
    pub fn handle_presence(&self, presence: &Element) {
        if presence.name() != "presence" {
            return;
        }
        let Some(from) = presence.get_attr("from") else { return };
        let (room, Some(nick)) = jid::split(from) else {
            // No resource portion: not an occupant presence.
            return;
        };
        let Some(x) = presence.find_child_in("x", &[ns::MUC_USER]) else {
            return;
        };

        let room = room.to_lowercase();
        let nick = nick.to_string();
        let mut state = self.rooms.entry(room.clone()).or_insert_with(RoomState::new);

        for status in x.children_named("status") {
            match status.get_attr("code") {
                Some("100") | Some("172") => {
                    state.anonymity = RoomAnonymity::NonAnonymous;
                }
                Some("110") => {
                    state.own_nick = Some(nick.clone());
                }
                _ => {}
            }
        }

        if presence.get_attr("type") == Some("unavailable") {
            state.occupants.remove(&nick);
            debug!(room = %room, nick = %nick, "occupant left");
        } else if let Some(item) = x.find_child("item") {
            let occupant = Occupant {
                full_jid: from.to_string(),
                real_jid: item.get_attr("jid").map(|j| jid::bare(j).to_lowercase()),
                affiliation: item.get_attr("affiliation").unwrap_or("none").to_string(),
                role: item.get_attr("role").unwrap_or("none").to_string(),
            };
            state.occupants.insert(nick, occupant);
        }
        state.updated_at = Utc::now();
    }

    /// De-duplicated real bare JIDs of the room's occupants.
    ///
    /// None when the room is not classified non-anonymous or no occupant
    /// has a known real JID.
    pub fn occupant_real_jids(&self, room: &str, exclude_self: bool) -> Option<Vec<String>> {
        let state = self.rooms.get(&room.to_lowercase())?;
        if state.anonymity != RoomAnonymity::NonAnonymous {
            return None;
        }

        let mut jids = Vec::new();
        for (nick, occupant) in &state.occupants {
            if exclude_self && state.own_nick.as_deref() == Some(nick.as_str()) {
                continue;
            }
            if let Some(real) = &occupant.real_jid {
                if !jids.contains(real) {
                    jids.push(real.clone());
                }
            }
        }

        if jids.is_empty() {
            None
        } else {
            Some(jids)
        }
    }

    /// Whether encrypted fan-out is possible for the room
    pub fn room_omemo_capable(&self, room: &str) -> bool {
        self.rooms
            .get(&room.to_lowercase())
            .map(|state| {
                state.anonymity == RoomAnonymity::NonAnonymous && !state.occupants.is_empty()
            })
            .unwrap_or(false)
    }

    /// Resolve an inbound room message sender to their real bare JID
    pub fn occupant_real_jid_by_nick(&self, room: &str, nick: &str) -> Option<String> {
        self.rooms
            .get(&room.to_lowercase())?
            .occupants
            .get(nick)?
            .real_jid
            .clone()
    }

    /// Our own nickname in a room, once self-presence was seen
    pub fn own_nick(&self, room: &str) -> Option<String> {
        self.rooms.get(&room.to_lowercase())?.own_nick.clone()
    }

    /// Discard state for one room (leave)
    pub fn forget_room(&self, room: &str) {
        self.rooms.remove(&room.to_lowercase());
    }

    /// Discard all room state (account shutdown)
    pub fn clear(&self) {
        self.rooms.clear();
    }
}
