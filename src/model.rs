//! Core data model shared by the Protocol Client and Session Supervisor.
//!
//! See §3 for the authoritative entity table; this module is the direct
//! Rust rendering of it.

use std::cmp::Ordering;

use crate::jid::Jid;

/// TLS policy for an Account. Plain unencrypted mode is never offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// STARTTLS is mandatory; `stream:features` without `<starttls>` is a
    /// fatal `TlsRequired` error.
    RequireTls,
    /// STARTTLS is used when offered, but an unencrypted session is
    /// accepted provided SASL PLAIN is never sent without TLS active.
    OpportunisticTls,
    /// TLS is negotiated immediately at TCP open; STARTTLS is not expected.
    DirectTls,
}

impl Default for SecurityMode {
    fn default() -> Self {
        SecurityMode::RequireTls
    }
}

/// A single configured XMPP identity.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub host: String,
    pub port: u16,
    pub jid: String,
    pub resource: String,
    pub security: SecurityMode,
    pub nickname: String,
    #[serde(default)]
    pub conference_domain: Option<String>,
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub dm_nicknames: Vec<String>,
    /// Opaque passthrough for the GUI shell; the core never reads these.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_hint: Option<String>,
}

impl Account {
    pub fn bare_jid(&self) -> Result<String, crate::error::XmppError> {
        Jid::parse(&self.jid).map(|j| j.to_bare())
    }
}

/// MUC membership class. Compared alongside role for display ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Affiliation {
    Owner,
    Admin,
    Member,
    None,
    Outcast,
}

impl Affiliation {
    pub fn parse(s: &str) -> Affiliation {
        match s {
            "owner" => Affiliation::Owner,
            "admin" => Affiliation::Admin,
            "member" => Affiliation::Member,
            "outcast" => Affiliation::Outcast,
            _ => Affiliation::None,
        }
    }
}

/// MUC current privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Moderator,
    Participant,
    Visitor,
    None,
}

impl Role {
    pub fn parse(s: &str) -> Role {
        match s {
            "moderator" => Role::Moderator,
            "participant" => Role::Participant,
            "visitor" => Role::Visitor,
            _ => Role::None,
        }
    }
}

/// A user present in a Room. Identity key is `nick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    pub nick: String,
    pub affiliation: Affiliation,
    pub role: Role,
}

impl Occupant {
    /// Sort key per §3: (affiliation, role, lowercase nick).
    fn sort_key(&self) -> (Affiliation, Role, String) {
        (self.affiliation, self.role, self.nick.to_lowercase())
    }
}

impl PartialOrd for Occupant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Occupant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// One rendered chat log line kind, matching the Chat Log Store's
/// per-line formats (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    Action,
    Join,
    Part,
    Quit,
    Topic,
    System,
}

/// One rendered line in a Room.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Unix timestamp (seconds), UTC.
    pub timestamp: i64,
    pub sender: String,
    pub body: String,
    pub kind: MessageKind,
}

/// A MUC conversation or a 1:1 DM.
#[derive(Debug, Clone)]
pub struct Room {
    pub jid: String,
    pub display_name: String,
    pub topic: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub occupants: Vec<Occupant>,
    pub unread_count: u32,
    pub self_nickname: String,
    pub is_dm: bool,
    pub initial_presence_complete: bool,
    pub pending_occupants: Vec<Occupant>,
    pub has_displayed_topic: bool,
}

impl Room {
    pub fn new_muc(jid: String, self_nickname: String) -> Room {
        Room {
            display_name: jid.clone(),
            jid,
            topic: None,
            messages: Vec::new(),
            occupants: Vec::new(),
            unread_count: 0,
            self_nickname,
            is_dm: false,
            initial_presence_complete: false,
            pending_occupants: Vec::new(),
            has_displayed_topic: false,
        }
    }

    pub fn new_dm(bare_jid: String) -> Room {
        Room {
            display_name: bare_jid.clone(),
            jid: bare_jid,
            topic: None,
            messages: Vec::new(),
            occupants: Vec::new(),
            unread_count: 0,
            self_nickname: String::new(),
            is_dm: true,
            initial_presence_complete: true,
            pending_occupants: Vec::new(),
            has_displayed_topic: false,
        }
    }

    /// Insert an occupant at its sorted position, preserving the total
    /// order invariant (affiliation, role, lowercase nick).
    pub fn insert_occupant_sorted(&mut self, occupant: Occupant) {
        let pos = self
            .occupants
            .binary_search(&occupant)
            .unwrap_or_else(|e| e);
        self.occupants.insert(pos, occupant);
    }

    pub fn remove_occupant(&mut self, nick: &str) -> Option<Occupant> {
        if let Some(pos) = self.occupants.iter().position(|o| o.nick == nick) {
            Some(self.occupants.remove(pos))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occ(nick: &str, aff: Affiliation, role: Role) -> Occupant {
        Occupant {
            nick: nick.to_string(),
            affiliation: aff,
            role,
        }
    }

    #[test]
    fn occupants_sort_by_affiliation_then_role_then_nick() {
        let mut room = Room::new_muc("room@muc.example.org".into(), "alice".into());
        room.initial_presence_complete = true;
        room.insert_occupant_sorted(occ("zed", Affiliation::Member, Role::Participant));
        room.insert_occupant_sorted(occ("anna", Affiliation::Owner, Role::Moderator));
        room.insert_occupant_sorted(occ("bob", Affiliation::Member, Role::Participant));

        let nicks: Vec<&str> = room.occupants.iter().map(|o| o.nick.as_str()).collect();
        assert_eq!(nicks, vec!["anna", "bob", "zed"]);
    }

    #[test]
    fn occupant_sort_is_case_insensitive_on_nick() {
        let mut room = Room::new_muc("room@muc.example.org".into(), "alice".into());
        room.insert_occupant_sorted(occ("Bob", Affiliation::Member, Role::Participant));
        room.insert_occupant_sorted(occ("alice", Affiliation::Member, Role::Participant));
        let nicks: Vec<&str> = room.occupants.iter().map(|o| o.nick.as_str()).collect();
        assert_eq!(nicks, vec!["alice", "Bob"]);
    }

    #[test]
    fn remove_occupant_by_nick() {
        let mut room = Room::new_muc("room@muc.example.org".into(), "alice".into());
        room.insert_occupant_sorted(occ("bob", Affiliation::Member, Role::Participant));
        let removed = room.remove_occupant("bob");
        assert!(removed.is_some());
        assert!(room.occupants.is_empty());
        assert!(room.remove_occupant("bob").is_none());
    }

    #[test]
    fn affiliation_and_role_parse_unknown_as_none() {
        assert_eq!(Affiliation::parse("bogus"), Affiliation::None);
        assert_eq!(Role::parse("bogus"), Role::None);
        assert_eq!(Affiliation::parse("owner"), Affiliation::Owner);
        assert_eq!(Role::parse("moderator"), Role::Moderator);
    }

    #[test]
    fn dm_room_starts_with_presence_complete_and_no_occupants() {
        let room = Room::new_dm("bob@example.org".into());
        assert!(room.is_dm);
        assert!(room.initial_presence_complete);
        assert!(room.occupants.is_empty());
    }
}
