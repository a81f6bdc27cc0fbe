//! Session Supervisor (§4.4): owns Accounts, Connections, and Rooms;
//! subscribes to all Protocol Client events on a single-threaded event
//! consumer; applies reconnection, dedup, and presence-flood rules; and
//! exposes the outbound command verbs.
//!
//! Generalizes the shape of the teacher's `main.rs` reconnection loop —
//! construct a client, drive it to completion, decide whether to retry
//! with backoff based on `is_retriable()` — into a standalone type that
//! also owns Room state instead of leaving that to a UI layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;

use crate::backoff::Backoff;
use crate::error::DisconnectReason;
use crate::jid::Jid;
use crate::logstore::{dm_room_name, LogStore};
use crate::model::{Account, Affiliation, ChatMessage, MessageKind, Occupant, Role, Room};
use crate::persistence::{KeyValueStore, SecretStore};
use crate::protocol::{ClientCommand, ClientEvent, IncomingMessage, IncomingMessageKind, IncomingPresence, ProtocolClient};

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(32);
const RECONNECT_MULTIPLIER: u32 = 2;
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEDUP_WINDOW_SECS: i64 = 2;
const MUC_HISTORY_LINES: u32 = 50;

#[derive(Debug, Clone)]
pub enum SupervisorCommand {
    SendGroupchat { room_jid: String, body: String },
    SendDm { bare_jid: String, body: String },
    JoinRoom { room_jid: String },
    LeaveRoom { room_jid: String },
    ListRooms,
    Reconnect,
    Disconnect,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    RoomUpdated(String),
    RoomList { items: Vec<(String, String)> },
    Connected,
    Disconnected { retrying: bool },
    PermanentFailure(String),
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

fn bare_from(full_or_bare: &str) -> String {
    full_or_bare.split('/').next().unwrap_or(full_or_bare).to_string()
}

/// Drives one Account's connection lifecycle: construct a
/// [`ProtocolClient`], run it to completion, apply the reconnection
/// ladder, and maintain the account's in-memory Room state across
/// reconnects.
pub struct SessionSupervisor {
    account: Account,
    password: String,
    secret_store: Arc<dyn SecretStore>,
    kv_store: Arc<dyn KeyValueStore>,
    log_store: Arc<LogStore>,
    rooms: HashMap<String, Room>,
    manually_disconnected: bool,
    permanent_failure: Option<String>,
}

impl SessionSupervisor {
    pub fn new(
        account: Account,
        password: String,
        secret_store: Arc<dyn SecretStore>,
        kv_store: Arc<dyn KeyValueStore>,
        log_store: Arc<LogStore>,
    ) -> Self {
        let rooms = account
            .rooms
            .iter()
            .map(|jid| (jid.clone(), Room::new_muc(jid.clone(), account.nickname.clone())))
            .collect();
        SessionSupervisor {
            account,
            password,
            secret_store,
            kv_store,
            log_store,
            rooms,
            manually_disconnected: false,
            permanent_failure: None,
        }
    }

    pub fn room(&self, jid: &str) -> Option<&Room> {
        self.rooms.get(jid)
    }

    pub async fn run(mut self, event_tx: mpsc::Sender<SupervisorEvent>, mut cmd_rx: mpsc::Receiver<SupervisorCommand>) {
        let mut backoff = Backoff::new(RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY, RECONNECT_MULTIPLIER);

        loop {
            if self.manually_disconnected {
                return;
            }

            self.append_account_system_message("Connecting…".into()).await;
            let (client_event_tx, mut client_event_rx) = mpsc::channel::<ClientEvent>(256);
            let (client_cmd_tx, client_cmd_rx) = mpsc::channel::<ClientCommand>(64);
            let client = ProtocolClient::new(self.account.clone(), self.password.clone());
            let client_task = tokio::spawn(client.run(client_event_tx, client_cmd_rx));

            let mut authenticated_this_attempt = false;

            loop {
                tokio::select! {
                    event = client_event_rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            ClientEvent::Connected => {}
                            ClientEvent::Authenticated { .. } => {
                                authenticated_this_attempt = true;
                                backoff.reset();
                                self.append_account_system_message("Connected".into()).await;
                                self.rejoin_rooms(&client_cmd_tx).await;
                                let _ = event_tx.send(SupervisorEvent::Connected).await;
                            }
                            ClientEvent::Message(msg) => self.handle_incoming_message(msg, &event_tx).await,
                            ClientEvent::Presence(presence) => self.handle_incoming_presence(presence, &event_tx).await,
                            ClientEvent::RoomSubject { room, text } => self.handle_room_subject(room, text, &event_tx).await,
                            ClientEvent::RoomList { items, .. } => {
                                let _ = event_tx.send(SupervisorEvent::RoomList { items }).await;
                            }
                            ClientEvent::Error(e) => warn!("protocol client error: {e}"),
                            ClientEvent::Disconnected { reason } => {
                                self.handle_disconnect(reason).await;
                                break;
                            }
                        }
                    }
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else {
                            self.manually_disconnected = true;
                            let _ = client_cmd_tx.send(ClientCommand::Disconnect).await;
                            continue;
                        };
                        match cmd {
                            SupervisorCommand::Disconnect => {
                                self.manually_disconnected = true;
                                let _ = client_cmd_tx.send(ClientCommand::Disconnect).await;
                            }
                            SupervisorCommand::Reconnect => {
                                backoff.reset();
                                let _ = client_cmd_tx.send(ClientCommand::Disconnect).await;
                            }
                            other => self.handle_command(other, &client_cmd_tx).await,
                        }
                    }
                }
            }

            let _ = client_task.await;
            let _ = authenticated_this_attempt;

            if self.manually_disconnected {
                return;
            }
            if let Some(reason) = self.permanent_failure.take() {
                let _ = event_tx.send(SupervisorEvent::PermanentFailure(reason)).await;
                return;
            }
            if backoff.exceeded_max_attempts(MAX_RECONNECT_ATTEMPTS) {
                self.append_account_system_message("Max reconnection attempts reached".into()).await;
                let _ = event_tx
                    .send(SupervisorEvent::PermanentFailure("maximum reconnection attempts exceeded".into()))
                    .await;
                return;
            }
            let delay = backoff.next_delay();
            self.append_account_system_message(format!(
                "Reconnecting in {}s… (attempt {}/{MAX_RECONNECT_ATTEMPTS})",
                delay.as_secs(),
                backoff.attempt
            ))
            .await;
            let _ = event_tx.send(SupervisorEvent::Disconnected { retrying: true }).await;
            sleep(delay).await;
        }
    }

    async fn rejoin_rooms(&mut self, client_cmd_tx: &mpsc::Sender<ClientCommand>) {
        let room_jids: Vec<String> = self.rooms.keys().cloned().collect();
        for room_jid in room_jids {
            if let Some(room) = self.rooms.get_mut(&room_jid) {
                if room.is_dm {
                    continue;
                }
                room.initial_presence_complete = false;
                room.occupants.clear();
                room.pending_occupants.clear();
            }
            let _ = client_cmd_tx
                .send(ClientCommand::JoinRoom {
                    room_jid,
                    nick: self.account.nickname.clone(),
                    max_history: MUC_HISTORY_LINES,
                })
                .await;
        }
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand, client_cmd_tx: &mpsc::Sender<ClientCommand>) {
        match cmd {
            SupervisorCommand::SendGroupchat { room_jid, body } => {
                let _ = client_cmd_tx.send(ClientCommand::SendGroupchat { room_jid, body }).await;
            }
            SupervisorCommand::SendDm { bare_jid, body } => {
                self.ensure_dm_room(&bare_jid).await;
                let _ = client_cmd_tx.send(ClientCommand::SendDm { bare_jid, body }).await;
            }
            SupervisorCommand::JoinRoom { room_jid } => {
                self.rooms
                    .entry(room_jid.clone())
                    .or_insert_with(|| Room::new_muc(room_jid.clone(), self.account.nickname.clone()));
                self.account.rooms.push(room_jid.clone());
                self.account.rooms.sort();
                self.account.rooms.dedup();
                self.persist_saved_rooms().await;
                let _ = client_cmd_tx
                    .send(ClientCommand::JoinRoom {
                        room_jid,
                        nick: self.account.nickname.clone(),
                        max_history: MUC_HISTORY_LINES,
                    })
                    .await;
            }
            SupervisorCommand::LeaveRoom { room_jid } => {
                let nick = self
                    .rooms
                    .get(&room_jid)
                    .map(|r| r.self_nickname.clone())
                    .unwrap_or_else(|| self.account.nickname.clone());
                let _ = client_cmd_tx.send(ClientCommand::LeaveRoom { room_jid: room_jid.clone(), nick }).await;
                self.rooms.remove(&room_jid);
                self.account.rooms.retain(|j| j != &room_jid);
                self.persist_saved_rooms().await;
            }
            SupervisorCommand::ListRooms => {
                if let Some(service) = self.account.conference_domain.clone() {
                    let _ = client_cmd_tx.send(ClientCommand::BrowseRooms { service }).await;
                }
            }
            SupervisorCommand::Disconnect | SupervisorCommand::Reconnect => {
                unreachable!("intercepted by the caller before reaching handle_command")
            }
        }
    }

    async fn persist_saved_rooms(&self) {
        let Ok(bare) = self.account.bare_jid() else { return };
        if let Ok(mut blob) = self.kv_store.load().await {
            blob.saved_rooms.insert(bare, self.account.rooms.clone());
            let _ = self.kv_store.save(&blob).await;
        }
    }

    /// Lazily creates a DM Room, loading recent history from the Chat
    /// Log Store the first time. Spec.md calls for this load to run on
    /// a background worker; here it is awaited inline before the room
    /// is first used, which keeps the same single-threaded event
    /// consumer invariant and avoids a second mutation path into
    /// `self.rooms` (documented in DESIGN.md).
    async fn ensure_dm_room(&mut self, bare_jid: &str) {
        if self.rooms.contains_key(bare_jid) {
            return;
        }
        let mut room = Room::new_dm(bare_jid.to_string());
        if let (Ok(account_bare), Ok(jid)) = (self.account.bare_jid(), Jid::parse(bare_jid)) {
            let room_name = dm_room_name(&jid.localpart);
            if let Ok(history) = self.log_store.load_recent_history(&account_bare, &room_name).await {
                room.messages = history;
            }
        }
        self.rooms.insert(bare_jid.to_string(), room);
    }

    fn is_duplicate(&self, room_jid: &str, sender: &str, body: &str, timestamp: Option<i64>) -> bool {
        let Some(ts) = timestamp else { return false };
        let Some(room) = self.rooms.get(room_jid) else { return false };
        room.messages
            .iter()
            .any(|m| m.sender == sender && m.body == body && (m.timestamp - ts).abs() < DEDUP_WINDOW_SECS)
    }

    async fn handle_incoming_message(&mut self, msg: IncomingMessage, event_tx: &mpsc::Sender<SupervisorEvent>) {
        match msg.kind {
            IncomingMessageKind::GroupChat => {
                let room_jid = bare_from(&msg.from);
                let sender = msg.from.rsplit('/').next().unwrap_or(&msg.from).to_string();

                if msg.is_delayed && self.is_duplicate(&room_jid, &sender, &msg.body, msg.timestamp) {
                    return;
                }
                // Nickname self-filter (§4.4): a message from our own nick is
                // still recorded (it is our own echoed message) but never
                // treated as a notification-worthy event by the GUI shell —
                // that distinction belongs to the observer, not storage here.

                let Some(room) = self.rooms.get_mut(&room_jid) else { return };
                let chat_msg = ChatMessage {
                    timestamp: msg.timestamp.unwrap_or_else(now_unix),
                    sender,
                    body: msg.body,
                    kind: MessageKind::Chat,
                };
                room.messages.push(chat_msg.clone());
                let bare = self.account.bare_jid().unwrap_or_default();
                self.log_store.append(&bare, &room_jid, chat_msg);
                let _ = event_tx.send(SupervisorEvent::RoomUpdated(room_jid)).await;
            }
            IncomingMessageKind::Chat => {
                let bare_sender = bare_from(&msg.from);
                self.ensure_dm_room(&bare_sender).await;

                if msg.is_delayed && self.is_duplicate(&bare_sender, &bare_sender, &msg.body, msg.timestamp) {
                    return;
                }

                let Some(room) = self.rooms.get_mut(&bare_sender) else { return };
                let chat_msg = ChatMessage {
                    timestamp: msg.timestamp.unwrap_or_else(now_unix),
                    sender: bare_sender.clone(),
                    body: msg.body,
                    kind: MessageKind::Chat,
                };
                room.messages.push(chat_msg.clone());
                if let (Ok(account_bare), Ok(jid)) = (self.account.bare_jid(), Jid::parse(&bare_sender)) {
                    self.log_store.append(&account_bare, &dm_room_name(&jid.localpart), chat_msg);
                }
                let _ = event_tx.send(SupervisorEvent::RoomUpdated(bare_sender)).await;
            }
            IncomingMessageKind::Normal => {}
        }
    }

    async fn handle_incoming_presence(&mut self, presence: IncomingPresence, event_tx: &mpsc::Sender<SupervisorEvent>) {
        let room_jid = bare_from(&presence.from);
        let Some(item) = presence.muc_item.as_ref() else { return };
        let Some(room) = self.rooms.get_mut(&room_jid) else { return };

        let nick = presence.from.rsplit('/').next().unwrap_or(&presence.from).to_string();
        let occupant = Occupant {
            nick: nick.clone(),
            affiliation: Affiliation::parse(&item.affiliation),
            role: Role::parse(&item.role),
        };
        let is_unavailable = presence.presence_type.as_deref() == Some("unavailable");
        let account_bare = self.account.bare_jid().unwrap_or_default();

        if !room.initial_presence_complete {
            if presence.is_self_presence {
                room.initial_presence_complete = true;
                room.self_nickname = nick;
                room.occupants = std::mem::take(&mut room.pending_occupants);
                if !is_unavailable {
                    room.occupants.push(occupant);
                }
                room.occupants.sort();
                let count = room.occupants.len();
                let system = ChatMessage {
                    timestamp: now_unix(),
                    sender: String::new(),
                    body: format!("Joined ({count} users)"),
                    kind: MessageKind::System,
                };
                room.messages.push(system.clone());
                self.log_store.append(&account_bare, &room_jid, system);
                let _ = event_tx.send(SupervisorEvent::RoomUpdated(room_jid)).await;
            } else if !is_unavailable {
                room.pending_occupants.push(occupant);
            }
            return;
        }

        if is_unavailable {
            room.remove_occupant(&nick);
            let part_msg = ChatMessage { timestamp: now_unix(), sender: nick, body: String::new(), kind: MessageKind::Part };
            room.messages.push(part_msg.clone());
            self.log_store.append(&account_bare, &room_jid, part_msg);
        } else {
            let is_new_occupant = !room.occupants.iter().any(|o| o.nick == nick);
            room.remove_occupant(&nick);
            room.insert_occupant_sorted(occupant);
            if is_new_occupant {
                let join_msg = ChatMessage { timestamp: now_unix(), sender: nick, body: String::new(), kind: MessageKind::Join };
                room.messages.push(join_msg.clone());
                self.log_store.append(&account_bare, &room_jid, join_msg);
            }
        }
        let _ = event_tx.send(SupervisorEvent::RoomUpdated(room_jid)).await;
    }

    async fn handle_room_subject(&mut self, room: String, text: String, event_tx: &mpsc::Sender<SupervisorEvent>) {
        let room_jid = bare_from(&room);
        let account_bare = self.account.bare_jid().unwrap_or_default();
        let Some(room) = self.rooms.get_mut(&room_jid) else { return };
        room.topic = Some(text.clone());
        room.has_displayed_topic = true;
        let topic_msg = ChatMessage { timestamp: now_unix(), sender: String::new(), body: text, kind: MessageKind::Topic };
        room.messages.push(topic_msg.clone());
        self.log_store.append(&account_bare, &room_jid, topic_msg);
        let _ = event_tx.send(SupervisorEvent::RoomUpdated(room_jid)).await;
    }

    async fn handle_disconnect(&mut self, reason: DisconnectReason) {
        match &reason {
            DisconnectReason::UserRequested => self.manually_disconnected = true,
            DisconnectReason::Conflict => warn!("disconnected: {reason}"),
            DisconnectReason::Error(e) if !e.is_retriable() => {
                warn!("permanent failure: {reason}");
                self.permanent_failure = Some(reason.to_string());
            }
            DisconnectReason::Error(_) => warn!("disconnected: {reason}"),
        }
        self.append_account_system_message(format!("Disconnected: {reason}")).await;
    }

    async fn append_account_system_message(&mut self, text: String) {
        let Some(room_jid) = self.account.rooms.first().cloned() else { return };
        let account_bare = self.account.bare_jid().unwrap_or_default();
        let msg = ChatMessage { timestamp: now_unix(), sender: String::new(), body: text, kind: MessageKind::System };
        if let Some(room) = self.rooms.get_mut(&room_jid) {
            room.messages.push(msg.clone());
        }
        self.log_store.append(&account_bare, &room_jid, msg);
    }

    /// Erases the password from both this Supervisor and the secret
    /// store — used by `disconnect()`'s permanent-failure path and by
    /// account removal. Credentials otherwise live only in the
    /// `SecretStore`, never the key-value settings blob (§4.5).
    pub async fn forget_password(&mut self) -> anyhow::Result<()> {
        self.password.clear();
        if let Ok(bare) = self.account.bare_jid() {
            self.secret_store.delete(&bare).await?;
        }
        Ok(())
    }
}
