//! Client-side synchronization agent.
//!
//! Reconciles optimistic local edits with the server's authoritative
//! broadcasts and projects ephemeral presence from the cursor/selection
//! relay stream. The agent is transport-agnostic: incoming
//! [`ServerMessage`]s are fed to [`SessionAgent::handle_server`] and
//! outgoing [`ClientMessage`]s accumulate in an outbox the transport drains.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::messages::{ClientMessage, Position, Selection, ServerMessage};

/// Remote cursors are dimmed after this much inactivity.
pub const PRESENCE_IDLE_AFTER: Duration = Duration::from_secs(10);
/// And dropped from the map entirely after this much.
pub const PRESENCE_PURGE_AFTER: Duration = Duration::from_secs(30);

/// Explicit connection lifecycle, replacing scattered boolean flags.
/// `Kicked` is terminal for the session; the UI redirects away from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
    Kicked,
}

/// Outcome of a local edit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Applied optimistically and queued for emission.
    Applied,
    /// The local user is muted; nothing was applied or emitted.
    RejectedMuted,
    /// Not currently joined to a room.
    NotJoined,
}

/// The shared buffer under the last-write-wins model. Local edits apply
/// immediately; a remote broadcast replaces the whole buffer, even mid-edit.
/// Future merge strategies (OT/CRDT) would replace this type alone.
#[derive(Debug, Default)]
pub struct LastWriteWinsBuffer {
    content: String,
}

impl LastWriteWinsBuffer {
    pub fn new(content: impl Into<String>) -> Self {
        LastWriteWinsBuffer {
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn apply_local(&mut self, content: &str) {
        self.content = content.to_string();
    }

    pub fn apply_remote(&mut self, content: String) {
        self.content = content;
    }
}

struct PresenceEntry {
    username: String,
    cursor: Option<Position>,
    selection: Option<Selection>,
    last_seen: Instant,
}

/// Snapshot of one remote participant's presence for rendering.
#[derive(Debug, Clone)]
pub struct RemotePresence {
    pub user_id: String,
    pub username: String,
    pub cursor: Option<Position>,
    pub selection: Option<Selection>,
    pub idle: bool,
}

/// Pure projection of the `cursor_update`/`selection_update` stream.
/// Disposable and rebuildable; never consulted for content convergence.
#[derive(Default)]
pub struct PresenceMap {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceMap {
    pub fn new() -> Self {
        PresenceMap::default()
    }

    pub fn observe_cursor(&mut self, user_id: &str, username: &str, position: Position, now: Instant) {
        let entry = self.entry(user_id, username, now);
        entry.cursor = Some(position);
    }

    pub fn observe_selection(
        &mut self,
        user_id: &str,
        username: &str,
        selection: Selection,
        now: Instant,
    ) {
        let entry = self.entry(user_id, username, now);
        entry.selection = Some(selection);
    }

    fn entry(&mut self, user_id: &str, username: &str, now: Instant) -> &mut PresenceEntry {
        let entry = self
            .entries
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceEntry {
                username: username.to_string(),
                cursor: None,
                selection: None,
                last_seen: now,
            });
        entry.username = username.to_string();
        entry.last_seen = now;
        entry
    }

    pub fn remove(&mut self, user_id: &str) {
        self.entries.remove(user_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops entries not seen within the purge threshold.
    pub fn prune(&mut self, now: Instant) {
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) < PRESENCE_PURGE_AFTER);
    }

    /// Renderable presence; entries past the idle threshold are flagged so
    /// the UI can dim them.
    pub fn visible(&self, now: Instant) -> Vec<RemotePresence> {
        self.entries
            .iter()
            .map(|(user_id, entry)| RemotePresence {
                user_id: user_id.clone(),
                username: entry.username.clone(),
                cursor: entry.cursor,
                selection: entry.selection,
                idle: now.duration_since(entry.last_seen) >= PRESENCE_IDLE_AFTER,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stored identity, persisted client-side so a reconnect can re-join as the
/// same participant.
#[derive(Debug, Clone)]
pub struct Identity {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub is_creator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub user_id: String,
    pub username: String,
}

pub struct SessionAgent {
    identity: Identity,
    state: ConnectionState,
    buffer: LastWriteWinsBuffer,
    language: String,
    roster: Vec<RosterEntry>,
    muted_users: HashSet<String>,
    presence: PresenceMap,
    last_error: Option<String>,
    last_analysis: Option<String>,
    outbox: Vec<ClientMessage>,
}

impl SessionAgent {
    pub fn new(identity: Identity) -> Self {
        SessionAgent {
            identity,
            state: ConnectionState::Disconnected,
            buffer: LastWriteWinsBuffer::default(),
            language: String::new(),
            roster: Vec::new(),
            muted_users: HashSet::new(),
            presence: PresenceMap::new(),
            last_error: None,
            last_analysis: None,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn content(&self) -> &str {
        self.buffer.content()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceMap {
        &mut self.presence
    }

    pub fn is_muted(&self) -> bool {
        self.muted_users.contains(&self.identity.user_id)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_analysis(&self) -> Option<&str> {
        self.last_analysis.as_deref()
    }

    /// Starts (or restarts) the join handshake with the stored identity.
    /// Returns `false` when the transition is not allowed from the current
    /// state — notably after a kick.
    pub fn connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Connecting;
        self.outbox.push(ClientMessage::JoinRoom {
            room_id: self.identity.room_id.clone(),
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
            is_creator: self.identity.is_creator,
        });
        true
    }

    /// The transport dropped. Presence is disposable and rebuilt after the
    /// next join; a kicked session stays kicked.
    pub fn transport_lost(&mut self) {
        if self.state != ConnectionState::Kicked {
            self.state = ConnectionState::Disconnected;
        }
        self.presence.clear();
    }

    pub fn handle_server(&mut self, message: ServerMessage, now: Instant) {
        match message {
            ServerMessage::RoomState {
                code,
                language,
                participants,
            } => {
                // Authoritative snapshot: any locally buffered content from
                // before the (re)join is discarded in its favor.
                self.state = ConnectionState::Joined;
                self.buffer.apply_remote(code);
                self.language = language;
                self.roster = participants
                    .into_iter()
                    .map(|p| RosterEntry {
                        user_id: p.user_id,
                        username: p.username,
                    })
                    .collect();
            }

            ServerMessage::ReceiveCode { code } => {
                if self.state == ConnectionState::Joined {
                    self.buffer.apply_remote(code);
                }
            }

            ServerMessage::LanguageChanged { language } => {
                if self.state == ConnectionState::Joined {
                    self.language = language;
                }
            }

            ServerMessage::UserJoined { user_id, username } => {
                self.roster.retain(|entry| entry.user_id != user_id);
                self.roster.push(RosterEntry { user_id, username });
            }

            ServerMessage::UserLeft { user_id } => {
                self.roster.retain(|entry| entry.user_id != user_id);
                self.presence.remove(&user_id);
            }

            ServerMessage::CursorUpdate {
                user_id,
                username,
                position,
            } => {
                if user_id != self.identity.user_id {
                    self.presence.observe_cursor(&user_id, &username, position, now);
                }
            }

            ServerMessage::SelectionUpdate {
                user_id,
                username,
                selection,
            } => {
                if user_id != self.identity.user_id {
                    self.presence
                        .observe_selection(&user_id, &username, selection, now);
                }
            }

            ServerMessage::UserMuted { user_id } => {
                self.muted_users.insert(user_id);
            }

            ServerMessage::UserUnmuted { user_id } => {
                self.muted_users.remove(&user_id);
            }

            ServerMessage::Kicked { user_id } => {
                if user_id == self.identity.user_id {
                    self.state = ConnectionState::Kicked;
                    self.presence.clear();
                    self.roster.clear();
                } else {
                    self.roster.retain(|entry| entry.user_id != user_id);
                    self.presence.remove(&user_id);
                }
            }

            ServerMessage::AnalysisResult { analysis } => {
                self.last_analysis = Some(analysis);
            }

            ServerMessage::Error { message } => {
                if message == "Room not found" {
                    self.state = ConnectionState::Disconnected;
                }
                self.last_error = Some(message);
            }
        }
    }

    /// Optimistic local edit. Muted users see the edit rejected before any
    /// emission happens.
    pub fn edit(&mut self, content: &str) -> EditOutcome {
        if self.state != ConnectionState::Joined {
            return EditOutcome::NotJoined;
        }
        if self.is_muted() {
            return EditOutcome::RejectedMuted;
        }
        self.buffer.apply_local(content);
        self.outbox.push(ClientMessage::CodeChange {
            room_id: self.identity.room_id.clone(),
            code: content.to_string(),
        });
        EditOutcome::Applied
    }

    pub fn change_language(&mut self, language: &str) {
        if self.state != ConnectionState::Joined {
            return;
        }
        self.language = language.to_string();
        self.outbox.push(ClientMessage::LanguageChange {
            room_id: self.identity.room_id.clone(),
            language: language.to_string(),
        });
    }

    pub fn move_cursor(&mut self, position: Position) {
        if self.state != ConnectionState::Joined {
            return;
        }
        self.outbox.push(ClientMessage::CursorMove {
            room_id: self.identity.room_id.clone(),
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
            position,
        });
    }

    pub fn select(&mut self, selection: Selection) {
        if self.state != ConnectionState::Joined {
            return;
        }
        self.outbox.push(ClientMessage::SelectionChange {
            room_id: self.identity.room_id.clone(),
            user_id: self.identity.user_id.clone(),
            username: self.identity.username.clone(),
            selection,
        });
    }

    pub fn request_analysis(&mut self) {
        if self.state != ConnectionState::Joined {
            return;
        }
        self.outbox.push(ClientMessage::RequestAnalysis {
            room_id: self.identity.room_id.clone(),
            code: self.buffer.content().to_string(),
            language: self.language.clone(),
        });
    }

    /// Queued messages for the transport to send, in emission order.
    pub fn drain_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }
}
