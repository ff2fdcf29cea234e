use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::services::AnalyticsSink;

/// Buffer contents for a room created without an exercise template.
pub const DEFAULT_CONTENT: &str = "// Write your solution here\n";
pub const DEFAULT_LANGUAGE: &str = "javascript";

const ROOM_CODE_LEN: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Only the room creator can perform this action")]
    NotCreator,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub joined_at: u64,
}

#[derive(Clone, Debug)]
pub struct RoomSnapshot {
    pub content: String,
    pub language: String,
    pub participants: Vec<Participant>,
}

#[derive(Clone, Debug)]
pub struct CreatedRoom {
    pub room_id: String,
    pub user_id: String,
}

/// Session counters reported to analytics when a room is reclaimed.
#[derive(Clone, Debug)]
pub struct RoomMetrics {
    pub duration_secs: u64,
    pub peak_participants: usize,
    pub edit_count: u64,
}

#[derive(Debug)]
pub struct Departure {
    pub username: String,
    pub remaining: Vec<Participant>,
    /// Present when this departure emptied the room and it was reclaimed.
    pub metrics: Option<RoomMetrics>,
}

#[derive(Debug)]
pub struct KickOutcome {
    /// Participant list before removal; the kicked user must still receive
    /// the `kicked` broadcast.
    pub recipients: Vec<Participant>,
    pub metrics: Option<RoomMetrics>,
}

struct Room {
    creator_id: String,
    content: String,
    language: String,
    participants: Vec<Participant>,
    muted: HashSet<String>,
    created: SystemTime,
    last_activity: Instant,
    peak_participants: usize,
    edit_count: u64,
}

impl Room {
    fn new(creator_id: &str, creator_username: &str, content: String, language: String) -> Self {
        let mut room = Room {
            creator_id: creator_id.to_string(),
            content,
            language,
            participants: Vec::new(),
            muted: HashSet::new(),
            created: SystemTime::now(),
            last_activity: Instant::now(),
            peak_participants: 0,
            edit_count: 0,
        };
        room.upsert_participant(creator_id, creator_username);
        room
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Removes any existing record for `user_id` before appending, so a
    /// reconnecting user never appears twice in the roster.
    fn upsert_participant(&mut self, user_id: &str, username: &str) {
        self.participants.retain(|p| p.user_id != user_id);
        self.participants.push(Participant {
            user_id: user_id.to_string(),
            username: username.to_string(),
            joined_at: now_millis(),
        });
        self.peak_participants = self.peak_participants.max(self.participants.len());
    }

    fn is_member(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            content: self.content.clone(),
            language: self.language.clone(),
            participants: self.participants.clone(),
        }
    }

    fn metrics(&self) -> RoomMetrics {
        RoomMetrics {
            duration_secs: self
                .created
                .elapsed()
                .unwrap_or_default()
                .as_secs(),
            peak_participants: self.peak_participants,
            edit_count: self.edit_count,
        }
    }
}

/// Authoritative in-memory mapping from room identifier to room state.
///
/// The registry is the only shared mutable resource in the process; every
/// read-modify operation runs under its write guard, which serializes
/// concurrent events against the same room on a multi-threaded runtime.
/// Broadcast fan-out happens after the guard is released, against the
/// participant snapshot the operation returned.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    expiry: Duration,
}

impl RoomRegistry {
    pub fn new(expiry: Duration) -> Self {
        RoomRegistry {
            rooms: RwLock::new(HashMap::new()),
            expiry,
        }
    }

    /// Creates a room with the creator as sole participant and returns the
    /// fresh identifiers. Username validation happens at the HTTP layer.
    pub async fn create_room(
        &self,
        creator_username: &str,
        content: String,
        language: String,
    ) -> CreatedRoom {
        let user_id = Uuid::new_v4().to_string();
        let mut rooms = self.rooms.write().await;

        let room_id = loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(ROOM_CODE_LEN)
                .map(char::from)
                .collect();
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let room = Room::new(&user_id, creator_username, content, language);
        rooms.insert(room_id.clone(), room);
        info!("room {} created by {}", room_id, creator_username);

        CreatedRoom { room_id, user_id }
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(Room::snapshot)
    }

    pub async fn participants(&self, room_id: &str) -> Result<Vec<Participant>, RoomError> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.participants.clone())
            .ok_or(RoomError::RoomNotFound)
    }

    pub async fn is_creator(&self, room_id: &str, user_id: &str) -> Result<bool, RoomError> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.creator_id == user_id)
            .ok_or(RoomError::RoomNotFound)
    }

    pub async fn is_muted(&self, room_id: &str, user_id: &str) -> Result<bool, RoomError> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.muted.contains(user_id))
            .ok_or(RoomError::RoomNotFound)
    }

    /// Adds or replaces the participant record and returns the post-join
    /// snapshot. Idempotent under repeated joins with the same identity.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
    ) -> Result<RoomSnapshot, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        room.upsert_participant(user_id, username);
        room.touch();
        Ok(room.snapshot())
    }

    /// Filters the participant out; reclaims the room when it empties.
    /// Returns `None` when the room or the participant was already gone.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> Option<Departure> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let record = room
            .participants
            .iter()
            .find(|p| p.user_id == user_id)?
            .clone();

        room.participants.retain(|p| p.user_id != user_id);
        room.touch();

        let remaining = room.participants.clone();
        let metrics = if remaining.is_empty() {
            let room = rooms.remove(room_id)?;
            info!("room {} reclaimed after last participant left", room_id);
            Some(room.metrics())
        } else {
            None
        };

        Some(Departure {
            username: record.username,
            remaining,
            metrics,
        })
    }

    /// Last-write-wins overwrite of the shared buffer. Returns the recipient
    /// list on success, or `Ok(None)` when the editor is no longer a member
    /// (a late event from a kicked or departed participant, dropped silently).
    pub async fn record_content(
        &self,
        room_id: &str,
        editor_id: &str,
        code: String,
    ) -> Result<Option<Vec<Participant>>, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if !room.is_member(editor_id) {
            debug!("dropping code_change from non-member {}", editor_id);
            return Ok(None);
        }
        room.content = code;
        room.edit_count += 1;
        room.touch();
        Ok(Some(room.participants.clone()))
    }

    pub async fn record_language(
        &self,
        room_id: &str,
        editor_id: &str,
        language: String,
    ) -> Result<Option<Vec<Participant>>, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if !room.is_member(editor_id) {
            debug!("dropping language_change from non-member {}", editor_id);
            return Ok(None);
        }
        room.language = language;
        room.touch();
        Ok(Some(room.participants.clone()))
    }

    pub async fn mute(
        &self,
        room_id: &str,
        actor_id: &str,
        target_id: &str,
    ) -> Result<Vec<Participant>, RoomError> {
        self.set_muted(room_id, actor_id, target_id, true).await
    }

    pub async fn unmute(
        &self,
        room_id: &str,
        actor_id: &str,
        target_id: &str,
    ) -> Result<Vec<Participant>, RoomError> {
        self.set_muted(room_id, actor_id, target_id, false).await
    }

    async fn set_muted(
        &self,
        room_id: &str,
        actor_id: &str,
        target_id: &str,
        muted: bool,
    ) -> Result<Vec<Participant>, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if room.creator_id != actor_id {
            return Err(RoomError::NotCreator);
        }
        if muted {
            room.muted.insert(target_id.to_string());
        } else {
            room.muted.remove(target_id);
        }
        room.touch();
        Ok(room.participants.clone())
    }

    /// Removes the target from the room. The returned recipient list is taken
    /// before removal so the kicked user still sees the broadcast.
    pub async fn kick(
        &self,
        room_id: &str,
        actor_id: &str,
        target_id: &str,
    ) -> Result<KickOutcome, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        if room.creator_id != actor_id {
            return Err(RoomError::NotCreator);
        }

        let recipients = room.participants.clone();
        room.participants.retain(|p| p.user_id != target_id);
        room.muted.remove(target_id);
        room.touch();

        let metrics = if room.participants.is_empty() {
            let reclaimed = rooms.remove(room_id).map(|r| r.metrics());
            info!("room {} reclaimed after last participant was kicked", room_id);
            reclaimed
        } else {
            None
        };

        Ok(KickOutcome { recipients, metrics })
    }

    /// Inactivity safety net for rooms whose last departure was never
    /// observed. Eager reclaim in [`RoomRegistry::leave`] is the primary path.
    pub async fn sweep_expired(&self) -> Vec<(String, RoomMetrics)> {
        let mut rooms = self.rooms.write().await;
        let expired: Vec<String> = rooms
            .iter()
            .filter(|(_, room)| room.last_activity.elapsed() >= self.expiry)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                let room = rooms.remove(&id)?;
                info!("room {} reclaimed by inactivity sweep", id);
                Some((id, room.metrics()))
            })
            .collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// Periodic inactivity sweep; reclaimed rooms are reported to analytics.
pub fn start_sweeper(
    registry: Arc<RoomRegistry>,
    analytics: Arc<dyn AnalyticsSink>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for (room_id, metrics) in registry.sweep_expired().await {
                analytics.emit(
                    "room_expired",
                    serde_json::json!({
                        "roomId": room_id,
                        "durationSecs": metrics.duration_secs,
                        "peakParticipants": metrics.peak_participants,
                        "editCount": metrics.edit_count,
                    }),
                );
            }
        }
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Duration::from_secs(1800))
    }

    async fn default_room(reg: &RoomRegistry) -> CreatedRoom {
        reg.create_room("Alice", DEFAULT_CONTENT.into(), DEFAULT_LANGUAGE.into())
            .await
    }

    #[tokio::test]
    async fn create_room_returns_fresh_identifiers() {
        let reg = registry();
        let created = default_room(&reg).await;
        assert!(!created.room_id.is_empty());
        assert!(!created.user_id.is_empty());

        let snap = reg.snapshot(&created.room_id).await.expect("room exists");
        assert_eq!(snap.content, DEFAULT_CONTENT);
        assert_eq!(snap.language, DEFAULT_LANGUAGE);
        assert_eq!(snap.participants.len(), 1);
        assert_eq!(snap.participants[0].username, "Alice");
    }

    #[tokio::test]
    async fn join_is_idempotent_per_user_id() {
        let reg = registry();
        let created = default_room(&reg).await;

        reg.join(&created.room_id, &created.user_id, "Alice")
            .await
            .expect("join");
        let snap = reg
            .join(&created.room_id, &created.user_id, "Alice")
            .await
            .expect("rejoin");

        let alice: Vec<_> = snap
            .participants
            .iter()
            .filter(|p| p.user_id == created.user_id)
            .collect();
        assert_eq!(alice.len(), 1);
    }

    #[tokio::test]
    async fn join_unknown_room_is_not_found() {
        let reg = registry();
        let err = reg.join("missing", "u1", "Bob").await.unwrap_err();
        assert_eq!(err, RoomError::RoomNotFound);
        assert_eq!(err.to_string(), "Room not found");
    }

    #[tokio::test]
    async fn last_leave_reclaims_the_room() {
        let reg = registry();
        let created = default_room(&reg).await;
        reg.join(&created.room_id, "u2", "Bob").await.expect("join");

        let departure = reg.leave(&created.room_id, "u2").await.expect("leave");
        assert_eq!(departure.remaining.len(), 1);
        assert!(departure.metrics.is_none());

        let departure = reg
            .leave(&created.room_id, &created.user_id)
            .await
            .expect("leave");
        assert!(departure.remaining.is_empty());
        let metrics = departure.metrics.expect("reclaim metrics");
        assert_eq!(metrics.peak_participants, 2);

        assert!(reg.snapshot(&created.room_id).await.is_none());
        assert_eq!(reg.room_count().await, 0);
    }

    #[tokio::test]
    async fn leave_is_a_noop_for_unknown_participants() {
        let reg = registry();
        let created = default_room(&reg).await;
        assert!(reg.leave(&created.room_id, "ghost").await.is_none());
        assert!(reg.snapshot(&created.room_id).await.is_some());
    }

    #[tokio::test]
    async fn content_overwrite_is_last_write_wins() {
        let reg = registry();
        let created = default_room(&reg).await;

        for i in 0..5 {
            reg.record_content(&created.room_id, &created.user_id, format!("x = {i}"))
                .await
                .expect("write")
                .expect("member");
        }

        let snap = reg.snapshot(&created.room_id).await.expect("room");
        assert_eq!(snap.content, "x = 4");
    }

    #[tokio::test]
    async fn edits_from_non_members_are_dropped() {
        let reg = registry();
        let created = default_room(&reg).await;

        let applied = reg
            .record_content(&created.room_id, "stranger", "pwned".into())
            .await
            .expect("room exists");
        assert!(applied.is_none());

        let snap = reg.snapshot(&created.room_id).await.expect("room");
        assert_eq!(snap.content, DEFAULT_CONTENT);
    }

    #[tokio::test]
    async fn language_change_is_independent_of_content() {
        let reg = registry();
        let created = default_room(&reg).await;

        reg.record_language(&created.room_id, &created.user_id, "rust".into())
            .await
            .expect("room")
            .expect("member");

        let snap = reg.snapshot(&created.room_id).await.expect("room");
        assert_eq!(snap.language, "rust");
        assert_eq!(snap.content, DEFAULT_CONTENT);
    }

    #[tokio::test]
    async fn moderation_requires_the_creator() {
        let reg = registry();
        let created = default_room(&reg).await;
        reg.join(&created.room_id, "u2", "Bob").await.expect("join");

        let err = reg.mute(&created.room_id, "u2", &created.user_id).await.unwrap_err();
        assert_eq!(err, RoomError::NotCreator);
        let err = reg.kick(&created.room_id, "u2", &created.user_id).await.unwrap_err();
        assert_eq!(err, RoomError::NotCreator);

        reg.mute(&created.room_id, &created.user_id, "u2")
            .await
            .expect("creator mutes");
        assert!(reg.is_muted(&created.room_id, "u2").await.expect("room"));

        reg.unmute(&created.room_id, &created.user_id, "u2")
            .await
            .expect("creator unmutes");
        assert!(!reg.is_muted(&created.room_id, "u2").await.expect("room"));
    }

    #[tokio::test]
    async fn kick_removes_target_but_keeps_them_in_recipients() {
        let reg = registry();
        let created = default_room(&reg).await;
        reg.join(&created.room_id, "u2", "Bob").await.expect("join");

        let outcome = reg
            .kick(&created.room_id, &created.user_id, "u2")
            .await
            .expect("kick");
        assert!(outcome.recipients.iter().any(|p| p.user_id == "u2"));
        assert!(outcome.metrics.is_none());

        let snap = reg.snapshot(&created.room_id).await.expect("room");
        assert!(!snap.participants.iter().any(|p| p.user_id == "u2"));
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_rooms() {
        let reg = RoomRegistry::new(Duration::ZERO);
        let created = reg
            .create_room("Alice", DEFAULT_CONTENT.into(), DEFAULT_LANGUAGE.into())
            .await;

        let reclaimed = reg.sweep_expired().await;
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].0, created.room_id);
        assert!(reg.snapshot(&created.room_id).await.is_none());
    }

    #[tokio::test]
    async fn sweep_spares_active_rooms() {
        let reg = registry();
        let created = default_room(&reg).await;

        assert!(reg.sweep_expired().await.is_empty());
        assert!(reg.snapshot(&created.room_id).await.is_some());
    }
}
