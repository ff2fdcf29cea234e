use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, RwLock};
use warp::ws::{Message, WebSocket};

use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::{Participant, RoomRegistry};
use crate::services::{AnalyticsSink, CodeAnalyzer};

type Connections = RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>;

/// One websocket client as the server sees it. `session` is established by
/// the first successful `join_room` and drives disconnect cleanup.
pub struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    session: Option<Session>,
}

#[derive(Clone)]
struct Session {
    room_id: String,
    user_id: String,
}

pub struct Server {
    registry: Arc<RoomRegistry>,
    connections: Connections,
    analyzer: Arc<dyn CodeAnalyzer>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl Server {
    pub fn new(
        registry: Arc<RoomRegistry>,
        analyzer: Arc<dyn CodeAnalyzer>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Server {
            registry,
            connections: RwLock::new(HashMap::new()),
            analyzer,
            analytics,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Creates the outbox pair for a new client. The receiver side is drained
    /// by the websocket writer task (or directly by tests).
    pub fn open(&self) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection { tx, session: None }, rx)
    }

    pub async fn handle_connection(self: Arc<Self>, ws: WebSocket) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (mut conn, mut rx) = self.open();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    if msg.is_close() {
                        break;
                    }
                    if let Ok(text) = msg.to_str() {
                        match serde_json::from_str::<ClientMessage>(text) {
                            Ok(client_msg) => self.dispatch(&mut conn, client_msg).await,
                            Err(e) => debug!("discarding malformed message: {}", e),
                        }
                    }
                }
                Err(e) => {
                    // Abrupt transport failure runs the same cleanup as a
                    // clean close; ghost participants must not linger.
                    warn!("websocket error: {}", e);
                    break;
                }
            }
        }

        self.disconnect(&mut conn).await;
        writer.abort();
    }

    pub async fn dispatch(&self, conn: &mut Connection, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom {
                room_id,
                user_id,
                username,
                is_creator: _,
            } => self.handle_join(conn, room_id, user_id, username).await,

            ClientMessage::CodeChange { room_id, code } => {
                let Some(session) = sender_session(conn, &room_id) else {
                    return;
                };
                match self
                    .registry
                    .record_content(&room_id, &session.user_id, code.clone())
                    .await
                {
                    Ok(Some(participants)) => {
                        self.broadcast(
                            &participants,
                            &ServerMessage::ReceiveCode { code },
                            Some(&session.user_id),
                        )
                        .await;
                    }
                    Ok(None) => {}
                    Err(err) => unicast(&conn.tx, &error_message(&err.to_string())),
                }
            }

            ClientMessage::LanguageChange { room_id, language } => {
                let Some(session) = sender_session(conn, &room_id) else {
                    return;
                };
                match self
                    .registry
                    .record_language(&room_id, &session.user_id, language.clone())
                    .await
                {
                    Ok(Some(participants)) => {
                        self.broadcast(
                            &participants,
                            &ServerMessage::LanguageChanged { language },
                            Some(&session.user_id),
                        )
                        .await;
                    }
                    Ok(None) => {}
                    Err(err) => unicast(&conn.tx, &error_message(&err.to_string())),
                }
            }

            ClientMessage::CursorMove {
                room_id,
                user_id,
                username,
                position,
            } => {
                let Some(session) = sender_session(conn, &room_id) else {
                    return;
                };
                // Pure relay: lossy by design, no persistence, no retry.
                match self.registry.participants(&room_id).await {
                    Ok(participants) => {
                        self.broadcast(
                            &participants,
                            &ServerMessage::CursorUpdate {
                                user_id,
                                username,
                                position,
                            },
                            Some(&session.user_id),
                        )
                        .await;
                    }
                    Err(_) => debug!("dropping cursor_move for unknown room {}", room_id),
                }
            }

            ClientMessage::SelectionChange {
                room_id,
                user_id,
                username,
                selection,
            } => {
                let Some(session) = sender_session(conn, &room_id) else {
                    return;
                };
                match self.registry.participants(&room_id).await {
                    Ok(participants) => {
                        self.broadcast(
                            &participants,
                            &ServerMessage::SelectionUpdate {
                                user_id,
                                username,
                                selection,
                            },
                            Some(&session.user_id),
                        )
                        .await;
                    }
                    Err(_) => debug!("dropping selection_change for unknown room {}", room_id),
                }
            }

            ClientMessage::MuteUser { room_id, user_id } => {
                self.handle_mute(conn, &room_id, &user_id, true).await;
            }

            ClientMessage::UnmuteUser { room_id, user_id } => {
                self.handle_mute(conn, &room_id, &user_id, false).await;
            }

            ClientMessage::KickUser { room_id, user_id } => {
                self.handle_kick(conn, &room_id, &user_id).await;
            }

            ClientMessage::RequestAnalysis {
                room_id,
                code,
                language,
            } => self.handle_analysis(conn, &room_id, code, language).await,
        }
    }

    async fn handle_join(
        &self,
        conn: &mut Connection,
        room_id: String,
        user_id: String,
        username: String,
    ) {
        // A connection hopping identities or rooms leaves its old room first.
        if let Some(session) = conn.session.clone() {
            if session.room_id != room_id || session.user_id != user_id {
                self.leave_room(&session).await;
            }
        }

        match self.registry.join(&room_id, &user_id, &username).await {
            Ok(snapshot) => {
                {
                    let mut connections = self.connections.write().await;
                    connections.insert(user_id.clone(), conn.tx.clone());
                }
                conn.session = Some(Session {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                });

                unicast(
                    &conn.tx,
                    &ServerMessage::RoomState {
                        code: snapshot.content,
                        language: snapshot.language,
                        participants: snapshot.participants.clone(),
                    },
                );
                self.broadcast(
                    &snapshot.participants,
                    &ServerMessage::UserJoined {
                        user_id: user_id.clone(),
                        username: username.clone(),
                    },
                    Some(&user_id),
                )
                .await;

                info!("{} joined room {}", username, room_id);
                self.analytics.emit(
                    "user_joined",
                    serde_json::json!({ "roomId": room_id, "userId": user_id }),
                );
            }
            Err(err) => unicast(&conn.tx, &error_message(&err.to_string())),
        }
    }

    async fn handle_mute(&self, conn: &Connection, room_id: &str, target_id: &str, mute: bool) {
        let Some(session) = conn.session.as_ref() else {
            return;
        };
        let result = if mute {
            self.registry.mute(room_id, &session.user_id, target_id).await
        } else {
            self.registry.unmute(room_id, &session.user_id, target_id).await
        };

        match result {
            Ok(participants) => {
                // Moderation broadcasts go to the whole room, actor included.
                let message = if mute {
                    ServerMessage::UserMuted {
                        user_id: target_id.to_string(),
                    }
                } else {
                    ServerMessage::UserUnmuted {
                        user_id: target_id.to_string(),
                    }
                };
                self.broadcast(&participants, &message, None).await;
                self.analytics.emit(
                    if mute { "user_muted" } else { "user_unmuted" },
                    serde_json::json!({ "roomId": room_id, "userId": target_id }),
                );
            }
            Err(err) => unicast(&conn.tx, &error_message(&err.to_string())),
        }
    }

    async fn handle_kick(&self, conn: &Connection, room_id: &str, target_id: &str) {
        let Some(session) = conn.session.as_ref() else {
            return;
        };
        match self.registry.kick(room_id, &session.user_id, target_id).await {
            Ok(outcome) => {
                self.broadcast(
                    &outcome.recipients,
                    &ServerMessage::Kicked {
                        user_id: target_id.to_string(),
                    },
                    None,
                )
                .await;

                // Forcibly terminate the target's transport.
                let evicted = {
                    let mut connections = self.connections.write().await;
                    connections.remove(target_id)
                };
                if let Some(tx) = evicted {
                    let _ = tx.send(Message::close());
                }

                info!("{} kicked from room {}", target_id, room_id);
                self.analytics.emit(
                    "user_kicked",
                    serde_json::json!({ "roomId": room_id, "userId": target_id }),
                );
                if let Some(metrics) = outcome.metrics {
                    self.emit_room_closed(room_id, &metrics);
                }
            }
            Err(err) => unicast(&conn.tx, &error_message(&err.to_string())),
        }
    }

    async fn handle_analysis(
        &self,
        conn: &Connection,
        room_id: &str,
        code: String,
        language: String,
    ) {
        let Some(session) = conn.session.as_ref() else {
            return;
        };
        match self.registry.is_creator(room_id, &session.user_id).await {
            Ok(true) => {
                // Analysis runs out-of-band; no room state is held across it
                // and the result is unicast to the requesting creator only.
                let analyzer = self.analyzer.clone();
                let tx = conn.tx.clone();
                tokio::spawn(async move {
                    let message = match analyzer.analyze(&code, &language).await {
                        Ok(analysis) => ServerMessage::AnalysisResult { analysis },
                        Err(err) => {
                            warn!("analysis failed: {}", err);
                            error_message("Analysis failed")
                        }
                    };
                    unicast(&tx, &message);
                });
            }
            Ok(false) => unicast(
                &conn.tx,
                &error_message("Only the room creator can perform this action"),
            ),
            Err(err) => unicast(&conn.tx, &error_message(&err.to_string())),
        }
    }

    /// Transport-level disconnect: identical cleanup for clean closes and
    /// abrupt failures. A reconnect may already have re-keyed this user's
    /// outbox; only the transport that still owns the key removes the
    /// participant.
    pub async fn disconnect(&self, conn: &mut Connection) {
        let Some(session) = conn.session.take() else {
            return;
        };

        let owns_identity = {
            let mut connections = self.connections.write().await;
            match connections.get(&session.user_id) {
                Some(current) if current.same_channel(&conn.tx) => {
                    connections.remove(&session.user_id);
                    true
                }
                _ => false,
            }
        };

        if owns_identity {
            self.leave_room(&session).await;
        }
    }

    async fn leave_room(&self, session: &Session) {
        if let Some(departure) = self.registry.leave(&session.room_id, &session.user_id).await {
            self.broadcast(
                &departure.remaining,
                &ServerMessage::UserLeft {
                    user_id: session.user_id.clone(),
                },
                None,
            )
            .await;
            info!("{} left room {}", departure.username, session.room_id);
            if let Some(metrics) = departure.metrics {
                self.emit_room_closed(&session.room_id, &metrics);
            }
        }
    }

    fn emit_room_closed(&self, room_id: &str, metrics: &crate::registry::RoomMetrics) {
        self.analytics.emit(
            "room_closed",
            serde_json::json!({
                "roomId": room_id,
                "durationSecs": metrics.duration_secs,
                "peakParticipants": metrics.peak_participants,
                "editCount": metrics.edit_count,
            }),
        );
    }

    async fn broadcast(
        &self,
        participants: &[Participant],
        message: &ServerMessage,
        except: Option<&str>,
    ) {
        let Some(frame) = encode(message) else {
            return;
        };
        let connections = self.connections.read().await;
        for participant in participants {
            if Some(participant.user_id.as_str()) == except {
                continue;
            }
            if let Some(sender) = connections.get(&participant.user_id) {
                let _ = sender.send(frame.clone());
            }
        }
    }
}

/// Checks that the message targets the room this connection joined; events
/// sent before `join_room`, or addressed to another room, are dropped.
fn sender_session<'a>(conn: &'a Connection, room_id: &str) -> Option<&'a Session> {
    let session = conn.session.as_ref()?;
    if session.room_id != room_id {
        debug!(
            "dropping event for room {} from connection joined to {}",
            room_id, session.room_id
        );
        return None;
    }
    Some(session)
}

fn unicast(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    if let Some(frame) = encode(message) {
        let _ = tx.send(frame);
    }
}

fn error_message(message: &str) -> ServerMessage {
    ServerMessage::Error {
        message: message.to_string(),
    }
}

fn encode(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            error!("failed to encode server message: {}", e);
            None
        }
    }
}
