use serde::{Deserialize, Serialize};

use crate::registry::Participant;

/// Cursor location inside the shared buffer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// A contiguous range of the shared buffer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub from: Position,
    pub to: Position,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "join_room")]
    JoinRoom {
        room_id: String,
        user_id: String,
        username: String,
        #[serde(default)]
        is_creator: bool,
    },
    #[serde(rename = "code_change")]
    CodeChange { room_id: String, code: String },
    #[serde(rename = "language_change")]
    LanguageChange { room_id: String, language: String },
    #[serde(rename = "cursor_move")]
    CursorMove {
        room_id: String,
        user_id: String,
        username: String,
        position: Position,
    },
    #[serde(rename = "selection_change")]
    SelectionChange {
        room_id: String,
        user_id: String,
        username: String,
        selection: Selection,
    },
    #[serde(rename = "mute_user")]
    MuteUser { room_id: String, user_id: String },
    #[serde(rename = "unmute_user")]
    UnmuteUser { room_id: String, user_id: String },
    #[serde(rename = "kick_user")]
    KickUser { room_id: String, user_id: String },
    #[serde(rename = "request_analysis")]
    RequestAnalysis {
        room_id: String,
        code: String,
        language: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Initial sync snapshot, unicast to the joining client.
    #[serde(rename = "room_state")]
    RoomState {
        code: String,
        language: String,
        participants: Vec<Participant>,
    },
    #[serde(rename = "user_joined")]
    UserJoined { user_id: String, username: String },
    #[serde(rename = "receive_code")]
    ReceiveCode { code: String },
    #[serde(rename = "language_changed")]
    LanguageChanged { language: String },
    #[serde(rename = "cursor_update")]
    CursorUpdate {
        user_id: String,
        username: String,
        position: Position,
    },
    #[serde(rename = "selection_update")]
    SelectionUpdate {
        user_id: String,
        username: String,
        selection: Selection,
    },
    #[serde(rename = "user_muted")]
    UserMuted { user_id: String },
    #[serde(rename = "user_unmuted")]
    UserUnmuted { user_id: String },
    #[serde(rename = "kicked")]
    Kicked { user_id: String },
    #[serde(rename = "user_left")]
    UserLeft { user_id: String },
    /// Free-text AI analysis, unicast to the requesting creator.
    #[serde(rename = "analysis_result")]
    AnalysisResult { analysis: String },
    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_wire_format() {
        let json = r#"{
            "type": "join_room",
            "roomId": "r1",
            "userId": "u1",
            "username": "Alice",
            "isCreator": true
        }"#;

        match serde_json::from_str::<ClientMessage>(json) {
            Ok(ClientMessage::JoinRoom {
                room_id,
                user_id,
                username,
                is_creator,
            }) => {
                assert_eq!(room_id, "r1");
                assert_eq!(user_id, "u1");
                assert_eq!(username, "Alice");
                assert!(is_creator);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn is_creator_defaults_to_false() {
        let json = r#"{"type":"join_room","roomId":"r1","userId":"u1","username":"Bob"}"#;
        match serde_json::from_str::<ClientMessage>(json) {
            Ok(ClientMessage::JoinRoom { is_creator, .. }) => assert!(!is_creator),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn cursor_move_round_trips_position() {
        let json = r#"{
            "type": "cursor_move",
            "roomId": "r1",
            "userId": "u1",
            "username": "Alice",
            "position": {"line": 3, "column": 14}
        }"#;
        match serde_json::from_str::<ClientMessage>(json) {
            Ok(ClientMessage::CursorMove { position, .. }) => {
                assert_eq!(position, Position { line: 3, column: 14 });
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn server_messages_use_snake_case_tags() {
        let msg = ServerMessage::ReceiveCode {
            code: "x = 1".into(),
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["type"], "receive_code");
        assert_eq!(value["code"], "x = 1");

        let msg = ServerMessage::UserLeft {
            user_id: "u2".into(),
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["type"], "user_left");
        assert_eq!(value["userId"], "u2");
    }

    #[test]
    fn error_payload_carries_message() {
        let msg = ServerMessage::Error {
            message: "Room not found".into(),
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "Room not found");
    }
}
