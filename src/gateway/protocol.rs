//! Inbound client frames.
//!
//! Clients speak the same `{event_name, payload}` envelope the gateway
//! sends. Three kinds are accepted:
//!
//! ```json
//! {"event_name": "join",  "payload": "board-1"}
//! {"event_name": "leave", "payload": {"room": "board-1"}}
//! {"event_name": "move",  "payload": {"id": "t1", "column": "in_progress"}}
//! ```

use serde::Deserialize;
use serde_json::Value;

use super::GatewayError;
use crate::event::{Envelope, Move};
use crate::task::{Column, TaskId};

/// Longest accepted room name.
pub const MAX_ROOM_LEN: usize = 64;

/// A parsed client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(String),
    Leave(String),
    Move(MoveRequest),
}

/// A client-initiated move, relayed before the write is confirmed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MoveRequest {
    pub id: TaskId,

    #[serde(alias = "column")]
    pub column_id: Column,
}

impl MoveRequest {
    /// The provisional event relayed to other clients. Client timestamps
    /// are not trusted, so none is carried.
    pub fn to_move(&self) -> Move {
        Move {
            id: self.id.clone(),
            column_id: self.column_id,
            updated_at: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RoomRef {
    Name(String),
    Object { room: String },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, GatewayError> {
        match envelope.event_name.as_str() {
            "join" => Ok(ClientMessage::Join(room_from(envelope.payload)?)),
            "leave" => Ok(ClientMessage::Leave(room_from(envelope.payload)?)),
            "move" | "task:move" => {
                let request: MoveRequest = serde_json::from_value(envelope.payload)
                    .map_err(|e| GatewayError::Malformed(format!("move: {}", e)))?;
                if request.id.as_str().is_empty() {
                    return Err(GatewayError::Malformed("move: empty task id".into()));
                }
                Ok(ClientMessage::Move(request))
            }
            other => Err(GatewayError::UnsupportedEvent(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Leave(_) => "leave",
            ClientMessage::Move(_) => "move",
        }
    }
}

fn room_from(payload: Value) -> Result<String, GatewayError> {
    let room = match serde_json::from_value(payload) {
        Ok(RoomRef::Name(name)) | Ok(RoomRef::Object { room: name }) => name,
        Err(_) => return Err(GatewayError::Malformed("expected a room name".into())),
    };
    validate_room(&room)?;
    Ok(room)
}

/// Room names are short identifiers: ASCII letters, digits and `-_.:`.
pub fn validate_room(room: &str) -> Result<(), GatewayError> {
    let valid = !room.is_empty()
        && room.len() <= MAX_ROOM_LEN
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));

    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidRoom(room.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_accepts_both_payload_shapes() {
        assert_eq!(
            ClientMessage::parse(r#"{"event_name":"join","payload":"board-1"}"#).unwrap(),
            ClientMessage::Join("board-1".into())
        );
        assert_eq!(
            ClientMessage::parse(r#"{"event_name":"leave","payload":{"room":"all"}}"#).unwrap(),
            ClientMessage::Leave("all".into())
        );
    }

    #[test]
    fn test_move_with_column_alias() {
        let msg =
            ClientMessage::parse(r#"{"event_name":"move","payload":{"id":"t1","column":"in_progress"}}"#)
                .unwrap();
        let ClientMessage::Move(request) = msg else {
            panic!("expected move");
        };
        assert_eq!(request.id.as_str(), "t1");
        assert_eq!(request.column_id, Column::InProgress);
        assert_eq!(request.to_move().updated_at, None);
    }

    #[test]
    fn test_move_rejects_unknown_column() {
        let result =
            ClientMessage::parse(r#"{"event_name":"move","payload":{"id":"t1","column":"archive"}}"#);
        assert!(matches!(result, Err(GatewayError::Malformed(_))));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = ClientMessage::parse(r#"{"event_name":"delete_all","payload":{}}"#);
        assert!(matches!(result, Err(GatewayError::UnsupportedEvent(kind)) if kind == "delete_all"));
    }

    #[test]
    fn test_not_json_is_malformed() {
        assert!(matches!(
            ClientMessage::parse("hello"),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn test_room_validation() {
        assert!(validate_room("all").is_ok());
        assert!(validate_room("board:42.v2_x-y").is_ok());
        assert!(validate_room("").is_err());
        assert!(validate_room("has space").is_err());
        assert!(validate_room("star*").is_err());
        assert!(validate_room(&"r".repeat(MAX_ROOM_LEN + 1)).is_err());

        let result = ClientMessage::parse(r#"{"event_name":"join","payload":"bad room"}"#);
        assert!(matches!(result, Err(GatewayError::InvalidRoom(_))));
    }
}
