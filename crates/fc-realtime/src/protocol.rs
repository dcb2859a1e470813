use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalAction {
    Input,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
        user_id: String,
    },
    Subscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runner_id: Option<Uuid>,
    },
    Unsubscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runner_id: Option<Uuid>,
    },
    Terminal {
        session_id: Uuid,
        action: TerminalAction,
        data: String,
    },
    Ping,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Output,
    StateChange,
    ApprovalRequest,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Session {
        session_id: Uuid,
        action: SessionAction,
        payload: serde_json::Value,
    },
    Terminal {
        session_id: Uuid,
        action: TerminalAction,
        data: String,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

/// Error codes reserved by the client protocol (spec §6).
pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
    pub const NOT_SUBSCRIBED: &str = "NOT_SUBSCRIBED";
    pub const CONNECTION_LIMIT: &str = "CONNECTION_LIMIT";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_serializes_tagged() {
        let msg = ClientMessage::Authenticate { token: "t".into(), user_id: "u1".into() };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "authenticate");
        assert_eq!(v["user_id"], "u1");
    }

    #[test]
    fn server_error_round_trips() {
        let msg = ServerMessage::Error { code: "AUTH_FAILED".into(), message: "bad token".into() };
        let text = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        match back {
            ServerMessage::Error { code, .. } => assert_eq!(code, "AUTH_FAILED"),
            _ => panic!("wrong variant"),
        }
    }
}
