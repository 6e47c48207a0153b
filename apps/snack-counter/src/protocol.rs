use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the counter a connection speaks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Mama,
    Guest,
}

impl Default for ParticipantRole {
    fn default() -> Self {
        ParticipantRole::Guest
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Text,
    Voice,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Text
    }
}

/// Why a session ended, as delivered to both sides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Timeout,
    MamaEnded,
    Switched,
    GuestLeft,
    DisconnectTimeout,
    PayingDisconnectTimeout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatSender {
    Mama,
    Guest,
}

/// One waiting visitor as shown to the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub handle: String,
    pub mood: Option<String>,
    pub mode: SessionMode,
    pub joined_at: i64,
}

/// Voice-room credentials for one side of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceInfo {
    pub room_url: String,
    pub token: String,
}

/// Messages sent from a client (mama or guest) to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare waiting intent; binds the durable id and enqueues.
    RegisterIntent {
        durable_id: String,
        mood: Option<String>,
        mode: SessionMode,
        #[serde(default)]
        room_tag: Option<String>,
    },
    /// Attach to a room tag; resumes the session it belongs to.
    JoinRoom { room_tag: String },
    /// Leave the queue, or end the active session.
    Leave,
    /// Chat relay between the active pair.
    SendMessage { text: String },
    /// Announce an in-flight tip; flips the paying flag.
    TipIntent {
        #[serde(default)]
        amount: Option<u64>,
    },
    /// Operator: start a session with a queued visitor.
    Accept { handle: String },
    /// Operator: end the active session.
    EndSession,
    /// Operator: re-request the stored voice payload.
    VoiceJoin,
    /// Heartbeat.
    Ping,
}

/// Messages sent from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        handle: String,
        mood: Option<String>,
        mode: SessionMode,
        room_tag: Option<String>,
        started_at: i64,
        max_ms: u64,
        resumed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_info: Option<VoiceInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_error: Option<String>,
    },
    /// One-minute-remaining notice; non-terminal.
    SessionWarning,
    SessionEnded {
        reason: EndReason,
    },
    /// Ordered waiting-room snapshot (operator only).
    QueueUpdate {
        queue: Vec<QueueEntry>,
    },
    /// Ack to a registering visitor.
    QueuePosition {
        position: usize,
        size: usize,
    },
    ChatMessage {
        from: ChatSender,
        text: String,
    },
    SystemNotice {
        text: String,
    },
    /// A guest announced a tip (operator only).
    TipIntent {
        amount: Option<u64>,
        at: i64,
    },
    /// Asynchronous payment confirmation (operator only).
    TipConfirmed {
        amount: i64,
        checkout_id: String,
        at: i64,
    },
    VoiceJoinReady {
        room_url: String,
        token: String,
        resumed: bool,
    },
    VoiceJoinFailed {
        message: String,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Generate a fresh connection handle.
pub fn generate_handle() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique() {
        let a = generate_handle();
        let b = generate_handle();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn end_reason_wire_spelling() {
        let json = serde_json::to_string(&ServerMessage::SessionEnded {
            reason: EndReason::MamaEnded,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"session_ended","reason":"mama_ended"}"#);

        let json = serde_json::to_string(&EndReason::DisconnectTimeout).unwrap();
        assert_eq!(json, r#""disconnect_timeout""#);
    }

    #[test]
    fn register_intent_accepts_missing_room_tag() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"register_intent","durable_id":"g-1","mood":"cheerful","mode":"voice"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::RegisterIntent {
                durable_id,
                mode,
                room_tag,
                ..
            } => {
                assert_eq!(durable_id, "g-1");
                assert_eq!(mode, SessionMode::Voice);
                assert!(room_tag.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn voice_info_omitted_when_absent() {
        let json = serde_json::to_string(&ServerMessage::SessionStarted {
            handle: "h".into(),
            mood: None,
            mode: SessionMode::Text,
            room_tag: None,
            started_at: 0,
            max_ms: 1,
            resumed: false,
            voice_info: None,
            voice_error: None,
        })
        .unwrap();
        assert!(!json.contains("voice_info"));
        assert!(!json.contains("voice_error"));
    }
}
