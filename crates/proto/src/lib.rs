pub mod call;

use crate::call::{
    AnswerMadePayload, CallBusyPayload, CallEndedPayload, CallMadePayload, CallRejectedPayload,
    CallUnavailablePayload, CallUserPayload, EndCallPayload, IceCandidateDownPayload,
    IceCandidateUpPayload, MakeAnswerPayload, RejectCallPayload,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_EVENT_LEN: usize = 64 * 1024;

#[derive(Debug)]
pub enum CodecError {
    InvalidEventJson,
    EventTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEventJson => write!(f, "invalid event payload"),
            Self::EventTooLarge => write!(f, "event exceeds limits"),
        }
    }
}

impl Error for CodecError {}

fn encode_event<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let encoded = serde_json::to_string(value).map_err(|_| CodecError::InvalidEventJson)?;
    if encoded.len() > MAX_EVENT_LEN {
        return Err(CodecError::EventTooLarge);
    }
    Ok(encoded)
}

fn decode_event<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, CodecError> {
    if text.len() > MAX_EVENT_LEN {
        return Err(CodecError::EventTooLarge);
    }
    serde_json::from_str(text).map_err(|_| CodecError::InvalidEventJson)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub user_id: String,
    pub socket_id: String,
    pub keepalive_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: String,
    pub content: String,
}

/// Persisted message record, echoed to the sender and pushed to the
/// receiver. Field names follow the message log's row layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

/// Events a client may submit over an established connection. `hello`
/// is only valid as the first frame of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "hello")]
    Hello(HelloPayload),
    #[serde(rename = "sendMessage")]
    SendMessage(SendMessagePayload),
    #[serde(rename = "call-user")]
    CallUser(CallUserPayload),
    #[serde(rename = "make-answer")]
    MakeAnswer(MakeAnswerPayload),
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidateUpPayload),
    #[serde(rename = "reject-call")]
    RejectCall(RejectCallPayload),
    #[serde(rename = "end-call")]
    EndCall(EndCallPayload),
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        decode_event(text)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        encode_event(self)
    }
}

/// Events the relay pushes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "ready")]
    Ready(ReadyPayload),
    #[serde(rename = "message")]
    Message(MessageRecord),
    #[serde(rename = "messageError")]
    MessageError(MessageErrorPayload),
    #[serde(rename = "call-made")]
    CallMade(CallMadePayload),
    #[serde(rename = "answer-made")]
    AnswerMade(AnswerMadePayload),
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidateDownPayload),
    #[serde(rename = "call-rejected")]
    CallRejected(CallRejectedPayload),
    #[serde(rename = "call-ended")]
    CallEnded(CallEndedPayload),
    #[serde(rename = "call-busy")]
    CallBusy(CallBusyPayload),
    #[serde(rename = "call-unavailable")]
    CallUnavailable(CallUnavailablePayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        decode_event(text)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        encode_event(self)
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            kind: kind.to_string(),
            message: message.into(),
        })
    }

    pub fn message_error(kind: &str, message: impl Into<String>) -> Self {
        ServerEvent::MessageError(MessageErrorPayload {
            kind: kind.to_string(),
            message: message.into(),
        })
    }
}
