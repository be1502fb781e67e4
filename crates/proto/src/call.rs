use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller's initiate request. The offer is an opaque SDP blob the relay
/// forwards verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUserPayload {
    pub to: String,
    pub offer: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMadePayload {
    pub offer: Value,
    pub from: String,
    pub from_socket_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MakeAnswerPayload {
    pub answer: Value,
    pub to_socket_id: String,
    pub to_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMadePayload {
    pub answer: Value,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateUpPayload {
    pub candidate: Value,
    pub to_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateDownPayload {
    pub candidate: Value,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectCallPayload {
    pub to_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRejectedPayload {
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallPayload {
    pub to_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedPayload {
    pub from: String,
    pub reason: CallEndReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEndReason {
    #[serde(rename = "hangup")]
    Hangup,
    #[serde(rename = "peer-disconnected")]
    PeerDisconnected,
}

impl CallEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hangup => "hangup",
            Self::PeerDisconnected => "peer-disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallBusyPayload {
    pub user_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUnavailablePayload {
    pub user_id: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn make_answer_roundtrip() {
        let payload = MakeAnswerPayload {
            answer: json!({"type": "answer", "sdp": "v=0"}),
            to_socket_id: "deadbeef".to_string(),
            to_user_id: "11".to_string(),
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains("\"toSocketId\""));
        assert!(encoded.contains("\"toUserId\""));
        let decoded: MakeAnswerPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn candidate_payload_is_opaque() {
        let raw = r#"{"candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0},"toUserId":"5"}"#;
        let payload: IceCandidateUpPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.to_user_id, "5");
        assert_eq!(
            payload
                .candidate
                .get("sdpMLineIndex")
                .and_then(|v| v.as_u64()),
            Some(0)
        );
    }

    #[test]
    fn end_reason_labels() {
        assert_eq!(CallEndReason::Hangup.as_str(), "hangup");
        assert_eq!(CallEndReason::PeerDisconnected.as_str(), "peer-disconnected");
    }
}
