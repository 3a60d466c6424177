use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat JSON envelope exchanged over the signaling link.
///
/// Every message carries a `type` discriminator; the remaining fields are
/// populated per kind and omitted from the wire when unused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl SignalingMessage {
    fn of(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            sdp: None,
            candidate: None,
            sdp_mid: None,
            sdp_mline_index: None,
            code: None,
            options: None,
            success: None,
        }
    }

    /// Initial liveness message pushed as soon as a link is accepted.
    pub fn connected() -> Self {
        Self::of("connected")
    }

    pub fn verification_challenge(options: Vec<i32>) -> Self {
        Self {
            options: Some(options),
            ..Self::of("verification_challenge")
        }
    }

    pub fn verification_response(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::of("verification_response")
        }
    }

    pub fn verification_result(success: bool) -> Self {
        Self {
            success: Some(success),
            ..Self::of("verification_result")
        }
    }

    pub fn description(kind: SdpKind, sdp: String) -> Self {
        Self {
            sdp: Some(sdp),
            ..Self::of(kind.as_wire_type())
        }
    }

    pub fn ice_candidate(candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: Some(candidate),
            sdp_mid,
            sdp_mline_index,
            ..Self::of("ice_candidate")
        }
    }

    pub fn start_negotiation() -> Self {
        Self::of("start_negotiation")
    }
}

/// Role of an SDP description in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_wire_type(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// Chunked-transfer messages. These ride either the signaling link or the
/// direct data channel; the `type` tag distinguishes them from other traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferMessage {
    #[serde(rename = "file_meta")]
    Meta {
        #[serde(rename = "fileId")]
        file_id: String,
        name: String,
        size: u64,
        #[serde(rename = "chunkSize")]
        chunk_size: u32,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
    },
    #[serde(rename = "file_chunk")]
    Chunk {
        #[serde(rename = "fileId")]
        file_id: String,
        seq: u32,
        /// Base64 encoding of the raw chunk bytes.
        data: String,
    },
    #[serde(rename = "file_complete")]
    Complete {
        #[serde(rename = "fileId")]
        file_id: String,
    },
}

/// Peer connection state as surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// Events pushed to the host-app UI bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    VerificationCode {
        code: i32,
    },
    VerificationSuccess {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    VerificationResult {
        success: bool,
    },
    FileReceived {
        name: String,
        size: u64,
    },
    WebrtcState {
        state: ConnectionState,
    },
}

/// Generate a new session ID.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_unused_fields() {
        let json = serde_json::to_string(&SignalingMessage::connected()).unwrap();
        assert_eq!(json, r#"{"type":"connected"}"#);
    }

    #[test]
    fn challenge_round_trips() {
        let msg = SignalingMessage::verification_challenge(vec![42, 7, 91, 3]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "verification_challenge");
        assert_eq!(back.options, Some(vec![42, 7, 91, 3]));
    }

    #[test]
    fn envelope_tolerates_unknown_fields() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0","extra":true}"#).unwrap();
        assert_eq!(msg.kind, "offer");
        assert_eq!(msg.sdp.as_deref(), Some("v=0"));
    }

    #[test]
    fn ice_candidate_uses_camel_case_fields() {
        let msg = SignalingMessage::ice_candidate("candidate:0".into(), Some("0".into()), Some(0));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"sdpMid\""));
        assert!(json.contains("\"sdpMLineIndex\""));
    }

    #[test]
    fn transfer_messages_tagged_by_type() {
        let meta: TransferMessage = serde_json::from_str(
            r#"{"type":"file_meta","fileId":"f1","name":"a.bin","size":40000,"chunkSize":16384,"totalChunks":3}"#,
        )
        .unwrap();
        match meta {
            TransferMessage::Meta { total_chunks, .. } => assert_eq!(total_chunks, 3),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
