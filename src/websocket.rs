use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::engine::{CandidateInit, EngineEvent, Negotiator};
use crate::protocol::{generate_session_id, SdpKind, SignalingMessage, UiEvent};
use crate::registry::{LinkFrame, LinkHandle, SessionRegistry};
use crate::transfer::TransferCodec;
use crate::verification::{VerificationEvent, VerificationManager};

/// WebSocket close code sent on verification failure.
const POLICY_VIOLATION: u16 = 1008;

/// Shared state for the signaling endpoint.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: Arc<SessionRegistry>,
    pub verification: Arc<VerificationManager>,
    pub codec: Arc<TransferCodec>,
    pub negotiator: Arc<Negotiator>,
    pub ui: mpsc::UnboundedSender<UiEvent>,
}

impl SignalingState {
    /// Wire up the state and start the verification event pump.
    pub fn new(
        registry: Arc<SessionRegistry>,
        verification: Arc<VerificationManager>,
        verification_events: mpsc::UnboundedReceiver<VerificationEvent>,
        codec: Arc<TransferCodec>,
        negotiator: Arc<Negotiator>,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> Self {
        let state = Self {
            registry,
            verification,
            codec,
            negotiator,
            ui,
        };
        state.spawn_verification_pump(verification_events);
        state
    }

    /// Translate verification events into UI events and forced closes.
    fn spawn_verification_pump(&self, mut events: mpsc::UnboundedReceiver<VerificationEvent>) {
        let registry = self.registry.clone();
        let ui = self.ui.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    VerificationEvent::CodeGenerated { code, .. } => {
                        let _ = ui.send(UiEvent::VerificationCode { code });
                    }
                    VerificationEvent::Succeeded { session_id } => {
                        let _ = ui.send(UiEvent::VerificationSuccess { session_id });
                    }
                    VerificationEvent::Failed { session_id } => {
                        debug!(session_id = %session_id, "verification failed");
                    }
                    VerificationEvent::Expired { session_id } => {
                        // The session may already be gone if the link closed
                        // first; lookup failure is fine.
                        if let Some(link) = registry.lookup(&session_id) {
                            link.close("Verification Failed");
                        }
                    }
                }
            }
        });
    }
}

/// Build the axum router for the host endpoint.
pub fn router(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Per-link control loop: challenge first, then dispatch inbound messages
/// until the link drops.
async fn handle_socket(socket: WebSocket, state: SignalingState, remote_addr: SocketAddr) {
    let session_id = generate_session_id();
    let (mut sender, mut receiver) = socket.split();

    // Writer task: everything pushed to this link flows through one queue.
    let (tx, mut rx) = mpsc::unbounded_channel::<LinkFrame>();
    let writer_session = session_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let outcome = match frame {
                LinkFrame::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => sender.send(Message::Text(json)).await,
                    Err(err) => {
                        error!(error = %err, "unserializable outbound message");
                        continue;
                    }
                },
                LinkFrame::Text(text) => sender.send(Message::Text(text)).await,
                LinkFrame::Close { reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: POLICY_VIOLATION,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if outcome.is_err() {
                break;
            }
        }
        debug!(session_id = %writer_session, "link writer task ended");
    });

    let link = LinkHandle::new(tx, Some(remote_addr));
    state.registry.register(&session_id, link.clone());
    info!(session_id = %session_id, remote = %remote_addr, "signaling link connected");

    link.send(SignalingMessage::connected());

    // Verification starts immediately; nothing else is authorized until the
    // challenge is answered correctly.
    let challenge = state.verification.start_session(&session_id);
    link.send(SignalingMessage::verification_challenge(challenge.options));

    while let Some(next) = receiver.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                error!(session_id = %session_id, error = %err, "signaling link error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                handle_message(&state, &session_id, &link, remote_addr, &text).await;
            }
            Message::Binary(data) => {
                // Some clients frame JSON as binary; accept it.
                if let Ok(text) = String::from_utf8(data) {
                    handle_message(&state, &session_id, &link, remote_addr, &text).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown order matters: forget the session before disposing the engine
    // so late engine events find nothing to address.
    state.verification.cleanup(&session_id);
    state.registry.unregister(&session_id);
    state.negotiator.close_session().await;
    info!(session_id = %session_id, "signaling link disconnected");
}

/// Dispatch one inbound signaling message.
///
/// Failures here are logged and dropped; nothing a peer sends can tear down
/// the link other than a failed verification.
async fn handle_message(
    state: &SignalingState,
    session_id: &str,
    link: &LinkHandle,
    remote_addr: SocketAddr,
    text: &str,
) {
    let message: SignalingMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(session_id, error = %err, "dropping malformed signaling message");
            return;
        }
    };

    if message.kind == "verification_response" {
        let code = message.code.unwrap_or(-1);
        let success = state.verification.verify_code(session_id, code);
        link.send(SignalingMessage::verification_result(success));
        let _ = state.ui.send(UiEvent::VerificationResult { success });
        if !success {
            link.close("Wrong Code");
        }
        return;
    }

    // The single authorization gate: everything except the verification
    // response is silently dropped until the session is verified.
    if !state.verification.is_verified(session_id) {
        debug!(session_id, kind = %message.kind, "blocked unverified message");
        return;
    }

    match message.kind.as_str() {
        "offer" => {
            let Some(sdp) = message.sdp else {
                warn!(session_id, "offer without sdp");
                return;
            };
            if let Err(err) = state
                .negotiator
                .set_remote_description(SdpKind::Offer, &sdp)
                .await
            {
                warn!(session_id, error = %err, "failed to apply remote offer");
                return;
            }
            if let Err(err) = state.negotiator.create_answer().await {
                warn!(session_id, error = %err, "failed to create answer");
            }
        }
        "answer" => {
            let Some(sdp) = message.sdp else {
                warn!(session_id, "answer without sdp");
                return;
            };
            if let Err(err) = state
                .negotiator
                .set_remote_description(SdpKind::Answer, &sdp)
                .await
            {
                warn!(session_id, error = %err, "failed to apply remote answer");
            }
        }
        "ice_candidate" => {
            let (Some(candidate), Some(sdp_mid), Some(sdp_mline_index)) =
                (message.candidate, message.sdp_mid, message.sdp_mline_index)
            else {
                warn!(session_id, "incomplete ice_candidate message");
                return;
            };
            let candidate = rewrite_local_hostnames(&candidate, remote_addr);
            if let Err(err) = state
                .negotiator
                .add_ice_candidate(CandidateInit {
                    candidate,
                    sdp_mid: Some(sdp_mid),
                    sdp_mline_index: Some(sdp_mline_index),
                })
                .await
            {
                warn!(session_id, error = %err, "failed to add remote candidate");
            }
        }
        "start_negotiation" => match state.negotiator.start_session().await {
            Ok(events) => {
                spawn_engine_pump(state.clone(), session_id.to_string(), events);
            }
            Err(err) => warn!(session_id, error = %err, "failed to start negotiation"),
        },
        "file_meta" | "file_chunk" | "file_complete" => {
            // Transfer frames are routed by file id, not by link; they may
            // arrive here before the direct channel exists.
            if let Err(err) = state.codec.handle_incoming(text) {
                warn!(session_id, error = %err, "transfer frame rejected");
            }
        }
        other => {
            debug!(session_id, kind = other, "ignoring unrecognized message type");
        }
    }
}

/// Serialize engine events for one negotiation session back onto the owning
/// link. Events arriving after the session is torn down address nothing and
/// are dropped.
fn spawn_engine_pump(
    state: SignalingState,
    session_id: String,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::LocalDescriptionReady { kind, sdp } => {
                    if let Some(link) = state.registry.lookup(&session_id) {
                        link.send(SignalingMessage::description(kind, sdp));
                    }
                }
                EngineEvent::LocalCandidate(candidate) => {
                    if let Some(link) = state.registry.lookup(&session_id) {
                        link.send(SignalingMessage::ice_candidate(
                            candidate.candidate,
                            candidate.sdp_mid,
                            candidate.sdp_mline_index,
                        ));
                    }
                }
                EngineEvent::ChannelOpen => {
                    info!(session_id = %session_id, "data channel open");
                    if let Err(err) = state.negotiator.send_bytes(b"ping").await {
                        debug!(error = %err, "liveness ping not sent");
                    }
                }
                EngineEvent::BytesReceived(bytes) => {
                    handle_channel_bytes(&state, &session_id, &bytes).await;
                }
                EngineEvent::ConnectionStateChanged(connection_state) => {
                    let _ = state.ui.send(UiEvent::WebrtcState {
                        state: connection_state,
                    });
                }
            }
        }
        debug!(session_id = %session_id, "engine event pump ended");
    });
}

/// Payloads received over the direct channel: transfer frames go to the
/// codec, `ping` is answered, anything else is logged and dropped.
async fn handle_channel_bytes(state: &SignalingState, session_id: &str, bytes: &[u8]) {
    let Ok(text) = std::str::from_utf8(bytes) else {
        debug!(session_id, len = bytes.len(), "ignoring non-utf8 channel payload");
        return;
    };

    if is_transfer_frame(text) {
        if let Err(err) = state.codec.handle_incoming(text) {
            warn!(session_id, error = %err, "channel transfer frame rejected");
        }
        return;
    }

    if text == "ping" {
        if let Err(err) = state.negotiator.send_bytes(b"pong").await {
            debug!(error = %err, "pong not sent");
        }
        return;
    }

    debug!(session_id, payload = text, "channel message");
}

fn is_transfer_frame(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| {
            value
                .get("type")
                .and_then(|t| t.as_str())
                .map(|t| t.starts_with("file_"))
        })
        .unwrap_or(false)
}

/// Browsers may advertise an mDNS `.local` hostname in their candidates,
/// which the receiving peer cannot resolve; substitute the address we
/// actually observe on the signaling link.
fn rewrite_local_hostnames(candidate: &str, remote_addr: SocketAddr) -> String {
    if !candidate.contains(".local") {
        return candidate.to_string();
    }
    let remote_ip = remote_addr.ip().to_string();
    let rewritten: Vec<String> = candidate
        .split(' ')
        .map(|token| {
            if token.ends_with(".local") {
                remote_ip.clone()
            } else {
                token.to_string()
            }
        })
        .collect();
    let rewritten = rewritten.join(" ");
    debug!(original = candidate, patched = %rewritten, "rewrote mdns candidate address");
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_mdns_hostname_to_observed_address() {
        let addr: SocketAddr = "192.168.1.50:54321".parse().unwrap();
        let candidate =
            "candidate:1 1 udp 2113937151 2bb9b251-9dcf-4f60-b9dc-c0984cfbf682.local 49203 typ host";
        assert_eq!(
            rewrite_local_hostnames(candidate, addr),
            "candidate:1 1 udp 2113937151 192.168.1.50 49203 typ host"
        );
    }

    #[test]
    fn leaves_routable_candidates_untouched() {
        let addr: SocketAddr = "192.168.1.50:54321".parse().unwrap();
        let candidate = "candidate:1 1 udp 2113937151 10.0.0.7 49203 typ host";
        assert_eq!(rewrite_local_hostnames(candidate, addr), candidate);
    }

    #[test]
    fn transfer_frames_recognized_by_type_prefix() {
        assert!(is_transfer_frame(r#"{"type":"file_meta","fileId":"f"}"#));
        assert!(is_transfer_frame(r#"{"type":"file_chunk","fileId":"f"}"#));
        assert!(!is_transfer_frame(r#"{"type":"offer"}"#));
        assert!(!is_transfer_frame("ping"));
    }
}
