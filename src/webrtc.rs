use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock as AsyncRwLock};
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::engine::{CandidateInit, EngineError, EngineEvent, NegotiationEngine};
use crate::protocol::{ConnectionState, SdpKind};

const DATA_CHANNEL_LABEL: &str = "data";
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        EngineError::Negotiation(err.to_string())
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        _ => None,
    }
}

struct EngineSession {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

/// `NegotiationEngine` backed by the `webrtc` crate.
///
/// Opens a single reliable ordered data channel labeled "data" and trickles
/// local candidates out as the ICE agent finds them. Description and
/// candidate application is left to the caller's pacing; this type holds no
/// queueing logic of its own.
pub struct WebRtcEngine {
    session: AsyncRwLock<Option<EngineSession>>,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self {
            session: AsyncRwLock::new(None),
        }
    }

    fn attach_data_channel(
        channel: &Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) {
        let on_open_events = events.clone();
        channel.on_open(Box::new(move || {
            let events = on_open_events.clone();
            Box::pin(async move {
                debug!("data channel open");
                let _ = events.send(EngineEvent::ChannelOpen);
            })
        }));

        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::BytesReceived(message.data.to_vec()));
            })
        }));
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn open(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), EngineError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    debug!(?state, "peer connection state changed");
                    if let Some(mapped) = map_connection_state(state) {
                        let _ = events.send(EngineEvent::ConnectionStateChanged(mapped));
                    }
                })
            },
        ));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let data_channel = Arc::new(AsyncRwLock::new(None));

        // We create the channel as offerer; a remote-created channel (the
        // peer offered first) arrives through on_data_channel instead.
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = peer_connection
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await?;
        Self::attach_data_channel(&channel, events.clone());
        *data_channel.write().await = Some(channel);

        let remote_channel_slot = data_channel.clone();
        let remote_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let slot = remote_channel_slot.clone();
            let events = remote_events.clone();
            Box::pin(async move {
                debug!(label = %channel.label(), "remote data channel received");
                Self::attach_data_channel(&channel, events);
                *slot.write().await = Some(channel);
            })
        }));

        *self.session.write().await = Some(EngineSession {
            peer_connection,
            data_channel,
            events,
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<(), EngineError> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(EngineError::NoSession)?;

        let offer = session.peer_connection.create_offer(None).await?;
        session
            .peer_connection
            .set_local_description(offer.clone())
            .await?;
        // Candidates trickle separately; the description goes out as soon as
        // it is set locally.
        let _ = session.events.send(EngineEvent::LocalDescriptionReady {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        });
        Ok(())
    }

    async fn create_answer(&self) -> Result<(), EngineError> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(EngineError::NoSession)?;

        let answer = session.peer_connection.create_answer(None).await?;
        session
            .peer_connection
            .set_local_description(answer.clone())
            .await?;
        let _ = session.events.send(EngineEvent::LocalDescriptionReady {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        });
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), EngineError> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(EngineError::NoSession)?;

        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string())?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string())?,
        };
        session
            .peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(EngineError::NoSession)?;

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        session.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send_bytes(&self, payload: &[u8]) -> Result<(), EngineError> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(EngineError::NoSession)?;

        let channel = session.data_channel.read().await;
        let channel = channel.as_ref().ok_or(EngineError::ChannelNotOpen)?;
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(EngineError::ChannelNotOpen);
        }
        channel.send(&Bytes::copy_from_slice(payload)).await?;
        Ok(())
    }

    async fn close_session(&self) -> Result<(), EngineError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        if let Some(channel) = session.data_channel.write().await.take() {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "failed to close data channel");
            }
        }
        session.peer_connection.close().await?;
        debug!("negotiation session disposed");
        Ok(())
    }
}
