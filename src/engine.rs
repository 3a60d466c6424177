use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{ConnectionState, SdpKind};
use crate::transfer::MessageSink;

/// Remote ICE candidate in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Events the negotiation engine pushes back to its consumer. Delivered over
/// a channel owned by the session that opened the engine, never via ambient
/// callbacks.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LocalDescriptionReady { kind: SdpKind, sdp: String },
    LocalCandidate(CandidateInit),
    ChannelOpen,
    BytesReceived(Vec<u8>),
    ConnectionStateChanged(ConnectionState),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active negotiation session")]
    NoSession,
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("negotiation failure: {0}")]
    Negotiation(String),
}

/// Connectivity-establishment engine for the direct peer-to-peer channel.
///
/// Implementations own ICE gathering, DTLS, and data-channel I/O; this crate
/// only drives the interface. `open` installs the event channel the session
/// consumes; all other calls refer to the currently open session.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn open(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), EngineError>;
    async fn create_offer(&self) -> Result<(), EngineError>;
    async fn create_answer(&self) -> Result<(), EngineError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError>;
    async fn send_bytes(&self, payload: &[u8]) -> Result<(), EngineError>;
    async fn close_session(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Default)]
struct GateState {
    active: bool,
    remote_description_set: bool,
    pending_candidates: Vec<CandidateInit>,
}

/// Orchestrator-side wrapper around the process-wide negotiation engine.
///
/// Adds the two behaviors the raw engine interface leaves to its caller:
/// remote candidates received before the remote description are queued and
/// flushed in receipt order once it applies, and opening a new session first
/// tears down the previous one (at most one active session process-wide).
pub struct Negotiator {
    engine: Arc<dyn NegotiationEngine>,
    state: Mutex<GateState>,
}

impl Negotiator {
    pub fn new(engine: Arc<dyn NegotiationEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Open a fresh negotiation session in the offerer role, tearing down any
    /// previous session first. Engine events for the new session arrive on
    /// the returned channel.
    pub async fn start_session(&self) -> Result<mpsc::UnboundedReceiver<EngineEvent>, EngineError> {
        let was_active = {
            let mut state = self.state.lock();
            let was_active = state.active;
            *state = GateState::default();
            was_active
        };
        if was_active {
            debug!("tearing down previous negotiation session");
            if let Err(err) = self.engine.close_session().await {
                warn!(error = %err, "failed to close previous negotiation session");
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.open(tx).await?;
        self.engine.create_offer().await?;
        self.state.lock().active = true;
        Ok(rx)
    }

    pub async fn create_answer(&self) -> Result<(), EngineError> {
        self.engine.create_answer().await
    }

    /// Apply the remote description, then flush any queued candidates in
    /// their original receipt order.
    pub async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), EngineError> {
        self.engine.set_remote_description(kind, sdp).await?;
        let pending = {
            let mut state = self.state.lock();
            state.remote_description_set = true;
            std::mem::take(&mut state.pending_candidates)
        };
        for candidate in pending {
            if let Err(err) = self.engine.add_ice_candidate(candidate).await {
                warn!(error = %err, "failed to apply queued candidate");
            }
        }
        Ok(())
    }

    /// Forward a remote candidate, or queue it if the remote description has
    /// not been applied yet.
    pub async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if !state.remote_description_set {
                debug!(candidate = %candidate.candidate, "queueing candidate until remote description");
                state.pending_candidates.push(candidate);
                return Ok(());
            }
        }
        self.engine.add_ice_candidate(candidate).await
    }

    pub async fn send_bytes(&self, payload: &[u8]) -> Result<(), EngineError> {
        self.engine.send_bytes(payload).await
    }

    /// Tear down the active session. Safe to call when none is open.
    pub async fn close_session(&self) {
        let was_active = {
            let mut state = self.state.lock();
            let was_active = state.active;
            *state = GateState::default();
            was_active
        };
        if was_active {
            if let Err(err) = self.engine.close_session().await {
                warn!(error = %err, "failed to close negotiation session");
            }
        }
    }
}

#[async_trait]
impl MessageSink for Negotiator {
    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        self.send_bytes(text.as_bytes()).await?;
        Ok(())
    }
}
