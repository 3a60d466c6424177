use std::net::SocketAddr;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::SignalingMessage;

/// Frame queued to a signaling link's writer task.
#[derive(Debug, Clone)]
pub enum LinkFrame {
    /// A structured signaling message, serialized to JSON before sending.
    Message(SignalingMessage),
    /// Pre-serialized JSON text (transfer messages pass through unparsed).
    Text(String),
    /// Close the link with a policy-violation close frame.
    Close { reason: String },
}

/// Send-side handle for one live signaling link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<LinkFrame>,
    remote_addr: Option<SocketAddr>,
}

impl LinkHandle {
    pub fn new(tx: mpsc::UnboundedSender<LinkFrame>, remote_addr: Option<SocketAddr>) -> Self {
        Self { tx, remote_addr }
    }

    /// Network address observed for the remote end of this link.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Queue a message; returns false if the writer task is gone.
    pub fn send(&self, message: SignalingMessage) -> bool {
        self.tx.send(LinkFrame::Message(message)).is_ok()
    }

    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(LinkFrame::Text(text)).is_ok()
    }

    pub fn close(&self, reason: &str) -> bool {
        self.tx
            .send(LinkFrame::Close {
                reason: reason.to_string(),
            })
            .is_ok()
    }
}

/// Process-wide map from session id to its live signaling link, used to push
/// asynchronous events (forced close, engine output) to a session outside the
/// call stack that owns it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    links: DashMap<String, LinkHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, link: LinkHandle) {
        self.links.insert(session_id.to_string(), link);
    }

    pub fn lookup(&self, session_id: &str) -> Option<LinkHandle> {
        self.links.get(session_id).map(|entry| entry.clone())
    }

    pub fn unregister(&self, session_id: &str) {
        self.links.remove(session_id);
    }
}
