use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Verification codes are drawn uniformly from `[0, CODE_SPACE)`.
pub const CODE_SPACE: i32 = 100;
/// Number of options presented to the connecting party (1 correct + decoys).
pub const CHALLENGE_OPTIONS: usize = 4;

/// Per-session pairing state.
///
/// `Connected` is transient: a session is advanced to `AwaitingVerification`
/// the moment its challenge is issued. `Verified` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Connected,
    AwaitingVerification,
    Verified,
    Failed,
}

/// Typed events replacing the host-side verification callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    /// The correct code for a session, to be displayed to the verifying human.
    CodeGenerated { session_id: String, code: i32 },
    Succeeded { session_id: String },
    /// A wrong code was submitted. The submitting link learns this in-band;
    /// the event is observability only.
    Failed { session_id: String },
    /// The challenge expired unanswered; the session's link must be closed
    /// out-of-band.
    Expired { session_id: String },
}

/// The candidate codes shown to the connecting party. Exactly one equals the
/// session's correct code; nothing in the challenge reveals which.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub options: Vec<i32>,
}

#[derive(Debug)]
struct Session {
    state: VerificationState,
    correct_code: i32,
    expiry: JoinHandle<()>,
}

/// Gates all peer-to-peer negotiation behind a human-confirmed shared code.
///
/// One wrong code is a hard failure: there is no retry budget, and an
/// unanswered challenge expires after a fixed window. Only one of
/// {explicit verify, explicit cleanup, timeout} ever produces the terminal
/// transition for a session; the per-key map guard serializes them.
pub struct VerificationManager {
    sessions: DashMap<String, Session>,
    expiry: Duration,
    events: mpsc::UnboundedSender<VerificationEvent>,
}

impl VerificationManager {
    pub fn new(expiry: Duration, events: mpsc::UnboundedSender<VerificationEvent>) -> Self {
        Self {
            sessions: DashMap::new(),
            expiry,
            events,
        }
    }

    /// Begin verification for a new session and build its challenge.
    ///
    /// Generates the correct code, arms the expiry timer, and emits
    /// `CodeGenerated` so the host UI can display the code. The returned
    /// challenge holds the correct code plus three distinct decoys in random
    /// order.
    pub fn start_session(self: &Arc<Self>, session_id: &str) -> Challenge {
        let mut rng = rand::thread_rng();
        let correct_code = rng.gen_range(0..CODE_SPACE);

        let manager = Arc::clone(self);
        let timeout_id = session_id.to_string();
        let expiry = self.expiry;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            manager.handle_timeout(&timeout_id);
        });

        if let Some(old) = self.sessions.insert(
            session_id.to_string(),
            Session {
                state: VerificationState::AwaitingVerification,
                correct_code,
                expiry: timer,
            },
        ) {
            old.expiry.abort();
        }

        let _ = self.events.send(VerificationEvent::CodeGenerated {
            session_id: session_id.to_string(),
            code: correct_code,
        });

        let mut options = vec![correct_code];
        while options.len() < CHALLENGE_OPTIONS {
            let decoy = rng.gen_range(0..CODE_SPACE);
            if !options.contains(&decoy) {
                options.push(decoy);
            }
        }
        options.shuffle(&mut rng);

        Challenge { options }
    }

    /// Check a submitted code against the session's correct code.
    ///
    /// Returns false without side effects if the session is unknown or no
    /// longer awaiting verification (late or replayed responses). A wrong
    /// code fails the session and removes it.
    pub fn verify_code(&self, session_id: &str, code: i32) -> bool {
        let outcome = {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return false;
            };
            if session.state != VerificationState::AwaitingVerification {
                return false;
            }
            session.expiry.abort();
            if code == session.correct_code {
                session.state = VerificationState::Verified;
                true
            } else {
                session.state = VerificationState::Failed;
                false
            }
        };

        if outcome {
            let _ = self.events.send(VerificationEvent::Succeeded {
                session_id: session_id.to_string(),
            });
        } else {
            self.sessions.remove(session_id);
            let _ = self.events.send(VerificationEvent::Failed {
                session_id: session_id.to_string(),
            });
        }
        outcome
    }

    pub fn is_verified(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|session| session.state == VerificationState::Verified)
            .unwrap_or(false)
    }

    /// Fires when the expiry timer elapses. No-op unless the session is still
    /// awaiting verification.
    pub fn handle_timeout(&self, session_id: &str) {
        let expired = {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return;
            };
            if session.state != VerificationState::AwaitingVerification {
                return;
            }
            session.state = VerificationState::Failed;
            true
        };

        if expired {
            self.sessions.remove(session_id);
            debug!(session_id, "verification timed out");
            let _ = self.events.send(VerificationEvent::Expired {
                session_id: session_id.to_string(),
            });
        }
    }

    /// Cancel any pending timer and drop the session, regardless of state.
    /// Used when the signaling link closes.
    pub fn cleanup(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.expiry.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager(
        expiry: Duration,
    ) -> (
        Arc<VerificationManager>,
        mpsc::UnboundedReceiver<VerificationEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(VerificationManager::new(expiry, tx)), rx)
    }

    fn generated_code(rx: &mut mpsc::UnboundedReceiver<VerificationEvent>) -> i32 {
        match rx.try_recv().unwrap() {
            VerificationEvent::CodeGenerated { code, .. } => code,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn correct_code_verifies_session() {
        let (manager, mut rx) = manager(Duration::from_secs(60));
        let challenge = manager.start_session("s1");
        let code = generated_code(&mut rx);

        assert!(challenge.options.contains(&code));
        assert!(manager.verify_code("s1", code));
        assert!(manager.is_verified("s1"));
        assert_eq!(
            rx.try_recv().unwrap(),
            VerificationEvent::Succeeded {
                session_id: "s1".into()
            }
        );
    }

    #[tokio::test]
    async fn wrong_code_fails_and_removes_session() {
        let (manager, mut rx) = manager(Duration::from_secs(60));
        manager.start_session("s1");
        let code = generated_code(&mut rx);
        let wrong = (code + 1) % CODE_SPACE;

        assert!(!manager.verify_code("s1", wrong));
        assert!(!manager.is_verified("s1"));
        assert_eq!(
            rx.try_recv().unwrap(),
            VerificationEvent::Failed {
                session_id: "s1".into()
            }
        );
        // Session is gone entirely, not just failed.
        assert!(!manager.verify_code("s1", code));
    }

    #[tokio::test]
    async fn second_verify_is_rejected() {
        let (manager, mut rx) = manager(Duration::from_secs(60));
        manager.start_session("s1");
        let code = generated_code(&mut rx);

        assert!(manager.verify_code("s1", code));
        assert!(!manager.verify_code("s1", code));
        assert!(manager.is_verified("s1"));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let (manager, _rx) = manager(Duration::from_secs(60));
        assert!(!manager.verify_code("nope", 42));
        assert!(!manager.is_verified("nope"));
    }

    #[tokio::test]
    async fn challenge_has_four_distinct_in_range_options() {
        let (manager, mut rx) = manager(Duration::from_secs(60));
        for i in 0..50 {
            let id = format!("s{i}");
            let challenge = manager.start_session(&id);
            let code = generated_code(&mut rx);

            assert_eq!(challenge.options.len(), CHALLENGE_OPTIONS);
            let distinct: HashSet<i32> = challenge.options.iter().copied().collect();
            assert_eq!(distinct.len(), CHALLENGE_OPTIONS);
            assert!(challenge.options.iter().all(|c| (0..CODE_SPACE).contains(c)));
            assert!(challenge.options.contains(&code));
        }
    }

    #[tokio::test]
    async fn correct_code_position_is_not_constant() {
        let (manager, mut rx) = manager(Duration::from_secs(60));
        let mut positions = HashSet::new();
        for i in 0..100 {
            let id = format!("s{i}");
            let challenge = manager.start_session(&id);
            let code = generated_code(&mut rx);
            positions.insert(
                challenge
                    .options
                    .iter()
                    .position(|c| *c == code)
                    .expect("challenge must contain the correct code"),
            );
        }
        assert!(positions.len() > 1, "correct code always at same position");
    }

    #[tokio::test]
    async fn timeout_fails_session_exactly_once() {
        let (manager, mut rx) = manager(Duration::from_millis(20));
        manager.start_session("s1");
        let code = generated_code(&mut rx);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(
            rx.try_recv().unwrap(),
            VerificationEvent::Expired {
                session_id: "s1".into()
            }
        );
        // Late verify after expiry is rejected and emits nothing further.
        assert!(!manager.verify_code("s1", code));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn verify_cancels_pending_timer() {
        let (manager, mut rx) = manager(Duration::from_millis(20));
        manager.start_session("s1");
        let code = generated_code(&mut rx);

        assert!(manager.verify_code("s1", code));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(
            rx.try_recv().unwrap(),
            VerificationEvent::Succeeded {
                session_id: "s1".into()
            }
        );
        assert!(rx.try_recv().is_err(), "timeout must not fire after verify");
        assert!(manager.is_verified("s1"));
    }

    #[tokio::test]
    async fn cleanup_suppresses_timeout() {
        let (manager, mut rx) = manager(Duration::from_millis(20));
        manager.start_session("s1");
        let _ = generated_code(&mut rx);

        manager.cleanup("s1");
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(rx.try_recv().is_err());
        assert!(!manager.is_verified("s1"));
    }
}
