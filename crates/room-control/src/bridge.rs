//! Bridge between web sign-in sessions and peers answering their challenge
//!
//! A browser opens a session and receives a server challenge (`sc`). The peer
//! signs the challenge over its room connection (`httpAuth.sendSolution`) and
//! the browser, waiting on the session's event stream, learns the outcome.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use room_proto::RoomError;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// How long a sign-in session waits for its solution
pub const SIGN_IN_TTL: Duration = Duration::from_secs(180);

/// Outcome of a sign-in attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInEvent {
    /// The peer proved its identity; the token lets the browser finish the login
    Success { token: String },
    Failed { reason: String },
}

#[derive(Debug)]
struct PendingSignIn {
    tx: oneshot::Sender<SignInEvent>,
    rx: Option<oneshot::Receiver<SignInEvent>>,
    created: Instant,
}

#[derive(Debug)]
pub struct SignInBridge {
    sessions: Mutex<HashMap<String, PendingSignIn>>,
    ttl: Duration,
}

impl SignInBridge {
    pub fn new() -> Self {
        Self::with_ttl(SIGN_IN_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Open a session and return its server challenge
    pub fn register(&self) -> String {
        let sc = random_string();
        let (tx, rx) = oneshot::channel();

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut sessions);
        sessions.insert(
            sc.clone(),
            PendingSignIn {
                tx,
                rx: Some(rx),
                created: Instant::now(),
            },
        );
        debug!(sessions = sessions.len(), "Opened sign-in session");
        sc
    }

    /// Receiver of a session's outcome. Handed out once.
    pub fn take_receiver(&self, sc: &str) -> Option<oneshot::Receiver<SignInEvent>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut sessions);
        sessions.get_mut(sc).and_then(|pending| pending.rx.take())
    }

    pub fn contains(&self, sc: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut sessions);
        sessions.contains_key(sc)
    }

    /// Complete a session successfully, returning the login token
    pub fn signal_success(&self, sc: &str) -> Result<String, RoomError> {
        let pending = self.finish(sc)?;
        let token = random_string();
        let _ = pending.tx.send(SignInEvent::Success {
            token: token.clone(),
        });
        info!("Sign-in session completed");
        Ok(token)
    }

    pub fn signal_failure(&self, sc: &str, reason: &str) -> Result<(), RoomError> {
        let pending = self.finish(sc)?;
        let _ = pending.tx.send(SignInEvent::Failed {
            reason: reason.to_string(),
        });
        info!(reason = %reason, "Sign-in session failed");
        Ok(())
    }

    /// Drop expired sessions, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut sessions)
    }

    fn finish(&self, sc: &str) -> Result<PendingSignIn, RoomError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut sessions);
        sessions
            .remove(sc)
            .ok_or_else(|| RoomError::BadRequest("unknown sign-in challenge".to_string()))
    }

    fn purge(&self, sessions: &mut HashMap<String, PendingSignIn>) -> usize {
        let before = sessions.len();
        sessions.retain(|_, pending| pending.created.elapsed() < self.ttl);
        before - sessions.len()
    }
}

impl Default for SignInBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn random_string() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
