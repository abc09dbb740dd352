//! Per-connection session state machine
//!
//! ```text
//! Connecting ──► Active(Unannounced ──► Announced ──► Left) ──► Closing ──► Closed
//!      └───────────────────────────────────────────────────────────┘
//! ```

use room_proto::RoomError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Tunnel substate of an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Unannounced,
    Announced,
    /// Terminal: a peer that left does not announce again on this connection
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active(TunnelState),
    Closing,
    Closed,
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Connecting => 0,
            SessionState::Active(_) => 1,
            SessionState::Closing => 2,
            SessionState::Closed => 3,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Active(TunnelState::Unannounced) => f.write_str("active"),
            SessionState::Active(TunnelState::Announced) => f.write_str("active (announced)"),
            SessionState::Active(TunnelState::Left) => f.write_str("active (left)"),
            SessionState::Closing => f.write_str("closing"),
            SessionState::Closed => f.write_str("closed"),
        }
    }
}

/// Compute the tunnel substate after `next` is requested from `current`
pub fn tunnel_transition(
    current: TunnelState,
    next: TunnelState,
) -> Result<TunnelState, RoomError> {
    match (current, next) {
        (TunnelState::Unannounced, TunnelState::Announced) => Ok(next),
        (TunnelState::Announced, TunnelState::Left) => Ok(next),
        (from, to) => Err(RoomError::InvalidState(format!(
            "cannot go from {:?} to {:?}",
            from, to
        ))),
    }
}

/// Shared handle on a session's state
#[derive(Debug, Clone)]
pub struct Session {
    state: Arc<watch::Sender<SessionState>>,
}

impl Session {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Connecting);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Tunnel substate, if the session is active
    pub fn tunnel_state(&self) -> Option<TunnelState> {
        match self.state() {
            SessionState::Active(tunnel) => Some(tunnel),
            _ => None,
        }
    }

    /// Connecting → Active(Unannounced)
    pub fn activate(&self) -> Result<(), RoomError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active(TunnelState::Unannounced);
                true
            } else {
                result = Err(RoomError::InvalidState(format!("cannot activate a {} session", state)));
                false
            }
        });
        result
    }

    /// Move the tunnel substate of an active session
    pub fn set_tunnel(&self, next: TunnelState) -> Result<(), RoomError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match *state {
            SessionState::Active(current) => match tunnel_transition(current, next) {
                Ok(tunnel) => {
                    *state = SessionState::Active(tunnel);
                    true
                }
                Err(e) => {
                    result = Err(e);
                    false
                }
            },
            other => {
                result = Err(RoomError::InvalidState(format!("session is {}", other)));
                false
            }
        });
        result
    }

    /// Start tearing the session down. No-op once closing or closed.
    pub fn begin_closing(&self) {
        self.advance(SessionState::Closing);
    }

    /// Terminal state
    pub fn finish(&self) {
        self.advance(SessionState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Wait until the session is closed
    pub async fn wait_closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    fn advance(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if next.rank() > state.rank() {
                *state = next;
                true
            } else {
                false
            }
        });
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.tunnel_state(), None);

        session.activate().unwrap();
        assert_eq!(session.tunnel_state(), Some(TunnelState::Unannounced));

        session.set_tunnel(TunnelState::Announced).unwrap();
        session.set_tunnel(TunnelState::Left).unwrap();
        assert_eq!(session.state(), SessionState::Active(TunnelState::Left));

        session.begin_closing();
        assert_eq!(session.state(), SessionState::Closing);
        session.finish();
        assert!(session.is_closed());
    }

    #[test]
    fn test_invalid_tunnel_transitions() {
        assert!(tunnel_transition(TunnelState::Unannounced, TunnelState::Left).is_err());
        assert!(tunnel_transition(TunnelState::Left, TunnelState::Announced).is_err());
        assert!(tunnel_transition(TunnelState::Left, TunnelState::Left).is_err());
        assert!(tunnel_transition(TunnelState::Announced, TunnelState::Announced).is_err());
    }

    #[test]
    fn test_tunnel_requires_active_session() {
        let session = Session::new();
        assert!(matches!(
            session.set_tunnel(TunnelState::Announced),
            Err(RoomError::InvalidState(_))
        ));
    }

    #[test]
    fn test_closed_is_terminal() {
        let session = Session::new();
        session.finish();
        session.begin_closing();
        assert!(session.is_closed());
        assert!(session.activate().is_err());
    }

    #[tokio::test]
    async fn test_wait_closed() {
        let session = Session::new();
        let waiter = session.clone();
        let task = tokio::spawn(async move { waiter.wait_closed().await });

        session.activate().unwrap();
        session.begin_closing();
        session.finish();

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
