//! Per-connection protocol state. The state only moves forward; once a
//! terminal state is reached the session is done and the socket is released
//! by the runner.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStartup,
    Authenticating,
    Ready,
    Executing,
    /// Clean end, reached via a Terminate message.
    Terminated,
    /// Absorbing failure state, reachable from anywhere.
    ErrorTerminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::ErrorTerminated)
    }

    fn may_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, ErrorTerminated) => true,
            (AwaitingStartup, Authenticating) => true,
            (Authenticating, Ready) => true,
            (Ready, Executing) => true,
            (Ready, Terminated) => true,
            (Executing, Ready) => true,
            _ => false,
        }
    }
}

pub struct Session {
    id: u32,
    state: SessionState,
    user: Option<String>,
    auth_attempts: u32,
    max_auth_attempts: u32,
}

impl Session {
    pub fn new(id: u32, max_auth_attempts: u32) -> Self {
        Self {
            id,
            state: SessionState::AwaitingStartup,
            user: None,
            auth_attempts: 0,
            max_auth_attempts,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn set_user(&mut self, user: String) {
        self.user = Some(user);
    }

    /// Move to `next`. Illegal transitions are a logic bug; they are caught
    /// in debug builds and coerced to ErrorTerminated in release builds.
    ///
    /// Once terminal, further failure notifications are no-ops: a write
    /// error marks the session failed, and the caller's own error path
    /// marks it again.
    pub fn advance(&mut self, next: SessionState) {
        if self.state.is_terminal() && next == SessionState::ErrorTerminated {
            return;
        }
        debug_assert!(
            self.state.may_advance_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        if self.state.may_advance_to(next) {
            self.state = next;
        } else if !self.state.is_terminal() {
            self.state = SessionState::ErrorTerminated;
        }
    }

    /// Record a failed authentication attempt. Returns true if the client
    /// may try again.
    pub fn record_auth_failure(&mut self) -> bool {
        self.auth_attempts += 1;
        self.auth_attempts < self.max_auth_attempts
    }

    pub fn auth_attempts(&self) -> u32 {
        self.auth_attempts
    }
}
