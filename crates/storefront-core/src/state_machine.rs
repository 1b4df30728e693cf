use crate::error::ClientError;

/// Position of one request inside the retry protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// First dispatch in flight.
    Attempting,
    /// Last dispatch was rejected for an expired access token.
    NeedsAuthRefresh,
    /// Last dispatch was rejected for an anti-forgery mismatch.
    NeedsHandshakeRenewal,
    /// Replay in flight after refresh or renewal.
    Retrying,
    Success,
    Failed,
}

/// Classified result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Ok,
    RetryableAuth,
    RetryableHandshake,
    Fatal,
}

/// What the caller must do after feeding an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Done,
    RefreshThenReplay,
    RenewHandshakeThenReplay,
    Fail,
}

/// Per-request state machine. Each failure class (expired token,
/// anti-forgery mismatch) earns at most one replay.
#[derive(Debug, Clone)]
pub struct AttemptStateMachine {
    state: AttemptState,
    auth_replayed: bool,
    handshake_replayed: bool,
}

impl Default for AttemptStateMachine {
    fn default() -> Self {
        Self {
            state: AttemptState::Attempting,
            auth_replayed: false,
            handshake_replayed: false,
        }
    }
}

impl AttemptStateMachine {
    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn has_replayed(&self) -> bool {
        self.auth_replayed || self.handshake_replayed
    }

    /// Whether a refresh already succeeded for this request.
    pub fn has_refreshed(&self) -> bool {
        self.auth_replayed
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, AttemptState::Success | AttemptState::Failed)
    }

    /// Feed the outcome of the dispatch that is currently in flight.
    pub fn on_outcome(&mut self, outcome: AttemptOutcome) -> Result<NextStep, ClientError> {
        match self.state {
            AttemptState::Attempting | AttemptState::Retrying => {
                let (next, step) = match outcome {
                    AttemptOutcome::Ok => (AttemptState::Success, NextStep::Done),
                    AttemptOutcome::RetryableAuth if !self.auth_replayed => {
                        (AttemptState::NeedsAuthRefresh, NextStep::RefreshThenReplay)
                    }
                    AttemptOutcome::RetryableHandshake if !self.handshake_replayed => (
                        AttemptState::NeedsHandshakeRenewal,
                        NextStep::RenewHandshakeThenReplay,
                    ),
                    _ => (AttemptState::Failed, NextStep::Fail),
                };
                self.state = next;
                Ok(step)
            }
            current => Err(ClientError::invalid_state(current, "on_outcome")),
        }
    }

    /// Refresh or renewal succeeded; the replay is about to be dispatched.
    pub fn begin_replay(&mut self) -> Result<(), ClientError> {
        match self.state {
            AttemptState::NeedsAuthRefresh if !self.auth_replayed => {
                self.auth_replayed = true;
            }
            AttemptState::NeedsHandshakeRenewal if !self.handshake_replayed => {
                self.handshake_replayed = true;
            }
            current => return Err(ClientError::invalid_state(current, "begin_replay")),
        }
        self.state = AttemptState::Retrying;
        Ok(())
    }

    /// Refresh or renewal itself failed.
    pub fn on_recovery_failed(&mut self) -> Result<(), ClientError> {
        match self.state {
            AttemptState::NeedsAuthRefresh | AttemptState::NeedsHandshakeRenewal => {
                self.state = AttemptState::Failed;
                Ok(())
            }
            current => Err(ClientError::invalid_state(current, "on_recovery_failed")),
        }
    }
}
