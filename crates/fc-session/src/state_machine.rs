use fc_core::types::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Admit,
    WorkspaceReady,
    ProviderStarted,
    RequestApproval,
    ResolveApproval,
    Pause,
    Resume,
    Stop,
    StopComplete,
    Fail,
    Timeout,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: SessionState, event: SessionEvent },
}

/// Session lifecycle state machine (spec §4.1). `Fail` and `Timeout` are
/// valid from any non-terminal state; every other transition follows the
/// explicit table in the component design.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionState,
    history: Vec<(SessionState, SessionEvent, SessionState)>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self { current: SessionState::Created, history: Vec::new() }
    }

    pub fn state(&self) -> SessionState {
        self.current
    }

    pub fn history(&self) -> &[(SessionState, SessionEvent, SessionState)] {
        &self.history
    }

    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionState, StateMachineError> {
        use SessionEvent::*;
        use SessionState::*;

        if !self.current.is_terminal() && matches!(event, Fail) {
            return Ok(self.apply(Failed, event));
        }
        if !self.current.is_terminal() && matches!(event, Timeout) {
            return Ok(self.apply(TimedOut, event));
        }

        let next = match (self.current, event) {
            (Created, Admit) => PreparingWorkspace,
            (PreparingWorkspace, WorkspaceReady) => StartingProvider,
            (StartingProvider, ProviderStarted) => Running,
            (Running, RequestApproval) => WaitingForApproval,
            (WaitingForApproval, ResolveApproval) => Running,
            (Running, Pause) => PausedByHuman,
            (PausedByHuman, Resume) => Running,
            (Created | PreparingWorkspace | StartingProvider | Running | WaitingForApproval | PausedByHuman, Stop) => {
                Stopping
            }
            (Stopping, Stop) => Stopping, // idempotent within the stopping grace window
            (Stopping, StopComplete) => Completed,
            _ => {
                return Err(StateMachineError::InvalidTransition { state: self.current, event });
            }
        };

        Ok(self.apply(next, event))
    }

    pub fn can_transition(&self, event: SessionEvent) -> bool {
        let mut probe = self.clone();
        probe.transition(event).is_ok()
    }

    fn apply(&mut self, next: SessionState, event: SessionEvent) -> SessionState {
        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::info!(from = %from, event = %event, to = %next, "session transition");
        next
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_running() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionEvent::Admit).unwrap();
        sm.transition(SessionEvent::WorkspaceReady).unwrap();
        sm.transition(SessionEvent::ProviderStarted).unwrap();
        assert_eq!(sm.state(), SessionState::Running);
    }

    #[test]
    fn approval_round_trip_returns_to_running() {
        let mut sm = SessionStateMachine::new();
        for e in [SessionEvent::Admit, SessionEvent::WorkspaceReady, SessionEvent::ProviderStarted] {
            sm.transition(e).unwrap();
        }
        sm.transition(SessionEvent::RequestApproval).unwrap();
        assert_eq!(sm.state(), SessionState::WaitingForApproval);
        sm.transition(SessionEvent::ResolveApproval).unwrap();
        assert_eq!(sm.state(), SessionState::Running);
    }

    #[test]
    fn pause_then_resume_round_trips() {
        let mut sm = SessionStateMachine::new();
        for e in [SessionEvent::Admit, SessionEvent::WorkspaceReady, SessionEvent::ProviderStarted] {
            sm.transition(e).unwrap();
        }
        sm.transition(SessionEvent::Pause).unwrap();
        assert_eq!(sm.state(), SessionState::PausedByHuman);
        sm.transition(SessionEvent::Resume).unwrap();
        assert_eq!(sm.state(), SessionState::Running);
    }

    #[test]
    fn fail_is_valid_from_any_non_terminal_state() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionEvent::Fail).unwrap();
        assert_eq!(sm.state(), SessionState::Failed);
    }

    #[test]
    fn fail_is_invalid_once_terminal() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionEvent::Fail).unwrap();
        assert!(sm.transition(SessionEvent::Fail).is_err());
    }

    #[test]
    fn double_stop_is_idempotent() {
        let mut sm = SessionStateMachine::new();
        sm.transition(SessionEvent::Stop).unwrap();
        assert_eq!(sm.transition(SessionEvent::Stop).unwrap(), SessionState::Stopping);
    }
}
