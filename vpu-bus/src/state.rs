use std::fmt::{Display, Formatter};

use crate::error::SessionError;

/// Lifecycle of one encoder instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no hardware resources bound.
    None,
    /// Hardware instance opened with the negotiated formats.
    Open,
    /// Sequence initialized, buffer requirements known.
    InitSeq,
    /// Reference frames registered, encoding allowed.
    PicRun,
    /// Draining: only a final flush command may be submitted.
    Stop,
}

impl SessionState {
    /// Allowed edges. `Stop -> PicRun` is the resume after an
    /// end-of-stream drain; `Open`/`InitSeq -> None` are setup rollbacks.
    const TRANSITIONS: &'static [(SessionState, SessionState)] = &[
        (SessionState::None, SessionState::Open),
        (SessionState::Open, SessionState::InitSeq),
        (SessionState::Open, SessionState::None),
        (SessionState::InitSeq, SessionState::PicRun),
        (SessionState::InitSeq, SessionState::None),
        (SessionState::PicRun, SessionState::Stop),
        (SessionState::Stop, SessionState::PicRun),
    ];

    pub fn can_transition(self, to: SessionState) -> bool {
        self == to || Self::TRANSITIONS.contains(&(self, to))
    }

    /// Returns the new state, or an error naming the rejected edge.
    pub fn transition(self, to: SessionState) -> Result<SessionState, SessionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(SessionError::Transition { from: self, to })
        }
    }

    /// Hardware instance is open.
    pub fn is_open(self) -> bool {
        !matches!(self, SessionState::None)
    }

    /// Sequence init has completed, so buffer minimums are known.
    pub fn is_initialized(self) -> bool {
        matches!(
            self,
            SessionState::InitSeq | SessionState::PicRun | SessionState::Stop
        )
    }

    /// Encode commands may be issued.
    pub fn can_encode(self) -> bool {
        matches!(self, SessionState::PicRun | SessionState::Stop)
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::None => "NONE",
            SessionState::Open => "OPEN",
            SessionState::InitSeq => "INIT_SEQ",
            SessionState::PicRun => "PIC_RUN",
            SessionState::Stop => "STOP",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path() {
        let s = SessionState::None;
        let s = s.transition(SessionState::Open).unwrap();
        let s = s.transition(SessionState::InitSeq).unwrap();
        let s = s.transition(SessionState::PicRun).unwrap();
        let s = s.transition(SessionState::Stop).unwrap();
        assert_eq!(s.transition(SessionState::PicRun).unwrap(), SessionState::PicRun);
    }

    #[test]
    fn rejects_skipping_setup() {
        let err = SessionState::None.transition(SessionState::PicRun).unwrap_err();
        assert!(err.to_string().contains("NONE -> PIC_RUN"));
        assert!(!SessionState::PicRun.can_transition(SessionState::None));
        assert!(!SessionState::Stop.can_transition(SessionState::InitSeq));
    }

    #[test]
    fn rollback_edges() {
        assert!(SessionState::Open.can_transition(SessionState::None));
        assert!(SessionState::InitSeq.can_transition(SessionState::None));
    }

    #[test]
    fn self_transition_is_noop() {
        assert!(SessionState::PicRun.can_transition(SessionState::PicRun));
    }

    #[test]
    fn predicates() {
        assert!(!SessionState::None.is_open());
        assert!(SessionState::InitSeq.is_initialized());
        assert!(!SessionState::Open.is_initialized());
        assert!(SessionState::Stop.can_encode());
        assert!(!SessionState::InitSeq.can_encode());
    }
}
