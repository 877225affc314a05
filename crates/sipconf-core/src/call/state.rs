use std::fmt;

use serde::{Deserialize, Serialize};

/// States of a call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    OutgoingInit,
    OutgoingProgress,
    OutgoingRinging,
    IncomingReceived,
    Connected,
    StreamsRunning,
    Pausing,
    Paused,
    Resuming,
    PausedByRemote,
    Updating,
    UpdatedByRemote,
    Error,
    End,
    Released,
}

impl CallState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;

        // Any live leg can fail or be hung up
        if matches!(next, Error | End) {
            return !matches!(self, Error | End | Released);
        }

        match (self, next) {
            (Idle, OutgoingInit | IncomingReceived) => true,
            (OutgoingInit, OutgoingProgress) => true,
            (OutgoingProgress, OutgoingRinging | Connected) => true,
            (OutgoingRinging, Connected) => true,
            (IncomingReceived, Connected) => true,
            (Connected, StreamsRunning) => true,
            (StreamsRunning, Pausing | Updating | UpdatedByRemote) => true,
            (Pausing, Paused | StreamsRunning) => true,
            (Paused, Resuming | Updating | UpdatedByRemote) => true,
            (Resuming, StreamsRunning | Paused | PausedByRemote) => true,
            (PausedByRemote, Pausing | Updating | UpdatedByRemote) => true,
            (Updating, StreamsRunning | Paused | PausedByRemote) => true,
            (UpdatedByRemote, StreamsRunning | Paused | PausedByRemote) => true,
            (Error | End, Released) => true,
            _ => false,
        }
    }

    /// Media has been negotiated and the leg is up (possibly on hold)
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            CallState::StreamsRunning
                | CallState::Pausing
                | CallState::Paused
                | CallState::Resuming
                | CallState::PausedByRemote
                | CallState::Updating
                | CallState::UpdatedByRemote
        )
    }

    /// A re-INVITE transaction of ours is in flight
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallState::Pausing | CallState::Resuming | CallState::Updating | CallState::UpdatedByRemote
        )
    }

    /// The call can be merged into a conference
    pub fn can_join_conference(&self) -> bool {
        matches!(self, CallState::StreamsRunning | CallState::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Error | CallState::End | CallState::Released)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Progress of a call transfer, reported by the transferee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Progress,
    Connected,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_path() {
        use CallState::*;
        let path = [Idle, OutgoingInit, OutgoingProgress, OutgoingRinging, Connected, StreamsRunning, End, Released];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_pause_resume_path() {
        use CallState::*;
        assert!(StreamsRunning.can_transition_to(Pausing));
        assert!(Pausing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Resuming));
        assert!(Resuming.can_transition_to(StreamsRunning));
        assert!(StreamsRunning.can_transition_to(UpdatedByRemote));
        assert!(UpdatedByRemote.can_transition_to(PausedByRemote));
    }

    #[test]
    fn test_invalid_transitions() {
        use CallState::*;
        assert!(!Idle.can_transition_to(StreamsRunning));
        assert!(!IncomingReceived.can_transition_to(Paused));
        assert!(!Released.can_transition_to(End));
        assert!(!End.can_transition_to(Error));
        assert!(!StreamsRunning.can_transition_to(Released));
    }

    #[test]
    fn test_join_eligibility() {
        assert!(CallState::StreamsRunning.can_join_conference());
        assert!(CallState::Paused.can_join_conference());
        assert!(!CallState::OutgoingRinging.can_join_conference());
        assert!(!CallState::IncomingReceived.can_join_conference());
    }
}
