use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a conference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConferenceState {
    Instantiated,
    CreationPending,
    Created,
    CreationFailed,
    TerminationPending,
    Terminated,
    Deleted,
}

impl ConferenceState {
    pub fn can_transition_to(&self, next: ConferenceState) -> bool {
        use ConferenceState::*;
        matches!(
            (self, next),
            (Instantiated, CreationPending | CreationFailed)
                | (CreationPending, Created | CreationFailed | TerminationPending)
                | (Created, TerminationPending)
                | (CreationFailed, TerminationPending | Deleted)
                | (TerminationPending, Terminated)
                | (Terminated, Deleted)
        )
    }

    /// Participants can be added or removed
    pub fn accepts_changes(&self) -> bool {
        matches!(self, ConferenceState::CreationPending | ConferenceState::Created)
    }

    pub fn is_ending(&self) -> bool {
        matches!(
            self,
            ConferenceState::TerminationPending
                | ConferenceState::Terminated
                | ConferenceState::Deleted
                | ConferenceState::CreationFailed
        )
    }
}

impl fmt::Display for ConferenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        use ConferenceState::*;
        let path = [Instantiated, CreationPending, Created, TerminationPending, Terminated, Deleted];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert!(!Created.can_transition_to(Deleted));
        assert!(!Deleted.can_transition_to(Instantiated));
        assert!(CreationPending.can_transition_to(CreationFailed));
    }
}
