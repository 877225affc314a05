//! Error types for sipconf-core
//!
//! Authorization failures coming from *other* cores are never surfaced as
//! errors: the mixing core ignores them and answers 403. Only the local API
//! returns [`ConferenceError::NotAuthorized`], so the caller learns about it
//! synchronously.

use thiserror::Error;

use crate::call::CallState;
use crate::conference::ConferenceState;

/// Result type for conference engine operations
pub type Result<T> = std::result::Result<T, ConferenceError>;

/// Errors raised by the simulated signalling network
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Destination is registered but currently unreachable
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    /// Nobody registered under this address
    #[error("No route to {0}")]
    NotRegistered(String),

    /// The destination inbox was dropped
    #[error("Inbox closed for {0}")]
    ChannelClosed(String),
}

/// Errors that can occur in the conference engine
#[derive(Debug, Error)]
pub enum ConferenceError {
    /// Call not found
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: String },

    /// Conference not found
    #[error("Conference not found: {conference}")]
    ConferenceNotFound { conference: String },

    /// Participant not found
    #[error("Participant {participant} not found in conference {conference}")]
    ParticipantNotFound { conference: String, participant: String },

    /// Scheduler not found
    #[error("Conference scheduler not found: {scheduler_id}")]
    SchedulerNotFound { scheduler_id: String },

    /// The call is not in a state that allows the operation
    #[error("Call {call_id} is in state {state:?}, cannot {operation}")]
    InvalidCallState {
        call_id: String,
        state: CallState,
        operation: String,
    },

    /// The conference is not in a state that allows the operation
    #[error("Conference {conference} is in state {state:?}, cannot {operation}")]
    InvalidConferenceState {
        conference: String,
        state: ConferenceState,
        operation: String,
    },

    /// Privileged operation attempted by a non-admin participant
    #[error("{requester} is not allowed to {operation}")]
    NotAuthorized { requester: String, operation: String },

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Malformed or unexpected signalling
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// conference-info+xml encoding or decoding failed
    #[error("Event package error: {message}")]
    EventPackage { message: String },

    /// iCalendar encoding or decoding failed
    #[error("ICS error: {message}")]
    Ics { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A bounded wait expired
    #[error("Timed out after {millis} ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ConferenceError {
    /// Create a call-not-found error
    pub fn call_not_found(call_id: impl ToString) -> Self {
        Self::CallNotFound {
            call_id: call_id.to_string(),
        }
    }

    /// Create a conference-not-found error
    pub fn conference_not_found(conference: impl ToString) -> Self {
        Self::ConferenceNotFound {
            conference: conference.to_string(),
        }
    }

    /// Create a participant-not-found error
    pub fn participant_not_found(conference: impl ToString, participant: impl ToString) -> Self {
        Self::ParticipantNotFound {
            conference: conference.to_string(),
            participant: participant.to_string(),
        }
    }

    /// Create a scheduler-not-found error
    pub fn scheduler_not_found(scheduler_id: impl ToString) -> Self {
        Self::SchedulerNotFound {
            scheduler_id: scheduler_id.to_string(),
        }
    }

    /// Create an invalid call state error
    pub fn invalid_call_state(call_id: impl ToString, state: CallState, operation: impl Into<String>) -> Self {
        Self::InvalidCallState {
            call_id: call_id.to_string(),
            state,
            operation: operation.into(),
        }
    }

    /// Create an invalid conference state error
    pub fn invalid_conference_state(
        conference: impl ToString,
        state: ConferenceState,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidConferenceState {
            conference: conference.to_string(),
            state,
            operation: operation.into(),
        }
    }

    /// Create a not-authorized error
    pub fn not_authorized(requester: impl ToString, operation: impl Into<String>) -> Self {
        Self::NotAuthorized {
            requester: requester.to_string(),
            operation: operation.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an event package error
    pub fn event_package(message: impl Into<String>) -> Self {
        Self::EventPackage {
            message: message.into(),
        }
    }

    /// Create an ICS error
    pub fn ics(message: impl Into<String>) -> Self {
        Self::Ics {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for authorization failures
    pub fn is_not_authorized(&self) -> bool {
        matches!(self, Self::NotAuthorized { .. })
    }
}
