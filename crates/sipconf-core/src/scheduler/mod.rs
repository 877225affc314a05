//! Conference scheduling
//!
//! Provisioning of conferences ahead of time, either over CCMP or with an
//! INVITE to a conference factory, and calendar invitations announcing them
//! to participants.

mod ccmp;
pub mod ics;
mod info;
mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use ccmp::{CcmpOperation, ConferenceScheduler, Invitations, SchedulingRequest};
pub use info::{ConferenceInfo, ConferenceInfoState, ParticipantInfo, SecurityLevel};
pub use store::ConferenceInfoStore;

/// How a [`ConferenceScheduler`] reaches the conference server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Conference control requests to a CCMP server
    Ccmp,
    /// INVITE to the conference factory, hung up once answered
    Sip,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Ccmp => write!(f, "CCMP"),
            SchedulerKind::Sip => write!(f, "SIP"),
        }
    }
}

/// Lifecycle of a [`ConferenceScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    /// Creation sent, waiting for the server to allocate the conference
    AllocationPending,
    /// Update or cancellation sent
    Updating,
    Ready,
    Error,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "Idle",
            SchedulerState::AllocationPending => "AllocationPending",
            SchedulerState::Updating => "Updating",
            SchedulerState::Ready => "Ready",
            SchedulerState::Error => "Error",
        };
        write!(f, "{}", name)
    }
}
