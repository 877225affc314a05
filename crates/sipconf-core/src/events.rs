//! Core events
//!
//! Observers subscribe with [`crate::Core::subscribe_events`] and receive
//! every state change of the core in the order its message loop processed
//! them.

use serde::Serialize;

use crate::call::{CallState, TransferState};
use crate::conference::{ConferenceChange, ConferenceState};
use crate::scheduler::SchedulerState;
use crate::types::{CallId, ConferenceId, SchedulerId, SipAddress};

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub enum CoreEvent {
    CallStateChanged {
        call_id: CallId,
        remote: SipAddress,
        state: CallState,
    },
    ConferenceStateChanged {
        conference: ConferenceId,
        address: Option<SipAddress>,
        state: ConferenceState,
    },
    ConferenceChanged {
        conference: ConferenceId,
        change: ConferenceChange,
    },
    NotifyReceived {
        conference: SipAddress,
        version: u32,
        full_state: bool,
    },
    /// The focus refused a request of ours
    RequestRejected {
        conference: SipAddress,
        code: u16,
    },
    TransferStateChanged {
        call_id: CallId,
        state: TransferState,
    },
    SchedulerStateChanged {
        scheduler: SchedulerId,
        state: SchedulerState,
    },
    InvitationsSent {
        scheduler: SchedulerId,
        failed: Vec<SipAddress>,
    },
    ConferenceInfoReceived {
        uri: SipAddress,
    },
}
