//! Call legs of a core
//!
//! A [`Call`] is one SIP dialog between this core and a remote endpoint. The
//! [`CallRegistry`] owns every live leg of a core and validates state
//! transitions; conferences only reference calls by [`CallId`].

mod params;
mod registry;
mod state;

pub use params::CallParams;
pub use registry::CallRegistry;
pub use state::{CallDirection, CallState, TransferState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CallId, ConferenceId, SipAddress};

/// Link between a call and the conference it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceBinding {
    pub conference: ConferenceId,
    /// Media of this leg is actually mixed into the conference
    pub mixed: bool,
}

/// Set on a call placed because of a REFER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferOrigin {
    pub refer_id: String,
    pub original_call: CallId,
    pub referer: SipAddress,
}

/// One call leg
#[derive(Debug, Clone)]
pub struct Call {
    pub id: CallId,
    pub direction: CallDirection,
    pub local: SipAddress,
    pub remote: SipAddress,
    pub state: CallState,
    pub params: CallParams,
    pub subject: Option<String>,
    /// Conference address when the remote end is a conference focus
    pub focus: Option<SipAddress>,
    pub conference: Option<ConferenceBinding>,
    /// We put the leg on hold
    pub local_hold: bool,
    /// The remote end put the leg on hold
    pub remote_hold: bool,
    pub refer_origin: Option<ReferOrigin>,
    /// Participants the focus must dial out to once the leg is answered
    pub resource_list: Vec<SipAddress>,
    /// The remote end must hear it left its conference once our re-INVITE
    /// in flight completes
    pub left_hint_pending: bool,
    pub started_at: DateTime<Utc>,
}

impl Call {
    pub fn outgoing(id: CallId, local: SipAddress, remote: SipAddress, params: CallParams) -> Self {
        Self::new(id, CallDirection::Outgoing, local, remote, params)
    }

    pub fn incoming(id: CallId, local: SipAddress, remote: SipAddress, params: CallParams) -> Self {
        Self::new(id, CallDirection::Incoming, local, remote, params)
    }

    fn new(id: CallId, direction: CallDirection, local: SipAddress, remote: SipAddress, params: CallParams) -> Self {
        Self {
            id,
            direction,
            local,
            remote,
            state: CallState::Idle,
            params,
            subject: None,
            focus: None,
            conference: None,
            local_hold: false,
            remote_hold: false,
            refer_origin: None,
            resource_list: Vec::new(),
            left_hint_pending: false,
            started_at: Utc::now(),
        }
    }

    /// The leg carries conference metadata
    pub fn has_conference(&self) -> bool {
        self.conference.is_some()
    }

    /// The leg's media is mixed into a conference
    pub fn is_in_conference(&self) -> bool {
        self.conference.map(|b| b.mixed).unwrap_or(false)
    }

    /// State reached once a re-INVITE completes, given the hold flags
    pub fn settled_state(&self) -> CallState {
        if self.local_hold {
            CallState::Paused
        } else if self.remote_hold {
            CallState::PausedByRemote
        } else {
            CallState::StreamsRunning
        }
    }

    /// Media is flowing in both directions
    pub fn is_running(&self) -> bool {
        self.state == CallState::StreamsRunning && !self.local_hold && !self.remote_hold
    }
}
