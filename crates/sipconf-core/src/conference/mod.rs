//! Conferences
//!
//! A [`ConferenceSession`] is the canonical state of one conference inside a
//! core: lifecycle, participants with their devices, admin rights, subject
//! and media parameters. Sessions are pure state machines; every mutation
//! returns the list of [`ConferenceChange`]s it produced so the caller can
//! count them, publish them to observers and notify subscribers.
//!
//! Where the media is mixed is decided by the [`ConferenceBackend`] chosen
//! when the conference is created: [`LocalMixingBackend`] when this core is
//! the mixer, [`FocusDelegatingBackend`] when a remote focus mixes and this
//! core is one of its clients.

mod backend;
mod params;
mod participant;
mod session;
mod state;

pub use backend::{ConferenceBackend, FocusDelegatingBackend, LocalMixingBackend};
pub use params::ConferenceParams;
pub use participant::{Participant, ParticipantRole};
pub use session::ConferenceSession;
pub use state::ConferenceState;

use serde::{Deserialize, Serialize};

use crate::device::DeviceState;
use crate::types::{MediaDirection, SipAddress};

/// Which side of the conference this core is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FocusRole {
    /// This core mixes media and owns the authoritative state
    Focus,
    /// A remote focus mixes; the state is mirrored from its notifications
    Client,
}

/// One observable mutation of a conference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConferenceChange {
    ParticipantAdded {
        participant: SipAddress,
    },
    ParticipantRemoved {
        participant: SipAddress,
    },
    AdminChanged {
        participant: SipAddress,
        is_admin: bool,
    },
    DeviceAdded {
        participant: SipAddress,
        device: SipAddress,
    },
    DeviceRemoved {
        participant: SipAddress,
        device: SipAddress,
    },
    DeviceStateChanged {
        participant: SipAddress,
        device: SipAddress,
        from: DeviceState,
        to: DeviceState,
    },
    DeviceMediaChanged {
        participant: SipAddress,
        device: SipAddress,
        audio: MediaDirection,
        video: MediaDirection,
    },
    DeviceMutedChanged {
        participant: SipAddress,
        device: SipAddress,
        muted: bool,
    },
    DeviceSpeakingChanged {
        participant: SipAddress,
        device: SipAddress,
        speaking: bool,
    },
    SubjectChanged {
        subject: String,
    },
    AvailableMediaChanged {
        audio: bool,
        video: bool,
    },
}

impl ConferenceChange {
    /// Participant concerned by the change, if any
    pub fn participant(&self) -> Option<&SipAddress> {
        match self {
            ConferenceChange::ParticipantAdded { participant }
            | ConferenceChange::ParticipantRemoved { participant }
            | ConferenceChange::AdminChanged { participant, .. }
            | ConferenceChange::DeviceAdded { participant, .. }
            | ConferenceChange::DeviceRemoved { participant, .. }
            | ConferenceChange::DeviceStateChanged { participant, .. }
            | ConferenceChange::DeviceMediaChanged { participant, .. }
            | ConferenceChange::DeviceMutedChanged { participant, .. }
            | ConferenceChange::DeviceSpeakingChanged { participant, .. } => Some(participant),
            ConferenceChange::SubjectChanged { .. } | ConferenceChange::AvailableMediaChanged { .. } => None,
        }
    }

    /// Changes describing the conference itself rather than one participant
    pub fn is_description_change(&self) -> bool {
        matches!(
            self,
            ConferenceChange::SubjectChanged { .. } | ConferenceChange::AvailableMediaChanged { .. }
        )
    }
}
