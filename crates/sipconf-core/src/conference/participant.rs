use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::ParticipantDevice;
use crate::types::{CallId, SipAddress};

/// Role of a participant in the media session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ParticipantRole {
    #[default]
    Speaker,
    Listener,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Speaker => "speaker",
            ParticipantRole::Listener => "listener",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "speaker" => Some(ParticipantRole::Speaker),
            "listener" => Some(ParticipantRole::Listener),
            _ => None,
        }
    }
}

/// One logical party of a conference
#[derive(Debug, Clone)]
pub struct Participant {
    pub address: SipAddress,
    pub is_admin: bool,
    pub role: ParticipantRole,
    pub devices: Vec<ParticipantDevice>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(address: SipAddress, role: ParticipantRole) -> Self {
        Self {
            address: address.uri_only(),
            is_admin: false,
            role,
            devices: Vec::new(),
            joined_at: Utc::now(),
        }
    }

    pub fn device(&self, address: &SipAddress) -> Option<&ParticipantDevice> {
        self.devices.iter().find(|d| d.address == *address)
    }

    pub fn device_mut(&mut self, address: &SipAddress) -> Option<&mut ParticipantDevice> {
        self.devices.iter_mut().find(|d| d.address == *address)
    }

    pub fn device_for_call(&self, call_id: &CallId) -> Option<&ParticipantDevice> {
        self.devices.iter().find(|d| d.call_id.as_ref() == Some(call_id))
    }

    /// At least one device is mixed
    pub fn is_in_conference(&self) -> bool {
        self.devices.iter().any(|d| d.is_in_conference())
    }
}
