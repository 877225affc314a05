use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::conference::ParticipantRole;
use crate::types::SipAddress;

/// Media security required by a scheduled conference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SecurityLevel {
    #[default]
    None,
    PointToPoint,
    EndToEnd,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::None => "none",
            SecurityLevel::PointToPoint => "point-to-point",
            SecurityLevel::EndToEnd => "end-to-end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(SecurityLevel::None),
            "point-to-point" => Some(SecurityLevel::PointToPoint),
            "end-to-end" => Some(SecurityLevel::EndToEnd),
            _ => None,
        }
    }
}

/// Lifecycle of a scheduling record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConferenceInfoState {
    #[default]
    New,
    Updated,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub address: SipAddress,
    pub role: ParticipantRole,
}

/// Scheduling record of a conference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceInfo {
    /// Conference address, known once the server allocated it
    pub uri: Option<SipAddress>,
    pub ccmp_uri: Option<SipAddress>,
    pub organizer: Option<SipAddress>,
    pub participants: Vec<ParticipantInfo>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_minutes: u32,
    pub subject: String,
    pub description: String,
    pub security_level: SecurityLevel,
    pub ics_sequence: u32,
    pub state: ConferenceInfoState,
    pub created_at: DateTime<Utc>,
}

/// ICS carries whole seconds only
pub(crate) fn truncate_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(time.timestamp(), 0).single().unwrap_or(time)
}

impl ConferenceInfo {
    pub fn new(organizer: SipAddress) -> Self {
        Self {
            uri: None,
            ccmp_uri: None,
            organizer: Some(organizer.uri_only()),
            participants: Vec::new(),
            start_time: None,
            duration_minutes: 0,
            subject: String::new(),
            description: String::new(),
            security_level: SecurityLevel::None,
            ics_sequence: 0,
            state: ConferenceInfoState::New,
            created_at: truncate_seconds(Utc::now()),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(truncate_seconds(start));
        self
    }

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.duration_minutes = minutes;
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    /// Add a participant, or change the role of a listed one
    pub fn with_participant(mut self, address: SipAddress, role: ParticipantRole) -> Self {
        self.add_participant(address, role);
        self
    }

    pub fn add_participant(&mut self, address: SipAddress, role: ParticipantRole) {
        let address = address.uri_only();
        match self.participants.iter_mut().find(|p| p.address.weak_equal(&address)) {
            Some(existing) => existing.role = role,
            None => self.participants.push(ParticipantInfo { address, role }),
        }
    }

    pub fn remove_participant(&mut self, address: &SipAddress) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| !p.address.weak_equal(address));
        self.participants.len() != before
    }

    pub fn participant_addresses(&self) -> Vec<SipAddress> {
        self.participants.iter().map(|p| p.address.clone()).collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ConferenceInfoState::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_roles_are_updated_in_place() {
        let pauline = SipAddress::new("pauline", "example.org");
        let mut info = ConferenceInfo::new(SipAddress::new("marie", "example.org"))
            .with_participant(pauline.clone(), ParticipantRole::Speaker)
            .with_participant(pauline.clone().with_param("gr", "x"), ParticipantRole::Listener);

        assert_eq!(info.participants.len(), 1);
        assert_eq!(info.participants[0].role, ParticipantRole::Listener);
        assert!(info.remove_participant(&pauline));
        assert!(!info.remove_participant(&pauline));
    }

    #[test]
    fn test_times_are_whole_seconds() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap() + chrono::Duration::milliseconds(250);
        let info = ConferenceInfo::new(SipAddress::new("marie", "example.org")).with_start_time(start);
        assert_eq!(info.start_time, Some(Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap()));
        assert_eq!(info.created_at.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_security_level_strings() {
        for level in [SecurityLevel::None, SecurityLevel::PointToPoint, SecurityLevel::EndToEnd] {
            assert_eq!(SecurityLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(SecurityLevel::parse("bogus"), None);
    }
}
