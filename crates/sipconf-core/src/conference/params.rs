use serde::{Deserialize, Serialize};

use crate::config::{ConferenceType, CoreConfig};
use crate::types::{ConferenceLayout, SipAddress};

/// Parameters of a conference, fixed at creation and updated by media operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceParams {
    pub subject: Option<String>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub layout: ConferenceLayout,
    /// The creating core takes part in the conference itself
    pub local_participant_enabled: bool,
    pub one_participant_conference_enabled: bool,
    pub conference_type: ConferenceType,
    /// Factory of the focus for remote conferences
    pub factory_uri: Option<String>,
    /// Participants the focus dials out to on creation
    pub participants: Vec<SipAddress>,
}

impl Default for ConferenceParams {
    fn default() -> Self {
        Self {
            subject: None,
            audio_enabled: true,
            video_enabled: false,
            layout: ConferenceLayout::Grid,
            local_participant_enabled: true,
            one_participant_conference_enabled: false,
            conference_type: ConferenceType::Local,
            factory_uri: None,
            participants: Vec::new(),
        }
    }
}

impl ConferenceParams {
    /// Defaults of a core
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            video_enabled: config.video_enabled,
            one_participant_conference_enabled: config.one_participant_conference_enabled,
            conference_type: config.conference_type,
            factory_uri: config.conference_factory_uri.clone(),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    pub fn with_layout(mut self, layout: ConferenceLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_local_participant(mut self, enabled: bool) -> Self {
        self.local_participant_enabled = enabled;
        self
    }

    pub fn with_one_participant_conference(mut self, enabled: bool) -> Self {
        self.one_participant_conference_enabled = enabled;
        self
    }

    /// Remote conference created through `factory_uri`
    pub fn remote(mut self, factory_uri: impl Into<String>) -> Self {
        self.conference_type = ConferenceType::Remote;
        self.factory_uri = Some(factory_uri.into());
        self
    }

    pub fn local(mut self) -> Self {
        self.conference_type = ConferenceType::Local;
        self
    }

    pub fn with_participants(mut self, participants: Vec<SipAddress>) -> Self {
        self.participants = participants;
        self
    }
}
