use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::types::{ConferenceLayout, MediaDirection, MediaEncryption};

/// Negotiated media parameters of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParams {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub audio_direction: MediaDirection,
    pub video_direction: MediaDirection,
    pub encryption: MediaEncryption,
    pub layout: ConferenceLayout,
    pub muted: bool,
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: false,
            audio_direction: MediaDirection::SendRecv,
            video_direction: MediaDirection::SendRecv,
            encryption: MediaEncryption::None,
            layout: ConferenceLayout::Grid,
            muted: false,
        }
    }
}

impl CallParams {
    /// Default offer of a core
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            video_enabled: config.video_enabled,
            encryption: config.media_encryption,
            ..Default::default()
        }
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    pub fn with_layout(mut self, layout: ConferenceLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn with_audio_direction(mut self, direction: MediaDirection) -> Self {
        self.audio_direction = direction;
        self
    }

    /// Answer to an offer. The answerer mirrors the offered streams and
    /// keeps its own microphone state.
    pub fn answer(offer: &CallParams, local_muted: bool) -> CallParams {
        CallParams {
            muted: local_muted,
            ..*offer
        }
    }

    /// Effective audio direction seen by the mixer
    pub fn effective_audio(&self) -> MediaDirection {
        if self.audio_enabled {
            self.audio_direction
        } else {
            MediaDirection::Inactive
        }
    }

    /// Effective video direction seen by the mixer
    pub fn effective_video(&self) -> MediaDirection {
        if self.video_enabled {
            self.video_direction
        } else {
            MediaDirection::Inactive
        }
    }
}
