//! Participant devices
//!
//! Every participant joins a conference from one or more devices. A device
//! carries the signalling-plane state (joining, present, on hold...) and the
//! media-plane flags (per stream direction, SSRCs, mute, speaking). The
//! [`ParticipantDeviceTracker`] creates devices and turns raw audio levels
//! into speaking edges.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::call::CallParams;
use crate::config::CoreConfig;
use crate::types::{CallId, MediaDirection, SipAddress, StreamType};

/// URI parameter identifying one device of a participant
pub const DEVICE_PARAM: &str = "gr";

/// Signalling state of a device in a conference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Joining,
    Present,
    OnHold,
    Leaving,
    Left,
}

impl DeviceState {
    /// Endpoint status value of the conference event package
    pub fn as_status(&self) -> &'static str {
        match self {
            DeviceState::Joining => "dialing-in",
            DeviceState::Present => "connected",
            DeviceState::OnHold => "on-hold",
            DeviceState::Leaving => "disconnecting",
            DeviceState::Left => "disconnected",
        }
    }

    pub fn from_status(status: &str) -> Option<Self> {
        match status {
            "dialing-in" | "dialing-out" | "alerting" | "pending" => Some(DeviceState::Joining),
            "connected" => Some(DeviceState::Present),
            "on-hold" => Some(DeviceState::OnHold),
            "disconnecting" => Some(DeviceState::Leaving),
            "disconnected" => Some(DeviceState::Left),
            _ => None,
        }
    }
}

/// Debounces audio levels into speaking edges.
///
/// A sample at or above the threshold starts speaking immediately; speaking
/// stops after `release_samples` consecutive samples below it.
#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    threshold_db: f32,
    release_samples: u32,
    quiet_run: u32,
    speaking: bool,
}

impl SpeakingDetector {
    pub fn new(threshold_db: f32, release_samples: u32) -> Self {
        Self {
            threshold_db,
            release_samples: release_samples.max(1),
            quiet_run: 0,
            speaking: false,
        }
    }

    /// Feed one level sample; returns the new value on an edge only
    pub fn feed(&mut self, level_db: f32) -> Option<bool> {
        if level_db >= self.threshold_db {
            self.quiet_run = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
            return None;
        }

        if self.speaking {
            self.quiet_run += 1;
            if self.quiet_run >= self.release_samples {
                self.speaking = false;
                self.quiet_run = 0;
                return Some(false);
            }
        }
        None
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Forget the current speaking state (device muted or on hold)
    pub fn reset(&mut self) {
        self.speaking = false;
        self.quiet_run = 0;
    }
}

/// One device of a participant
#[derive(Debug, Clone)]
pub struct ParticipantDevice {
    pub address: SipAddress,
    pub name: Option<String>,
    pub call_id: Option<CallId>,
    pub state: DeviceState,
    pub audio: MediaDirection,
    pub video: MediaDirection,
    pub audio_ssrc: Option<u32>,
    pub video_ssrc: Option<u32>,
    pub muted: bool,
    pub speaking: bool,
    pub joined_at: DateTime<Utc>,
    detector: SpeakingDetector,
}

impl ParticipantDevice {
    /// Media is mixed (as opposed to merely associated with the conference)
    pub fn is_in_conference(&self) -> bool {
        self.state == DeviceState::Present
    }

    pub fn direction(&self, stream: StreamType) -> MediaDirection {
        match stream {
            StreamType::Audio => self.audio,
            StreamType::Video => self.video,
        }
    }

    pub fn ssrc(&self, stream: StreamType) -> Option<u32> {
        match stream {
            StreamType::Audio => self.audio_ssrc,
            StreamType::Video => self.video_ssrc,
        }
    }

    /// Returns the previous state if it changed
    pub fn set_state(&mut self, state: DeviceState) -> Option<DeviceState> {
        if self.state == state {
            return None;
        }
        let previous = self.state;
        self.state = state;
        if state != DeviceState::Present {
            self.detector.reset();
        }
        Some(previous)
    }

    /// Returns true if either direction changed
    pub fn set_media(&mut self, audio: MediaDirection, video: MediaDirection) -> bool {
        let changed = self.audio != audio || self.video != video;
        self.audio = audio;
        self.video = video;
        changed
    }

    pub fn set_muted(&mut self, muted: bool) -> bool {
        if self.muted == muted {
            return false;
        }
        self.muted = muted;
        if muted {
            self.detector.reset();
        }
        true
    }

    pub fn set_speaking(&mut self, speaking: bool) -> bool {
        if self.speaking == speaking {
            return false;
        }
        self.speaking = speaking;
        true
    }

    /// Feed a mixer audio level; muted or absent devices never speak
    pub fn feed_audio_level(&mut self, level_db: f32) -> Option<bool> {
        let level = if self.muted || !self.is_in_conference() {
            f32::NEG_INFINITY
        } else {
            level_db
        };
        let edge = self.detector.feed(level)?;
        self.set_speaking(edge).then_some(edge)
    }
}

/// Creates devices with the speaking detection settings of a core
#[derive(Debug, Clone)]
pub struct ParticipantDeviceTracker {
    threshold_db: f32,
    release_samples: u32,
    allocate_ssrcs: bool,
}

impl ParticipantDeviceTracker {
    pub fn new(threshold_db: f32, release_samples: u32) -> Self {
        Self {
            threshold_db,
            release_samples,
            allocate_ssrcs: false,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.speaking_threshold_db, config.speaking_release_samples)
    }

    /// The mixing side allocates SSRCs for new devices
    pub fn with_ssrc_allocation(mut self, enabled: bool) -> Self {
        self.allocate_ssrcs = enabled;
        self
    }

    /// Device address of a participant joining over `call_id`
    pub fn device_address(participant: &SipAddress, call_id: Option<&CallId>) -> SipAddress {
        match call_id {
            Some(id) => participant.uri_only().with_param(DEVICE_PARAM, id.short()),
            None => participant.uri_only(),
        }
    }

    /// Build a device for a leg with the given negotiated params
    pub fn create_device(
        &self,
        address: SipAddress,
        call_id: Option<CallId>,
        state: DeviceState,
        params: Option<&CallParams>,
    ) -> ParticipantDevice {
        let (audio, video, muted) = match params {
            Some(p) => (p.effective_audio(), p.effective_video(), p.muted),
            None => (MediaDirection::SendRecv, MediaDirection::Inactive, false),
        };

        let (audio_ssrc, video_ssrc) = if self.allocate_ssrcs {
            let mut rng = rand::thread_rng();
            let audio_ssrc = audio.is_active().then(|| rng.gen_range(1..u32::MAX));
            let video_ssrc = video.is_active().then(|| rng.gen_range(1..u32::MAX));
            (audio_ssrc, video_ssrc)
        } else {
            (None, None)
        };

        ParticipantDevice {
            address,
            name: None,
            call_id,
            state,
            audio,
            video,
            audio_ssrc,
            video_ssrc,
            muted,
            speaking: false,
            joined_at: Utc::now(),
            detector: SpeakingDetector::new(self.threshold_db, self.release_samples),
        }
    }

    /// Re-allocate a video SSRC when video starts on a device
    pub fn refresh_ssrcs(&self, device: &mut ParticipantDevice) {
        if !self.allocate_ssrcs {
            return;
        }
        let mut rng = rand::thread_rng();
        if device.video.is_active() && device.video_ssrc.is_none() {
            device.video_ssrc = Some(rng.gen_range(1..u32::MAX));
        }
        if !device.video.is_active() {
            device.video_ssrc = None;
        }
        if device.audio.is_active() && device.audio_ssrc.is_none() {
            device.audio_ssrc = Some(rng.gen_range(1..u32::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ParticipantDeviceTracker {
        ParticipantDeviceTracker::new(-30.0, 3).with_ssrc_allocation(true)
    }

    #[test]
    fn test_speaking_edges_only() {
        let mut detector = SpeakingDetector::new(-30.0, 3);
        assert_eq!(detector.feed(-50.0), None);
        assert_eq!(detector.feed(-10.0), Some(true));
        assert_eq!(detector.feed(-12.0), None);
        assert_eq!(detector.feed(-60.0), None);
        assert_eq!(detector.feed(-60.0), None);
        assert_eq!(detector.feed(-60.0), Some(false));
        assert_eq!(detector.feed(-60.0), None);
    }

    #[test]
    fn test_short_silence_does_not_release() {
        let mut detector = SpeakingDetector::new(-30.0, 3);
        assert_eq!(detector.feed(-20.0), Some(true));
        assert_eq!(detector.feed(-40.0), None);
        assert_eq!(detector.feed(-40.0), None);
        assert_eq!(detector.feed(-20.0), None);
        assert!(detector.is_speaking());
    }

    #[test]
    fn test_device_ssrcs_follow_media() {
        let participant = SipAddress::new("pauline", "example.org");
        let call_id = CallId::new();
        let address = ParticipantDeviceTracker::device_address(&participant, Some(&call_id));
        assert_eq!(address.param(DEVICE_PARAM), Some(call_id.short().as_str()));

        let params = CallParams::default();
        let mut device = tracker().create_device(address, Some(call_id), DeviceState::Joining, Some(&params));
        assert!(device.audio_ssrc.is_some());
        assert!(device.video_ssrc.is_none());

        assert!(device.set_media(MediaDirection::SendRecv, MediaDirection::SendRecv));
        tracker().refresh_ssrcs(&mut device);
        assert!(device.video_ssrc.is_some());
    }

    #[test]
    fn test_muted_device_stops_speaking() {
        let mut device = tracker().create_device(
            SipAddress::new("laure", "example.org"),
            None,
            DeviceState::Present,
            None,
        );
        assert_eq!(device.feed_audio_level(-5.0), Some(true));
        assert!(device.set_muted(true));
        assert_eq!(device.feed_audio_level(-5.0), None);
        assert!(device.speaking);
        device.set_speaking(false);
        assert!(!device.set_muted(true));
    }

    #[test]
    fn test_state_change_reports_previous() {
        let mut device = tracker().create_device(
            SipAddress::new("laure", "example.org"),
            None,
            DeviceState::Joining,
            None,
        );
        assert_eq!(device.set_state(DeviceState::Present), Some(DeviceState::Joining));
        assert_eq!(device.set_state(DeviceState::Present), None);
        assert!(device.is_in_conference());
        assert_eq!(DeviceState::from_status(DeviceState::OnHold.as_status()), Some(DeviceState::OnHold));
    }
}
