//! Subscriber side of the conference event package
//!
//! A client conference mirrors the state published by its focus. Documents
//! must arrive with contiguous versions; a gap means a notification was
//! lost and the client re-subscribes to get a fresh full state.

use tracing::{debug, warn};

use super::notify::user_roles;
use super::xml::{ConferenceInfoDocument, ElementState, EndpointInfo, UserInfo};
use crate::conference::{ConferenceChange, ConferenceSession, Participant};
use crate::device::{DeviceState, ParticipantDevice, ParticipantDeviceTracker};
use crate::types::{SipAddress, StreamType};

/// Outcome of the version check of an incoming document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Apply,
    /// Already applied, drop it
    Stale,
    /// A version is missing, re-subscribe
    Gap,
}

/// Subscription state of a client conference
#[derive(Debug, Clone, Default)]
pub struct ClientSubscription {
    last_version: Option<u32>,
    pending: bool,
}

impl ClientSubscription {
    pub fn last_version(&self) -> Option<u32> {
        self.last_version
    }

    /// A SUBSCRIBE is in flight
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    pub fn check(&self, document: &ConferenceInfoDocument) -> VersionCheck {
        if document.is_full_state() {
            return VersionCheck::Apply;
        }
        match self.last_version {
            None => VersionCheck::Gap,
            Some(last) if document.version <= last => VersionCheck::Stale,
            Some(last) if document.version == last + 1 => VersionCheck::Apply,
            Some(last) => {
                warn!(expected = last + 1, received = document.version, "conference notification gap");
                VersionCheck::Gap
            }
        }
    }

    pub fn accept(&mut self, version: u32) {
        self.last_version = Some(version);
        self.pending = false;
    }

    /// Forget the version so the next full state starts over
    pub fn reset(&mut self) {
        self.last_version = None;
    }
}

fn device_from_endpoint(tracker: &ParticipantDeviceTracker, endpoint: &EndpointInfo) -> ParticipantDevice {
    let mut device = tracker.create_device(
        endpoint.entity.clone(),
        None,
        endpoint.status.unwrap_or(DeviceState::Joining),
        None,
    );
    if let Some(audio) = endpoint.direction(StreamType::Audio) {
        device.audio = audio;
    }
    if let Some(video) = endpoint.direction(StreamType::Video) {
        device.video = video;
    }
    device.audio_ssrc = endpoint.src_id(StreamType::Audio);
    device.video_ssrc = endpoint.src_id(StreamType::Video);
    device.muted = endpoint.muted.unwrap_or(false);
    device.speaking = endpoint.speaking.unwrap_or(false);
    device
}

fn remove_member_device(
    session: &mut ConferenceSession,
    participant: &SipAddress,
    device: &SipAddress,
) -> Vec<ConferenceChange> {
    if !session.is_me(participant) {
        return session.remove_device(device);
    }
    let Some(me) = session.me_mut() else {
        return Vec::new();
    };
    let before = me.devices.len();
    me.devices.retain(|d| d.address != *device);
    if me.devices.len() == before {
        return Vec::new();
    }
    vec![ConferenceChange::DeviceRemoved {
        participant: me.address.clone(),
        device: device.clone(),
    }]
}

fn merge_endpoint(session: &mut ConferenceSession, user: &SipAddress, endpoint: &EndpointInfo) -> Vec<ConferenceChange> {
    if endpoint.state == ElementState::Deleted {
        return remove_member_device(session, user, &endpoint.entity);
    }

    let tracker = session.tracker().clone();
    let Some(member) = session.member_mut(user) else {
        return Vec::new();
    };

    let Some(current) = member.device_mut(&endpoint.entity) else {
        member.devices.push(device_from_endpoint(&tracker, endpoint));
        return vec![ConferenceChange::DeviceAdded {
            participant: member.address.clone(),
            device: endpoint.entity.clone(),
        }];
    };

    // SSRCs are not observable changes
    if endpoint.media.iter().any(|m| m.media_type == StreamType::Audio) {
        current.audio_ssrc = endpoint.src_id(StreamType::Audio);
    }
    if endpoint.media.iter().any(|m| m.media_type == StreamType::Video) {
        current.video_ssrc = endpoint.src_id(StreamType::Video);
    }
    let audio = endpoint.direction(StreamType::Audio).unwrap_or(current.audio);
    let video = endpoint.direction(StreamType::Video).unwrap_or(current.video);

    let mut changes = Vec::new();
    if let Some(status) = endpoint.status {
        changes.extend(session.set_device_state(&endpoint.entity, status));
    }
    changes.extend(session.set_device_media(&endpoint.entity, audio, video));
    if let Some(muted) = endpoint.muted {
        changes.extend(session.set_device_muted(&endpoint.entity, muted));
    }
    if let Some(speaking) = endpoint.speaking {
        changes.extend(session.set_device_speaking(&endpoint.entity, speaking));
    }
    changes
}

fn merge_user(session: &mut ConferenceSession, user: &UserInfo) -> Vec<ConferenceChange> {
    let (admin, role) = user_roles(user);

    if user.state == ElementState::Deleted {
        if session.is_me(&user.entity) {
            return Vec::new();
        }
        return session.remove_participant(&user.entity);
    }

    if session.member(&user.entity).is_none() {
        let tracker = session.tracker().clone();
        let mut participant = Participant::new(user.entity.clone(), role.unwrap_or_default());
        participant.is_admin = admin.unwrap_or(false);

        let mut changes = vec![ConferenceChange::ParticipantAdded {
            participant: participant.address.clone(),
        }];
        for endpoint in user.endpoints.iter().filter(|e| e.state != ElementState::Deleted) {
            changes.push(ConferenceChange::DeviceAdded {
                participant: participant.address.clone(),
                device: endpoint.entity.clone(),
            });
            participant.devices.push(device_from_endpoint(&tracker, endpoint));
        }
        session.participants_mut().push(participant);
        return changes;
    }

    let mut changes = Vec::new();
    if let Some(admin) = admin {
        changes.extend(session.apply_admin(&user.entity, admin));
    }
    if let (Some(role), Some(member)) = (role, session.member_mut(&user.entity)) {
        member.role = role;
    }
    for endpoint in &user.endpoints {
        changes.extend(merge_endpoint(session, &user.entity, endpoint));
    }

    if user.state == ElementState::Full {
        let stale: Vec<SipAddress> = session
            .member(&user.entity)
            .map(|m| {
                m.devices
                    .iter()
                    .filter(|d| !user.endpoints.iter().any(|e| e.entity == d.address))
                    .map(|d| d.address.clone())
                    .collect()
            })
            .unwrap_or_default();
        for device in stale {
            changes.extend(remove_member_device(session, &user.entity, &device));
        }
    }
    changes
}

/// Merge a document into a client session and return the observable changes
pub fn apply_document(session: &mut ConferenceSession, document: &ConferenceInfoDocument) -> Vec<ConferenceChange> {
    let mut changes = Vec::new();

    if let Some(description) = &document.description {
        if let Some(subject) = &description.subject {
            if let Ok(subject_changes) = session.set_subject(None, subject) {
                changes.extend(subject_changes);
            }
        }
        let available = |stream: StreamType| {
            description
                .available_media
                .iter()
                .find(|m| m.media_type == stream)
                .map(|m| m.status.is_active())
        };
        let audio = available(StreamType::Audio).unwrap_or(session.params().audio_enabled);
        let video = available(StreamType::Video).unwrap_or(session.params().video_enabled);
        changes.extend(session.set_available_media(audio, video));
    }

    for user in &document.users {
        changes.extend(merge_user(session, user));
    }

    if document.is_full_state() {
        let gone: Vec<SipAddress> = session
            .participants()
            .iter()
            .filter(|p| !document.users.iter().any(|u| u.entity.weak_equal(&p.address)))
            .map(|p| p.address.clone())
            .collect();
        for participant in gone {
            changes.extend(session.remove_participant(&participant));
        }
        session.set_synchronized(true);
    }

    debug!(
        conference = %session.id(),
        version = document.version,
        changes = changes.len(),
        "conference document applied"
    );
    changes
}
