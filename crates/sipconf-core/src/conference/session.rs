use tracing::{debug, info};

use super::{ConferenceChange, ConferenceParams, ConferenceState, FocusRole, Participant, ParticipantRole};
use crate::config::AdminPolicy;
use crate::device::{DeviceState, ParticipantDevice, ParticipantDeviceTracker};
use crate::errors::{ConferenceError, Result};
use crate::types::{CallId, ConferenceId, ConferenceLayout, MediaDirection, SipAddress};

/// State of one conference as seen by one core
#[derive(Debug, Clone)]
pub struct ConferenceSession {
    id: ConferenceId,
    role: FocusRole,
    address: Option<SipAddress>,
    state: ConferenceState,
    params: ConferenceParams,
    subject: String,
    me: Option<Participant>,
    participants: Vec<Participant>,
    admin_policy: AdminPolicy,
    tracker: ParticipantDeviceTracker,
    organizer: Option<SipAddress>,
    allowed: Vec<SipAddress>,
    had_participants: bool,
    synchronized: bool,
}

impl ConferenceSession {
    pub fn new(
        id: ConferenceId,
        role: FocusRole,
        params: ConferenceParams,
        admin_policy: AdminPolicy,
        tracker: ParticipantDeviceTracker,
    ) -> Self {
        let tracker = tracker.with_ssrc_allocation(role == FocusRole::Focus);
        Self {
            id,
            role,
            address: None,
            state: ConferenceState::Instantiated,
            subject: params.subject.clone().unwrap_or_default(),
            params,
            me: None,
            participants: Vec::new(),
            admin_policy,
            tracker,
            organizer: None,
            allowed: Vec::new(),
            had_participants: false,
            synchronized: false,
        }
    }

    pub fn id(&self) -> ConferenceId {
        self.id
    }

    pub fn role(&self) -> FocusRole {
        self.role
    }

    pub fn address(&self) -> Option<&SipAddress> {
        self.address.as_ref()
    }

    pub fn set_address(&mut self, address: SipAddress) {
        info!(conference = %self.id, address = %address, "conference address set");
        self.address = Some(address);
    }

    pub fn state(&self) -> ConferenceState {
        self.state
    }

    pub fn params(&self) -> &ConferenceParams {
        &self.params
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn tracker(&self) -> &ParticipantDeviceTracker {
        &self.tracker
    }

    pub fn organizer(&self) -> Option<&SipAddress> {
        self.organizer.as_ref()
    }

    pub fn set_organizer(&mut self, organizer: SipAddress) {
        self.organizer = Some(organizer.uri_only());
    }

    pub fn allowed_participants(&self) -> &[SipAddress] {
        &self.allowed
    }

    pub fn set_allowed_participants(&mut self, allowed: Vec<SipAddress>) {
        self.allowed = allowed.iter().map(SipAddress::uri_only).collect();
    }

    /// Dial-in check of scheduled conferences. An empty list allows everybody.
    pub fn is_allowed(&self, address: &SipAddress) -> bool {
        self.allowed.is_empty()
            || self.organizer.as_ref().map(|o| o.weak_equal(address)).unwrap_or(false)
            || self.allowed.iter().any(|a| a.weak_equal(address))
            || self.find_participant(address).is_some()
    }

    /// A participant joined at some point
    pub fn had_participants(&self) -> bool {
        self.had_participants
    }

    /// A full state was received from the focus
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub(crate) fn set_synchronized(&mut self, synchronized: bool) {
        self.synchronized = synchronized;
    }

    /// Validate and apply a lifecycle transition, returning the previous state
    pub fn set_state(&mut self, next: ConferenceState) -> Result<ConferenceState> {
        let previous = self.state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            return Err(ConferenceError::invalid_conference_state(
                self.id,
                previous,
                format!("move to {}", next),
            ));
        }
        self.state = next;
        info!(conference = %self.id, from = %previous, to = %next, "conference state changed");
        Ok(previous)
    }

    // Local participant

    /// Make the local user a member of the conference
    pub fn set_local_participant(&mut self, address: SipAddress, is_admin: bool, device: ParticipantDevice) {
        let mut me = Participant::new(address, ParticipantRole::Speaker);
        me.is_admin = is_admin;
        me.devices.push(device);
        self.me = Some(me);
    }

    pub fn me(&self) -> Option<&Participant> {
        self.me.as_ref()
    }

    pub(crate) fn me_mut(&mut self) -> Option<&mut Participant> {
        self.me.as_mut()
    }

    pub fn is_me(&self, address: &SipAddress) -> bool {
        self.me.as_ref().map(|m| m.address.weak_equal(address)).unwrap_or(false)
    }

    /// The local user is mixed into the conference
    pub fn is_in(&self) -> bool {
        self.me.as_ref().map(|m| m.is_in_conference()).unwrap_or(false)
    }

    /// Change the state of the local user's device
    pub fn set_me_state(&mut self, state: DeviceState) -> Vec<ConferenceChange> {
        let Some(me) = self.me.as_mut() else {
            return Vec::new();
        };
        let participant = me.address.clone();
        let mut changes = Vec::new();
        for device in me.devices.iter_mut() {
            if let Some(from) = device.set_state(state) {
                changes.push(ConferenceChange::DeviceStateChanged {
                    participant: participant.clone(),
                    device: device.address.clone(),
                    from,
                    to: state,
                });
            }
        }
        changes
    }

    // Participants

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub(crate) fn participants_mut(&mut self) -> &mut Vec<Participant> {
        &mut self.participants
    }

    /// Number of participants, the local user excluded
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Number of members, the local user included
    pub fn size(&self) -> usize {
        self.participants.len() + usize::from(self.me.is_some())
    }

    pub fn find_participant(&self, address: &SipAddress) -> Option<&Participant> {
        self.participants.iter().find(|p| p.address.weak_equal(address))
    }

    /// The local user or a participant
    pub fn member(&self, address: &SipAddress) -> Option<&Participant> {
        if self.is_me(address) {
            return self.me.as_ref();
        }
        self.find_participant(address)
    }

    pub(crate) fn member_mut(&mut self, address: &SipAddress) -> Option<&mut Participant> {
        if self.is_me(address) {
            return self.me.as_mut();
        }
        self.participants.iter_mut().find(|p| p.address.weak_equal(address))
    }

    /// Members in join order: the local user first
    pub fn members(&self) -> impl Iterator<Item = &Participant> {
        self.me.iter().chain(self.participants.iter())
    }

    pub fn is_admin(&self, address: &SipAddress) -> bool {
        self.member(address).map(|p| p.is_admin).unwrap_or(false)
    }

    pub fn admins(&self) -> Vec<SipAddress> {
        self.members().filter(|p| p.is_admin).map(|p| p.address.clone()).collect()
    }

    pub fn participant_for_call(&self, call_id: &CallId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.device_for_call(call_id).is_some())
    }

    /// Participant and device address of the device joined over `call_id`
    pub fn device_for_call(&self, call_id: &CallId) -> Option<(SipAddress, SipAddress)> {
        self.members().find_map(|p| {
            p.device_for_call(call_id)
                .map(|d| (p.address.clone(), d.address.clone()))
        })
    }

    /// Admit a participant, or a new device of a known participant
    pub fn add_participant(
        &mut self,
        address: &SipAddress,
        role: ParticipantRole,
        device: ParticipantDevice,
    ) -> Vec<ConferenceChange> {
        let address = address.uri_only();
        let mut changes = Vec::new();

        if let Some(existing) = self.participants.iter_mut().find(|p| p.address.weak_equal(&address)) {
            if existing.device(&device.address).is_none() {
                changes.push(ConferenceChange::DeviceAdded {
                    participant: existing.address.clone(),
                    device: device.address.clone(),
                });
                existing.devices.push(device);
            }
            return changes;
        }

        let mut participant = Participant::new(address.clone(), role);
        if self.role == FocusRole::Focus {
            let is_organizer = self.organizer.as_ref().map(|o| o.weak_equal(&address)).unwrap_or(false);
            let exclusive_taken = self.admin_policy == AdminPolicy::Exclusive && self.has_admin();
            participant.is_admin = (is_organizer && !exclusive_taken) || !self.has_admin();
        }

        debug!(conference = %self.id, participant = %address, admin = participant.is_admin, "participant added");
        changes.push(ConferenceChange::ParticipantAdded {
            participant: address.clone(),
        });
        changes.push(ConferenceChange::DeviceAdded {
            participant: address,
            device: device.address.clone(),
        });
        participant.devices.push(device);
        self.participants.push(participant);
        self.had_participants = true;
        changes
    }

    /// Remove a participant with all its devices. The devices are reported
    /// first, the participant last.
    pub fn remove_participant(&mut self, address: &SipAddress) -> Vec<ConferenceChange> {
        let Some(index) = self.participants.iter().position(|p| p.address.weak_equal(address)) else {
            return Vec::new();
        };
        let participant = self.participants.remove(index);
        debug!(conference = %self.id, participant = %participant.address, "participant removed");

        let mut changes: Vec<ConferenceChange> = participant
            .devices
            .iter()
            .map(|d| ConferenceChange::DeviceRemoved {
                participant: participant.address.clone(),
                device: d.address.clone(),
            })
            .collect();
        changes.push(ConferenceChange::ParticipantRemoved {
            participant: participant.address,
        });
        changes.extend(self.ensure_admin());
        changes
    }

    /// Remove one device; the participant goes away with its last device
    pub fn remove_device(&mut self, device: &SipAddress) -> Vec<ConferenceChange> {
        let Some(participant) = self
            .participants
            .iter_mut()
            .find(|p| p.device(device).is_some())
        else {
            return Vec::new();
        };

        if participant.devices.len() == 1 {
            let address = participant.address.clone();
            return self.remove_participant(&address);
        }

        participant.devices.retain(|d| d.address != *device);
        vec![ConferenceChange::DeviceRemoved {
            participant: participant.address.clone(),
            device: device.clone(),
        }]
    }

    // Admin rights

    pub fn has_admin(&self) -> bool {
        self.members().any(|p| p.is_admin)
    }

    /// Re-assign the admin right when nobody holds it: the first remaining
    /// member in join order gets it. Only the focus side decides.
    pub fn ensure_admin(&mut self) -> Vec<ConferenceChange> {
        if self.role != FocusRole::Focus || self.has_admin() {
            return Vec::new();
        }
        let next = self.me.iter_mut().chain(self.participants.iter_mut()).next();
        match next {
            Some(member) => {
                member.is_admin = true;
                info!(conference = %self.id, admin = %member.address, "admin re-assigned");
                vec![ConferenceChange::AdminChanged {
                    participant: member.address.clone(),
                    is_admin: true,
                }]
            }
            None => Vec::new(),
        }
    }

    /// Grant or revoke the admin right of `target` on behalf of `requester`
    pub fn set_admin(
        &mut self,
        requester: &SipAddress,
        target: &SipAddress,
        admin: bool,
    ) -> Result<Vec<ConferenceChange>> {
        if !self.is_admin(requester) {
            return Err(ConferenceError::not_authorized(requester, "change admin status"));
        }
        let current = self
            .member(target)
            .map(|p| p.is_admin)
            .ok_or_else(|| ConferenceError::participant_not_found(self.id, target))?;
        if current == admin {
            return Ok(Vec::new());
        }

        let mut changes = Vec::new();
        if admin {
            changes.extend(self.apply_admin(target, true));
            if self.admin_policy == AdminPolicy::Exclusive {
                let others: Vec<SipAddress> = self
                    .admins()
                    .into_iter()
                    .filter(|a| !a.weak_equal(target))
                    .collect();
                for other in others {
                    changes.extend(self.apply_admin(&other, false));
                }
            }
        } else {
            let other_admins = self.admins().iter().filter(|a| !a.weak_equal(target)).count();
            if other_admins == 0 {
                let successor = self
                    .members()
                    .find(|p| !p.address.weak_equal(target))
                    .map(|p| p.address.clone());
                let Some(successor) = successor else {
                    // Last member keeps the right
                    return Ok(Vec::new());
                };
                changes.extend(self.apply_admin(target, false));
                changes.extend(self.apply_admin(&successor, true));
            } else {
                changes.extend(self.apply_admin(target, false));
            }
        }
        Ok(changes)
    }

    /// Set the admin flag without authorization checks
    pub(crate) fn apply_admin(&mut self, target: &SipAddress, admin: bool) -> Vec<ConferenceChange> {
        match self.member_mut(target) {
            Some(member) if member.is_admin != admin => {
                member.is_admin = admin;
                vec![ConferenceChange::AdminChanged {
                    participant: member.address.clone(),
                    is_admin: admin,
                }]
            }
            _ => Vec::new(),
        }
    }

    // Description

    /// Change the subject. `requester` is checked for admin rights when given.
    pub fn set_subject(&mut self, requester: Option<&SipAddress>, subject: &str) -> Result<Vec<ConferenceChange>> {
        if let Some(requester) = requester {
            if !self.is_admin(requester) {
                return Err(ConferenceError::not_authorized(requester, "change the subject"));
            }
        }
        if self.subject == subject {
            return Ok(Vec::new());
        }
        self.subject = subject.to_string();
        self.params.subject = Some(subject.to_string());
        Ok(vec![ConferenceChange::SubjectChanged {
            subject: subject.to_string(),
        }])
    }

    pub fn set_available_media(&mut self, audio: bool, video: bool) -> Vec<ConferenceChange> {
        if self.params.audio_enabled == audio && self.params.video_enabled == video {
            return Vec::new();
        }
        self.params.audio_enabled = audio;
        self.params.video_enabled = video;
        vec![ConferenceChange::AvailableMediaChanged { audio, video }]
    }

    /// Returns true if the layout changed
    pub fn set_layout(&mut self, layout: ConferenceLayout) -> bool {
        let changed = self.params.layout != layout;
        self.params.layout = layout;
        changed
    }

    // Devices

    fn locate_device(&mut self, device: &SipAddress) -> Option<(SipAddress, &mut ParticipantDevice)> {
        self.me
            .iter_mut()
            .chain(self.participants.iter_mut())
            .find_map(|p| {
                let participant = p.address.clone();
                p.device_mut(device).map(|d| (participant, d))
            })
    }

    pub fn set_device_state(&mut self, device: &SipAddress, state: DeviceState) -> Vec<ConferenceChange> {
        let Some((participant, dev)) = self.locate_device(device) else {
            return Vec::new();
        };
        let mut changes = Vec::new();
        let was_speaking = dev.speaking;
        if let Some(from) = dev.set_state(state) {
            changes.push(ConferenceChange::DeviceStateChanged {
                participant: participant.clone(),
                device: device.clone(),
                from,
                to: state,
            });
            if was_speaking && state != DeviceState::Present && dev.set_speaking(false) {
                changes.push(ConferenceChange::DeviceSpeakingChanged {
                    participant,
                    device: device.clone(),
                    speaking: false,
                });
            }
        }
        changes
    }

    pub fn set_device_media(
        &mut self,
        device: &SipAddress,
        audio: MediaDirection,
        video: MediaDirection,
    ) -> Vec<ConferenceChange> {
        let tracker = self.tracker.clone();
        let Some((participant, dev)) = self.locate_device(device) else {
            return Vec::new();
        };
        if !dev.set_media(audio, video) {
            return Vec::new();
        }
        tracker.refresh_ssrcs(dev);
        vec![ConferenceChange::DeviceMediaChanged {
            participant,
            device: device.clone(),
            audio,
            video,
        }]
    }

    pub fn set_device_muted(&mut self, device: &SipAddress, muted: bool) -> Vec<ConferenceChange> {
        let Some((participant, dev)) = self.locate_device(device) else {
            return Vec::new();
        };
        if !dev.set_muted(muted) {
            return Vec::new();
        }
        let mut changes = vec![ConferenceChange::DeviceMutedChanged {
            participant: participant.clone(),
            device: device.clone(),
            muted,
        }];
        if muted && dev.set_speaking(false) {
            changes.push(ConferenceChange::DeviceSpeakingChanged {
                participant,
                device: device.clone(),
                speaking: false,
            });
        }
        changes
    }

    pub fn set_device_speaking(&mut self, device: &SipAddress, speaking: bool) -> Vec<ConferenceChange> {
        let Some((participant, dev)) = self.locate_device(device) else {
            return Vec::new();
        };
        if !dev.set_speaking(speaking) {
            return Vec::new();
        }
        vec![ConferenceChange::DeviceSpeakingChanged {
            participant,
            device: device.clone(),
            speaking,
        }]
    }

    /// Feed a mixer audio level for a device
    pub fn report_audio_level(&mut self, device: &SipAddress, level_db: f32) -> Vec<ConferenceChange> {
        let Some((participant, dev)) = self.locate_device(device) else {
            return Vec::new();
        };
        match dev.feed_audio_level(level_db) {
            Some(speaking) => vec![ConferenceChange::DeviceSpeakingChanged {
                participant,
                device: device.clone(),
                speaking,
            }],
            None => Vec::new(),
        }
    }
}
