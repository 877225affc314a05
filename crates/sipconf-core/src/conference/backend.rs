//! Where a conference is mixed
//!
//! Every conference operation of a core goes through the
//! [`ConferenceBackend`] chosen when the conference was created. The core
//! state is passed in by the caller, which holds the core lock for the whole
//! operation.

use std::fmt::Debug;

use tracing::{debug, info, warn};

use super::{ConferenceState, FocusRole};
use crate::call::{CallParams, CallState, ConferenceBinding};
use crate::device::{DeviceState, ParticipantDeviceTracker};
use crate::engine::{CoreInner, OutgoingCall};
use crate::errors::{ConferenceError, Result};
use crate::message::{ConferenceHint, ReInviteKind, ReferMethod};
use crate::types::{CallId, ConferenceId, ConferenceLayout, MediaDirection, SipAddress, CONF_ID_PARAM};

/// Conference operations, implemented once per mixing strategy
pub trait ConferenceBackend: Debug + Send + Sync {
    /// Side of the conference this backend drives
    fn role(&self) -> FocusRole;

    /// Bring a freshly inserted session up
    fn create(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()>;

    /// Merge an established call into the conference
    fn add_participant(&self, core: &mut CoreInner, conference: &ConferenceId, call_id: &CallId) -> Result<()>;

    /// Merge several calls at once
    fn add_participants(&self, core: &mut CoreInner, conference: &ConferenceId, calls: &[CallId]) -> Result<()> {
        for call_id in calls {
            self.add_participant(core, conference, call_id)?;
        }
        Ok(())
    }

    /// Have the mixer dial out to new participants
    fn invite_participants(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        addresses: &[SipAddress],
    ) -> Result<()>;

    fn remove_participant(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        participant: &SipAddress,
    ) -> Result<()>;

    fn set_admin(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        participant: &SipAddress,
        admin: bool,
    ) -> Result<()>;

    fn set_subject(&self, core: &mut CoreInner, conference: &ConferenceId, subject: &str) -> Result<()>;

    fn enable_video(&self, core: &mut CoreInner, conference: &ConferenceId, enabled: bool) -> Result<()>;

    fn set_layout(&self, core: &mut CoreInner, conference: &ConferenceId, layout: ConferenceLayout) -> Result<()>;

    fn set_muted(&self, core: &mut CoreInner, conference: &ConferenceId, muted: bool) -> Result<()>;

    /// Mixer audio level of one device; only a mixer measures levels
    fn report_audio_level(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        device: &SipAddress,
        level_db: f32,
    ) -> Result<()>;

    /// Mix the local user in
    fn enter(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()>;

    /// Put the local user on hold, leaving the other members mixed
    fn leave(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()>;

    fn terminate(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()>;

    /// A call bound to the conference reached `End` or `Error`
    fn call_ended(&self, core: &mut CoreInner, conference: &ConferenceId, call_id: &CallId);
}

/// This core is the focus: it mixes the media of every leg and owns the
/// authoritative conference state.
#[derive(Debug, Default)]
pub struct LocalMixingBackend;

impl LocalMixingBackend {
    pub fn new() -> Self {
        Self
    }

    /// Renegotiate the legs whose params differ from what the conference now
    /// wants
    fn renegotiate_legs(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        differs: impl Fn(&CallParams) -> bool,
        apply: impl Fn(&mut CallParams),
    ) {
        for call_id in core.calls.bound_to(*conference) {
            let Ok(call) = core.call_mut(&call_id) else {
                continue;
            };
            if !call.state.is_established() || !differs(&call.params) {
                continue;
            }
            apply(&mut call.params);
            if call.state.is_transient() {
                // Picked up by the next renegotiation
                continue;
            }
            if let Err(e) = core.send_reinvite(&call_id, ReInviteKind::Update, ConferenceHint::Unchanged, None) {
                warn!(conference = %conference, call = %call_id, error = %e, "cannot renegotiate leg");
            }
        }
    }

    /// Bind a call and renegotiate it into the mix. Entering the conference
    /// is left to the caller so that several calls can be merged before the
    /// other ones get paused.
    fn merge_call(&self, core: &mut CoreInner, conference: &ConferenceId, call_id: &CallId) -> Result<()> {
        core.require_changes_accepted(conference, "add a participant")?;
        let address = core.conference_address(conference)?;

        let call = core.call(call_id)?;
        if let Some(binding) = call.conference {
            if binding.conference == *conference {
                return Ok(());
            }
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "join a second conference"));
        }
        if !call.state.can_join_conference() {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "join a conference"));
        }
        let on_hold = call.local_hold;

        info!(conference = %conference, call = %call_id, "adding call to conference");
        core.bind_call(call_id, conference, false)?;
        let (video, layout) = {
            let params = core.session(conference)?.params();
            (params.video_enabled, params.layout)
        };
        {
            let call = core.call_mut(call_id)?;
            call.params.video_enabled = video;
            call.params.layout = layout;
            call.local_hold = false;
        }
        let params = core.call(call_id)?.params;
        core.admit_call(conference, call_id, DeviceState::Joining, &params)?;

        let kind = if on_hold {
            ReInviteKind::Resume
        } else {
            ReInviteKind::Update
        };
        core.send_reinvite(call_id, kind, ConferenceHint::Joined(address), None)
    }

    fn enter_if_needed(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let needs_entering = core.session(conference).map(|s| s.me().is_some() && !s.is_in())?;
        if needs_entering {
            self.enter(core, conference)?;
        }
        Ok(())
    }
}

impl ConferenceBackend for LocalMixingBackend {
    fn role(&self) -> FocusRole {
        FocusRole::Focus
    }

    fn create(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let identity = core.identity.clone();
        let address = identity.uri_only().with_param(CONF_ID_PARAM, conference.short());
        let participants = {
            let session = core.session_mut(conference)?;
            session.set_address(address);
            session.set_organizer(identity.clone());
            if session.params().local_participant_enabled {
                let device = session.tracker().create_device(
                    ParticipantDeviceTracker::device_address(&identity, None),
                    None,
                    DeviceState::Joining,
                    None,
                );
                session.set_local_participant(identity.uri_only(), true, device);
            }
            session.params().participants.clone()
        };

        core.set_conference_state(conference, ConferenceState::CreationPending)?;
        core.set_conference_state(conference, ConferenceState::Created)?;

        if !participants.is_empty() {
            self.invite_participants(core, conference, &participants)?;
        }
        Ok(())
    }

    fn add_participant(&self, core: &mut CoreInner, conference: &ConferenceId, call_id: &CallId) -> Result<()> {
        self.merge_call(core, conference, call_id)?;
        self.enter_if_needed(core, conference)
    }

    fn add_participants(&self, core: &mut CoreInner, conference: &ConferenceId, calls: &[CallId]) -> Result<()> {
        for call_id in calls {
            self.merge_call(core, conference, call_id)?;
        }
        self.enter_if_needed(core, conference)
    }

    fn invite_participants(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        addresses: &[SipAddress],
    ) -> Result<()> {
        core.require_changes_accepted(conference, "invite participants")?;
        let address = core.conference_address(conference)?;
        let (video, layout, subject) = {
            let session = core.session(conference)?;
            (
                session.params().video_enabled,
                session.params().layout,
                session.subject().to_string(),
            )
        };

        for target in addresses {
            let skip = target.weak_equal(&core.identity)
                || core.session(conference)?.find_participant(target).is_some()
                || core
                    .calls
                    .bound_to(*conference)
                    .iter()
                    .filter_map(|id| core.call(id).ok())
                    .any(|c| c.remote.weak_equal(target));
            if skip {
                debug!(conference = %conference, participant = %target, "already invited");
                continue;
            }

            let params = CallParams::from_config(&core.config).with_video(video).with_layout(layout);
            let options = OutgoingCall {
                params: Some(params),
                subject: (!subject.is_empty()).then(|| subject.clone()),
                focus: Some(address.clone()),
                conference: Some(ConferenceBinding {
                    conference: *conference,
                    mixed: false,
                }),
                dial_out: true,
                ..Default::default()
            };
            if let Err(e) = core.place_call(target, options) {
                warn!(conference = %conference, participant = %target, error = %e, "cannot dial out");
            }
        }
        self.enter_if_needed(core, conference)
    }

    fn remove_participant(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        participant: &SipAddress,
    ) -> Result<()> {
        let session = core.session(conference)?;
        if session.me().is_some() && !session.is_admin(&core.identity) {
            return Err(ConferenceError::not_authorized(&core.identity, "remove a participant"));
        }
        if session.find_participant(participant).is_none() {
            return Err(ConferenceError::participant_not_found(conference, participant));
        }
        core.expel_participant(conference, participant);
        Ok(())
    }

    fn set_admin(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        participant: &SipAddress,
        admin: bool,
    ) -> Result<()> {
        let identity = core.identity.clone();
        let session = core.session_mut(conference)?;
        let changes = if session.me().is_some() {
            session.set_admin(&identity, participant, admin)?
        } else {
            if session.member(participant).is_none() {
                return Err(ConferenceError::participant_not_found(conference, participant));
            }
            let mut changes = session.apply_admin(participant, admin);
            changes.extend(session.ensure_admin());
            changes
        };
        core.publish(conference, changes);
        Ok(())
    }

    fn set_subject(&self, core: &mut CoreInner, conference: &ConferenceId, subject: &str) -> Result<()> {
        let identity = core.identity.clone();
        let session = core.session_mut(conference)?;
        let requester = session.me().is_some().then_some(&identity);
        let changes = session.set_subject(requester, subject)?;
        core.publish(conference, changes);
        Ok(())
    }

    fn enable_video(&self, core: &mut CoreInner, conference: &ConferenceId, enabled: bool) -> Result<()> {
        let session = core.session_mut(conference)?;
        let audio = session.params().audio_enabled;
        let mut changes = session.set_available_media(audio, enabled);
        if let Some((address, audio)) = session
            .me()
            .and_then(|m| m.devices.first())
            .map(|d| (d.address.clone(), d.audio))
        {
            let video = if enabled {
                MediaDirection::SendRecv
            } else {
                MediaDirection::Inactive
            };
            changes.extend(session.set_device_media(&address, audio, video));
        }
        core.publish(conference, changes);

        self.renegotiate_legs(
            core,
            conference,
            |p| p.video_enabled != enabled,
            |p| p.video_enabled = enabled,
        );
        Ok(())
    }

    fn set_layout(&self, core: &mut CoreInner, conference: &ConferenceId, layout: ConferenceLayout) -> Result<()> {
        if !core.session_mut(conference)?.set_layout(layout) {
            return Ok(());
        }
        self.renegotiate_legs(core, conference, |p| p.layout != layout, |p| p.layout = layout);
        Ok(())
    }

    fn set_muted(&self, core: &mut CoreInner, conference: &ConferenceId, muted: bool) -> Result<()> {
        let session = core.session_mut(conference)?;
        let Some(device) = session.me().and_then(|m| m.devices.first()).map(|d| d.address.clone()) else {
            return Err(ConferenceError::invalid_conference_state(
                conference,
                session.state(),
                "mute without a local participant",
            ));
        };
        let changes = session.set_device_muted(&device, muted);
        core.publish(conference, changes);
        Ok(())
    }

    fn report_audio_level(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        device: &SipAddress,
        level_db: f32,
    ) -> Result<()> {
        let changes = core.session_mut(conference)?.report_audio_level(device, level_db);
        core.publish(conference, changes);
        Ok(())
    }

    fn enter(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let session = core.session(conference)?;
        if session.me().is_none() {
            return Err(ConferenceError::invalid_conference_state(
                conference,
                session.state(),
                "enter without a local participant",
            ));
        }
        if session.is_in() {
            return Ok(());
        }
        let keep = core.calls.bound_to(*conference);
        core.make_room(&keep);

        let changes = core.session_mut(conference)?.set_me_state(DeviceState::Present);
        core.publish(conference, changes);
        Ok(())
    }

    fn leave(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let session = core.session_mut(conference)?;
        if session.me().is_none() {
            return Err(ConferenceError::invalid_conference_state(
                conference,
                session.state(),
                "leave without a local participant",
            ));
        }
        let changes = session.set_me_state(DeviceState::OnHold);
        core.publish(conference, changes);
        Ok(())
    }

    fn terminate(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let state = core.session(conference)?.state();
        if state.can_transition_to(ConferenceState::TerminationPending) {
            core.set_conference_state(conference, ConferenceState::TerminationPending)?;
        }
        info!(conference = %conference, "terminating conference");
        for call_id in core.calls.bound_to(*conference) {
            if let Err(e) = core.terminate(&call_id) {
                warn!(conference = %conference, call = %call_id, error = %e, "cannot hang up leg");
            }
        }
        core.finish_conference(conference, true);
        Ok(())
    }

    fn call_ended(&self, core: &mut CoreInner, conference: &ConferenceId, call_id: &CallId) {
        let Ok(session) = core.session(conference) else {
            return;
        };
        if session.state().is_ending() {
            return;
        }
        let participant = session.participant_for_call(call_id).map(|p| p.address.clone());
        let device = session.device_for_call(call_id).map(|(_, device)| device);

        if let Some(device) = device {
            let changes = match core.session_mut(conference) {
                Ok(session) => session.remove_device(&device),
                Err(_) => return,
            };
            core.publish(conference, changes);
        }
        if let Some(participant) = participant {
            if let Some(entry) = core.conferences.get_mut(conference) {
                if entry.session.find_participant(&participant).is_none() {
                    entry.dispatcher.unsubscribe(&participant);
                }
            }
        }
        // The leg is released right after; it no longer counts for the mixer
        if let Ok(call) = core.call_mut(call_id) {
            call.conference = None;
        }
        core.check_dissolution(conference);
    }
}

/// A remote focus mixes; this core holds one leg to it and mirrors the
/// conference state from the focus's notifications.
#[derive(Debug, Default)]
pub struct FocusDelegatingBackend;

impl FocusDelegatingBackend {
    pub fn new() -> Self {
        Self
    }

    fn focus_call(core: &CoreInner, conference: &ConferenceId) -> Result<CallId> {
        let entry = core.entry(conference)?;
        entry.focus_call.ok_or_else(|| {
            ConferenceError::invalid_conference_state(conference, entry.session.state(), "reach the focus")
        })
    }

    /// Local admin check; the focus enforces it again
    fn require_admin(core: &CoreInner, conference: &ConferenceId, operation: &str) -> Result<()> {
        let session = core.session(conference)?;
        if session.is_synchronized() && !session.is_admin(&core.identity) {
            return Err(ConferenceError::not_authorized(&core.identity, operation));
        }
        Ok(())
    }

    /// Renegotiate the focus leg after changing its params
    fn update_focus_leg(
        core: &mut CoreInner,
        conference: &ConferenceId,
        change: impl FnOnce(&mut CallParams),
        subject: Option<String>,
    ) -> Result<()> {
        let call_id = Self::focus_call(core, conference)?;
        let call = core.call_mut(&call_id)?;
        if call.state.is_transient() || !call.state.is_established() {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "renegotiate"));
        }
        change(&mut call.params);
        core.send_reinvite(&call_id, ReInviteKind::Update, ConferenceHint::Unchanged, subject)
    }
}

impl ConferenceBackend for FocusDelegatingBackend {
    fn role(&self) -> FocusRole {
        FocusRole::Client
    }

    fn create(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let (factory, params) = {
            let session = core.session(conference)?;
            let params = session.params().clone();
            let factory = match &params.factory_uri {
                Some(uri) => Some(SipAddress::parse(uri)?),
                None => core.factory.clone(),
            };
            (factory, params)
        };
        let Some(factory) = factory else {
            core.finish_conference(conference, true);
            return Err(ConferenceError::config("no conference factory configured"));
        };

        let identity = core.identity.clone();
        core.session_mut(conference)?.set_organizer(identity.clone());
        core.set_conference_state(conference, ConferenceState::CreationPending)?;

        let call_params = CallParams::from_config(&core.config)
            .with_video(params.video_enabled)
            .with_layout(params.layout);
        let options = OutgoingCall {
            params: Some(call_params),
            subject: params.subject.clone(),
            resource_list: params.participants.clone(),
            conference: Some(ConferenceBinding {
                conference: *conference,
                mixed: true,
            }),
            ..Default::default()
        };
        info!(conference = %conference, factory = %factory, "creating conference on remote focus");
        let call_id = match core.place_call(&factory, options) {
            Ok(call_id) => call_id,
            Err(e) => {
                core.finish_conference(conference, false);
                return Err(e);
            }
        };

        if let Ok(entry) = core.entry_mut(conference) {
            entry.focus_call = Some(call_id);
            let device = entry.session.tracker().create_device(
                ParticipantDeviceTracker::device_address(&identity, Some(&call_id)),
                Some(call_id),
                DeviceState::Joining,
                Some(&call_params),
            );
            entry.session.set_local_participant(identity.uri_only(), false, device);
        }
        Ok(())
    }

    /// Transfer the call to the conference; the focus takes it from there
    fn add_participant(&self, core: &mut CoreInner, conference: &ConferenceId, call_id: &CallId) -> Result<()> {
        core.require_changes_accepted(conference, "add a participant")?;
        let call = core.call(call_id)?;
        if !call.state.can_join_conference() {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "join a conference"));
        }
        match core.session(conference)?.address().cloned() {
            Some(address) => core.transfer(call_id, &address),
            None => {
                debug!(conference = %conference, call = %call_id, "conference address unknown, queueing call");
                let entry = core.entry_mut(conference)?;
                if !entry.queued_calls.contains(call_id) {
                    entry.queued_calls.push(*call_id);
                }
                Ok(())
            }
        }
    }

    fn invite_participants(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        addresses: &[SipAddress],
    ) -> Result<()> {
        Self::require_admin(core, conference, "invite participants")?;
        for address in addresses {
            core.send_conference_refer(conference, address, ReferMethod::Invite, None)?;
        }
        Ok(())
    }

    fn remove_participant(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        participant: &SipAddress,
    ) -> Result<()> {
        Self::require_admin(core, conference, "remove a participant")?;
        core.send_conference_refer(conference, participant, ReferMethod::Bye, None)
    }

    fn set_admin(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        participant: &SipAddress,
        admin: bool,
    ) -> Result<()> {
        Self::require_admin(core, conference, "change admin status")?;
        core.send_conference_refer(conference, participant, ReferMethod::Invite, Some(admin))
    }

    fn set_subject(&self, core: &mut CoreInner, conference: &ConferenceId, subject: &str) -> Result<()> {
        Self::require_admin(core, conference, "change the subject")?;
        Self::update_focus_leg(core, conference, |_| {}, Some(subject.to_string()))
    }

    fn enable_video(&self, core: &mut CoreInner, conference: &ConferenceId, enabled: bool) -> Result<()> {
        Self::update_focus_leg(core, conference, |p| p.video_enabled = enabled, None)
    }

    fn set_layout(&self, core: &mut CoreInner, conference: &ConferenceId, layout: ConferenceLayout) -> Result<()> {
        core.session_mut(conference)?.set_layout(layout);
        Self::update_focus_leg(core, conference, |p| p.layout = layout, None)
    }

    fn set_muted(&self, core: &mut CoreInner, conference: &ConferenceId, muted: bool) -> Result<()> {
        Self::update_focus_leg(core, conference, |p| p.muted = muted, None)
    }

    fn report_audio_level(
        &self,
        core: &mut CoreInner,
        conference: &ConferenceId,
        _device: &SipAddress,
        _level_db: f32,
    ) -> Result<()> {
        let state = core.session(conference)?.state();
        Err(ConferenceError::invalid_conference_state(
            conference,
            state,
            "measure audio levels of a remotely mixed conference",
        ))
    }

    fn enter(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let call_id = Self::focus_call(core, conference)?;
        if core.call(&call_id)?.state == CallState::Paused {
            core.resume(&call_id)?;
        }
        let changes = core.session_mut(conference)?.set_me_state(DeviceState::Present);
        core.record_changes(conference, &changes);
        Ok(())
    }

    fn leave(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        let call_id = Self::focus_call(core, conference)?;
        let state = core.call(&call_id)?.state;
        if matches!(
            state,
            CallState::StreamsRunning | CallState::PausedByRemote
        ) {
            core.pause(&call_id)?;
        }
        let changes = core.session_mut(conference)?.set_me_state(DeviceState::OnHold);
        core.record_changes(conference, &changes);
        Ok(())
    }

    fn terminate(&self, core: &mut CoreInner, conference: &ConferenceId) -> Result<()> {
        core.unsubscribe_conference(conference);
        match core.entry(conference)?.focus_call {
            Some(call_id) if core.calls.contains(&call_id) => core.terminate(&call_id),
            _ => {
                core.finish_conference(conference, true);
                Ok(())
            }
        }
    }

    fn call_ended(&self, core: &mut CoreInner, conference: &ConferenceId, call_id: &CallId) {
        let Ok(entry) = core.entry_mut(conference) else {
            return;
        };
        entry.queued_calls.retain(|c| c != call_id);
        if entry.focus_call != Some(*call_id) {
            return;
        }
        // A focus that cannot be reached leaves the conference undeleted
        let reachable = core
            .call(call_id)
            .map(|c| c.state != CallState::Error)
            .unwrap_or(false);
        info!(conference = %conference, call = %call_id, "leg to the focus ended");
        core.finish_conference(conference, reachable);
    }
}
