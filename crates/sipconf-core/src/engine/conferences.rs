//! Conference API of a core and the bookkeeping shared by both backends

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CoreInner, PendingRefer};
use crate::call::{CallParams, ConferenceBinding};
use crate::conference::{
    ConferenceBackend, ConferenceParams, ConferenceState, FocusDelegatingBackend, FocusRole, LocalMixingBackend,
    ParticipantRole,
};
use crate::config::ConferenceType;
use crate::device::{DeviceState, ParticipantDeviceTracker};
use crate::errors::{ConferenceError, Result};
use crate::message::{ConferenceHint, ReInviteKind, ReferMethod, SipMessage};
use crate::types::{CallId, ConferenceId, ConferenceLayout, MediaDirection, SipAddress};

impl CoreInner {
    pub(crate) fn create_conference(&mut self, params: ConferenceParams) -> Result<ConferenceId> {
        let remote = params.conference_type == ConferenceType::Remote || params.factory_uri.is_some();
        let (role, backend): (FocusRole, Arc<dyn ConferenceBackend>) = if remote {
            (FocusRole::Client, Arc::new(FocusDelegatingBackend::new()))
        } else {
            (FocusRole::Focus, Arc::new(LocalMixingBackend::new()))
        };

        let session = self.new_session(role, params);
        let id = self.insert_conference(session, backend.clone());
        info!(conference = %id, role = ?role, "creating conference");
        backend.create(self, &id)?;
        Ok(id)
    }

    pub(crate) fn add_participant(&mut self, conference: &ConferenceId, call_id: &CallId) -> Result<()> {
        self.backend(conference)?.add_participant(self, conference, call_id)
    }

    /// Merge every call that can join and is not part of a conference yet
    pub(crate) fn add_all_to_conference(&mut self, conference: &ConferenceId) -> Result<()> {
        let backend = self.backend(conference)?;
        let candidates: Vec<CallId> = self
            .calls
            .iter()
            .filter(|c| !c.has_conference() && c.state.can_join_conference())
            .map(|c| c.id)
            .collect();
        backend.add_participants(self, conference, &candidates)
    }

    pub(crate) fn invite_participants(&mut self, conference: &ConferenceId, addresses: &[SipAddress]) -> Result<()> {
        self.backend(conference)?.invite_participants(self, conference, addresses)
    }

    pub(crate) fn remove_participant(&mut self, conference: &ConferenceId, participant: &SipAddress) -> Result<()> {
        self.backend(conference)?.remove_participant(self, conference, participant)
    }

    pub(crate) fn set_admin(&mut self, conference: &ConferenceId, participant: &SipAddress, admin: bool) -> Result<()> {
        self.backend(conference)?.set_admin(self, conference, participant, admin)
    }

    pub(crate) fn set_subject(&mut self, conference: &ConferenceId, subject: &str) -> Result<()> {
        self.backend(conference)?.set_subject(self, conference, subject)
    }

    pub(crate) fn enable_video(&mut self, conference: &ConferenceId, enabled: bool) -> Result<()> {
        self.backend(conference)?.enable_video(self, conference, enabled)
    }

    pub(crate) fn set_layout(&mut self, conference: &ConferenceId, layout: ConferenceLayout) -> Result<()> {
        self.backend(conference)?.set_layout(self, conference, layout)
    }

    pub(crate) fn set_muted(&mut self, conference: &ConferenceId, muted: bool) -> Result<()> {
        self.backend(conference)?.set_muted(self, conference, muted)
    }

    pub(crate) fn report_audio_level(
        &mut self,
        conference: &ConferenceId,
        device: &SipAddress,
        level_db: f32,
    ) -> Result<()> {
        self.backend(conference)?.report_audio_level(self, conference, device, level_db)
    }

    pub(crate) fn enter(&mut self, conference: &ConferenceId) -> Result<()> {
        self.backend(conference)?.enter(self, conference)
    }

    pub(crate) fn leave(&mut self, conference: &ConferenceId) -> Result<()> {
        self.backend(conference)?.leave(self, conference)
    }

    pub(crate) fn terminate_conference(&mut self, conference: &ConferenceId) -> Result<()> {
        self.backend(conference)?.terminate(self, conference)
    }

    // Shared helpers

    pub(crate) fn conference_address(&self, conference: &ConferenceId) -> Result<SipAddress> {
        let session = self.session(conference)?;
        session
            .address()
            .cloned()
            .ok_or_else(|| ConferenceError::invalid_conference_state(conference, session.state(), "use its address"))
    }

    pub(crate) fn require_changes_accepted(&self, conference: &ConferenceId, operation: &str) -> Result<()> {
        let state = self.session(conference)?.state();
        if !state.accepts_changes() {
            return Err(ConferenceError::invalid_conference_state(conference, state, operation));
        }
        Ok(())
    }

    pub(crate) fn bind_call(&mut self, call_id: &CallId, conference: &ConferenceId, mixed: bool) -> Result<()> {
        let call = self.call_mut(call_id)?;
        call.conference = Some(ConferenceBinding {
            conference: *conference,
            mixed,
        });
        debug!(call = %call_id, conference = %conference, mixed, "call bound to conference");
        Ok(())
    }

    /// Admit the remote end of a leg as a participant of a conference we mix
    pub(crate) fn admit_call(
        &mut self,
        conference: &ConferenceId,
        call_id: &CallId,
        state: DeviceState,
        params: &CallParams,
    ) -> Result<()> {
        let remote = self.call(call_id)?.remote.clone();
        let role = self.scheduled_role(conference, &remote);
        let mut params = *params;
        if role == ParticipantRole::Listener {
            params.audio_direction = MediaDirection::RecvOnly;
        }

        let session = self.session_mut(conference)?;
        let device = session.tracker().create_device(
            ParticipantDeviceTracker::device_address(&remote, Some(call_id)),
            Some(*call_id),
            state,
            Some(&params),
        );
        let changes = session.add_participant(&remote, role, device);
        info!(conference = %conference, participant = %remote, "participant admitted");
        self.publish(conference, changes);
        Ok(())
    }

    /// Role given to `participant` by the scheduling record of the conference
    fn scheduled_role(&self, conference: &ConferenceId, participant: &SipAddress) -> ParticipantRole {
        self.session(conference)
            .ok()
            .and_then(|s| s.address())
            .and_then(|address| self.info_store.get(address))
            .and_then(|info| info.participants.iter().find(|p| p.address.weak_equal(participant)))
            .map(|p| p.role)
            .unwrap_or(ParticipantRole::Speaker)
    }

    /// A participant we dialed out to, or who dialed in, is connected
    pub(crate) fn admit_answered_call(
        &mut self,
        conference: &ConferenceId,
        call_id: &CallId,
        params: &CallParams,
    ) -> Result<()> {
        self.bind_call(call_id, conference, true)?;
        let device = self.session(conference)?.device_for_call(call_id).map(|(_, d)| d);
        match device {
            Some(device) => {
                let session = self.session_mut(conference)?;
                let mut changes = session.set_device_state(&device, DeviceState::Present);
                changes.extend(session.set_device_media(&device, params.effective_audio(), params.effective_video()));
                self.publish(conference, changes);
            }
            None => self.admit_call(conference, call_id, DeviceState::Present, params)?,
        }
        if self.session(conference)?.state() == ConferenceState::CreationPending {
            self.set_conference_state(conference, ConferenceState::Created)?;
        }
        Ok(())
    }

    /// The remote end of a leg re-INVITEd us
    pub(crate) fn apply_leg_reinvite(
        &mut self,
        conference: &ConferenceId,
        call_id: &CallId,
        from: &SipAddress,
        kind: ReInviteKind,
        params: &CallParams,
        subject: Option<&str>,
    ) {
        let Ok(session) = self.session_mut(conference) else {
            return;
        };
        let Some((_, device)) = session.device_for_call(call_id) else {
            return;
        };

        let mut changes = match kind {
            ReInviteKind::Hold => session.set_device_state(&device, DeviceState::OnHold),
            ReInviteKind::Resume => session.set_device_state(&device, DeviceState::Present),
            ReInviteKind::Update => Vec::new(),
        };
        changes.extend(session.set_device_media(&device, params.effective_audio(), params.effective_video()));
        changes.extend(session.set_device_muted(&device, params.muted));

        if let Some(subject) = subject {
            match session.set_subject(Some(from), subject) {
                Ok(subject_changes) => changes.extend(subject_changes),
                Err(e) => debug!(conference = %conference, requester = %from, error = %e, "subject change ignored"),
            }
        }
        self.publish(conference, changes);
    }

    /// One of our re-INVITEs on a participant leg completed
    pub(crate) fn leg_renegotiated(&mut self, conference: &ConferenceId, call_id: &CallId, params: &CallParams) {
        let Ok(call) = self.call_mut(call_id) else {
            return;
        };
        let joined = match call.conference.as_mut() {
            Some(binding) if !binding.mixed => {
                binding.mixed = true;
                true
            }
            _ => false,
        };
        let local_hold = call.local_hold;

        let Ok(session) = self.session_mut(conference) else {
            return;
        };
        let Some((_, device)) = session.device_for_call(call_id) else {
            return;
        };
        let mut changes = Vec::new();
        if joined && !local_hold {
            changes.extend(session.set_device_state(&device, DeviceState::Present));
        }
        changes.extend(session.set_device_media(&device, params.effective_audio(), params.effective_video()));
        changes.extend(session.set_device_muted(&device, params.muted));
        self.publish(conference, changes);
    }

    /// Take a participant leg out of the mix without ending the call
    pub(crate) fn detach_leg(&mut self, conference: &ConferenceId, call_id: &CallId) {
        let Ok(session) = self.session_mut(conference) else {
            return;
        };
        let participant = session.participant_for_call(call_id).map(|p| p.address.clone());
        let changes = match session.device_for_call(call_id) {
            Some((_, device)) => session.remove_device(&device),
            None => Vec::new(),
        };
        info!(conference = %conference, call = %call_id, "leg detached from conference");
        self.publish(conference, changes);

        if let Some(participant) = participant {
            if let Some(entry) = self.conferences.get_mut(conference) {
                if entry.session.find_participant(&participant).is_none() {
                    entry.dispatcher.unsubscribe(&participant);
                }
            }
        }
        if let Ok(call) = self.call_mut(call_id) {
            call.conference = None;
        }
    }

    /// Remove a participant and hang up its legs
    pub(crate) fn expel_participant(&mut self, conference: &ConferenceId, participant: &SipAddress) {
        let Ok(session) = self.session_mut(conference) else {
            return;
        };
        let legs: Vec<CallId> = session
            .find_participant(participant)
            .map(|p| p.devices.iter().filter_map(|d| d.call_id).collect())
            .unwrap_or_default();
        let changes = session.remove_participant(participant);
        info!(conference = %conference, participant = %participant, "participant removed");
        self.publish(conference, changes);

        if let Some(entry) = self.conferences.get_mut(conference) {
            entry.dispatcher.unsubscribe(participant);
        }
        for call_id in legs {
            if let Ok(call) = self.call_mut(&call_id) {
                call.conference = None;
            }
            if let Err(e) = self.terminate(&call_id) {
                warn!(conference = %conference, call = %call_id, error = %e, "cannot hang up removed participant");
            }
        }
        self.check_dissolution(conference);
    }

    /// End a conference we mix once it has nobody left to mix
    pub(crate) fn check_dissolution(&mut self, conference: &ConferenceId) {
        let Ok(session) = self.session(conference) else {
            return;
        };
        if session.role() != FocusRole::Focus || session.state().is_ending() || !session.had_participants() {
            return;
        }
        // Dial-outs still ringing keep the conference alive
        let pending = self
            .calls
            .bound_to(*conference)
            .iter()
            .filter_map(|id| self.call(id).ok())
            .any(|c| !c.state.is_established());
        let count = session.participant_count();
        let has_me = session.me().is_some();
        let one_participant = session.params().one_participant_conference_enabled;

        if pending {
            return;
        }
        if count == 0 {
            info!(conference = %conference, "last participant left");
            self.finish_conference(conference, true);
            return;
        }
        if count == 1 && has_me && !one_participant {
            info!(conference = %conference, "one participant left, dissolving conference");
            for call_id in self.calls.bound_to(*conference) {
                let Ok(call) = self.call_mut(&call_id) else {
                    continue;
                };
                call.conference = None;
                // One re-INVITE at a time: the hint follows the answer
                if call.state.is_transient() {
                    call.left_hint_pending = true;
                    continue;
                }
                if let Err(e) = self.send_reinvite(&call_id, ReInviteKind::Update, ConferenceHint::Left, None) {
                    warn!(conference = %conference, call = %call_id, error = %e, "cannot release remaining leg");
                }
            }
            self.finish_conference(conference, true);
        }
    }

    /// REFER sent to a remote conference on behalf of its admin
    pub(crate) fn send_conference_refer(
        &mut self,
        conference: &ConferenceId,
        target: &SipAddress,
        method: ReferMethod,
        admin: Option<bool>,
    ) -> Result<()> {
        let address = self.conference_address(conference)?;
        let refer_id = Uuid::new_v4().to_string();
        self.refers.insert(
            refer_id.clone(),
            PendingRefer {
                call_id: None,
                conference: Some(address.clone()),
            },
        );
        debug!(conference = %address, target = %target, method = ?method, "sending conference REFER");
        let result = self.send(
            &address,
            SipMessage::Refer {
                refer_id: refer_id.clone(),
                call_id: None,
                refer_to: target.clone(),
                method,
                admin,
            },
        );
        if result.is_err() {
            self.refers.shift_remove(&refer_id);
        }
        result
    }
}
