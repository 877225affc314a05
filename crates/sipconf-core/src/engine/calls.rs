//! Call legs: placing, answering, hold/resume, re-INVITE handling and
//! transfers

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CoreInner, PendingRefer};
use crate::call::{Call, CallParams, CallState, ConferenceBinding, ReferOrigin, TransferState};
use crate::conference::FocusRole;
use crate::errors::{ConferenceError, Result};
use crate::events::CoreEvent;
use crate::message::{codes, ConferenceHint, ReInviteKind, ReferMethod, SipMessage};
use crate::types::{CallId, SipAddress};

/// Options of an outgoing call
#[derive(Debug, Default)]
pub(crate) struct OutgoingCall {
    pub(crate) params: Option<CallParams>,
    pub(crate) subject: Option<String>,
    /// Set when a focus dials out to a participant
    pub(crate) focus: Option<SipAddress>,
    pub(crate) resource_list: Vec<SipAddress>,
    /// Scheduled start sent to a focus that only provisions the conference
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) refer_origin: Option<ReferOrigin>,
    pub(crate) conference: Option<ConferenceBinding>,
    /// Placed on behalf of a conference: other calls are left alone
    pub(crate) dial_out: bool,
}

impl CoreInner {
    pub(crate) fn place_call(&mut self, to: &SipAddress, options: OutgoingCall) -> Result<CallId> {
        let params = options
            .params
            .unwrap_or_else(|| CallParams::from_config(&self.config));
        let call_id = CallId::new();

        let mut call = Call::outgoing(call_id, self.identity.clone(), to.clone(), params);
        call.subject = options.subject.clone();
        call.focus = options.focus.clone();
        call.resource_list = options.resource_list.clone();
        call.refer_origin = options.refer_origin.clone();
        call.conference = options.conference;

        if self.calls.insert(call) {
            self.stats.update(|s| s.first_call_started += 1);
        }
        info!(call = %call_id, to = %to, "placing call");
        self.set_call_state(&call_id, CallState::OutgoingInit)?;

        if !options.dial_out {
            let mut keep = vec![call_id];
            keep.extend(options.refer_origin.as_ref().map(|o| o.original_call));
            self.make_room(&keep);
        }

        let invite = SipMessage::Invite {
            call_id,
            params,
            subject: options.subject,
            focus: options.focus,
            resource_list: options.resource_list,
            start_time: options.start_time,
        };
        if let Err(e) = self.send(to, invite) {
            return Err(self.fail_call(&call_id, e));
        }
        self.set_call_state(&call_id, CallState::OutgoingProgress)?;
        Ok(call_id)
    }

    pub(crate) fn invite(&mut self, to: &SipAddress, params: Option<CallParams>) -> Result<CallId> {
        self.place_call(
            to,
            OutgoingCall {
                params,
                ..Default::default()
            },
        )
    }

    pub(crate) fn accept(&mut self, call_id: &CallId) -> Result<()> {
        let call = self.call(call_id)?;
        if call.state != CallState::IncomingReceived {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "accept"));
        }
        let remote = call.remote.clone();
        let focus = call.focus.clone();
        let params = CallParams::answer(&call.params, false);

        self.make_room(&[*call_id]);
        self.call_mut(call_id)?.params = params;

        let ok = SipMessage::Ok {
            call_id: *call_id,
            params,
            focus: None,
        };
        if let Err(e) = self.send(&remote, ok) {
            return Err(self.fail_call(call_id, e));
        }
        self.set_call_state(call_id, CallState::Connected)?;
        self.set_call_state(call_id, CallState::StreamsRunning)?;

        // A focus dialing us in
        if let Some(focus) = focus {
            self.client_join(call_id, &focus)?;
        }
        Ok(())
    }

    pub(crate) fn decline(&mut self, call_id: &CallId, code: u16) -> Result<()> {
        let call = self.call(call_id)?;
        if call.state != CallState::IncomingReceived {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "decline"));
        }
        let remote = call.remote.clone();
        if let Err(e) = self.send(&remote, SipMessage::Decline { call_id: *call_id, code }) {
            debug!(call = %call_id, error = %e, "decline not delivered");
        }
        self.end_call(call_id, CallState::End);
        Ok(())
    }

    pub(crate) fn pause(&mut self, call_id: &CallId) -> Result<()> {
        let call = self.call(call_id)?;
        if !matches!(call.state, CallState::StreamsRunning | CallState::PausedByRemote) {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "pause"));
        }

        // Pausing a participant leg takes it out of the conference we mix
        let hosted = self.hosted_conference_of(call_id);
        let hint = match hosted {
            Some(conference) => {
                self.detach_leg(&conference, call_id);
                ConferenceHint::Left
            }
            None => ConferenceHint::Unchanged,
        };

        self.call_mut(call_id)?.local_hold = true;
        self.send_reinvite(call_id, ReInviteKind::Hold, hint, None)?;

        if let Some(conference) = hosted {
            self.check_dissolution(&conference);
        }
        Ok(())
    }

    pub(crate) fn resume(&mut self, call_id: &CallId) -> Result<()> {
        let call = self.call(call_id)?;
        if call.state != CallState::Paused {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "resume"));
        }
        self.make_room(&[*call_id]);
        self.call_mut(call_id)?.local_hold = false;
        self.send_reinvite(call_id, ReInviteKind::Resume, ConferenceHint::Unchanged, None)
    }

    pub(crate) fn update(&mut self, call_id: &CallId, params: CallParams) -> Result<()> {
        let call = self.call(call_id)?;
        if !call.state.is_established() || call.state.is_transient() {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "update"));
        }
        self.call_mut(call_id)?.params = params;
        self.send_reinvite(call_id, ReInviteKind::Update, ConferenceHint::Unchanged, None)
    }

    /// Hang up. An unreachable peer still ends the call locally, in error.
    pub(crate) fn terminate(&mut self, call_id: &CallId) -> Result<()> {
        let call = self.call(call_id)?;
        if call.state.is_terminal() {
            return Ok(());
        }
        let remote = call.remote.clone();
        let message = if call.state == CallState::IncomingReceived {
            SipMessage::Decline {
                call_id: *call_id,
                code: codes::DECLINE,
            }
        } else {
            SipMessage::Bye { call_id: *call_id }
        };

        match self.send(&remote, message) {
            Ok(()) => self.end_call(call_id, CallState::End),
            Err(e) => {
                warn!(call = %call_id, error = %e, "peer unreachable, ending call locally");
                self.end_call(call_id, CallState::Error);
            }
        }
        Ok(())
    }

    /// Ask the remote end of `call_id` to call `to`
    pub(crate) fn transfer(&mut self, call_id: &CallId, to: &SipAddress) -> Result<()> {
        let call = self.call(call_id)?;
        if !call.state.is_established() {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "transfer"));
        }
        let remote = call.remote.clone();
        let refer_id = Uuid::new_v4().to_string();
        self.refers.insert(
            refer_id.clone(),
            PendingRefer {
                call_id: Some(*call_id),
                conference: None,
            },
        );
        info!(call = %call_id, to = %to, "transferring call");
        self.send(
            &remote,
            SipMessage::Refer {
                refer_id,
                call_id: Some(*call_id),
                refer_to: to.clone(),
                method: ReferMethod::Invite,
                admin: None,
            },
        )
    }

    /// Start a re-INVITE with the call's current params
    pub(crate) fn send_reinvite(
        &mut self,
        call_id: &CallId,
        kind: ReInviteKind,
        hint: ConferenceHint,
        subject: Option<String>,
    ) -> Result<()> {
        let call = self.call(call_id)?;
        let remote = call.remote.clone();
        let params = call.params;
        let next = match kind {
            ReInviteKind::Hold => CallState::Pausing,
            ReInviteKind::Resume => CallState::Resuming,
            ReInviteKind::Update => CallState::Updating,
        };
        self.set_call_state(call_id, next)?;

        let message = SipMessage::ReInvite {
            call_id: *call_id,
            kind,
            params,
            conference: hint,
            subject,
        };
        if let Err(e) = self.send(&remote, message) {
            return Err(self.fail_call(call_id, e));
        }
        Ok(())
    }

    /// End a call in error after a signalling failure
    pub(crate) fn fail_call(&mut self, call_id: &CallId, error: ConferenceError) -> ConferenceError {
        warn!(call = %call_id, error = %error, "call failed");
        self.end_call(call_id, CallState::Error);
        error
    }

    /// Move a call to `End` or `Error`, detach it from its conference and
    /// release it
    pub(crate) fn end_call(&mut self, call_id: &CallId, state: CallState) {
        let Ok(call) = self.call(call_id) else {
            return;
        };
        if call.state.is_terminal() {
            return;
        }
        let connected = call.state.is_established();
        let refer_origin = call.refer_origin.clone();

        if let Err(e) = self.set_call_state(call_id, state) {
            warn!(call = %call_id, error = %e, "cannot end call");
            return;
        }

        if let Some(conference) = self.conference_of_call(call_id) {
            if let Ok(backend) = self.backend(&conference) {
                backend.call_ended(self, &conference, call_id);
            }
        }
        self.scheduling_call_ended(call_id);

        // The transferee never reached the target
        if let (Some(origin), false) = (refer_origin, connected) {
            self.report_transfer(&origin, TransferState::Failed);
        }

        if let Err(e) = self.set_call_state(call_id, CallState::Released) {
            warn!(call = %call_id, error = %e, "cannot release call");
        }
        if let Some((_, last)) = self.calls.remove(call_id) {
            info!(call = %call_id, state = %state, "call released");
            if last {
                self.stats.update(|s| s.last_call_ended += 1);
            }
        }
    }

    /// Pause whatever uses the local audio before a new call takes it
    pub(crate) fn make_room(&mut self, keep: &[CallId]) {
        if !self.config.auto_pause_on_new_call {
            return;
        }
        for call_id in self.calls.running_outside_conference(None) {
            if keep.contains(&call_id) {
                continue;
            }
            debug!(call = %call_id, "pausing call for a new one");
            if let Err(e) = self.pause(&call_id) {
                warn!(call = %call_id, error = %e, "cannot pause call");
            }
        }

        let joined: Vec<_> = self
            .conferences
            .values()
            .filter(|e| e.session.is_in())
            .filter(|e| !e.focus_call.map(|c| keep.contains(&c)).unwrap_or(false))
            .map(|e| e.session.id())
            .collect();
        for conference in joined {
            if let Ok(backend) = self.backend(&conference) {
                if let Err(e) = backend.leave(self, &conference) {
                    warn!(conference = %conference, error = %e, "cannot leave conference");
                }
            }
        }
    }

    /// Conference mixed by this core that `call_id` is a participant leg of
    pub(crate) fn hosted_conference_of(&self, call_id: &CallId) -> Option<crate::types::ConferenceId> {
        self.conference_of_call(call_id)
            .filter(|id| self.session(id).map(|s| s.role() == FocusRole::Focus).unwrap_or(false))
    }

    fn report_transfer(&mut self, origin: &ReferOrigin, state: TransferState) {
        let notify = SipMessage::ReferNotify {
            refer_id: origin.refer_id.clone(),
            call_id: origin.original_call,
            state,
        };
        if let Err(e) = self.send(&origin.referer, notify) {
            debug!(referer = %origin.referer, error = %e, "transfer notification not delivered");
        }
        self.emit(CoreEvent::TransferStateChanged {
            call_id: origin.original_call,
            state,
        });
    }

    // Incoming requests

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_invite(
        &mut self,
        from: SipAddress,
        to: SipAddress,
        call_id: CallId,
        params: CallParams,
        subject: Option<String>,
        focus: Option<SipAddress>,
        resource_list: Vec<SipAddress>,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.calls.contains(&call_id) {
            return Err(ConferenceError::protocol(format!("duplicate INVITE for {}", call_id)));
        }
        let to_factory = self.factory.as_ref().map(|f| f.weak_equal(&to)).unwrap_or(false);
        if to_factory && !to.weak_equal(&self.identity) {
            return match start_time {
                Some(start_time) => {
                    self.on_scheduling_invite(from, None, call_id, params, subject, resource_list, start_time)
                }
                None => self.on_factory_invite(from, call_id, params, subject, resource_list),
            };
        }
        if to.conference_id().is_some() {
            return match start_time {
                Some(start_time) => {
                    self.on_scheduling_invite(from, Some(to), call_id, params, subject, resource_list, start_time)
                }
                None => self.on_conference_invite(from, to, call_id, params),
            };
        }

        let mut call = Call::incoming(call_id, self.identity.clone(), from.clone(), params);
        call.subject = subject;
        call.focus = focus;
        if self.calls.insert(call) {
            self.stats.update(|s| s.first_call_started += 1);
        }
        info!(call = %call_id, from = %from, "incoming call");
        self.set_call_state(&call_id, CallState::IncomingReceived)?;

        if let Err(e) = self.send(&from, SipMessage::Ringing { call_id }) {
            return Err(self.fail_call(&call_id, e));
        }
        if self.config.auto_accept_calls {
            self.accept(&call_id)?;
        }
        Ok(())
    }

    pub(crate) fn on_ringing(&mut self, call_id: CallId) -> Result<()> {
        if self.call(&call_id)?.state == CallState::OutgoingProgress {
            self.set_call_state(&call_id, CallState::OutgoingRinging)?;
        }
        Ok(())
    }

    pub(crate) fn on_ok(&mut self, call_id: CallId, params: CallParams, focus: Option<SipAddress>) -> Result<()> {
        let call = self.call(&call_id)?;
        if !matches!(call.state, CallState::OutgoingProgress | CallState::OutgoingRinging) {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "accept an answer"));
        }
        let local_muted = call.params.muted;
        let refer_origin = call.refer_origin.clone();

        self.call_mut(&call_id)?.params = CallParams {
            muted: local_muted,
            ..params
        };
        self.set_call_state(&call_id, CallState::Connected)?;
        self.set_call_state(&call_id, CallState::StreamsRunning)?;

        if let Some(pending) = self.scheduling_calls.shift_remove(&call_id) {
            return self.on_scheduling_answer(&call_id, pending, focus);
        }
        // A participant we dialed out to answered
        if let Some(conference) = self.hosted_conference_of(&call_id) {
            self.admit_answered_call(&conference, &call_id, &params)?;
        }
        if let Some(focus) = focus {
            self.client_join(&call_id, &focus)?;
        }
        if let Some(origin) = refer_origin {
            self.report_transfer(&origin, TransferState::Connected);
        }
        Ok(())
    }

    pub(crate) fn on_decline(&mut self, call_id: CallId, code: u16) -> Result<()> {
        let call = self.call(&call_id)?;
        if call.state.is_established() {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "be declined"));
        }
        info!(call = %call_id, code, "call declined");
        let state = if matches!(code, codes::DECLINE | codes::BUSY_HERE) {
            CallState::End
        } else {
            CallState::Error
        };
        self.end_call(&call_id, state);
        Ok(())
    }

    pub(crate) fn on_reinvite(
        &mut self,
        from: SipAddress,
        call_id: CallId,
        kind: ReInviteKind,
        params: CallParams,
        hint: ConferenceHint,
        subject: Option<String>,
    ) -> Result<()> {
        let call = self.call(&call_id)?;
        if !call.state.is_established() {
            return Err(ConferenceError::invalid_call_state(call_id, call.state, "accept a re-INVITE"));
        }
        let remote = call.remote.clone();
        // Our own re-INVITE is in flight: answer without moving the state
        let settled = !call.state.is_transient();

        if settled {
            self.set_call_state(&call_id, CallState::UpdatedByRemote)?;
        }
        {
            let call = self.call_mut(&call_id)?;
            match kind {
                ReInviteKind::Hold => call.remote_hold = true,
                ReInviteKind::Resume => call.remote_hold = false,
                ReInviteKind::Update => {}
            }
            call.params = CallParams::answer(&params, call.params.muted);
        }

        if let Some(conference) = self.hosted_conference_of(&call_id) {
            self.apply_leg_reinvite(&conference, &call_id, &from, kind, &params, subject.as_deref());
        }
        match hint {
            ConferenceHint::Joined(address) => {
                if let Err(e) = self.client_join(&call_id, &address) {
                    warn!(call = %call_id, conference = %address, error = %e, "cannot join conference");
                }
            }
            ConferenceHint::Left => self.client_leave(&call_id),
            ConferenceHint::Unchanged => {}
        }

        let answer = self.call(&call_id)?.params;
        if let Err(e) = self.send(&remote, SipMessage::ReInviteOk { call_id, params: answer }) {
            return Err(self.fail_call(&call_id, e));
        }
        if settled {
            let next = self.call(&call_id)?.settled_state();
            self.set_call_state(&call_id, next)?;
        }
        Ok(())
    }

    pub(crate) fn on_reinvite_ok(&mut self, call_id: CallId, params: CallParams) -> Result<()> {
        let call = self.call(&call_id)?;
        if !call.state.is_transient() || call.state == CallState::UpdatedByRemote {
            debug!(call = %call_id, state = %call.state, "late re-INVITE answer ignored");
            return Ok(());
        }
        let next = call.settled_state();
        self.set_call_state(&call_id, next)?;

        if let Some(conference) = self.hosted_conference_of(&call_id) {
            self.leg_renegotiated(&conference, &call_id, &params);
        }
        if std::mem::take(&mut self.call_mut(&call_id)?.left_hint_pending) {
            debug!(call = %call_id, "telling the remote end its conference is gone");
            self.send_reinvite(&call_id, ReInviteKind::Update, ConferenceHint::Left, None)?;
        }
        Ok(())
    }

    pub(crate) fn on_bye(&mut self, call_id: CallId) -> Result<()> {
        if self.calls.contains(&call_id) {
            info!(call = %call_id, "remote hung up");
            self.end_call(&call_id, CallState::End);
        }
        Ok(())
    }

    /// REFER inside a dialog: call the target and report back
    pub(crate) fn on_transfer_request(
        &mut self,
        from: SipAddress,
        refer_id: String,
        call_id: CallId,
        refer_to: SipAddress,
    ) -> Result<()> {
        if !self.calls.contains(&call_id) {
            self.send(
                &from,
                SipMessage::ReferResponse {
                    refer_id,
                    code: codes::NOT_FOUND,
                },
            )?;
            return Err(ConferenceError::call_not_found(call_id));
        }

        self.stats.update(|s| s.transfer_refer_received += 1);
        self.send(
            &from,
            SipMessage::ReferResponse {
                refer_id: refer_id.clone(),
                code: codes::ACCEPTED,
            },
        )?;
        self.emit(CoreEvent::TransferStateChanged {
            call_id,
            state: TransferState::Progress,
        });

        info!(call = %call_id, target = %refer_to, "transfer requested");
        let origin = ReferOrigin {
            refer_id,
            original_call: call_id,
            referer: from,
        };
        self.place_call(
            &refer_to,
            OutgoingCall {
                refer_origin: Some(origin),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    pub(crate) fn on_refer_response(&mut self, refer_id: String, code: u16) -> Result<()> {
        let Some(pending) = self.refers.get(&refer_id).cloned() else {
            debug!(refer = %refer_id, "answer to unknown REFER");
            return Ok(());
        };
        if codes::is_success(code) {
            // Transfers complete with a notification
            if pending.call_id.is_none() {
                self.refers.shift_remove(&refer_id);
            }
            return Ok(());
        }
        self.refers.shift_remove(&refer_id);

        if let Some(conference) = pending.conference {
            info!(conference = %conference, code, "conference request rejected");
            self.stats.update(|s| s.conference_requests_rejected += 1);
            self.emit(CoreEvent::RequestRejected { conference, code });
        } else if let Some(call_id) = pending.call_id {
            self.stats.update(|s| s.transfer_call_failed += 1);
            self.emit(CoreEvent::TransferStateChanged {
                call_id,
                state: TransferState::Failed,
            });
        }
        Ok(())
    }

    pub(crate) fn on_refer_notify(&mut self, refer_id: String, call_id: CallId, state: TransferState) -> Result<()> {
        self.emit(CoreEvent::TransferStateChanged { call_id, state });
        match state {
            TransferState::Progress => Ok(()),
            TransferState::Connected => {
                self.refers.shift_remove(&refer_id);
                self.stats.update(|s| s.transfer_call_connected += 1);
                info!(call = %call_id, "transfer connected, hanging up original call");
                if self.calls.contains(&call_id) {
                    self.terminate(&call_id)?;
                }
                Ok(())
            }
            TransferState::Failed => {
                self.refers.shift_remove(&refer_id);
                self.stats.update(|s| s.transfer_call_failed += 1);
                Ok(())
            }
        }
    }
}
