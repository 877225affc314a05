//! Conference schedulers owned by a core and the calendar invitations they
//! send

use tracing::{debug, info, warn};

use super::{CoreInner, OutgoingCall, PendingScheduling};
use crate::errors::{ConferenceError, Result};
use crate::events::CoreEvent;
use crate::message::{codes, SipMessage, ICS_CONTENT_TYPE};
use crate::scheduler::{
    ics, CcmpOperation, ConferenceInfo, ConferenceScheduler, SchedulerKind, SchedulerState, SchedulingRequest,
};
use crate::types::{CallId, SchedulerId, SipAddress};

impl CoreInner {
    pub(crate) fn create_conference_scheduler(&mut self, kind: SchedulerKind) -> SchedulerId {
        let server = match kind {
            SchedulerKind::Ccmp => self.config.ccmp_server_address().unwrap_or_else(|e| {
                warn!(error = %e, "invalid CCMP server address");
                None
            }),
            SchedulerKind::Sip => self.factory.clone(),
        };
        let id = SchedulerId::new();
        self.schedulers.insert(id, ConferenceScheduler::new(id, kind, server));
        debug!(scheduler = %id, kind = %kind, "conference scheduler created");
        id
    }

    pub(crate) fn scheduler(&self, id: &SchedulerId) -> Result<&ConferenceScheduler> {
        self.schedulers
            .get(id)
            .ok_or_else(|| ConferenceError::scheduler_not_found(id))
    }

    fn scheduler_mut(&mut self, id: &SchedulerId) -> Result<&mut ConferenceScheduler> {
        self.schedulers
            .get_mut(id)
            .ok_or_else(|| ConferenceError::scheduler_not_found(id))
    }

    /// Count and publish the scheduler state if `operation` moved it
    fn track_scheduler<T>(
        &mut self,
        id: &SchedulerId,
        operation: impl FnOnce(&mut ConferenceScheduler) -> Result<T>,
    ) -> Result<T> {
        let scheduler = self.scheduler_mut(id)?;
        let before = scheduler.state();
        let result = operation(scheduler);
        let after = scheduler.state();
        if before != after {
            self.stats.update(|s| s.record_scheduler_state(after));
            self.emit(CoreEvent::SchedulerStateChanged {
                scheduler: *id,
                state: after,
            });
        }
        result
    }

    fn send_request(&mut self, id: &SchedulerId, request: SchedulingRequest) -> Result<()> {
        let kind = self.scheduler(id)?.kind();
        let result = match kind {
            SchedulerKind::Ccmp => self.send_ccmp(request),
            SchedulerKind::Sip => self.send_scheduling_invite(id, request),
        };
        if let Err(e) = result {
            let error = self.track_scheduler(id, |s| Ok(s.on_send_failure(e)))?;
            return Err(error);
        }
        Ok(())
    }

    fn send_ccmp(&self, request: SchedulingRequest) -> Result<()> {
        let SchedulingRequest {
            request_id,
            server,
            operation,
            info,
        } = request;
        info!(server = %server, operation = ?operation, "sending CCMP request");
        let message = SipMessage::CcmpRequest {
            request_id,
            operation,
            info,
        };
        self.send(&server, message)
    }

    /// Creation goes to the factory, updates to the conference itself
    fn send_scheduling_invite(&mut self, id: &SchedulerId, request: SchedulingRequest) -> Result<()> {
        let SchedulingRequest {
            request_id,
            server,
            operation,
            info,
        } = request;
        let target = match operation {
            CcmpOperation::Create => server,
            CcmpOperation::Update => info
                .uri
                .clone()
                .ok_or_else(|| ConferenceError::internal("no conference to update"))?,
            CcmpOperation::Delete => {
                return Err(ConferenceError::config("cancelling a conference needs a CCMP server"));
            }
        };
        info!(scheduler = %id, to = %target, operation = ?operation, "sending scheduling INVITE");

        let options = OutgoingCall {
            subject: (!info.subject.is_empty()).then(|| info.subject.clone()),
            resource_list: info.participant_addresses(),
            start_time: Some(info.start_time.unwrap_or(info.created_at)),
            dial_out: true,
            ..Default::default()
        };
        let call_id = self.place_call(&target, options)?;
        self.scheduling_calls.insert(
            call_id,
            PendingScheduling {
                scheduler: *id,
                request_id,
            },
        );
        Ok(())
    }

    pub(crate) fn scheduler_set_info(&mut self, id: &SchedulerId, info: ConferenceInfo) -> Result<()> {
        let request = self.track_scheduler(id, |s| s.set_info(info))?;
        self.send_request(id, request)
    }

    pub(crate) fn scheduler_cancel(&mut self, id: &SchedulerId) -> Result<()> {
        let request = self.track_scheduler(id, |s| s.cancel())?;
        self.send_request(id, request)
    }

    pub(crate) fn scheduler_send_invitations(&mut self, id: &SchedulerId) -> Result<Vec<SipAddress>> {
        let scheduler = self.scheduler(id)?;
        let invitations = scheduler.invitations()?;
        let info = scheduler.info().cloned();

        let mut failed = Vec::new();
        for recipient in &invitations.recipients {
            let message = SipMessage::Message {
                content_type: ICS_CONTENT_TYPE.to_string(),
                body: invitations.body.clone(),
            };
            if let Err(e) = self.send(recipient, message) {
                debug!(scheduler = %id, recipient = %recipient, error = %e, "invitation not delivered");
                failed.push(recipient.clone());
            }
        }

        info!(
            scheduler = %id,
            sent = invitations.recipients.len() - failed.len(),
            failed = failed.len(),
            "conference invitations sent"
        );
        let failed_count = failed.len() as u32;
        self.stats.update(|s| {
            s.invitations_sent += 1;
            s.invitations_failed += failed_count;
        });
        if let Some(info) = info {
            self.info_store.upsert(info);
        }
        self.emit(CoreEvent::InvitationsSent {
            scheduler: *id,
            failed: failed.clone(),
        });
        Ok(failed)
    }

    pub(crate) fn on_ccmp_response(
        &mut self,
        request_id: String,
        code: u16,
        conference: Option<SipAddress>,
        xcon_id: Option<String>,
    ) -> Result<()> {
        let owner = self
            .schedulers
            .values()
            .find(|s| s.pending_request() == Some(request_id.as_str()))
            .map(|s| s.id());
        let Some(id) = owner else {
            return Err(ConferenceError::protocol(format!("unexpected CCMP response {}", request_id)));
        };
        self.scheduler_answered(&id, &request_id, code, conference, xcon_id)
    }

    /// A scheduling INVITE was answered: the focus of the answer is the
    /// conference address, and the call has nothing more to carry
    pub(crate) fn on_scheduling_answer(
        &mut self,
        call_id: &CallId,
        pending: PendingScheduling,
        focus: Option<SipAddress>,
    ) -> Result<()> {
        let code = if focus.is_some() { codes::OK } else { codes::NOT_FOUND };
        let answered = self.scheduler_answered(&pending.scheduler, &pending.request_id, code, focus, None);
        self.terminate(call_id)?;
        answered
    }

    /// A scheduling INVITE ended without an answer
    pub(crate) fn scheduling_call_ended(&mut self, call_id: &CallId) {
        let Some(pending) = self.scheduling_calls.shift_remove(call_id) else {
            return;
        };
        let error = ConferenceError::protocol(format!("scheduling INVITE {} was not answered", call_id));
        if let Err(e) = self.track_scheduler(&pending.scheduler, |s| Ok(s.on_send_failure(error))) {
            debug!(call = %call_id, error = %e, "scheduler gone before its INVITE ended");
        }
    }

    fn scheduler_answered(
        &mut self,
        id: &SchedulerId,
        request_id: &str,
        code: u16,
        conference: Option<SipAddress>,
        xcon_id: Option<String>,
    ) -> Result<()> {
        let state = self.track_scheduler(id, |s| s.on_response(request_id, code, conference, xcon_id))?;
        if state == SchedulerState::Ready {
            if let Some(info) = self.scheduler(id)?.info().cloned() {
                self.info_store.upsert(info);
            }
        }
        Ok(())
    }

    /// Out-of-dialog MESSAGE; only calendar invitations are understood
    pub(crate) fn on_message(&mut self, from: SipAddress, content_type: String, body: String) -> Result<()> {
        if content_type != ICS_CONTENT_TYPE {
            debug!(from = %from, content_type = %content_type, "ignoring MESSAGE");
            return Ok(());
        }
        let info = ics::from_ics(&body)?;
        self.stats.update(|s| s.ics_invitations_received += 1);
        info!(from = %from, subject = %info.subject, state = ?info.state, "conference invitation received");

        if let Some(uri) = info.uri.clone() {
            if self.info_store.upsert(info) {
                self.emit(CoreEvent::ConferenceInfoReceived { uri });
            }
        }
        Ok(())
    }
}
