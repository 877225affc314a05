//! Conference server side: factory INVITEs, dial-ins, subscriptions,
//! REFERs from admins and CCMP provisioning

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::CoreInner;
use crate::call::{Call, CallParams, CallState, ConferenceBinding};
use crate::conference::{ConferenceParams, ConferenceState, FocusRole, LocalMixingBackend, ParticipantRole};
use crate::errors::{ConferenceError, Result};
use crate::message::{codes, ReferMethod, SipMessage, CONFERENCE_INFO_CONTENT_TYPE};
use crate::scheduler::{CcmpOperation, ConferenceInfo, ConferenceInfoState};
use crate::types::{CallId, ConferenceId, SipAddress, CONF_ID_PARAM};

impl CoreInner {
    /// Session for a conference hosted by this server, without a local user
    fn new_hosted_conference(&mut self, params: ConferenceParams, organizer: &SipAddress) -> (ConferenceId, SipAddress) {
        let mut session = self.new_session(FocusRole::Focus, params.with_local_participant(false).local());
        let address = self.identity.uri_only().with_param(CONF_ID_PARAM, session.id().short());
        session.set_address(address.clone());
        session.set_organizer(organizer.clone());
        let id = self.insert_conference(session, Arc::new(LocalMixingBackend::new()));
        (id, address)
    }

    pub(crate) fn on_factory_invite(
        &mut self,
        from: SipAddress,
        call_id: CallId,
        offer: CallParams,
        subject: Option<String>,
        resource_list: Vec<SipAddress>,
    ) -> Result<()> {
        if !self.config.conference_server_enabled {
            debug!(from = %from, "not a conference server, declining factory INVITE");
            return self.send(
                &from,
                SipMessage::Decline {
                    call_id,
                    code: codes::NOT_FOUND,
                },
            );
        }

        let mut params = ConferenceParams::from_config(&self.config).with_video(offer.video_enabled);
        params.subject = subject.clone();
        let (conference, address) = self.new_hosted_conference(params, &from);
        info!(conference = %conference, address = %address, organizer = %from, "conference created by factory");
        self.set_conference_state(&conference, ConferenceState::CreationPending)?;

        self.answer_as_focus(&conference, from.clone(), call_id, offer, subject)?;

        let invitees: Vec<SipAddress> = resource_list
            .into_iter()
            .filter(|a| !a.weak_equal(&from))
            .collect();
        if !invitees.is_empty() {
            self.backend(&conference)?
                .invite_participants(self, &conference, &invitees)?;
        }
        Ok(())
    }

    /// INVITE of a SIP conference scheduler. Sent to the factory it
    /// provisions a conference; sent to a conference address it reschedules
    /// that conference. The answer carries the conference address and
    /// nobody is dialed out to or admitted.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_scheduling_invite(
        &mut self,
        from: SipAddress,
        to: Option<SipAddress>,
        call_id: CallId,
        offer: CallParams,
        subject: Option<String>,
        resource_list: Vec<SipAddress>,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let decline = |core: &CoreInner, code: u16| core.send(&from, SipMessage::Decline { call_id, code });
        if !self.config.conference_server_enabled {
            debug!(from = %from, "not a conference server, declining scheduling INVITE");
            return decline(self, codes::NOT_FOUND);
        }
        let subject = subject.unwrap_or_default();

        let address = match to {
            None => {
                let mut params = ConferenceParams::from_config(&self.config);
                params.subject = (!subject.is_empty()).then(|| subject.clone());
                let (conference, address) = self.new_hosted_conference(params, &from);
                self.session_mut(&conference)?
                    .set_allowed_participants(resource_list.clone());
                self.set_conference_state(&conference, ConferenceState::CreationPending)?;

                let mut info = ConferenceInfo::new(from.clone())
                    .with_subject(subject)
                    .with_start_time(start_time);
                for participant in resource_list {
                    info.add_participant(participant, ParticipantRole::Speaker);
                }
                info.uri = Some(address.clone());
                self.info_store.upsert(info);
                info!(conference = %conference, address = %address, organizer = %from, "conference provisioned by INVITE");
                address
            }
            Some(to) => {
                let hosted = self
                    .find_conference(&to)
                    .filter(|id| self.session(id).map(|s| s.role() == FocusRole::Focus).unwrap_or(false));
                let Some(conference) = hosted else {
                    return decline(self, codes::NOT_FOUND);
                };
                let is_organizer = self
                    .session(&conference)?
                    .organizer()
                    .map(|o| o.weak_equal(&from))
                    .unwrap_or(false);
                if !is_organizer {
                    info!(from = %from, conference = %to, "only the organizer may reschedule");
                    return decline(self, codes::FORBIDDEN);
                }

                let changes = self.session_mut(&conference)?.set_subject(None, &subject)?;
                self.session_mut(&conference)?
                    .set_allowed_participants(resource_list.clone());
                self.publish(&conference, changes);

                let address = self.conference_address(&conference)?;
                if let Some(mut stored) = self.info_store.get(&address).cloned() {
                    // Resource lists carry no roles: known participants keep theirs
                    let previous = std::mem::take(&mut stored.participants);
                    for participant in resource_list {
                        let role = previous
                            .iter()
                            .find(|p| p.address.weak_equal(&participant))
                            .map(|p| p.role)
                            .unwrap_or(ParticipantRole::Speaker);
                        stored.add_participant(participant, role);
                    }
                    stored = stored.with_subject(subject).with_start_time(start_time);
                    stored.ics_sequence += 1;
                    stored.state = ConferenceInfoState::Updated;
                    self.info_store.upsert(stored);
                }
                info!(conference = %conference, "conference rescheduled by INVITE");
                address
            }
        };

        self.send(
            &from,
            SipMessage::Ok {
                call_id,
                params: CallParams::answer(&offer, false),
                focus: Some(address),
            },
        )
    }

    pub(crate) fn on_conference_invite(
        &mut self,
        from: SipAddress,
        to: SipAddress,
        call_id: CallId,
        offer: CallParams,
    ) -> Result<()> {
        let hosted = self.find_conference(&to).filter(|id| {
            self.session(id)
                .map(|s| s.role() == FocusRole::Focus && s.state().accepts_changes())
                .unwrap_or(false)
        });
        let code = match hosted {
            None => Some(codes::NOT_FOUND),
            Some(id) if !self.session(&id)?.is_allowed(&from) => Some(codes::FORBIDDEN),
            Some(_) => None,
        };
        if let Some(code) = code {
            info!(from = %from, conference = %to, code, "conference INVITE refused");
            return self.send(&from, SipMessage::Decline { call_id, code });
        }

        let Some(conference) = hosted else {
            return Ok(());
        };
        let subject = self.session(&conference)?.subject().to_string();
        self.answer_as_focus(&conference, from, call_id, offer, (!subject.is_empty()).then_some(subject))
    }

    /// Answer an INVITE to a conference and admit the caller
    fn answer_as_focus(
        &mut self,
        conference: &ConferenceId,
        from: SipAddress,
        call_id: CallId,
        offer: CallParams,
        subject: Option<String>,
    ) -> Result<()> {
        let address = self.conference_address(conference)?;
        let params = CallParams::answer(&offer, false);

        let mut call = Call::incoming(call_id, self.identity.clone(), from.clone(), params);
        call.subject = subject;
        call.focus = Some(address.clone());
        call.conference = Some(ConferenceBinding {
            conference: *conference,
            mixed: true,
        });
        if self.calls.insert(call) {
            self.stats.update(|s| s.first_call_started += 1);
        }
        self.set_call_state(&call_id, CallState::IncomingReceived)?;

        let ok = SipMessage::Ok {
            call_id,
            params,
            focus: Some(address),
        };
        if let Err(e) = self.send(&from, ok) {
            return Err(self.fail_call(&call_id, e));
        }
        self.set_call_state(&call_id, CallState::Connected)?;
        self.set_call_state(&call_id, CallState::StreamsRunning)?;
        self.admit_answered_call(conference, &call_id, &params)
    }

    pub(crate) fn on_subscribe(&mut self, from: SipAddress, conference: SipAddress) -> Result<()> {
        let hosted = self
            .find_conference(&conference)
            .filter(|id| self.session(id).map(|s| s.role() == FocusRole::Focus).unwrap_or(false));
        let Some(id) = hosted else {
            return self.send(
                &from,
                SipMessage::SubscribeResponse {
                    conference,
                    code: codes::NOT_FOUND,
                },
            );
        };

        let entry = self.entry_mut(&id)?;
        let code = entry.dispatcher.subscribe(&from);
        let full_state = if codes::is_success(code) {
            Some(entry.dispatcher.full_state(&entry.session)?)
        } else {
            None
        };
        self.send(
            &from,
            SipMessage::SubscribeResponse {
                conference: conference.clone(),
                code,
            },
        )?;
        if let Some(body) = full_state {
            self.send(
                &from,
                SipMessage::Notify {
                    conference,
                    content_type: CONFERENCE_INFO_CONTENT_TYPE.to_string(),
                    body,
                },
            )?;
        }
        Ok(())
    }

    pub(crate) fn on_unsubscribe(&mut self, from: SipAddress, conference: SipAddress) -> Result<()> {
        if let Some(id) = self.find_conference(&conference) {
            if self.entry_mut(&id)?.dispatcher.unsubscribe(&from) {
                debug!(conference = %conference, subscriber = %from, "subscription ended");
            }
        }
        Ok(())
    }

    /// REFER sent to a conference address by one of its members
    pub(crate) fn on_conference_refer(
        &mut self,
        from: SipAddress,
        to: SipAddress,
        refer_id: String,
        refer_to: SipAddress,
        method: ReferMethod,
        admin: Option<bool>,
    ) -> Result<()> {
        let hosted = self
            .find_conference(&to)
            .filter(|id| self.session(id).map(|s| s.role() == FocusRole::Focus).unwrap_or(false));
        let code = match hosted {
            None => codes::NOT_FOUND,
            Some(id) if !self.session(&id)?.is_admin(&from) => codes::FORBIDDEN,
            Some(_) => codes::ACCEPTED,
        };
        self.send(
            &from,
            SipMessage::ReferResponse {
                refer_id,
                code,
            },
        )?;
        let Some(conference) = hosted.filter(|_| code == codes::ACCEPTED) else {
            info!(from = %from, conference = %to, code, "conference REFER refused");
            return Ok(());
        };

        match (admin, method) {
            (Some(admin), _) => {
                let changes = self.session_mut(&conference)?.set_admin(&from, &refer_to, admin)?;
                self.publish(&conference, changes);
            }
            (None, ReferMethod::Bye) => {
                if self.session(&conference)?.find_participant(&refer_to).is_none() {
                    return Err(ConferenceError::participant_not_found(conference, &refer_to));
                }
                self.expel_participant(&conference, &refer_to);
            }
            (None, ReferMethod::Invite) => {
                self.backend(&conference)?
                    .invite_participants(self, &conference, std::slice::from_ref(&refer_to))?;
            }
        }
        Ok(())
    }

    pub(crate) fn on_ccmp_request(
        &mut self,
        from: SipAddress,
        request_id: String,
        operation: CcmpOperation,
        mut info: ConferenceInfo,
    ) -> Result<()> {
        let respond = |core: &CoreInner, code: u16, conference: Option<SipAddress>, xcon_id: Option<String>| {
            core.send(
                &from,
                SipMessage::CcmpResponse {
                    request_id: request_id.clone(),
                    code,
                    conference,
                    xcon_id,
                },
            )
        };
        if !self.config.conference_server_enabled {
            return respond(self, codes::SERVICE_UNAVAILABLE, None, None);
        }

        if operation == CcmpOperation::Create {
            let mut params = ConferenceParams::from_config(&self.config);
            params.subject = (!info.subject.is_empty()).then(|| info.subject.clone());
            let organizer = info.organizer.clone().unwrap_or_else(|| from.clone());
            let (conference, address) = self.new_hosted_conference(params, &organizer);
            self.session_mut(&conference)?
                .set_allowed_participants(info.participant_addresses());
            self.set_conference_state(&conference, ConferenceState::CreationPending)?;

            let xcon_id = format!(
                "xcon:{}@{}",
                address.conference_id().unwrap_or_default(),
                address.domain
            );
            info!(conference = %conference, address = %address, organizer = %organizer, "conference provisioned");
            info.uri = Some(address.clone());
            self.info_store.upsert(info);
            return respond(self, codes::OK, Some(address), Some(xcon_id));
        }

        let hosted = info
            .uri
            .as_ref()
            .and_then(|uri| self.find_conference(uri))
            .filter(|id| self.session(id).map(|s| s.role() == FocusRole::Focus).unwrap_or(false));
        let Some(conference) = hosted else {
            return respond(self, codes::NOT_FOUND, None, None);
        };
        let address = self.conference_address(&conference)?;

        match operation {
            CcmpOperation::Update => {
                let changes = self.session_mut(&conference)?.set_subject(None, &info.subject)?;
                self.session_mut(&conference)?
                    .set_allowed_participants(info.participant_addresses());
                self.publish(&conference, changes);
                info!(conference = %conference, "conference information updated");
            }
            CcmpOperation::Delete => {
                info.state = ConferenceInfoState::Cancelled;
                if let Err(e) = self.backend(&conference)?.terminate(self, &conference) {
                    warn!(conference = %conference, error = %e, "cannot terminate cancelled conference");
                }
            }
            CcmpOperation::Create => {}
        }
        self.info_store.upsert(info);
        respond(self, codes::OK, Some(address), None)
    }
}
