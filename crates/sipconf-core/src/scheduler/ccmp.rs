use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::ics;
use super::info::{ConferenceInfo, ConferenceInfoState};
use super::{SchedulerKind, SchedulerState};
use crate::errors::{ConferenceError, Result};
use crate::message::codes;
use crate::types::{SchedulerId, SipAddress};

/// What a scheduling request asks of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CcmpOperation {
    Create,
    Update,
    Delete,
}

/// A request the scheduler wants sent to its server
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingRequest {
    pub request_id: String,
    pub server: SipAddress,
    pub operation: CcmpOperation,
    pub info: ConferenceInfo,
}

/// Calendar invitation to send to every participant
#[derive(Debug, Clone, PartialEq)]
pub struct Invitations {
    pub body: String,
    pub recipients: Vec<SipAddress>,
}

/// Provisions a conference on a server ahead of time.
///
/// The scheduler is a pure state machine: each operation returns the request
/// to send and the owner feeds the server's answer back through
/// [`ConferenceScheduler::on_response`]. Its [`SchedulerKind`] only decides
/// how the owner carries requests; a SIP scheduler cannot cancel.
#[derive(Debug, Clone)]
pub struct ConferenceScheduler {
    id: SchedulerId,
    kind: SchedulerKind,
    /// CCMP server, or conference factory of a SIP scheduler
    server: Option<SipAddress>,
    state: SchedulerState,
    info: Option<ConferenceInfo>,
    pending: Option<(String, CcmpOperation)>,
    xcon_id: Option<String>,
}

impl ConferenceScheduler {
    pub fn new(id: SchedulerId, kind: SchedulerKind, server: Option<SipAddress>) -> Self {
        Self {
            id,
            kind,
            server,
            state: SchedulerState::Idle,
            info: None,
            pending: None,
            xcon_id: None,
        }
    }

    pub fn id(&self) -> SchedulerId {
        self.id
    }

    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn info(&self) -> Option<&ConferenceInfo> {
        self.info.as_ref()
    }

    /// Conference object identifier assigned by the server
    pub fn xcon_id(&self) -> Option<&str> {
        self.xcon_id.as_deref()
    }

    /// Identifier of the request waiting for an answer
    pub fn pending_request(&self) -> Option<&str> {
        self.pending.as_ref().map(|(id, _)| id.as_str())
    }

    fn set_state(&mut self, next: SchedulerState) {
        if self.state != next {
            info!(scheduler = %self.id, from = %self.state, to = %next, "scheduler state changed");
            self.state = next;
        }
    }

    fn fail(&mut self, error: ConferenceError) -> ConferenceError {
        warn!(scheduler = %self.id, error = %error, "scheduling failed");
        self.pending = None;
        self.set_state(SchedulerState::Error);
        error
    }

    fn missing_server(&self) -> ConferenceError {
        match self.kind {
            SchedulerKind::Ccmp => ConferenceError::config("no CCMP server configured"),
            SchedulerKind::Sip => ConferenceError::config("no conference factory configured"),
        }
    }

    fn request(&mut self, operation: CcmpOperation, next: SchedulerState) -> Result<SchedulingRequest> {
        let server = self.server.clone().ok_or_else(|| self.missing_server())?;
        let info = self
            .info
            .clone()
            .ok_or_else(|| ConferenceError::internal("no conference information to send"))?;
        let request_id = Uuid::new_v4().to_string();
        self.pending = Some((request_id.clone(), operation));
        self.set_state(next);
        Ok(SchedulingRequest {
            request_id,
            server,
            operation,
            info,
        })
    }

    /// Create the conference, or update it once it exists
    pub fn set_info(&mut self, mut info: ConferenceInfo) -> Result<SchedulingRequest> {
        if self.pending.is_some() {
            return Err(ConferenceError::internal(format!(
                "scheduler {} has a request in progress",
                self.id
            )));
        }
        if info.participants.is_empty() {
            return Err(self.fail(ConferenceError::config("a scheduled conference needs participants")));
        }
        let Some(server) = self.server.clone() else {
            let error = self.missing_server();
            return Err(self.fail(error));
        };

        let existing = self.info.as_ref().and_then(|i| i.uri.clone().map(|uri| (uri, i.ics_sequence)));
        info.ccmp_uri = (self.kind == SchedulerKind::Ccmp).then_some(server);
        let (operation, next) = match existing {
            None => {
                info.uri = None;
                info.ics_sequence = 0;
                info.state = ConferenceInfoState::New;
                (CcmpOperation::Create, SchedulerState::AllocationPending)
            }
            Some((uri, sequence)) => {
                info.uri = Some(uri);
                info.ics_sequence = sequence + 1;
                info.state = ConferenceInfoState::Updated;
                (CcmpOperation::Update, SchedulerState::Updating)
            }
        };
        self.info = Some(info);
        self.request(operation, next)
    }

    /// Cancel a provisioned conference
    pub fn cancel(&mut self) -> Result<SchedulingRequest> {
        if self.kind == SchedulerKind::Sip {
            return Err(ConferenceError::config("cancelling a conference needs a CCMP server"));
        }
        if self.pending.is_some() || self.state != SchedulerState::Ready {
            return Err(ConferenceError::internal(format!(
                "scheduler {} cannot cancel in state {}",
                self.id, self.state
            )));
        }
        let Some(info) = self.info.as_mut().filter(|i| i.uri.is_some()) else {
            return Err(ConferenceError::internal("no conference to cancel"));
        };
        info.ics_sequence += 1;
        info.state = ConferenceInfoState::Cancelled;
        self.request(CcmpOperation::Delete, SchedulerState::Updating)
    }

    /// Apply the server's answer to the request in progress
    pub fn on_response(
        &mut self,
        request_id: &str,
        code: u16,
        conference: Option<SipAddress>,
        xcon_id: Option<String>,
    ) -> Result<SchedulerState> {
        match &self.pending {
            Some((pending, _)) if pending == request_id => {}
            _ => {
                return Err(ConferenceError::protocol(format!(
                    "unexpected CCMP response {} for scheduler {}",
                    request_id, self.id
                )))
            }
        }
        let operation = self.pending.take().map(|(_, op)| op);

        if !codes::is_success(code) {
            let error = ConferenceError::protocol(format!("CCMP {:?} rejected with {}", operation, code));
            self.fail(error);
            return Ok(self.state);
        }

        if let Some(info) = self.info.as_mut() {
            if let Some(conference) = conference {
                info.uri = Some(conference);
            }
        }
        if xcon_id.is_some() {
            self.xcon_id = xcon_id;
        }
        self.set_state(SchedulerState::Ready);
        Ok(self.state)
    }

    /// The request could not be delivered to the server
    pub fn on_send_failure(&mut self, error: ConferenceError) -> ConferenceError {
        self.fail(error)
    }

    /// Calendar invitation for the current record. Only a ready scheduler
    /// has something to announce.
    pub fn invitations(&self) -> Result<Invitations> {
        if self.state != SchedulerState::Ready {
            return Err(ConferenceError::internal(format!(
                "scheduler {} is not ready ({})",
                self.id, self.state
            )));
        }
        let info = self
            .info
            .as_ref()
            .filter(|i| i.uri.is_some())
            .ok_or_else(|| ConferenceError::internal("no conference to announce"))?;

        let organizer = info.organizer.clone();
        let recipients = info
            .participants
            .iter()
            .map(|p| p.address.clone())
            .filter(|a| organizer.as_ref().map(|o| !o.weak_equal(a)).unwrap_or(true))
            .collect();
        Ok(Invitations {
            body: ics::to_ics(info),
            recipients,
        })
    }
}
