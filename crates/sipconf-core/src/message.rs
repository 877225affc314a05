//! Signalling messages exchanged between cores
//!
//! SIP parsing and transport are out of scope; cores exchange these typed
//! messages through the [`crate::network::SimNetwork`]. In-dialog requests
//! carry the [`CallId`] shared by both ends of the dialog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{CallParams, TransferState};
use crate::scheduler::{CcmpOperation, ConferenceInfo};
use crate::types::{CallId, SipAddress};

/// Content type of conference event package bodies
pub const CONFERENCE_INFO_CONTENT_TYPE: &str = "application/conference-info+xml";

/// Content type of scheduled conference invitations
pub const ICS_CONTENT_TYPE: &str = "text/calendar;conference-event=yes";

/// Purpose of a re-INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReInviteKind {
    Hold,
    Resume,
    Update,
}

/// Conference membership announced in a re-INVITE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConferenceHint {
    Unchanged,
    /// The leg is now mixed into the conference at this address
    Joined(SipAddress),
    /// The leg was taken out of its conference
    Left,
}

/// What the transferee must do with the refer target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferMethod {
    Invite,
    Bye,
}

/// Response codes used by the engine
pub mod codes {
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const BUSY_HERE: u16 = 486;
    pub const BAD_EVENT: u16 = 489;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const DECLINE: u16 = 603;

    pub fn is_success(code: u16) -> bool {
        (200..300).contains(&code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SipMessage {
    Invite {
        call_id: CallId,
        params: CallParams,
        subject: Option<String>,
        /// Conference address when the caller is a focus dialing out
        focus: Option<SipAddress>,
        /// Participants to dial out to (INVITE to a conference factory)
        resource_list: Vec<SipAddress>,
        /// Set by a scheduler: the focus provisions the conference for
        /// later dial-ins instead of dialing out
        start_time: Option<DateTime<Utc>>,
    },
    Ringing {
        call_id: CallId,
    },
    Ok {
        call_id: CallId,
        params: CallParams,
        /// Conference address when the callee is a focus
        focus: Option<SipAddress>,
    },
    Decline {
        call_id: CallId,
        code: u16,
    },
    ReInvite {
        call_id: CallId,
        kind: ReInviteKind,
        params: CallParams,
        conference: ConferenceHint,
        subject: Option<String>,
    },
    ReInviteOk {
        call_id: CallId,
        params: CallParams,
    },
    Bye {
        call_id: CallId,
    },
    Refer {
        refer_id: String,
        /// Dialog the REFER is sent in, none when sent to a conference
        call_id: Option<CallId>,
        refer_to: SipAddress,
        method: ReferMethod,
        admin: Option<bool>,
    },
    ReferResponse {
        refer_id: String,
        code: u16,
    },
    ReferNotify {
        refer_id: String,
        call_id: CallId,
        state: TransferState,
    },
    Subscribe {
        conference: SipAddress,
    },
    Unsubscribe {
        conference: SipAddress,
    },
    SubscribeResponse {
        conference: SipAddress,
        code: u16,
    },
    Notify {
        conference: SipAddress,
        content_type: String,
        body: String,
    },
    Message {
        content_type: String,
        body: String,
    },
    CcmpRequest {
        request_id: String,
        operation: CcmpOperation,
        info: ConferenceInfo,
    },
    CcmpResponse {
        request_id: String,
        code: u16,
        conference: Option<SipAddress>,
        xcon_id: Option<String>,
    },
}

impl SipMessage {
    /// Short name for logs
    pub fn method(&self) -> &'static str {
        match self {
            SipMessage::Invite { .. } => "INVITE",
            SipMessage::Ringing { .. } => "180",
            SipMessage::Ok { .. } => "200-INVITE",
            SipMessage::Decline { .. } => "DECLINE",
            SipMessage::ReInvite { .. } => "re-INVITE",
            SipMessage::ReInviteOk { .. } => "200-re-INVITE",
            SipMessage::Bye { .. } => "BYE",
            SipMessage::Refer { .. } => "REFER",
            SipMessage::ReferResponse { .. } => "REFER-RESPONSE",
            SipMessage::ReferNotify { .. } => "NOTIFY-refer",
            SipMessage::Subscribe { .. } => "SUBSCRIBE",
            SipMessage::Unsubscribe { .. } => "UNSUBSCRIBE",
            SipMessage::SubscribeResponse { .. } => "SUBSCRIBE-RESPONSE",
            SipMessage::Notify { .. } => "NOTIFY",
            SipMessage::Message { .. } => "MESSAGE",
            SipMessage::CcmpRequest { .. } => "CCMP",
            SipMessage::CcmpResponse { .. } => "CCMP-RESPONSE",
        }
    }
}

/// A message in flight between two cores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: SipAddress,
    pub to: SipAddress,
    pub message: SipMessage,
}

impl Envelope {
    pub fn new(from: SipAddress, to: SipAddress, message: SipMessage) -> Self {
        Self { from, to, message }
    }
}
