//! Client side of remotely mixed conferences: joining a focus and
//! mirroring its state from NOTIFYs

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::CoreInner;
use crate::conference::{ConferenceParams, ConferenceState, FocusDelegatingBackend, FocusRole};
use crate::device::{DeviceState, ParticipantDeviceTracker};
use crate::errors::{ConferenceError, Result};
use crate::event_package::{apply_document, ConferenceInfoDocument, VersionCheck};
use crate::events::CoreEvent;
use crate::message::{codes, SipMessage, CONFERENCE_INFO_CONTENT_TYPE};
use crate::types::{CallId, ConferenceId, SipAddress};

impl CoreInner {
    /// `call_id` now reaches the focus of the conference at `address`
    pub(crate) fn client_join(&mut self, call_id: &CallId, address: &SipAddress) -> Result<ConferenceId> {
        let existing = self
            .conference_of_call(call_id)
            .or_else(|| self.find_conference(address))
            .filter(|id| {
                self.session(id)
                    .map(|s| s.role() == FocusRole::Client && !s.state().is_ending())
                    .unwrap_or(false)
            });

        let conference = match existing {
            Some(id) => id,
            None => {
                let video = self.call(call_id)?.params.video_enabled;
                let params = ConferenceParams::from_config(&self.config)
                    .with_video(video)
                    .remote(address.uri_only().to_string());
                let session = self.new_session(FocusRole::Client, params);
                self.insert_conference(session, Arc::new(FocusDelegatingBackend::new()))
            }
        };
        info!(conference = %conference, address = %address, call = %call_id, "joined remote conference");

        self.bind_call(call_id, &conference, true)?;
        let identity = self.identity.clone();
        let params = self.call(call_id)?.params;
        {
            let entry = self.entry_mut(&conference)?;
            entry.focus_call = Some(*call_id);
            if entry.session.address().map(|a| !a.same_conference(address)).unwrap_or(true) {
                entry.session.set_address(address.clone());
            }
            if entry.session.me().is_none() {
                let device = entry.session.tracker().create_device(
                    ParticipantDeviceTracker::device_address(&identity, Some(call_id)),
                    Some(*call_id),
                    DeviceState::Present,
                    Some(&params),
                );
                entry.session.set_local_participant(identity.uri_only(), false, device);
            } else {
                // Reported by the focus, not by us
                entry.session.set_me_state(DeviceState::Present);
            }
        }

        if self.session(&conference)?.state() == ConferenceState::Instantiated {
            self.set_conference_state(&conference, ConferenceState::CreationPending)?;
        }
        self.subscribe_conference(&conference)?;
        self.flush_queued(&conference);
        Ok(conference)
    }

    /// The focus took `call_id` out of its conference
    pub(crate) fn client_leave(&mut self, call_id: &CallId) {
        let Some(conference) = self
            .conference_of_call(call_id)
            .filter(|id| self.session(id).map(|s| s.role() == FocusRole::Client).unwrap_or(false))
        else {
            return;
        };
        info!(conference = %conference, call = %call_id, "left remote conference");
        self.unsubscribe_conference(&conference);
        if let Ok(call) = self.call_mut(call_id) {
            call.conference = None;
        }
        self.finish_conference(&conference, true);
    }

    pub(crate) fn subscribe_conference(&mut self, conference: &ConferenceId) -> Result<()> {
        if !self.config.conference_event_log_enabled {
            debug!(conference = %conference, "event log disabled, not subscribing");
            if self.session(conference)?.state() == ConferenceState::CreationPending {
                self.set_conference_state(conference, ConferenceState::Created)?;
            }
            return Ok(());
        }
        let address = self.conference_address(conference)?;
        self.entry_mut(conference)?.subscription.set_pending(true);
        self.send(
            &address,
            SipMessage::Subscribe {
                conference: address.clone(),
            },
        )
    }

    pub(crate) fn unsubscribe_conference(&mut self, conference: &ConferenceId) {
        let Ok(entry) = self.entry_mut(conference) else {
            return;
        };
        let subscribed = entry.subscription.is_pending() || entry.subscription.last_version().is_some();
        entry.subscription.reset();
        entry.subscription.set_pending(false);
        let Some(address) = entry.session.address().cloned() else {
            return;
        };
        if !subscribed {
            return;
        }
        if let Err(e) = self.send(
            &address,
            SipMessage::Unsubscribe {
                conference: address.clone(),
            },
        ) {
            debug!(conference = %address, error = %e, "unsubscribe not delivered");
        }
    }

    /// Refer the calls queued before the conference address was known
    fn flush_queued(&mut self, conference: &ConferenceId) {
        let Ok(address) = self.conference_address(conference) else {
            return;
        };
        let queued = match self.entry_mut(conference) {
            Ok(entry) => std::mem::take(&mut entry.queued_calls),
            Err(_) => return,
        };
        for call_id in queued {
            debug!(conference = %address, call = %call_id, "referring queued call to the conference");
            if let Err(e) = self.transfer(&call_id, &address) {
                warn!(conference = %address, call = %call_id, error = %e, "cannot add queued call");
            }
        }
    }

    pub(crate) fn on_subscribe_response(&mut self, conference: SipAddress, code: u16) -> Result<()> {
        let id = self
            .find_conference(&conference)
            .ok_or_else(|| ConferenceError::conference_not_found(&conference))?;
        if codes::is_success(code) {
            debug!(conference = %conference, "subscription accepted");
            return Ok(());
        }

        info!(conference = %conference, code, "subscription rejected");
        self.stats.update(|s| s.subscriptions_rejected += 1);
        self.entry_mut(&id)?.subscription.set_pending(false);
        if self.session(&id)?.state() == ConferenceState::CreationPending {
            self.set_conference_state(&id, ConferenceState::Created)?;
        }
        Ok(())
    }

    pub(crate) fn on_notify(&mut self, conference: SipAddress, content_type: String, body: String) -> Result<()> {
        if content_type != CONFERENCE_INFO_CONTENT_TYPE {
            return Err(ConferenceError::event_package(format!(
                "unexpected NOTIFY content type {}",
                content_type
            )));
        }
        let id = self
            .find_conference(&conference)
            .ok_or_else(|| ConferenceError::conference_not_found(&conference))?;
        let document = ConferenceInfoDocument::from_xml(&body)?;
        let full_state = document.is_full_state();

        self.stats.update(|s| {
            s.notify_received += 1;
            if full_state {
                s.notify_full_state_received += 1;
            }
        });
        self.emit(CoreEvent::NotifyReceived {
            conference: conference.clone(),
            version: document.version,
            full_state,
        });

        let entry = self.entry_mut(&id)?;
        match entry.subscription.check(&document) {
            VersionCheck::Apply => {}
            VersionCheck::Stale => {
                debug!(conference = %conference, version = document.version, "stale notification dropped");
                return Ok(());
            }
            VersionCheck::Gap => {
                entry.subscription.reset();
                info!(conference = %conference, "re-subscribing for a fresh full state");
                return self.subscribe_conference(&id);
            }
        }

        let first_sync = full_state && !entry.session.is_synchronized();
        let changes = apply_document(&mut entry.session, &document);
        entry.subscription.accept(document.version);

        // The initial snapshot describes the conference, nothing changed
        if !first_sync {
            self.record_changes(&id, &changes);
        }
        if self.session(&id)?.state() == ConferenceState::CreationPending {
            self.set_conference_state(&id, ConferenceState::Created)?;
        }
        Ok(())
    }
}
