//! The per-core runtime
//!
//! A [`Core`] is one simulated SIP user agent (or conference server). All of
//! its state lives in a [`CoreInner`] behind a single lock; a message loop
//! task drains the core's network inbox and handles one envelope at a time,
//! so every state change of a core happens in FIFO order. Public operations
//! take the same lock, apply their effect and return immediately; the
//! outcome of the protocol exchanges they start is observed through
//! [`CoreStats`] and [`CoreEvent`]s.

mod calls;
mod client;
mod conferences;
mod focus;
mod scheduling;

pub(crate) use calls::OutgoingCall;

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::call::{Call, CallParams, CallRegistry, CallState};
use crate::conference::{
    ConferenceBackend, ConferenceChange, ConferenceParams, ConferenceSession, ConferenceState, FocusRole,
};
use crate::config::CoreConfig;
use crate::errors::{ConferenceError, Result};
use crate::event_package::{ClientSubscription, EventNotificationDispatcher};
use crate::events::{CoreEvent, EVENT_CHANNEL_CAPACITY};
use crate::message::{Envelope, SipMessage, CONFERENCE_INFO_CONTENT_TYPE};
use crate::network::{Inbox, SimNetwork};
use crate::scheduler::{ConferenceInfo, ConferenceInfoStore, ConferenceScheduler, SchedulerKind, SchedulerState};
use crate::stats::{CoreStats, StatsHandle, StatsRecorder};
use crate::types::{CallId, ConferenceId, ConferenceLayout, SchedulerId, SipAddress};

/// A conference known to this core
pub(crate) struct ConferenceEntry {
    pub(crate) session: ConferenceSession,
    pub(crate) backend: Arc<dyn ConferenceBackend>,
    pub(crate) dispatcher: EventNotificationDispatcher,
    pub(crate) subscription: ClientSubscription,
    /// Client side: the leg to the focus
    pub(crate) focus_call: Option<CallId>,
    /// Client side: calls to refer once the conference address is known
    pub(crate) queued_calls: Vec<CallId>,
}

/// A REFER we sent and wait an answer for
#[derive(Debug, Clone)]
pub(crate) struct PendingRefer {
    /// Dialog of a transfer
    pub(crate) call_id: Option<CallId>,
    /// Conference of a conference request
    pub(crate) conference: Option<SipAddress>,
}

/// Call carrying the request of a SIP conference scheduler
#[derive(Debug, Clone)]
pub(crate) struct PendingScheduling {
    pub(crate) scheduler: SchedulerId,
    pub(crate) request_id: String,
}

/// State of one core, only touched under the core lock
pub struct CoreInner {
    pub(crate) config: CoreConfig,
    pub(crate) identity: SipAddress,
    pub(crate) factory: Option<SipAddress>,
    pub(crate) network: SimNetwork,
    pub(crate) calls: CallRegistry,
    pub(crate) conferences: IndexMap<ConferenceId, ConferenceEntry>,
    pub(crate) schedulers: IndexMap<SchedulerId, ConferenceScheduler>,
    pub(crate) info_store: ConferenceInfoStore,
    pub(crate) refers: IndexMap<String, PendingRefer>,
    pub(crate) scheduling_calls: IndexMap<CallId, PendingScheduling>,
    pub(crate) stats: StatsRecorder,
    pub(crate) events: broadcast::Sender<CoreEvent>,
}

impl CoreInner {
    fn new(config: CoreConfig, identity: SipAddress, factory: Option<SipAddress>, network: SimNetwork) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            identity,
            factory,
            network,
            calls: CallRegistry::new(),
            conferences: IndexMap::new(),
            schedulers: IndexMap::new(),
            info_store: ConferenceInfoStore::new(),
            refers: IndexMap::new(),
            scheduling_calls: IndexMap::new(),
            stats: StatsRecorder::new(),
            events,
        }
    }

    pub(crate) fn send(&self, to: &SipAddress, message: SipMessage) -> Result<()> {
        let envelope = Envelope::new(self.identity.clone(), to.clone(), message);
        self.network.send(envelope)?;
        Ok(())
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    // Calls

    /// Apply a validated call state change, counting and publishing it
    pub(crate) fn set_call_state(&mut self, call_id: &CallId, state: CallState) -> Result<()> {
        let previous = self.calls.transition(call_id, state)?;
        if previous == state {
            return Ok(());
        }
        let remote = self.calls.get(call_id)?.remote.clone();
        self.stats.update(|s| s.record_call_state(state));
        self.emit(CoreEvent::CallStateChanged {
            call_id: *call_id,
            remote,
            state,
        });
        Ok(())
    }

    pub(crate) fn call(&self, call_id: &CallId) -> Result<&Call> {
        self.calls.get(call_id)
    }

    pub(crate) fn call_mut(&mut self, call_id: &CallId) -> Result<&mut Call> {
        self.calls.get_mut(call_id)
    }

    // Conferences

    pub(crate) fn entry(&self, id: &ConferenceId) -> Result<&ConferenceEntry> {
        self.conferences
            .get(id)
            .ok_or_else(|| ConferenceError::conference_not_found(id))
    }

    pub(crate) fn entry_mut(&mut self, id: &ConferenceId) -> Result<&mut ConferenceEntry> {
        self.conferences
            .get_mut(id)
            .ok_or_else(|| ConferenceError::conference_not_found(id))
    }

    pub(crate) fn session(&self, id: &ConferenceId) -> Result<&ConferenceSession> {
        self.entry(id).map(|e| &e.session)
    }

    pub(crate) fn session_mut(&mut self, id: &ConferenceId) -> Result<&mut ConferenceSession> {
        self.entry_mut(id).map(|e| &mut e.session)
    }

    pub(crate) fn backend(&self, id: &ConferenceId) -> Result<Arc<dyn ConferenceBackend>> {
        self.entry(id).map(|e| e.backend.clone())
    }

    /// Register a new session driven by `backend`
    pub(crate) fn insert_conference(
        &mut self,
        session: ConferenceSession,
        backend: Arc<dyn ConferenceBackend>,
    ) -> ConferenceId {
        let id = session.id();
        let entry = ConferenceEntry {
            dispatcher: EventNotificationDispatcher::new(self.config.conference_event_log_enabled),
            subscription: ClientSubscription::default(),
            session,
            backend,
            focus_call: None,
            queued_calls: Vec::new(),
        };
        self.conferences.insert(id, entry);
        id
    }

    pub(crate) fn new_session(&self, role: FocusRole, params: ConferenceParams) -> ConferenceSession {
        ConferenceSession::new(
            ConferenceId::new(),
            role,
            params,
            self.config.admin_policy,
            crate::device::ParticipantDeviceTracker::from_config(&self.config),
        )
    }

    pub(crate) fn set_conference_state(&mut self, id: &ConferenceId, state: ConferenceState) -> Result<()> {
        let session = self.session_mut(id)?;
        let previous = session.set_state(state)?;
        if previous == state {
            return Ok(());
        }
        let address = session.address().cloned();
        self.stats.update(|s| s.record_conference_state(state));
        self.emit(CoreEvent::ConferenceStateChanged {
            conference: *id,
            address,
            state,
        });
        Ok(())
    }

    /// Count changes and hand them to observers
    pub(crate) fn record_changes(&self, id: &ConferenceId, changes: &[ConferenceChange]) {
        if changes.is_empty() {
            return;
        }
        self.stats.update(|s| {
            for change in changes {
                s.record_change(change);
            }
        });
        for change in changes {
            self.emit(CoreEvent::ConferenceChanged {
                conference: *id,
                change: change.clone(),
            });
        }
    }

    /// Record a batch of changes of a conference we own and notify its
    /// subscribers
    pub(crate) fn publish(&mut self, id: &ConferenceId, changes: Vec<ConferenceChange>) {
        if changes.is_empty() {
            return;
        }
        self.record_changes(id, &changes);

        let Some(entry) = self.conferences.get_mut(id) else {
            return;
        };
        if entry.session.role() != FocusRole::Focus {
            return;
        }
        let notification = match entry.dispatcher.publish(&entry.session, &changes) {
            Ok(Some(notification)) => notification,
            Ok(None) => return,
            Err(e) => {
                warn!(conference = %id, error = %e, "failed to build conference notification");
                return;
            }
        };
        let Some(address) = entry.session.address().cloned() else {
            return;
        };
        for recipient in &notification.recipients {
            let message = SipMessage::Notify {
                conference: address.clone(),
                content_type: CONFERENCE_INFO_CONTENT_TYPE.to_string(),
                body: notification.body.clone(),
            };
            if let Err(e) = self.send(recipient, message) {
                debug!(conference = %address, subscriber = %recipient, error = %e, "notification not delivered");
            }
        }
    }

    /// Conference designated by a conference address
    pub(crate) fn find_conference(&self, address: &SipAddress) -> Option<ConferenceId> {
        self.conferences
            .values()
            .find(|e| {
                e.session
                    .address()
                    .map(|a| a.same_conference(address))
                    .unwrap_or(false)
            })
            .map(|e| e.session.id())
    }

    /// Conference a call is bound to
    pub(crate) fn conference_of_call(&self, call_id: &CallId) -> Option<ConferenceId> {
        self.calls
            .get(call_id)
            .ok()
            .and_then(|c| c.conference)
            .map(|b| b.conference)
            .filter(|id| self.conferences.contains_key(id))
    }

    /// Tear a conference down. Calls still bound to it are unbound; `delete`
    /// is false when the conference cannot be destroyed cleanly (its focus
    /// is unreachable).
    pub(crate) fn finish_conference(&mut self, id: &ConferenceId, delete: bool) {
        let Ok(state) = self.session(id).map(|s| s.state()) else {
            return;
        };
        let mut path = Vec::new();
        match state {
            ConferenceState::Instantiated | ConferenceState::CreationPending if !delete => {
                path.push(ConferenceState::CreationFailed)
            }
            ConferenceState::Instantiated => path.push(ConferenceState::CreationFailed),
            ConferenceState::Terminated | ConferenceState::Deleted => {}
            ConferenceState::TerminationPending => path.push(ConferenceState::Terminated),
            _ => path.extend([ConferenceState::TerminationPending, ConferenceState::Terminated]),
        }
        if delete {
            path.push(ConferenceState::Deleted);
        }
        for next in path {
            let current = self.session(id).map(|s| s.state());
            if current.map(|c| c.can_transition_to(next)).unwrap_or(false) {
                if let Err(e) = self.set_conference_state(id, next) {
                    warn!(conference = %id, error = %e, "conference teardown");
                }
            }
        }

        for call_id in self.calls.bound_to(*id) {
            if let Ok(call) = self.calls.get_mut(&call_id) {
                call.conference = None;
            }
        }
        if self.conferences.shift_remove(id).is_some() {
            info!(conference = %id, "conference removed");
        }
    }

    // Message loop

    fn handle(&mut self, envelope: Envelope) {
        let Envelope { from, to, message } = envelope;
        let method = message.method();
        trace!(from = %from, to = %to, method, "received");
        let peer = from.clone();

        let result = match message {
            SipMessage::Invite {
                call_id,
                params,
                subject,
                focus,
                resource_list,
                start_time,
            } => self.on_invite(from, to, call_id, params, subject, focus, resource_list, start_time),
            SipMessage::Ringing { call_id } => self.on_ringing(call_id),
            SipMessage::Ok { call_id, params, focus } => self.on_ok(call_id, params, focus),
            SipMessage::Decline { call_id, code } => self.on_decline(call_id, code),
            SipMessage::ReInvite {
                call_id,
                kind,
                params,
                conference,
                subject,
            } => self.on_reinvite(from, call_id, kind, params, conference, subject),
            SipMessage::ReInviteOk { call_id, params } => self.on_reinvite_ok(call_id, params),
            SipMessage::Bye { call_id } => self.on_bye(call_id),
            SipMessage::Refer {
                refer_id,
                call_id: Some(call_id),
                refer_to,
                ..
            } => self.on_transfer_request(from, refer_id, call_id, refer_to),
            SipMessage::Refer {
                refer_id,
                call_id: None,
                refer_to,
                method,
                admin,
            } => self.on_conference_refer(from, to, refer_id, refer_to, method, admin),
            SipMessage::ReferResponse { refer_id, code } => self.on_refer_response(refer_id, code),
            SipMessage::ReferNotify {
                refer_id,
                call_id,
                state,
            } => self.on_refer_notify(refer_id, call_id, state),
            SipMessage::Subscribe { conference } => self.on_subscribe(from, conference),
            SipMessage::Unsubscribe { conference } => self.on_unsubscribe(from, conference),
            SipMessage::SubscribeResponse { conference, code } => self.on_subscribe_response(conference, code),
            SipMessage::Notify {
                conference,
                content_type,
                body,
            } => self.on_notify(conference, content_type, body),
            SipMessage::Message { content_type, body } => self.on_message(from, content_type, body),
            SipMessage::CcmpRequest {
                request_id,
                operation,
                info,
            } => self.on_ccmp_request(from, request_id, operation, info),
            SipMessage::CcmpResponse {
                request_id,
                code,
                conference,
                xcon_id,
            } => self.on_ccmp_response(request_id, code, conference, xcon_id),
        };

        if let Err(e) = result {
            warn!(identity = %self.identity, from = %peer, method, error = %e, "failed to handle message");
        }
    }
}

async fn run_loop(inner: Arc<Mutex<CoreInner>>, mut inbox: Inbox, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            envelope = inbox.recv() => match envelope {
                Some(envelope) => inner.lock().handle(envelope),
                None => break,
            },
        }
    }
    debug!("core message loop stopped");
}

/// One SIP user agent or conference server
pub struct Core {
    identity: SipAddress,
    network: SimNetwork,
    inner: Arc<Mutex<CoreInner>>,
    stats: StatsHandle,
    events: broadcast::Sender<CoreEvent>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core").field("identity", &self.identity).finish()
    }
}

impl Core {
    /// Register the core on the network and start its message loop
    pub async fn start(config: CoreConfig, network: SimNetwork) -> Result<Arc<Self>> {
        config.validate()?;
        let identity = config.identity_address()?;
        let factory = config.factory_address()?;

        let inbox = network.register(&identity);
        if config.conference_server_enabled {
            if let Some(factory) = &factory {
                network.add_alias(factory, &identity);
            }
        }

        let inner = CoreInner::new(config, identity.clone(), factory, network.clone());
        let stats = inner.stats.handle();
        let events = inner.events.clone();
        let inner = Arc::new(Mutex::new(inner));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_loop(inner.clone(), inbox, shutdown_rx));
        info!(identity = %identity, "core started");

        Ok(Arc::new(Self {
            identity,
            network,
            inner,
            stats,
            events,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }))
    }

    /// Leave the network and stop the message loop
    pub async fn shutdown(&self) {
        self.network.unregister(&self.identity);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(identity = %self.identity, error = %e, "core loop ended abnormally");
            }
        }
        info!(identity = %self.identity, "core stopped");
    }

    pub fn identity(&self) -> &SipAddress {
        &self.identity
    }

    pub fn config(&self) -> CoreConfig {
        self.inner.lock().config.clone()
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn stats_snapshot(&self) -> CoreStats {
        self.stats.snapshot()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    // Call control

    /// Place a call with the core's default parameters
    pub fn invite(&self, to: &SipAddress) -> Result<CallId> {
        self.inner.lock().invite(to, None)
    }

    pub fn invite_with_params(&self, to: &SipAddress, params: CallParams) -> Result<CallId> {
        self.inner.lock().invite(to, Some(params))
    }

    pub fn accept(&self, call_id: &CallId) -> Result<()> {
        self.inner.lock().accept(call_id)
    }

    pub fn decline(&self, call_id: &CallId, code: u16) -> Result<()> {
        self.inner.lock().decline(call_id, code)
    }

    pub fn pause(&self, call_id: &CallId) -> Result<()> {
        self.inner.lock().pause(call_id)
    }

    pub fn resume(&self, call_id: &CallId) -> Result<()> {
        self.inner.lock().resume(call_id)
    }

    pub fn update(&self, call_id: &CallId, params: CallParams) -> Result<()> {
        self.inner.lock().update(call_id, params)
    }

    pub fn terminate(&self, call_id: &CallId) -> Result<()> {
        self.inner.lock().terminate(call_id)
    }

    /// Ask the remote end of `call_id` to call `to` instead
    pub fn transfer(&self, call_id: &CallId, to: &SipAddress) -> Result<()> {
        self.inner.lock().transfer(call_id, to)
    }

    // Conference control

    pub fn create_conference(&self, params: ConferenceParams) -> Result<ConferenceId> {
        self.inner.lock().create_conference(params)
    }

    /// Merge an established call into a conference
    pub fn add_participant(&self, conference: &ConferenceId, call_id: &CallId) -> Result<()> {
        self.inner.lock().add_participant(conference, call_id)
    }

    /// Merge every running call of the core into a conference
    pub fn add_all_to_conference(&self, conference: &ConferenceId) -> Result<()> {
        self.inner.lock().add_all_to_conference(conference)
    }

    /// Dial out to new participants on behalf of the conference
    pub fn invite_participants(&self, conference: &ConferenceId, addresses: &[SipAddress]) -> Result<()> {
        self.inner.lock().invite_participants(conference, addresses)
    }

    pub fn remove_participant(&self, conference: &ConferenceId, participant: &SipAddress) -> Result<()> {
        self.inner.lock().remove_participant(conference, participant)
    }

    pub fn set_admin(&self, conference: &ConferenceId, participant: &SipAddress, admin: bool) -> Result<()> {
        self.inner.lock().set_admin(conference, participant, admin)
    }

    pub fn set_subject(&self, conference: &ConferenceId, subject: &str) -> Result<()> {
        self.inner.lock().set_subject(conference, subject)
    }

    pub fn enable_video(&self, conference: &ConferenceId, enabled: bool) -> Result<()> {
        self.inner.lock().enable_video(conference, enabled)
    }

    pub fn set_layout(&self, conference: &ConferenceId, layout: ConferenceLayout) -> Result<()> {
        self.inner.lock().set_layout(conference, layout)
    }

    pub fn set_muted(&self, conference: &ConferenceId, muted: bool) -> Result<()> {
        self.inner.lock().set_muted(conference, muted)
    }

    /// Feed a mixer audio level for a participant device
    pub fn report_audio_level(&self, conference: &ConferenceId, device: &SipAddress, level_db: f32) -> Result<()> {
        self.inner.lock().report_audio_level(conference, device, level_db)
    }

    pub fn enter(&self, conference: &ConferenceId) -> Result<()> {
        self.inner.lock().enter(conference)
    }

    pub fn leave(&self, conference: &ConferenceId) -> Result<()> {
        self.inner.lock().leave(conference)
    }

    pub fn terminate_conference(&self, conference: &ConferenceId) -> Result<()> {
        self.inner.lock().terminate_conference(conference)
    }

    // Scheduling

    /// Scheduler provisioning conferences on the configured CCMP server
    pub fn create_conference_scheduler(&self) -> SchedulerId {
        self.inner.lock().create_conference_scheduler(SchedulerKind::Ccmp)
    }

    /// Scheduler provisioning conferences through the conference factory
    pub fn create_sip_conference_scheduler(&self) -> SchedulerId {
        self.inner.lock().create_conference_scheduler(SchedulerKind::Sip)
    }

    pub fn scheduler_set_info(&self, scheduler: &SchedulerId, info: ConferenceInfo) -> Result<()> {
        self.inner.lock().scheduler_set_info(scheduler, info)
    }

    pub fn scheduler_cancel(&self, scheduler: &SchedulerId) -> Result<()> {
        self.inner.lock().scheduler_cancel(scheduler)
    }

    /// Send the calendar invitation; returns the unreachable participants
    pub fn scheduler_send_invitations(&self, scheduler: &SchedulerId) -> Result<Vec<SipAddress>> {
        self.inner.lock().scheduler_send_invitations(scheduler)
    }

    pub fn scheduler_state(&self, scheduler: &SchedulerId) -> Result<SchedulerState> {
        self.inner.lock().scheduler(scheduler).map(|s| s.state())
    }

    pub fn scheduler_info(&self, scheduler: &SchedulerId) -> Result<Option<ConferenceInfo>> {
        self.inner.lock().scheduler(scheduler).map(|s| s.info().cloned())
    }

    // Queries

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.iter().cloned().collect()
    }

    pub fn call(&self, call_id: &CallId) -> Result<Call> {
        self.inner.lock().calls.get(call_id).cloned()
    }

    pub fn call_state(&self, call_id: &CallId) -> Option<CallState> {
        self.inner.lock().calls.get(call_id).ok().map(|c| c.state)
    }

    /// The call sending and receiving media outside any conference
    pub fn current_call(&self) -> Option<Call> {
        self.inner.lock().calls.current_call().cloned()
    }

    pub fn conference(&self, conference: &ConferenceId) -> Result<ConferenceSession> {
        self.inner.lock().session(conference).cloned()
    }

    pub fn conferences(&self) -> Vec<ConferenceSession> {
        self.inner
            .lock()
            .conferences
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn search_conference(&self, address: &SipAddress) -> Option<ConferenceSession> {
        let inner = self.inner.lock();
        let found = inner
            .find_conference(address)
            .and_then(|id| inner.session(&id).ok().cloned());
        found
    }

    /// The local user is mixed into one of the conferences
    pub fn is_in_conference(&self) -> bool {
        self.inner.lock().conferences.values().any(|e| e.session.is_in())
    }

    /// Members of the first conference the local user is part of
    pub fn conference_size(&self) -> usize {
        self.inner
            .lock()
            .conferences
            .values()
            .find(|e| e.session.me().is_some())
            .map(|e| e.session.size())
            .unwrap_or(0)
    }

    /// Stored scheduling record of a conference
    pub fn conference_info(&self, uri: &SipAddress) -> Option<ConferenceInfo> {
        let inner = self.inner.lock();
        if let Some(info) = inner.info_store.get(uri) {
            return Some(info.clone());
        }
        let found = inner
            .info_store
            .iter()
            .find(|i| i.uri.as_ref().map(|u| u.same_conference(uri)).unwrap_or(false))
            .cloned();
        found
    }

    pub fn conference_infos(&self) -> Vec<ConferenceInfo> {
        self.inner.lock().info_store.iter().cloned().collect()
    }
}
