//! Per-core counters
//!
//! Every core owns one [`CoreStats`] value published through a
//! `tokio::sync::watch` channel. Counters are only bumped by the core's own
//! message loop; observers hold a [`StatsHandle`] and wait for a predicate
//! with a deadline.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::call::CallState;
use crate::conference::{ConferenceChange, ConferenceState};
use crate::device::DeviceState;
use crate::errors::{ConferenceError, Result};
use crate::scheduler::SchedulerState;

/// Event counters of one core
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoreStats {
    pub call_states: HashMap<CallState, u32>,
    pub conference_states: HashMap<ConferenceState, u32>,
    pub scheduler_states: HashMap<SchedulerState, u32>,

    pub first_call_started: u32,
    pub last_call_ended: u32,

    pub transfer_refer_received: u32,
    pub transfer_call_connected: u32,
    pub transfer_call_failed: u32,

    pub participants_added: u32,
    pub participants_removed: u32,
    pub participant_admin_statuses_changed: u32,
    pub participant_devices_added: u32,
    pub participant_devices_removed: u32,
    pub participant_devices_joining: u32,
    pub participant_devices_present: u32,
    pub participant_devices_on_hold: u32,
    pub participant_devices_leaving: u32,
    pub participant_devices_left: u32,
    pub participant_devices_media_changed: u32,
    pub participant_devices_muted: u32,
    pub participant_devices_unmuted: u32,
    pub participant_devices_speaking: u32,
    pub participant_devices_not_speaking: u32,
    pub subject_changed: u32,
    pub available_media_changed: u32,

    pub notify_received: u32,
    pub notify_full_state_received: u32,
    pub subscriptions_rejected: u32,
    pub conference_requests_rejected: u32,

    pub invitations_sent: u32,
    pub invitations_failed: u32,
    pub ics_invitations_received: u32,
}

impl CoreStats {
    pub fn calls_in(&self, state: CallState) -> u32 {
        self.call_states.get(&state).copied().unwrap_or(0)
    }

    pub fn conferences_in(&self, state: ConferenceState) -> u32 {
        self.conference_states.get(&state).copied().unwrap_or(0)
    }

    pub fn schedulers_in(&self, state: SchedulerState) -> u32 {
        self.scheduler_states.get(&state).copied().unwrap_or(0)
    }

    pub(crate) fn record_call_state(&mut self, state: CallState) {
        *self.call_states.entry(state).or_default() += 1;
    }

    pub(crate) fn record_conference_state(&mut self, state: ConferenceState) {
        *self.conference_states.entry(state).or_default() += 1;
    }

    pub(crate) fn record_scheduler_state(&mut self, state: SchedulerState) {
        *self.scheduler_states.entry(state).or_default() += 1;
    }

    pub(crate) fn record_change(&mut self, change: &ConferenceChange) {
        match change {
            ConferenceChange::ParticipantAdded { .. } => self.participants_added += 1,
            ConferenceChange::ParticipantRemoved { .. } => self.participants_removed += 1,
            ConferenceChange::AdminChanged { .. } => self.participant_admin_statuses_changed += 1,
            ConferenceChange::DeviceAdded { .. } => self.participant_devices_added += 1,
            ConferenceChange::DeviceRemoved { .. } => self.participant_devices_removed += 1,
            ConferenceChange::DeviceStateChanged { to, .. } => match to {
                DeviceState::Joining => self.participant_devices_joining += 1,
                DeviceState::Present => self.participant_devices_present += 1,
                DeviceState::OnHold => self.participant_devices_on_hold += 1,
                DeviceState::Leaving => self.participant_devices_leaving += 1,
                DeviceState::Left => self.participant_devices_left += 1,
            },
            ConferenceChange::DeviceMediaChanged { .. } => self.participant_devices_media_changed += 1,
            ConferenceChange::DeviceMutedChanged { muted, .. } => {
                if *muted {
                    self.participant_devices_muted += 1
                } else {
                    self.participant_devices_unmuted += 1
                }
            }
            ConferenceChange::DeviceSpeakingChanged { speaking, .. } => {
                if *speaking {
                    self.participant_devices_speaking += 1
                } else {
                    self.participant_devices_not_speaking += 1
                }
            }
            ConferenceChange::SubjectChanged { .. } => self.subject_changed += 1,
            ConferenceChange::AvailableMediaChanged { .. } => self.available_media_changed += 1,
        }
    }
}

/// Writer side, owned by the core
#[derive(Debug)]
pub(crate) struct StatsRecorder {
    tx: watch::Sender<CoreStats>,
}

impl StatsRecorder {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(CoreStats::default());
        Self { tx }
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut CoreStats)) {
        self.tx.send_modify(f);
    }

    pub(crate) fn handle(&self) -> StatsHandle {
        StatsHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of a core's counters
#[derive(Debug, Clone)]
pub struct StatsHandle {
    rx: watch::Receiver<CoreStats>,
}

impl StatsHandle {
    /// Current values
    pub fn snapshot(&self) -> CoreStats {
        self.rx.borrow().clone()
    }

    /// Wait until `predicate` holds, or fail with [`ConferenceError::Timeout`]
    pub async fn wait_for<F>(&self, what: &str, timeout: Duration, predicate: F) -> Result<CoreStats>
    where
        F: FnMut(&CoreStats) -> bool,
    {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(predicate).await.map(|stats| stats.clone())
        })
        .await;

        match waited {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(_)) => Err(ConferenceError::internal("core stopped while waiting")),
            Err(_) => Err(ConferenceError::Timeout {
                what: what.to_string(),
                millis: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SipAddress;

    #[tokio::test]
    async fn test_wait_for_sees_updates() {
        let recorder = StatsRecorder::new();
        let handle = recorder.handle();

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .wait_for("two running calls", Duration::from_secs(2), |s| {
                        s.calls_in(CallState::StreamsRunning) >= 2
                    })
                    .await
            }
        });

        recorder.update(|s| s.record_call_state(CallState::StreamsRunning));
        recorder.update(|s| s.record_call_state(CallState::StreamsRunning));

        let stats = waiter.await.unwrap().unwrap();
        assert_eq!(stats.calls_in(CallState::StreamsRunning), 2);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let recorder = StatsRecorder::new();
        let err = recorder
            .handle()
            .wait_for("nothing", Duration::from_millis(50), |s| s.participants_added > 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConferenceError::Timeout { millis: 50, .. }));
    }

    #[test]
    fn test_record_change() {
        let mut stats = CoreStats::default();
        let participant = SipAddress::new("pauline", "example.org");
        stats.record_change(&ConferenceChange::DeviceStateChanged {
            participant: participant.clone(),
            device: participant.clone(),
            from: DeviceState::Present,
            to: DeviceState::OnHold,
        });
        stats.record_change(&ConferenceChange::DeviceMutedChanged {
            participant: participant.clone(),
            device: participant,
            muted: false,
        });
        assert_eq!(stats.participant_devices_on_hold, 1);
        assert_eq!(stats.participant_devices_unmuted, 1);
    }
}
