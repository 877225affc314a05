use indexmap::IndexMap;
use tracing::debug;

use super::{Call, CallState};
use crate::errors::{ConferenceError, Result};
use crate::types::{CallId, ConferenceId};

/// Live call legs of one core, in creation order
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: IndexMap<CallId, Call>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new leg. Returns true if it is the only live call.
    pub fn insert(&mut self, call: Call) -> bool {
        self.calls.insert(call.id, call);
        self.calls.len() == 1
    }

    /// Drop a released leg. Returns true if no call remains.
    pub fn remove(&mut self, id: &CallId) -> Option<(Call, bool)> {
        let call = self.calls.shift_remove(id)?;
        Some((call, self.calls.is_empty()))
    }

    pub fn get(&self, id: &CallId) -> Result<&Call> {
        self.calls.get(id).ok_or_else(|| ConferenceError::call_not_found(id))
    }

    pub fn get_mut(&mut self, id: &CallId) -> Result<&mut Call> {
        self.calls.get_mut(id).ok_or_else(|| ConferenceError::call_not_found(id))
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Call> {
        self.calls.values()
    }

    /// Validate and apply a state transition, returning the previous state
    pub fn transition(&mut self, id: &CallId, next: CallState) -> Result<CallState> {
        let call = self.get_mut(id)?;
        let previous = call.state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            return Err(ConferenceError::invalid_call_state(id, previous, format!("move to {}", next)));
        }
        call.state = next;
        debug!(call = %id, from = %previous, to = %next, "call state changed");
        Ok(previous)
    }

    /// The leg currently sending and receiving media outside any conference
    pub fn current_call(&self) -> Option<&Call> {
        self.calls
            .values()
            .find(|c| c.is_running() && !c.is_in_conference())
    }

    /// Running legs other than `except` that are not part of a conference
    pub fn running_outside_conference(&self, except: Option<CallId>) -> Vec<CallId> {
        self.calls
            .values()
            .filter(|c| Some(c.id) != except)
            .filter(|c| c.is_running() && !c.has_conference())
            .map(|c| c.id)
            .collect()
    }

    /// Legs bound to the given conference
    pub fn bound_to(&self, conference: ConferenceId) -> Vec<CallId> {
        self.calls
            .values()
            .filter(|c| c.conference.map(|b| b.conference) == Some(conference))
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallParams, ConferenceBinding};
    use crate::types::SipAddress;

    fn call(remote: &str) -> Call {
        Call::outgoing(
            CallId::new(),
            SipAddress::new("marie", "example.org"),
            SipAddress::new(remote, "example.org"),
            CallParams::default(),
        )
    }

    #[test]
    fn test_first_and_last_call() {
        let mut registry = CallRegistry::new();
        let a = call("pauline");
        let b = call("laure");
        let (a_id, b_id) = (a.id, b.id);
        assert!(registry.insert(a));
        assert!(!registry.insert(b));

        let (_, last) = registry.remove(&a_id).unwrap();
        assert!(!last);
        let (_, last) = registry.remove(&b_id).unwrap();
        assert!(last);
        assert!(registry.remove(&b_id).is_none());
    }

    #[test]
    fn test_transition_validation() {
        let mut registry = CallRegistry::new();
        let c = call("pauline");
        let id = c.id;
        registry.insert(c);

        assert_eq!(registry.transition(&id, CallState::OutgoingInit).unwrap(), CallState::Idle);
        let err = registry.transition(&id, CallState::Paused).unwrap_err();
        assert!(matches!(err, ConferenceError::InvalidCallState { .. }));
        assert_eq!(registry.get(&id).unwrap().state, CallState::OutgoingInit);
    }

    #[test]
    fn test_current_call_skips_conference_legs() {
        let mut registry = CallRegistry::new();
        let mut a = call("pauline");
        a.state = CallState::StreamsRunning;
        a.conference = Some(ConferenceBinding {
            conference: ConferenceId::new(),
            mixed: true,
        });
        let mut b = call("laure");
        b.state = CallState::StreamsRunning;
        let b_id = b.id;
        registry.insert(a);
        registry.insert(b);

        assert_eq!(registry.current_call().map(|c| c.id), Some(b_id));
        assert_eq!(registry.running_outside_conference(None), vec![b_id]);
        assert!(registry.running_outside_conference(Some(b_id)).is_empty());
    }
}
