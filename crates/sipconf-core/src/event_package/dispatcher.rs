use indexmap::IndexMap;
use tracing::{debug, info};

use super::notify;
use crate::conference::{ConferenceChange, ConferenceSession};
use crate::errors::Result;
use crate::message::codes;
use crate::types::SipAddress;

/// A NOTIFY body ready to be sent to a list of subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipients: Vec<SipAddress>,
    pub version: u32,
    pub body: String,
}

/// Publishes the state of one conference to its subscribers.
///
/// Versions increase by one per published batch. A new subscriber gets the
/// full state at the current version, then every later batch.
#[derive(Debug, Clone)]
pub struct EventNotificationDispatcher {
    enabled: bool,
    version: u32,
    subscribers: IndexMap<String, SipAddress>,
}

impl EventNotificationDispatcher {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            version: 0,
            subscribers: IndexMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &SipAddress> {
        self.subscribers.values()
    }

    pub fn is_subscribed(&self, address: &SipAddress) -> bool {
        self.subscribers.contains_key(&address.routing_key())
    }

    /// Register a subscriber and return the response code; on success the
    /// caller sends [`Self::full_state`] to it
    pub fn subscribe(&mut self, subscriber: &SipAddress) -> u16 {
        if !self.enabled {
            debug!(subscriber = %subscriber, "event log disabled, rejecting subscription");
            return codes::BAD_EVENT;
        }
        self.subscribers
            .insert(subscriber.routing_key(), subscriber.uri_only());
        info!(subscriber = %subscriber, version = self.version, "conference subscription accepted");
        codes::OK
    }

    pub fn unsubscribe(&mut self, subscriber: &SipAddress) -> bool {
        self.subscribers.shift_remove(&subscriber.routing_key()).is_some()
    }

    pub fn full_state(&self, session: &ConferenceSession) -> Result<String> {
        notify::full_state(session, self.version)?.to_xml()
    }

    /// Publish a batch of changes. Returns nothing when the event log is
    /// disabled or the batch is empty.
    pub fn publish(
        &mut self,
        session: &ConferenceSession,
        changes: &[ConferenceChange],
    ) -> Result<Option<Notification>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(document) = notify::partial_state(session, changes, self.version + 1)? else {
            return Ok(None);
        };
        self.version += 1;

        if self.subscribers.is_empty() {
            return Ok(None);
        }
        Ok(Some(Notification {
            recipients: self.subscribers.values().cloned().collect(),
            version: self.version,
            body: document.to_xml()?,
        }))
    }
}
