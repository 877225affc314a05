//! In-memory signalling network
//!
//! Routes [`Envelope`]s between cores by `user@domain`. Delivery is FIFO per
//! destination inbox; nothing orders deliveries across destinations.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::errors::NetworkError;
use crate::message::Envelope;
use crate::types::SipAddress;

/// Receiving side of a registered address
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

#[derive(Debug)]
struct Route {
    sender: mpsc::UnboundedSender<Envelope>,
    reachable: bool,
}

/// Shared message router
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    routes: Arc<DashMap<String, Route>>,
    aliases: Arc<DashMap<String, String>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address and return its inbox. Registering again replaces
    /// the previous inbox.
    pub fn register(&self, address: &SipAddress) -> Inbox {
        let (sender, inbox) = mpsc::unbounded_channel();
        let key = address.routing_key();
        debug!(address = %key, "registered on network");
        self.routes.insert(
            key,
            Route {
                sender,
                reachable: true,
            },
        );
        inbox
    }

    /// Deliver messages for `alias` to the inbox of `target`
    pub fn add_alias(&self, alias: &SipAddress, target: &SipAddress) {
        self.aliases.insert(alias.routing_key(), target.routing_key());
    }

    pub fn unregister(&self, address: &SipAddress) {
        let key = address.routing_key();
        self.routes.remove(&key);
        self.aliases.retain(|_, target| *target != key);
        debug!(address = %key, "unregistered from network");
    }

    /// Simulate a peer going down or coming back
    pub fn set_reachable(&self, address: &SipAddress, reachable: bool) {
        let key = self.resolve(address);
        if let Some(mut route) = self.routes.get_mut(&key) {
            route.reachable = reachable;
            debug!(address = %key, reachable, "reachability changed");
        }
    }

    pub fn is_reachable(&self, address: &SipAddress) -> bool {
        let key = self.resolve(address);
        self.routes.get(&key).map(|r| r.reachable).unwrap_or(false)
    }

    fn resolve(&self, address: &SipAddress) -> String {
        let key = address.routing_key();
        match self.aliases.get(&key) {
            Some(target) => target.clone(),
            None => key,
        }
    }

    /// Route an envelope to its destination inbox
    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        let key = self.resolve(&envelope.to);
        let route = self
            .routes
            .get(&key)
            .ok_or_else(|| NetworkError::NotRegistered(key.clone()))?;

        if !route.reachable {
            warn!(to = %key, method = envelope.message.method(), "destination unreachable");
            return Err(NetworkError::Unreachable(key));
        }

        trace!(from = %envelope.from, to = %envelope.to, method = envelope.message.method(), "sending");
        route
            .sender
            .send(envelope)
            .map_err(|_| NetworkError::ChannelClosed(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMessage;
    use crate::types::CallId;

    fn bye(from: &SipAddress, to: &SipAddress) -> Envelope {
        Envelope::new(from.clone(), to.clone(), SipMessage::Bye { call_id: CallId::new() })
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let network = SimNetwork::new();
        let marie = SipAddress::new("marie", "example.org");
        let pauline = SipAddress::new("pauline", "example.org");
        let mut inbox = network.register(&pauline);

        let first = bye(&marie, &pauline);
        let second = bye(&marie, &pauline);
        network.send(first.clone()).unwrap();
        network.send(second.clone()).unwrap();

        assert_eq!(inbox.recv().await.unwrap(), first);
        assert_eq!(inbox.recv().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_alias_and_conference_params() {
        let network = SimNetwork::new();
        let focus = SipAddress::new("focus", "example.org");
        let factory = SipAddress::new("conference-factory", "example.org");
        let mut inbox = network.register(&focus);
        network.add_alias(&factory, &focus);

        let marie = SipAddress::new("marie", "example.org");
        network.send(bye(&marie, &factory)).unwrap();
        network
            .send(bye(&marie, &focus.clone().with_param("conf-id", "abc")))
            .unwrap();

        assert!(inbox.recv().await.is_some());
        assert!(inbox.recv().await.is_some());
    }

    #[test]
    fn test_unreachable_and_unknown() {
        let network = SimNetwork::new();
        let focus = SipAddress::new("focus", "example.org");
        let marie = SipAddress::new("marie", "example.org");
        let _inbox = network.register(&focus);

        network.set_reachable(&focus, false);
        assert!(!network.is_reachable(&focus));
        assert_eq!(
            network.send(bye(&marie, &focus)),
            Err(NetworkError::Unreachable("focus@example.org".to_string()))
        );

        assert!(matches!(
            network.send(bye(&focus, &marie)),
            Err(NetworkError::NotRegistered(_))
        ));
    }
}
