//! Conference event package
//!
//! The focus publishes the state of each conference as
//! `application/conference-info+xml` documents: one full state per new
//! subscriber, then one partial document per batch of changes, each with the
//! next version number. Clients merge the documents into their own
//! [`crate::conference::ConferenceSession`].

mod client;
mod dispatcher;
pub mod notify;
mod xml;

pub use client::{apply_document, ClientSubscription, VersionCheck};
pub use dispatcher::{EventNotificationDispatcher, Notification};
pub use xml::{
    AvailableMedia, ConferenceDescription, ConferenceInfoDocument, ElementState, EndpointInfo, EndpointMedia,
    UserInfo,
};
