//! # sipconf-core
//!
//! Multi-party SIP conference orchestration.
//!
//! A [`Core`] is one SIP user agent: it places and answers calls, merges
//! them into conferences it mixes locally, or joins conferences mixed by a
//! remote focus and mirrors their state through the conference event
//! package (RFC 4575). A core with the conference server role also answers
//! conference factory INVITEs and provisions scheduled conferences over
//! CCMP or from a scheduler's factory INVITE; any core can schedule
//! conferences and announce them with iCalendar invitations.
//!
//! Signalling is exchanged as typed messages over a [`SimNetwork`]; SIP
//! parsing, transport and real media are out of scope.
//!
//! ## Architecture
//!
//! - [`call`]: call legs, their state machine and the per-core registry
//! - [`conference`]: conference sessions and the two mixing backends
//! - [`device`]: participant devices and speaking detection
//! - [`event_package`]: conference-info documents, publishing and mirroring
//! - [`scheduler`]: CCMP and SIP scheduling, iCalendar invitations
//! - [`stats`] / [`events`]: per-core counters and the event stream
//!
//! ## Example
//!
//! ```no_run
//! use sipconf_core::{Core, CoreConfig, ConferenceParams, SimNetwork};
//!
//! # async fn run() -> sipconf_core::Result<()> {
//! let network = SimNetwork::new();
//! let marie = Core::start(CoreConfig::new("sip:marie@example.org"), network.clone()).await?;
//! let pauline = Core::start(CoreConfig::new("sip:pauline@example.org"), network.clone()).await?;
//!
//! let call = marie.invite(pauline.identity())?;
//! // ... once the call is running
//! let conference = marie.create_conference(ConferenceParams::default().with_subject("Weekly"))?;
//! marie.add_participant(&conference, &call)?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod conference;
pub mod config;
pub mod device;
mod engine;
pub mod errors;
pub mod event_package;
pub mod events;
pub mod logging;
pub mod message;
pub mod network;
pub mod scheduler;
pub mod stats;
pub mod types;

pub use call::{Call, CallDirection, CallParams, CallState, TransferState};
pub use conference::{
    ConferenceBackend, ConferenceChange, ConferenceParams, ConferenceSession, ConferenceState, FocusRole,
    Participant, ParticipantRole,
};
pub use config::{AdminPolicy, ConferenceType, CoreConfig};
pub use device::{DeviceState, ParticipantDevice};
pub use engine::{Core, CoreInner};
pub use errors::{ConferenceError, NetworkError, Result};
pub use events::CoreEvent;
pub use logging::{setup_logging, LogFormat, LoggingConfig};
pub use network::SimNetwork;
pub use scheduler::{
    ConferenceInfo, ConferenceInfoState, ConferenceScheduler, SchedulerKind, SchedulerState, SecurityLevel,
};
pub use stats::{CoreStats, StatsHandle};
pub use types::{CallId, ConferenceId, ConferenceLayout, MediaDirection, MediaEncryption, SchedulerId, SipAddress};
