//! Common types shared by every component of the engine

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ConferenceError, Result};

/// URI parameter carrying the conference identifier of a conference address
pub const CONF_ID_PARAM: &str = "conf-id";

/// A SIP address of the form `sip:user@domain;param=value`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SipAddress {
    pub user: String,
    pub domain: String,
    pub params: BTreeMap<String, String>,
}

impl SipAddress {
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            domain: domain.into(),
            params: BTreeMap::new(),
        }
    }

    /// Parse `sip:user@domain;k=v` (the `sip:` scheme is optional)
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim().trim_start_matches('<').trim_end_matches('>');
        let rest = trimmed
            .strip_prefix("sip:")
            .or_else(|| trimmed.strip_prefix("sips:"))
            .unwrap_or(trimmed);

        let mut parts = rest.split(';');
        let user_host = parts.next().unwrap_or_default();
        let (user, domain) = user_host
            .split_once('@')
            .ok_or_else(|| ConferenceError::protocol(format!("Invalid SIP address: {}", input)))?;
        if user.is_empty() || domain.is_empty() {
            return Err(ConferenceError::protocol(format!("Invalid SIP address: {}", input)));
        }

        let mut params = BTreeMap::new();
        for param in parts.filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some((k, v)) => params.insert(k.to_string(), v.to_string()),
                None => params.insert(param.to_string(), String::new()),
            };
        }

        Ok(Self {
            user: user.to_string(),
            domain: domain.to_string(),
            params,
        })
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Key used to route messages: `user@domain`
    pub fn routing_key(&self) -> String {
        format!("{}@{}", self.user, self.domain)
    }

    /// The address stripped of its parameters
    pub fn uri_only(&self) -> SipAddress {
        SipAddress::new(self.user.clone(), self.domain.clone())
    }

    /// Compare user and domain, ignoring parameters
    pub fn weak_equal(&self, other: &SipAddress) -> bool {
        self.user == other.user && self.domain == other.domain
    }

    /// Conference identifier carried by a conference address
    pub fn conference_id(&self) -> Option<&str> {
        self.param(CONF_ID_PARAM)
    }

    /// True if both addresses designate the same conference
    pub fn same_conference(&self, other: &SipAddress) -> bool {
        self.weak_equal(other) && self.conference_id() == other.conference_id()
    }
}

impl fmt::Display for SipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:{}@{}", self.user, self.domain)?;
        for (k, v) in &self.params {
            if v.is_empty() {
                write!(f, ";{}", k)?;
            } else {
                write!(f, ";{}={}", k, v)?;
            }
        }
        Ok(())
    }
}

impl FromStr for SipAddress {
    type Err = ConferenceError;

    fn from_str(s: &str) -> Result<Self> {
        SipAddress::parse(s)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// First eight hex digits, used in addresses and logs
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Dialog identifier, shared by both ends of a call
    CallId
);
uuid_id!(
    /// Identifier of a conference inside one core
    ConferenceId
);
uuid_id!(
    /// Identifier of a conference scheduler
    SchedulerId
);

/// Direction of a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        *self != MediaDirection::Inactive
    }
}

/// Media stream kinds tracked per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(StreamType::Audio),
            "video" => Some(StreamType::Video),
            _ => None,
        }
    }
}

/// Video layout of a mixed conference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConferenceLayout {
    #[default]
    Grid,
    ActiveSpeaker,
}

/// Media encryption negotiated on a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaEncryption {
    #[default]
    None,
    Srtp,
    Zrtp,
    Dtls,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr = SipAddress::parse("sip:marie@example.org;conf-id=abc").unwrap();
        assert_eq!(addr.user, "marie");
        assert_eq!(addr.domain, "example.org");
        assert_eq!(addr.conference_id(), Some("abc"));
        assert_eq!(addr.to_string(), "sip:marie@example.org;conf-id=abc");
        assert_eq!(addr.routing_key(), "marie@example.org");
    }

    #[test]
    fn test_parse_rejects_missing_domain() {
        assert!(SipAddress::parse("sip:marie").is_err());
        assert!(SipAddress::parse("sip:@example.org").is_err());
    }

    #[test]
    fn test_conference_comparison() {
        let a = SipAddress::parse("sip:focus@example.org;conf-id=1").unwrap();
        let b = SipAddress::parse("<sip:focus@example.org;conf-id=1>").unwrap();
        let c = SipAddress::parse("sip:focus@example.org;conf-id=2").unwrap();
        assert!(a.same_conference(&b));
        assert!(a.weak_equal(&c));
        assert!(!a.same_conference(&c));
    }

    #[test]
    fn test_media_direction_strings() {
        for dir in [
            MediaDirection::SendRecv,
            MediaDirection::SendOnly,
            MediaDirection::RecvOnly,
            MediaDirection::Inactive,
        ] {
            assert_eq!(MediaDirection::parse(dir.as_str()), Some(dir));
        }
        assert!(!MediaDirection::Inactive.is_active());
    }
}
