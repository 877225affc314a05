//! Core configuration
//!
//! A [`CoreConfig`] describes one simulated SIP user agent: its identity,
//! its default call parameters, and the conferencing policies it applies.
//! It can be built in code with the `with_*` helpers or loaded from YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ConferenceError, Result};
use crate::types::{MediaEncryption, SipAddress};

/// Which backend an implicit merge creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConferenceType {
    /// The core mixes media itself
    #[default]
    Local,
    /// A focus server mixes media; the core is one of its clients
    Remote,
}

/// How admin rights are granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdminPolicy {
    /// Promotion adds an admin; revoking the last admin re-assigns the right
    #[default]
    Shared,
    /// Promotion transfers the right, there is exactly one admin
    Exclusive,
}

/// Configuration for a core instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// SIP identity of the core
    pub identity: String,

    /// Display name advertised in conference documents
    pub display_name: Option<String>,

    /// Publish conference state through the event package
    pub conference_event_log_enabled: bool,

    /// This core is a dedicated conference focus
    pub conference_server_enabled: bool,

    /// Factory URI used to create remote conferences (on a focus: the URI it serves)
    pub conference_factory_uri: Option<String>,

    /// CCMP server used by conference schedulers
    pub ccmp_server_uri: Option<String>,

    /// Backend used by implicit merges
    pub conference_type: ConferenceType,

    /// Offer video on new calls
    pub video_enabled: bool,

    /// Media encryption offered on new calls
    pub media_encryption: MediaEncryption,

    /// Answer incoming calls automatically
    pub auto_accept_calls: bool,

    /// Pause the running call when a new one starts
    pub auto_pause_on_new_call: bool,

    /// Admin policy of conferences hosted or focused by this core
    pub admin_policy: AdminPolicy,

    /// Keep a conference alive with a single remote participant
    pub one_participant_conference_enabled: bool,

    /// Audio level (dBm0) at or above which a device is speaking
    pub speaking_threshold_db: f32,

    /// Consecutive quiet samples before speaking stops
    pub speaking_release_samples: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            identity: "sip:user@localhost".to_string(),
            display_name: None,
            conference_event_log_enabled: true,
            conference_server_enabled: false,
            conference_factory_uri: None,
            ccmp_server_uri: None,
            conference_type: ConferenceType::Local,
            video_enabled: false,
            media_encryption: MediaEncryption::None,
            auto_accept_calls: false,
            auto_pause_on_new_call: true,
            admin_policy: AdminPolicy::Shared,
            one_participant_conference_enabled: false,
            speaking_threshold_db: -30.0,
            speaking_release_samples: 3,
        }
    }
}

impl CoreConfig {
    /// Create a configuration for the given identity
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    /// Configuration of a dedicated focus serving `factory_uri`
    pub fn focus(identity: impl Into<String>, factory_uri: impl Into<String>) -> Self {
        Self::new(identity)
            .with_conference_server(true)
            .with_conference_factory(factory_uri)
            .with_auto_accept(true)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_event_log(mut self, enabled: bool) -> Self {
        self.conference_event_log_enabled = enabled;
        self
    }

    pub fn with_conference_server(mut self, enabled: bool) -> Self {
        self.conference_server_enabled = enabled;
        self
    }

    pub fn with_conference_factory(mut self, uri: impl Into<String>) -> Self {
        self.conference_factory_uri = Some(uri.into());
        self
    }

    pub fn with_ccmp_server(mut self, uri: impl Into<String>) -> Self {
        self.ccmp_server_uri = Some(uri.into());
        self
    }

    pub fn with_conference_type(mut self, conference_type: ConferenceType) -> Self {
        self.conference_type = conference_type;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    pub fn with_media_encryption(mut self, encryption: MediaEncryption) -> Self {
        self.media_encryption = encryption;
        self
    }

    pub fn with_auto_accept(mut self, enabled: bool) -> Self {
        self.auto_accept_calls = enabled;
        self
    }

    pub fn with_auto_pause(mut self, enabled: bool) -> Self {
        self.auto_pause_on_new_call = enabled;
        self
    }

    pub fn with_admin_policy(mut self, policy: AdminPolicy) -> Self {
        self.admin_policy = policy;
        self
    }

    pub fn with_one_participant_conference(mut self, enabled: bool) -> Self {
        self.one_participant_conference_enabled = enabled;
        self
    }

    pub fn with_speaking_detection(mut self, threshold_db: f32, release_samples: u32) -> Self {
        self.speaking_threshold_db = threshold_db;
        self.speaking_release_samples = release_samples;
        self
    }

    /// Parsed identity
    pub fn identity_address(&self) -> Result<SipAddress> {
        SipAddress::parse(&self.identity)
    }

    /// Parsed factory URI, if any
    pub fn factory_address(&self) -> Result<Option<SipAddress>> {
        self.conference_factory_uri
            .as_deref()
            .map(SipAddress::parse)
            .transpose()
    }

    /// Parsed CCMP server URI, if any
    pub fn ccmp_server_address(&self) -> Result<Option<SipAddress>> {
        self.ccmp_server_uri.as_deref().map(SipAddress::parse).transpose()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.identity_address()
            .map_err(|_| ConferenceError::config(format!("identity is not a SIP address: {}", self.identity)))?;

        self.factory_address().map_err(|_| {
            ConferenceError::config("conference_factory_uri is not a SIP address")
        })?;

        self.ccmp_server_address()
            .map_err(|_| ConferenceError::config("ccmp_server_uri is not a SIP address"))?;

        if self.conference_server_enabled && self.conference_factory_uri.is_none() {
            return Err(ConferenceError::config(
                "a conference server needs a conference_factory_uri",
            ));
        }

        if self.speaking_release_samples == 0 {
            return Err(ConferenceError::config("speaking_release_samples must be greater than 0"));
        }

        if !self.speaking_threshold_db.is_finite() {
            return Err(ConferenceError::config("speaking_threshold_db must be finite"));
        }

        Ok(())
    }

    /// Load a configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CoreConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ConferenceError::config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConferenceError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.conference_event_log_enabled);
        assert!(!config.one_participant_conference_enabled);
        assert_eq!(config.admin_policy, AdminPolicy::Shared);
    }

    #[test]
    fn test_focus_requires_factory() {
        let config = CoreConfig::new("sip:focus@example.org").with_conference_server(true);
        assert!(config.validate().is_err());

        let config = CoreConfig::focus("sip:focus@example.org", "sip:conference-factory@example.org");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_identity() {
        let config = CoreConfig::new("marie");
        assert!(matches!(config.validate(), Err(ConferenceError::Config { .. })));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
identity: "sip:marie@example.org"
conference_event_log_enabled: false
conference_type: remote
conference_factory_uri: "sip:conference-factory@example.org"
admin_policy: exclusive
"#;
        let config = CoreConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.identity, "sip:marie@example.org");
        assert!(!config.conference_event_log_enabled);
        assert_eq!(config.conference_type, ConferenceType::Remote);
        assert_eq!(config.admin_policy, AdminPolicy::Exclusive);
        assert!(config.auto_pause_on_new_call);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "identity: \"sip:laure@example.org\"").unwrap();
        writeln!(file, "speaking_release_samples: 5").unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.speaking_release_samples, 5);
    }
}
