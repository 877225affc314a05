//! Building notification documents from a conference session

use indexmap::IndexMap;

use super::xml::{
    AvailableMedia, ConferenceDescription, ConferenceInfoDocument, ElementState, EndpointInfo, EndpointMedia,
    UserInfo,
};
use crate::conference::{ConferenceChange, ConferenceSession, Participant, ParticipantRole};
use crate::device::ParticipantDevice;
use crate::errors::{ConferenceError, Result};
use crate::types::{MediaDirection, SipAddress, StreamType};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_PARTICIPANT: &str = "participant";

fn conference_entity(session: &ConferenceSession) -> Result<SipAddress> {
    session
        .address()
        .cloned()
        .ok_or_else(|| ConferenceError::event_package(format!("conference {} has no address", session.id())))
}

fn description(session: &ConferenceSession) -> ConferenceDescription {
    let params = session.params();
    let status = |enabled: bool| {
        if enabled {
            MediaDirection::SendRecv
        } else {
            MediaDirection::Inactive
        }
    };
    ConferenceDescription {
        subject: Some(session.subject().to_string()),
        available_media: vec![
            AvailableMedia {
                media_type: StreamType::Audio,
                status: status(params.audio_enabled),
            },
            AvailableMedia {
                media_type: StreamType::Video,
                status: status(params.video_enabled),
            },
        ],
    }
}

fn roles(participant: &Participant) -> Vec<String> {
    let admin = if participant.is_admin { ROLE_ADMIN } else { ROLE_PARTICIPANT };
    vec![admin.to_string(), participant.role.as_str().to_string()]
}

fn endpoint(device: &ParticipantDevice) -> EndpointInfo {
    let media = [StreamType::Audio, StreamType::Video]
        .into_iter()
        .enumerate()
        .map(|(idx, stream)| EndpointMedia {
            id: (idx + 1).to_string(),
            media_type: stream,
            src_id: device.ssrc(stream),
            status: device.direction(stream),
        })
        .collect();

    EndpointInfo {
        entity: device.address.clone(),
        state: ElementState::Full,
        status: Some(device.state),
        media,
        muted: Some(device.muted),
        speaking: Some(device.speaking),
    }
}

fn full_user(participant: &Participant) -> UserInfo {
    UserInfo {
        entity: participant.address.clone(),
        state: ElementState::Full,
        display_text: None,
        roles: Some(roles(participant)),
        endpoints: participant.devices.iter().map(endpoint).collect(),
    }
}

/// Complete state of a conference
pub fn full_state(session: &ConferenceSession, version: u32) -> Result<ConferenceInfoDocument> {
    let mut document = ConferenceInfoDocument::new(conference_entity(session)?, ElementState::Full, version);
    document.description = Some(description(session));
    document.users = session.members().map(full_user).collect();
    Ok(document)
}

/// Incremental document describing one batch of changes, or `None` when the
/// batch has nothing to publish
pub fn partial_state(
    session: &ConferenceSession,
    changes: &[ConferenceChange],
    version: u32,
) -> Result<Option<ConferenceInfoDocument>> {
    if changes.is_empty() {
        return Ok(None);
    }

    let mut document = ConferenceInfoDocument::new(conference_entity(session)?, ElementState::Partial, version);
    if changes.iter().any(ConferenceChange::is_description_change) {
        document.description = Some(description(session));
    }

    let mut by_participant: IndexMap<SipAddress, Vec<&ConferenceChange>> = IndexMap::new();
    for change in changes {
        if let Some(participant) = change.participant() {
            by_participant.entry(participant.clone()).or_default().push(change);
        }
    }

    for (address, changes) in by_participant {
        let removed = changes
            .iter()
            .any(|c| matches!(c, ConferenceChange::ParticipantRemoved { .. }));
        let member = session.member(&address);

        let user = match member {
            None if removed => UserInfo::deleted(address),
            // Removed and re-added within one batch: publish the new state
            Some(participant) if removed => full_user(participant),
            None => continue,
            Some(participant)
                if changes
                    .iter()
                    .any(|c| matches!(c, ConferenceChange::ParticipantAdded { .. })) =>
            {
                full_user(participant)
            }
            Some(participant) => partial_user(participant, &changes),
        };
        document.users.push(user);
    }

    if document.users.is_empty() && document.description.is_none() {
        return Ok(None);
    }
    Ok(Some(document))
}

fn partial_user(participant: &Participant, changes: &[&ConferenceChange]) -> UserInfo {
    let admin_changed = changes
        .iter()
        .any(|c| matches!(c, ConferenceChange::AdminChanged { .. }));

    let mut endpoints: IndexMap<SipAddress, EndpointInfo> = IndexMap::new();
    for change in changes {
        let device = match change {
            ConferenceChange::DeviceAdded { device, .. }
            | ConferenceChange::DeviceRemoved { device, .. }
            | ConferenceChange::DeviceStateChanged { device, .. }
            | ConferenceChange::DeviceMediaChanged { device, .. }
            | ConferenceChange::DeviceMutedChanged { device, .. }
            | ConferenceChange::DeviceSpeakingChanged { device, .. } => device,
            _ => continue,
        };
        let info = match participant.device(device) {
            Some(current) => endpoint(current),
            None => EndpointInfo::deleted(device.clone()),
        };
        endpoints.insert(device.clone(), info);
    }

    UserInfo {
        entity: participant.address.clone(),
        state: ElementState::Partial,
        display_text: None,
        roles: admin_changed.then(|| roles(participant)),
        endpoints: endpoints.into_values().collect(),
    }
}

/// Admin flag and role carried by a user element
pub fn user_roles(user: &UserInfo) -> (Option<bool>, Option<ParticipantRole>) {
    let Some(roles) = user.roles.as_ref() else {
        return (None, None);
    };
    let is_admin = roles.iter().any(|r| r == ROLE_ADMIN);
    let role = if roles.iter().any(|r| r == ParticipantRole::Listener.as_str()) {
        ParticipantRole::Listener
    } else {
        ParticipantRole::Speaker
    };
    (Some(is_admin), Some(role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallParams;
    use crate::conference::{ConferenceParams, FocusRole};
    use crate::config::AdminPolicy;
    use crate::device::{DeviceState, ParticipantDeviceTracker};
    use crate::types::{CallId, ConferenceId};

    fn addr(user: &str) -> SipAddress {
        SipAddress::new(user, "example.org")
    }

    fn session() -> ConferenceSession {
        let tracker = ParticipantDeviceTracker::new(-30.0, 2);
        let mut session = ConferenceSession::new(
            ConferenceId::new(),
            FocusRole::Focus,
            ConferenceParams::default().with_subject("Standup"),
            AdminPolicy::Shared,
            tracker.clone(),
        );
        session.set_address(addr("marie").with_param("conf-id", "1"));
        let me = tracker.create_device(addr("marie"), None, DeviceState::Present, None);
        session.set_local_participant(addr("marie"), true, me);
        session
    }

    fn add(session: &mut ConferenceSession, user: &str) -> (Vec<ConferenceChange>, SipAddress) {
        let call_id = CallId::new();
        let device_address = ParticipantDeviceTracker::device_address(&addr(user), Some(&call_id));
        let device = session.tracker().create_device(
            device_address.clone(),
            Some(call_id),
            DeviceState::Joining,
            Some(&CallParams::default()),
        );
        (session.add_participant(&addr(user), ParticipantRole::Speaker, device), device_address)
    }

    #[test]
    fn test_full_state_lists_every_member() {
        let mut session = session();
        add(&mut session, "pauline");
        let document = full_state(&session, 3).unwrap();
        assert!(document.is_full_state());
        assert_eq!(document.version, 3);
        assert_eq!(document.users.len(), 2);
        assert_eq!(document.users[0].has_role(ROLE_ADMIN), Some(true));
        assert_eq!(document.users[1].has_role(ROLE_ADMIN), Some(false));
        assert_eq!(
            document.description.unwrap().subject.as_deref(),
            Some("Standup")
        );
    }

    #[test]
    fn test_removal_is_one_deleted_user() {
        let mut session = session();
        add(&mut session, "pauline");
        let changes = session.remove_participant(&addr("pauline"));
        let document = partial_state(&session, &changes, 5).unwrap().unwrap();
        assert_eq!(document.users, vec![UserInfo::deleted(addr("pauline"))]);
        assert!(document.description.is_none());
    }

    #[test]
    fn test_device_change_is_partial_user() {
        let mut session = session();
        let (_, device) = add(&mut session, "pauline");
        let changes = session.set_device_state(&device, DeviceState::Present);
        let document = partial_state(&session, &changes, 2).unwrap().unwrap();

        let user = &document.users[0];
        assert_eq!(user.state, ElementState::Partial);
        assert_eq!(user.roles, None);
        assert_eq!(user.endpoints.len(), 1);
        assert_eq!(user.endpoints[0].status, Some(DeviceState::Present));
    }

    #[test]
    fn test_subject_change_has_description_only() {
        let mut session = session();
        let changes = session.set_subject(None, "Retro").unwrap();
        let document = partial_state(&session, &changes, 2).unwrap().unwrap();
        assert!(document.users.is_empty());
        assert_eq!(document.description.unwrap().subject.as_deref(), Some("Retro"));
        assert!(partial_state(&session, &[], 3).unwrap().is_none());
    }

    #[test]
    fn test_user_roles() {
        let mut session = session();
        add(&mut session, "pauline");
        let document = full_state(&session, 1).unwrap();
        assert_eq!(user_roles(&document.users[0]), (Some(true), Some(ParticipantRole::Speaker)));
        assert_eq!(user_roles(&UserInfo::deleted(addr("x"))), (None, None));
    }
}
