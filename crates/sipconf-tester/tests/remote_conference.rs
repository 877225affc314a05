//! Conferences mixed by a dedicated focus and created through its factory

use pretty_assertions::assert_eq;
use serial_test::serial;

use sipconf_core::{CallState, ConferenceId, ConferenceParams, ConferenceState, FocusRole};
use sipconf_tester::{run_scenario, wait_until, CoreManager, TestBed, DEFAULT_TIMEOUT};

struct Conference {
    focus: CoreManager,
    organizer: CoreManager,
    invitees: Vec<CoreManager>,
    conference: ConferenceId,
}

impl Conference {
    fn size_everywhere(&self, size: usize) -> bool {
        let hosted = self
            .focus
            .conferences()
            .first()
            .map(|c| c.participant_count() == size)
            .unwrap_or(false);
        let organizer = self
            .organizer
            .conference(&self.conference)
            .map(|c| c.state() == ConferenceState::Created && c.size() == size)
            .unwrap_or(false);
        hosted
            && organizer
            && self.invitees.iter().all(|m| {
                m.joined_conference()
                    .map(|c| c.state() == ConferenceState::Created && c.size() == size)
                    .unwrap_or(false)
            })
    }
}

/// The organizer creates a conference on the focus and has it dial out to
/// every invitee
async fn remote_conference(bed: &TestBed, invitees: &[&str]) -> anyhow::Result<Conference> {
    let focus = bed.focus("focus").await?;
    let organizer = bed
        .manager_with("marie", bed.remote_user_config("marie", &focus))
        .await?;
    let mut managers = Vec::new();
    for name in invitees {
        managers.push(bed.manager_with(name, bed.remote_user_config(name, &focus)).await?);
    }

    let params = ConferenceParams::from_config(&organizer.config())
        .with_subject("Roadmap")
        .with_participants(managers.iter().map(|m| m.identity().clone()).collect());
    let conference = organizer.create_conference(params)?;

    let setup = Conference {
        focus,
        organizer,
        invitees: managers,
        conference,
    };
    let size = invitees.len() + 1;
    wait_until("remote conference established", DEFAULT_TIMEOUT, || setup.size_everywhere(size)).await?;
    Ok(setup)
}

#[tokio::test]
#[serial]
async fn test_factory_creates_conference_and_dials_out() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = remote_conference(&bed, &["pauline", "laure"]).await?;

        let hosted = setup.focus.conferences();
        assert_eq!(hosted.len(), 1);
        let hosted = &hosted[0];
        assert_eq!(hosted.role(), FocusRole::Focus);
        assert!(hosted.me().is_none());
        assert_eq!(hosted.subject(), "Roadmap");
        assert_eq!(hosted.organizer(), Some(&setup.organizer.identity().uri_only()));

        let mirrored = setup.organizer.conference(&setup.conference)?;
        assert_eq!(mirrored.role(), FocusRole::Client);
        assert_eq!(mirrored.address(), hosted.address());
        assert!(mirrored.is_admin(setup.organizer.identity()));
        assert!(mirrored.is_synchronized());

        for invitee in &setup.invitees {
            let joined = invitee.joined_conference().expect("joined conference");
            assert_eq!(joined.subject(), "Roadmap");
            assert!(!joined.is_admin(invitee.identity()));
            assert_eq!(joined.participant_count(), 2);
        }
        assert_eq!(setup.focus.stats().calls_in(CallState::StreamsRunning), 3);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_non_admin_cannot_remove_participants() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = remote_conference(&bed, &["pauline", "laure", "michelle", "chloe"]).await?;
        let pauline = &setup.invitees[0];
        let laure = &setup.invitees[1];
        let conference = pauline.joined_conference().expect("joined conference").id();

        let err = pauline
            .remove_participant(&conference, laure.identity())
            .expect_err("pauline is not an admin");
        assert!(err.is_not_authorized());

        // Refused before any REFER reached the focus
        assert_eq!(pauline.stats().conference_requests_rejected, 0);
        assert!(setup.size_everywhere(5));
        assert_eq!(setup.focus.conferences()[0].participant_count(), 5);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_admin_invites_and_removes_through_focus() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let mut setup = remote_conference(&bed, &["pauline", "laure"]).await?;
        let michelle = bed
            .manager_with("michelle", bed.remote_user_config("michelle", &setup.focus))
            .await?;

        setup
            .organizer
            .invite_participants(&setup.conference, &[michelle.identity().clone()])?;
        setup.invitees.push(michelle.clone());
        wait_until("michelle joined", DEFAULT_TIMEOUT, || setup.size_everywhere(4)).await?;

        setup
            .organizer
            .remove_participant(&setup.conference, michelle.identity())?;
        setup.invitees.pop();
        wait_until("michelle removed", DEFAULT_TIMEOUT, || {
            setup.size_everywhere(3) && michelle.calls().is_empty() && michelle.conferences().is_empty()
        })
        .await?;
        assert_eq!(setup.organizer.stats().conference_requests_rejected, 0);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_admin_changes_subject() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = remote_conference(&bed, &["pauline", "laure"]).await?;

        setup.organizer.set_subject(&setup.conference, "Roadmap, take two")?;

        wait_until("subject propagated", DEFAULT_TIMEOUT, || {
            setup.invitees.iter().all(|m| {
                m.joined_conference()
                    .map(|c| c.subject() == "Roadmap, take two")
                    .unwrap_or(false)
            }) && setup
                .organizer
                .conference(&setup.conference)
                .map(|c| c.subject() == "Roadmap, take two")
                .unwrap_or(false)
        })
        .await?;
        assert_eq!(setup.focus.conferences()[0].subject(), "Roadmap, take two");
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_unreachable_focus_leaves_conference_terminated() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = remote_conference(&bed, &["pauline"]).await?;

        bed.network().set_reachable(setup.focus.identity(), false);
        setup.organizer.terminate_conference(&setup.conference)?;

        let stats = setup.organizer.stats();
        assert_eq!(stats.conferences_in(ConferenceState::Terminated), 1);
        assert_eq!(stats.conferences_in(ConferenceState::Deleted), 0);
        assert_eq!(stats.calls_in(CallState::Error), 1);
        assert!(setup.organizer.conferences().is_empty());
        assert!(setup.organizer.calls().is_empty());
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_merging_a_call_into_remote_conference() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = remote_conference(&bed, &["pauline"]).await?;
        let laure = bed
            .manager_with("laure", bed.remote_user_config("laure", &setup.focus))
            .await?;

        // marie calls laure outside the conference, then hands the call over
        let to_laure = sipconf_tester::call(&setup.organizer, &laure).await?;
        setup.organizer.add_participant(&setup.conference, &to_laure)?;

        wait_until("laure transferred", DEFAULT_TIMEOUT, || {
            laure
                .joined_conference()
                .map(|c| c.size() == 3)
                .unwrap_or(false)
                && setup.organizer.call_state(&to_laure).is_none()
        })
        .await?;
        assert_eq!(laure.stats().transfer_refer_received, 1);
        assert_eq!(setup.organizer.stats().transfer_call_connected, 1);
        Ok(())
    })
    .await
}
