//! Conferences provisioned over CCMP or through the conference factory, and
//! announced with calendar invitations

use pretty_assertions::assert_eq;
use serial_test::serial;

use sipconf_core::{
    CallState, ConferenceInfoState, ConferenceState, MediaDirection, ParticipantRole, SchedulerId, SchedulerState,
    SipAddress,
};
use sipconf_tester::{address, run_scenario, scheduled_info, wait_until, CoreManager, TestBed, DEFAULT_TIMEOUT};

struct Scheduled {
    focus: CoreManager,
    marie: CoreManager,
    pauline: CoreManager,
    laure: CoreManager,
    scheduler: SchedulerId,
    uri: SipAddress,
}

/// marie schedules a conference on the focus with pauline as speaker and
/// laure as listener
async fn schedule(bed: &TestBed) -> anyhow::Result<Scheduled> {
    let focus = bed.focus("focus").await?;
    let marie = bed
        .manager_with("marie", bed.remote_user_config("marie", &focus))
        .await?;
    let pauline = bed.manager("pauline").await?;
    let laure = bed.manager("laure").await?;

    let info = scheduled_info(&marie, "Quarterly review", &[&pauline])
        .with_participant(laure.identity().clone(), ParticipantRole::Listener);
    let scheduler = marie.create_conference_scheduler();
    marie.scheduler_set_info(&scheduler, info)?;

    marie
        .wait("conference allocated", |s| s.schedulers_in(SchedulerState::Ready) == 1)
        .await?;
    let uri = marie
        .scheduler_info(&scheduler)?
        .and_then(|i| i.uri)
        .ok_or_else(|| anyhow::anyhow!("ready scheduler without conference address"))?;

    Ok(Scheduled {
        focus,
        marie,
        pauline,
        laure,
        scheduler,
        uri,
    })
}

#[tokio::test]
#[serial]
async fn test_scheduler_allocates_conference() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = schedule(&bed).await?;

        assert_eq!(setup.marie.scheduler_state(&setup.scheduler)?, SchedulerState::Ready);
        assert_eq!(setup.uri.user, setup.focus.identity().user);
        assert!(setup.uri.conference_id().is_some());

        let hosted = setup
            .focus
            .search_conference(&setup.uri)
            .expect("conference provisioned on the focus");
        assert_eq!(hosted.subject(), "Quarterly review");
        assert_eq!(hosted.state(), ConferenceState::CreationPending);
        assert_eq!(hosted.organizer(), Some(setup.marie.identity()));

        let stored = setup.marie.conference_info(&setup.uri).expect("record stored");
        assert_eq!(stored.state, ConferenceInfoState::New);
        assert_eq!(stored.ics_sequence, 0);
        assert_eq!(setup.focus.conference_info(&setup.uri).map(|i| i.subject), Some(stored.subject));
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_invitations_are_received_and_stored() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = schedule(&bed).await?;

        let failed = setup.marie.scheduler_send_invitations(&setup.scheduler)?;
        assert!(failed.is_empty());

        for invitee in [&setup.pauline, &setup.laure] {
            invitee
                .wait("invitation received", |s| s.ics_invitations_received == 1)
                .await?;
        }
        let sent = setup.marie.scheduler_info(&setup.scheduler)?.expect("scheduled info");
        assert_eq!(setup.pauline.conference_info(&setup.uri), Some(sent.clone()));
        assert_eq!(setup.laure.conference_info(&setup.uri), Some(sent.clone()));
        assert_eq!(setup.marie.stats().invitations_sent, 1);

        // Looked up through an address carrying extra parameters
        let dialed = setup.uri.clone().with_param("transport", "tcp");
        assert_eq!(setup.laure.conference_info(&dialed), Some(sent));
        assert_eq!(
            setup.focus.search_conference(&dialed).and_then(|c| c.address().cloned()),
            Some(setup.uri.clone())
        );
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_only_invited_participants_dial_in() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = schedule(&bed).await?;
        let chloe = bed.manager("chloe").await?;

        let pauline_call = setup.pauline.invite(&setup.uri)?;
        setup
            .pauline
            .wait_call_state(&pauline_call, CallState::StreamsRunning)
            .await?;
        let joined = setup
            .pauline
            .wait_conference("dial-in conference", |c| c.state() == ConferenceState::Created)
            .await?;
        assert_eq!(joined.address().map(|a| a.same_conference(&setup.uri)), Some(true));

        let laure_call = setup.laure.invite(&setup.uri)?;
        setup.laure.wait_call_state(&laure_call, CallState::StreamsRunning).await?;

        wait_until("both admitted", DEFAULT_TIMEOUT, || {
            setup
                .focus
                .search_conference(&setup.uri)
                .map(|c| c.state() == ConferenceState::Created && c.participant_count() == 2)
                .unwrap_or(false)
        })
        .await?;
        let hosted = setup.focus.search_conference(&setup.uri).expect("hosted conference");
        let listener = hosted.find_participant(setup.laure.identity()).expect("laure admitted");
        assert_eq!(listener.role, ParticipantRole::Listener);
        assert_eq!(listener.devices[0].audio, MediaDirection::RecvOnly);
        let speaker = hosted.find_participant(setup.pauline.identity()).expect("pauline admitted");
        assert_eq!(speaker.role, ParticipantRole::Speaker);

        // Not on the list
        let chloe_call = chloe.invite(&setup.uri)?;
        chloe.wait("call refused", |s| s.calls_in(CallState::Error) == 1).await?;
        assert_eq!(chloe.call_state(&chloe_call), None);
        assert!(chloe.conferences().is_empty());
        assert_eq!(
            setup.focus.search_conference(&setup.uri).map(|c| c.participant_count()),
            Some(2)
        );
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_update_bumps_sequence() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = schedule(&bed).await?;

        let mut info = setup.marie.scheduler_info(&setup.scheduler)?.expect("scheduled info");
        info.subject = "Quarterly review (moved)".to_string();
        info.duration_minutes = 90;
        setup.marie.scheduler_set_info(&setup.scheduler, info)?;
        assert_eq!(setup.marie.scheduler_state(&setup.scheduler)?, SchedulerState::Updating);

        setup
            .marie
            .wait("update acknowledged", |s| s.schedulers_in(SchedulerState::Ready) == 2)
            .await?;
        let updated = setup.marie.scheduler_info(&setup.scheduler)?.expect("scheduled info");
        assert_eq!(updated.ics_sequence, 1);
        assert_eq!(updated.state, ConferenceInfoState::Updated);
        assert_eq!(updated.uri.as_ref(), Some(&setup.uri));
        assert_eq!(
            setup.focus.search_conference(&setup.uri).map(|c| c.subject().to_string()),
            Some("Quarterly review (moved)".to_string())
        );
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_cancel_terminates_conference() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = schedule(&bed).await?;
        setup.marie.scheduler_send_invitations(&setup.scheduler)?;
        setup
            .pauline
            .wait("invitation received", |s| s.ics_invitations_received == 1)
            .await?;

        setup.marie.scheduler_cancel(&setup.scheduler)?;
        setup
            .marie
            .wait("cancellation acknowledged", |s| s.schedulers_in(SchedulerState::Ready) == 2)
            .await?;

        let cancelled = setup.marie.scheduler_info(&setup.scheduler)?.expect("scheduled info");
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.ics_sequence, 1);
        wait_until("conference removed from the focus", DEFAULT_TIMEOUT, || {
            setup.focus.search_conference(&setup.uri).is_none()
        })
        .await?;
        assert_eq!(
            setup.focus.conference_info(&setup.uri).map(|i| i.state),
            Some(ConferenceInfoState::Cancelled)
        );

        // The cancellation replaces the stored invitation
        setup.marie.scheduler_send_invitations(&setup.scheduler)?;
        setup
            .pauline
            .wait("cancellation received", |s| s.ics_invitations_received == 2)
            .await?;
        assert_eq!(
            setup.pauline.conference_info(&setup.uri).map(|i| i.state),
            Some(ConferenceInfoState::Cancelled)
        );
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_scheduler_without_server_fails() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let marie = bed.manager("marie").await?;
        let pauline = bed.manager("pauline").await?;

        let scheduler = marie.create_conference_scheduler();
        let result = marie.scheduler_set_info(&scheduler, scheduled_info(&marie, "Nowhere", &[&pauline]));

        assert!(result.is_err());
        assert_eq!(marie.scheduler_state(&scheduler)?, SchedulerState::Error);
        assert_eq!(marie.stats().schedulers_in(SchedulerState::Error), 1);
        assert!(marie.scheduler_send_invitations(&scheduler).is_err());
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_unreachable_recipient_is_reported() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let focus = bed.focus("focus").await?;
        let marie = bed
            .manager_with("marie", bed.remote_user_config("marie", &focus))
            .await?;
        let pauline = bed.manager("pauline").await?;
        let ghost = address("ghost");

        let info = scheduled_info(&marie, "Half empty", &[&pauline]).with_participant(ghost.clone(), ParticipantRole::Speaker);
        let scheduler = marie.create_conference_scheduler();
        marie.scheduler_set_info(&scheduler, info)?;
        marie
            .wait("conference allocated", |s| s.schedulers_in(SchedulerState::Ready) == 1)
            .await?;

        let failed = marie.scheduler_send_invitations(&scheduler)?;
        assert_eq!(failed, vec![ghost]);
        assert_eq!(marie.stats().invitations_failed, 1);
        pauline
            .wait("invitation received", |s| s.ics_invitations_received == 1)
            .await?;
        Ok(())
    })
    .await
}

/// marie provisions a conference by calling the factory, then announces it
async fn schedule_over_sip(bed: &TestBed) -> anyhow::Result<Scheduled> {
    let focus = bed.focus("focus").await?;
    let marie = bed
        .manager_with("marie", bed.remote_user_config("marie", &focus))
        .await?;
    let pauline = bed.manager("pauline").await?;
    let laure = bed.manager("laure").await?;

    let scheduler = marie.create_sip_conference_scheduler();
    marie.scheduler_set_info(&scheduler, scheduled_info(&marie, "Design review", &[&pauline, &laure]))?;
    assert_eq!(marie.scheduler_state(&scheduler)?, SchedulerState::AllocationPending);

    marie
        .wait("conference allocated", |s| s.schedulers_in(SchedulerState::Ready) == 1)
        .await?;
    let uri = marie
        .scheduler_info(&scheduler)?
        .and_then(|i| i.uri)
        .ok_or_else(|| anyhow::anyhow!("ready scheduler without conference address"))?;

    Ok(Scheduled {
        focus,
        marie,
        pauline,
        laure,
        scheduler,
        uri,
    })
}

#[tokio::test]
#[serial]
async fn test_sip_scheduler_allocates_through_factory() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = schedule_over_sip(&bed).await?;

        let info = setup.marie.scheduler_info(&setup.scheduler)?.expect("scheduled info");
        assert_eq!(info.ccmp_uri, None);
        assert_eq!(info.state, ConferenceInfoState::New);
        assert!(setup.uri.conference_id().is_some());
        assert_eq!(setup.marie.conference_info(&setup.uri), Some(info));

        // The factory call only carried the request
        assert!(setup.marie.calls().is_empty());
        assert!(setup.marie.conferences().is_empty());
        assert_eq!(setup.marie.stats().calls_in(CallState::StreamsRunning), 1);
        assert_eq!(setup.marie.stats().calls_in(CallState::End), 1);

        let hosted = setup
            .focus
            .search_conference(&setup.uri)
            .expect("conference provisioned on the focus");
        assert_eq!(hosted.subject(), "Design review");
        assert_eq!(hosted.state(), ConferenceState::CreationPending);
        assert_eq!(hosted.participant_count(), 0);
        assert_eq!(hosted.organizer(), Some(&setup.marie.identity().uri_only()));
        // Nobody was dialed out to or admitted
        assert!(setup.focus.calls().is_empty());
        let stored = setup.focus.conference_info(&setup.uri).expect("record stored on the focus");
        assert_eq!(
            stored.participant_addresses(),
            vec![setup.pauline.identity().uri_only(), setup.laure.identity().uri_only()]
        );

        let failed = setup.marie.scheduler_send_invitations(&setup.scheduler)?;
        assert!(failed.is_empty());
        setup
            .pauline
            .wait("invitation received", |s| s.ics_invitations_received == 1)
            .await?;
        assert_eq!(
            setup.pauline.conference_info(&setup.uri).map(|i| i.subject),
            Some("Design review".to_string())
        );

        let pauline_call = setup.pauline.invite(&setup.uri)?;
        setup
            .pauline
            .wait_call_state(&pauline_call, CallState::StreamsRunning)
            .await?;
        wait_until("pauline admitted", DEFAULT_TIMEOUT, || {
            setup
                .focus
                .search_conference(&setup.uri)
                .map(|c| c.state() == ConferenceState::Created && c.participant_count() == 1)
                .unwrap_or(false)
        })
        .await?;
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_sip_scheduler_update_and_cancel() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let setup = schedule_over_sip(&bed).await?;

        let mut info = setup.marie.scheduler_info(&setup.scheduler)?.expect("scheduled info");
        info.subject = "Design review (moved)".to_string();
        info.add_participant(setup.laure.identity().clone(), ParticipantRole::Listener);
        setup.marie.scheduler_set_info(&setup.scheduler, info)?;
        assert_eq!(setup.marie.scheduler_state(&setup.scheduler)?, SchedulerState::Updating);

        setup
            .marie
            .wait("update answered", |s| s.schedulers_in(SchedulerState::Ready) == 2)
            .await?;
        let updated = setup.marie.scheduler_info(&setup.scheduler)?.expect("scheduled info");
        assert_eq!(updated.ics_sequence, 1);
        assert_eq!(updated.uri.as_ref(), Some(&setup.uri));
        assert_eq!(
            setup.focus.search_conference(&setup.uri).map(|c| c.subject().to_string()),
            Some("Design review (moved)".to_string())
        );
        let stored = setup.focus.conference_info(&setup.uri).expect("record stored on the focus");
        assert_eq!(stored.state, ConferenceInfoState::Updated);
        assert_eq!(stored.subject, "Design review (moved)");
        assert!(setup.marie.calls().is_empty());

        // Cancelling needs CCMP: refused without leaving Ready
        assert!(setup.marie.scheduler_cancel(&setup.scheduler).is_err());
        assert_eq!(setup.marie.scheduler_state(&setup.scheduler)?, SchedulerState::Ready);
        assert!(setup.focus.search_conference(&setup.uri).is_some());
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_sip_scheduler_with_unreachable_factory() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        // No focus serves the factory
        let marie = bed
            .manager_with("marie", bed.user_config("marie").with_conference_factory(bed.factory_uri()))
            .await?;
        let pauline = bed.manager("pauline").await?;

        let scheduler = marie.create_sip_conference_scheduler();
        let result = marie.scheduler_set_info(&scheduler, scheduled_info(&marie, "Nowhere", &[&pauline]));

        assert!(result.is_err());
        assert_eq!(marie.scheduler_state(&scheduler)?, SchedulerState::Error);
        assert_eq!(marie.stats().calls_in(CallState::Error), 1);
        assert!(marie.calls().is_empty());
        assert!(marie.scheduler_send_invitations(&scheduler).is_err());
        Ok(())
    })
    .await
}
