//! Conferences mixed by one of the calling cores

use pretty_assertions::assert_eq;
use serial_test::serial;

use sipconf_core::{CallId, CallState, ConferenceId, ConferenceParams, ConferenceState, DeviceState};
use sipconf_tester::{call, run_scenario, wait_until, CoreManager, TestBed, DEFAULT_TIMEOUT};

struct ThreeParty {
    marie: CoreManager,
    pauline: CoreManager,
    laure: CoreManager,
    conference: ConferenceId,
    to_pauline: CallId,
    to_laure: CallId,
}

/// Device state of `of` as seen by `observer` in its joined conference
fn seen_state(observer: &CoreManager, of: &CoreManager) -> Option<DeviceState> {
    observer
        .joined_conference()?
        .member(of.identity())?
        .devices
        .first()
        .map(|d| d.state)
}

/// Everybody mixed and mirrored
fn converged(setup: &ThreeParty) -> bool {
    let hosted = setup
        .marie
        .conference(&setup.conference)
        .map(|c| c.participant_count() == 2 && c.participants().iter().all(|p| p.is_in_conference()))
        .unwrap_or(false);
    hosted
        && [&setup.pauline, &setup.laure].iter().all(|m| {
            m.joined_conference()
                .map(|c| c.state() == ConferenceState::Created && c.participant_count() == 2)
                .unwrap_or(false)
        })
}

async fn start_managers(bed: &TestBed) -> anyhow::Result<(CoreManager, CoreManager, CoreManager)> {
    Ok((
        bed.manager("marie").await?,
        bed.manager("pauline").await?,
        bed.manager("laure").await?,
    ))
}

/// marie calls pauline and laure, then merges both calls
async fn three_party(marie: CoreManager, pauline: CoreManager, laure: CoreManager) -> anyhow::Result<ThreeParty> {
    let to_pauline = call(&marie, &pauline).await?;
    let to_laure = call(&marie, &laure).await?;
    marie.wait_call_state(&to_pauline, CallState::Paused).await?;

    let conference = marie.create_conference(ConferenceParams::default().with_subject("Team sync"))?;
    marie.add_all_to_conference(&conference)?;

    let setup = ThreeParty {
        marie,
        pauline,
        laure,
        conference,
        to_pauline,
        to_laure,
    };
    wait_until("three party conference", DEFAULT_TIMEOUT, || converged(&setup)).await?;
    Ok(setup)
}

#[tokio::test]
#[serial]
async fn test_three_party_conference() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;

        let hosted = setup.marie.conference(&setup.conference)?;
        assert_eq!(hosted.state(), ConferenceState::Created);
        assert_eq!(hosted.size(), 3);
        assert!(hosted.is_in());
        assert!(hosted.is_admin(setup.marie.identity()));
        assert!(setup.marie.is_in_conference());

        for member in [&setup.pauline, &setup.laure] {
            let mirrored = member.joined_conference().expect("joined conference");
            assert_eq!(mirrored.subject(), "Team sync");
            assert_eq!(mirrored.size(), hosted.size());
            assert!(mirrored.is_admin(setup.marie.identity()));
            assert!(!mirrored.is_admin(member.identity()));
        }
        assert_eq!(setup.marie.call_state(&setup.to_pauline), Some(CallState::StreamsRunning));
        assert_eq!(setup.marie.call_state(&setup.to_laure), Some(CallState::StreamsRunning));
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_hang_up_dissolves_conference() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;

        setup.laure.terminate(&setup.to_laure)?;

        wait_until("conference dissolved", DEFAULT_TIMEOUT, || {
            setup.marie.conferences().is_empty() && setup.pauline.conferences().is_empty()
        })
        .await?;
        setup.marie.wait_call_state(&setup.to_pauline, CallState::StreamsRunning).await?;
        setup.pauline.wait_call_state(&setup.to_pauline, CallState::StreamsRunning).await?;

        let stats = setup.marie.stats();
        assert_eq!(stats.conferences_in(ConferenceState::Terminated), 1);
        assert_eq!(stats.conferences_in(ConferenceState::Deleted), 1);
        assert_eq!(setup.marie.call_state(&setup.to_laure), None);
        assert!(setup.laure.conferences().is_empty());
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_pausing_a_leg_dissolves_conference() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;

        setup.marie.pause(&setup.to_pauline)?;

        setup.marie.wait_call_state(&setup.to_pauline, CallState::Paused).await?;
        setup
            .pauline
            .wait_call_state(&setup.to_pauline, CallState::PausedByRemote)
            .await?;
        wait_until("conference dissolved", DEFAULT_TIMEOUT, || {
            setup.marie.conferences().is_empty()
                && setup.pauline.conferences().is_empty()
                && setup.laure.conferences().is_empty()
        })
        .await?;
        setup.laure.wait_call_state(&setup.to_laure, CallState::StreamsRunning).await?;
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_dissolution_waits_for_renegotiation_in_flight() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;
        let answered_before = setup.laure.stats().calls_in(CallState::UpdatedByRemote);

        let params = setup.marie.call(&setup.to_laure)?.params.with_video(true);
        setup.marie.update(&setup.to_laure, params)?;
        assert_eq!(setup.marie.call_state(&setup.to_laure), Some(CallState::Updating));
        setup.marie.terminate(&setup.to_pauline)?;
        assert!(setup.marie.conferences().is_empty());

        // The video update first, then the notice that the conference is gone
        setup
            .laure
            .wait("both re-INVITEs answered", |s| {
                s.calls_in(CallState::UpdatedByRemote) == answered_before + 2
            })
            .await?;
        assert!(setup.laure.conferences().is_empty());
        setup.marie.wait_call_state(&setup.to_laure, CallState::StreamsRunning).await?;
        assert!(setup.marie.call(&setup.to_laure)?.params.video_enabled);
        assert!(!setup.marie.call(&setup.to_laure)?.left_hint_pending);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_leave_and_enter() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;
        let on_hold_before = setup.pauline.stats().participant_devices_on_hold;

        setup.marie.leave(&setup.conference)?;
        assert!(!setup.marie.is_in_conference());
        setup
            .pauline
            .wait("marie on hold", |s| s.participant_devices_on_hold > on_hold_before)
            .await?;
        assert_eq!(seen_state(&setup.pauline, &setup.marie), Some(DeviceState::OnHold));
        assert_eq!(setup.marie.conference(&setup.conference)?.participant_count(), 2);

        setup.marie.enter(&setup.conference)?;
        assert!(setup.marie.is_in_conference());
        wait_until("marie back", DEFAULT_TIMEOUT, || {
            seen_state(&setup.pauline, &setup.marie) == Some(DeviceState::Present)
                && seen_state(&setup.laure, &setup.marie) == Some(DeviceState::Present)
        })
        .await?;
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_enabling_video_renegotiates_each_leg_once() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;
        let updates = |m: &CoreManager| m.stats().calls_in(CallState::UpdatedByRemote);
        let (pauline_before, laure_before) = (updates(&setup.pauline), updates(&setup.laure));

        setup.marie.enable_video(&setup.conference, true)?;

        wait_until("video negotiated", DEFAULT_TIMEOUT, || {
            [(&setup.pauline, &setup.to_pauline), (&setup.laure, &setup.to_laure)]
                .iter()
                .all(|(m, id)| {
                    m.call(id)
                        .map(|c| c.params.video_enabled && c.state == CallState::StreamsRunning)
                        .unwrap_or(false)
                })
                && setup
                    .pauline
                    .joined_conference()
                    .map(|c| c.params().video_enabled)
                    .unwrap_or(false)
        })
        .await?;
        assert_eq!(updates(&setup.pauline), pauline_before + 1);
        assert_eq!(updates(&setup.laure), laure_before + 1);

        // Nothing left to renegotiate. The subject change is published
        // after it, so once it arrived no re-INVITE can still be on its way.
        setup.marie.enable_video(&setup.conference, true)?;
        let members = [&setup.pauline, &setup.laure];
        let renamed_before: Vec<u32> = members.iter().map(|m| m.stats().subject_changed).collect();
        setup.marie.set_subject(&setup.conference, "Team sync (video)")?;
        for (member, before) in members.iter().zip(renamed_before) {
            member.wait("subject change published", |s| s.subject_changed > before).await?;
        }
        assert_eq!(updates(&setup.pauline), pauline_before + 1);
        assert_eq!(updates(&setup.laure), laure_before + 1);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_client_without_event_log() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let marie = bed.manager("marie").await?;
        let pauline = bed
            .manager_with("pauline", bed.user_config("pauline").with_event_log(false))
            .await?;
        let to_pauline = call(&marie, &pauline).await?;

        let conference = marie.create_conference(ConferenceParams::default())?;
        marie.add_participant(&conference, &to_pauline)?;

        let mirrored = pauline
            .wait_conference("conference joined", |c| c.state() == ConferenceState::Created)
            .await?;
        // A hold round trip: a subscription sent before it would be answered by now
        pauline.pause(&to_pauline)?;
        pauline.wait_call_state(&to_pauline, CallState::Paused).await?;
        let stats = pauline.stats();
        assert_eq!(stats.notify_received, 0);
        assert_eq!(mirrored.participant_count(), 0);
        assert_eq!(marie.conference(&conference)?.participant_count(), 1);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_focus_without_event_log_rejects_subscriptions() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let marie = bed
            .manager_with("marie", bed.user_config("marie").with_event_log(false))
            .await?;
        let pauline = bed.manager("pauline").await?;
        let to_pauline = call(&marie, &pauline).await?;

        let conference = marie.create_conference(ConferenceParams::default())?;
        marie.add_participant(&conference, &to_pauline)?;

        pauline.wait("subscription rejected", |s| s.subscriptions_rejected == 1).await?;
        let mirrored = pauline
            .wait_conference("conference created", |c| c.state() == ConferenceState::Created)
            .await?;
        assert!(!mirrored.is_synchronized());
        assert_eq!(pauline.stats().notify_received, 0);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_admin_change_is_published_once() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;
        let members = [&setup.marie, &setup.pauline, &setup.laure];
        let before: Vec<u32> = members
            .iter()
            .map(|m| m.stats().participant_admin_statuses_changed)
            .collect();

        setup
            .marie
            .set_admin(&setup.conference, setup.pauline.identity(), true)?;

        wait_until("pauline promoted", DEFAULT_TIMEOUT, || {
            [&setup.pauline, &setup.laure].iter().all(|m| {
                m.joined_conference()
                    .map(|c| c.is_admin(setup.pauline.identity()))
                    .unwrap_or(false)
            })
        })
        .await?;

        // Shared policy: marie keeps her right
        assert!(setup.marie.conference(&setup.conference)?.is_admin(setup.marie.identity()));

        // The new admin renames the conference through the focus
        let renamed_before: Vec<u32> = members.iter().map(|m| m.stats().subject_changed).collect();
        let mirrored = setup.pauline.joined_conference().expect("joined conference");
        setup.pauline.set_subject(&mirrored.id(), "Renamed by pauline")?;
        for (member, before) in members.iter().zip(renamed_before) {
            member.wait("subject changed", |s| s.subject_changed > before).await?;
        }
        assert_eq!(
            setup.laure.joined_conference().map(|c| c.subject().to_string()),
            Some("Renamed by pauline".to_string())
        );
        assert_eq!(
            setup.marie.conference(&setup.conference)?.subject(),
            "Renamed by pauline"
        );

        // Published after the promotion: a second admin notification would have arrived
        let after: Vec<u32> = members
            .iter()
            .map(|m| m.stats().participant_admin_statuses_changed)
            .collect();
        let expected: Vec<u32> = before.iter().map(|n| n + 1).collect();
        assert_eq!(after, expected);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_non_admin_cannot_change_subject() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;
        let mirrored = setup.laure.joined_conference().expect("joined conference");

        let err = setup
            .laure
            .set_subject(&mirrored.id(), "Hijacked")
            .expect_err("laure is not an admin");
        assert!(err.is_not_authorized());

        // Refused before anything was sent
        assert_eq!(setup.marie.conference(&setup.conference)?.subject(), "Team sync");
        assert_eq!(setup.laure.conference(&mirrored.id())?.subject(), "Team sync");
        assert_eq!(setup.laure.stats().conference_requests_rejected, 0);
        Ok(())
    })
    .await
}

#[tokio::test]
#[serial]
async fn test_host_removes_participant() -> anyhow::Result<()> {
    run_scenario(|bed| async move {
        let (marie, pauline, laure) = start_managers(&bed).await?;
        let setup = three_party(marie, pauline, laure).await?;

        setup
            .marie
            .remove_participant(&setup.conference, setup.laure.identity())?;

        wait_until("laure removed", DEFAULT_TIMEOUT, || {
            setup.laure.calls().is_empty() && setup.marie.conferences().is_empty()
        })
        .await?;
        // One participant left with the host: the conference dissolved
        setup.pauline.wait_call_state(&setup.to_pauline, CallState::StreamsRunning).await?;
        assert!(setup.pauline.conferences().is_empty());
        Ok(())
    })
    .await
}
