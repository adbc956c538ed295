//! End-to-end tests of the session actor against simulated and scripted rigs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_settings, read_rows, wait_until, with_class, Counters, FakeRig, MemoryEncoders};
use sock_cond::config::Settings;
use sock_cond::coordinator::CoordinatorState;
use sock_cond::core::{AnimalBlock, AppState, Phase};
use sock_cond::error::CondError;
use sock_cond::hardware::mock::SimulatedDevices;
use sock_cond::hardware::DeviceFactory;
use sock_cond::messages::SessionEvent;
use sock_cond::recording::RawVideoFactory;
use sock_cond::session::SessionHandle;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

fn spawn_sim(settings: Settings) -> (SessionHandle, JoinHandle<()>) {
    SessionHandle::spawn(settings, Arc::new(SimulatedDevices), Arc::new(RawVideoFactory))
}

fn spawn_rig(mut settings: Settings, rig: &FakeRig) -> (SessionHandle, JoinHandle<()>) {
    settings.application.simulate = false;
    let factory: Arc<dyn DeviceFactory> = Arc::new(rig.clone());
    SessionHandle::spawn(settings, factory, Arc::new(RawVideoFactory))
}

async fn close(session: SessionHandle, task: JoinHandle<()>) {
    session.shutdown().await.unwrap();
    drop(session);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_std_train_block_writes_trial_log() {
    let dir = tempfile::tempdir().unwrap();
    let (session, task) = spawn_sim(fast_settings(dir.path()));

    assert_eq!(session.start().await.unwrap(), CoordinatorState::Activated);
    let trials = session
        .run_block(AnimalBlock::new("7").with_day("train"))
        .await
        .unwrap();
    assert_eq!(trials.len(), 1);
    assert!(trials[0].odor && trials[0].shock);

    let rows = read_rows(&dir.path().join("rat7.csv"));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], vec!["Date", "RatID", "Trial", "Time", "Odor?", "Shock?"]);
    assert_eq!(&rows[1][1..3], &["7".to_string(), "0".to_string()]);
    assert_eq!(&rows[1][4..], &["1".to_string(), "1".to_string()]);

    let status = session.status().await.unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert_eq!(status.app_state, AppState::Running);

    session.stop().await.unwrap();
    assert_eq!(session.status().await.unwrap().app_state, AppState::Clear);
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_odor_list_overlays_default_names() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("odor_list.txt"), "3,Banana\n").unwrap();
    let (session, task) = spawn_sim(fast_settings(dir.path()));
    let mut events = session.subscribe();

    session.start_and_wait().await.unwrap();
    session.run_block(AnimalBlock::new("7")).await.unwrap();

    let mut names = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::OdorNames(list) = event {
            names = Some(list);
        }
    }
    let names = names.unwrap();
    assert_eq!(names.len(), 8);
    assert_eq!(names[0], "p0");
    assert_eq!(names[3], "Banana");
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_class_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let settings = with_class(fast_settings(dir.path()), "5", "Bogus");
    let (session, task) = spawn_sim(settings);

    let err = session.start_block(AnimalBlock::new("7")).await.unwrap_err();
    assert!(matches!(err, CondError::InvalidState(_)));

    session.start_and_wait().await.unwrap();
    let err = session.start_block(AnimalBlock::new("5")).await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(err.to_string(), "Configuration validation error: Protocol Bogus not recognized");
    assert_eq!(session.status().await.unwrap().app_state, AppState::Error);

    session.stop().await.unwrap();
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_psd_train_meets_quotas() {
    let dir = tempfile::tempdir().unwrap();
    let settings = with_class(fast_settings(dir.path()), "7", "PsdTrain");
    let (session, task) = spawn_sim(settings);

    session.start_and_wait().await.unwrap();
    let trials = session.run_block(AnimalBlock::new("7")).await.unwrap();
    assert_eq!(trials.len(), 6);
    assert!(trials.iter().all(|t| t.odor != t.shock));
    assert_eq!(trials.iter().filter(|t| t.shock).count(), 2);
    assert!(trials.windows(2).all(|w| w[0].event_time < w[1].event_time));

    let rows = read_rows(&dir.path().join("rat7.csv"));
    assert_eq!(rows.len(), 7);
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_shock_co_terminates_with_odor() {
    let dir = tempfile::tempdir().unwrap();
    let rig = FakeRig::default();
    let (session, task) = spawn_rig(fast_settings(dir.path()), &rig);

    session.start_and_wait().await.unwrap();
    session.run_block(AnimalBlock::new("7")).await.unwrap();

    let odor = rig.transitions("p1");
    let no_valve = rig.transitions("p0");
    let shock = rig.transitions("shocker");
    assert_eq!(odor.len(), 2);
    assert_eq!(no_valve, odor);
    assert_eq!(shock.len(), 2);
    assert!(odor[0].1 && !odor[1].1);
    assert!(shock[0].1 && !shock[1].1);

    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    assert!((ms(odor[1].0 - odor[0].0) - 100.0).abs() < 1.0);
    assert!((ms(shock[0].0 - odor[0].0) - 60.0).abs() < 1.0);
    assert_eq!(shock[1].0, odor[1].0);

    session.stop().await.unwrap();
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_at_next_phase_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let (session, task) = spawn_sim(fast_settings(dir.path()));
    session.start_and_wait().await.unwrap();

    let runner = session.clone();
    let block = tokio::spawn(async move { runner.run_block(AnimalBlock::new("7")).await });

    // prehab ends at 50ms, the trial would start at 80ms
    tokio::time::sleep(Duration::from_millis(60)).await;
    session.pause().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let status = session.status().await.unwrap();
    assert_eq!(status.app_state, AppState::Paused);
    assert_eq!(status.phase, Phase::PreRecord);
    assert!(status.paused);

    assert_ok!(session.resume().await);
    let trials = assert_ok!(block.await.unwrap());
    assert_eq!(trials.len(), 1);
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_start_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let rig = FakeRig::with_start_delay(Duration::from_millis(50));
    let (session, task) = spawn_rig(fast_settings(dir.path()), &rig);

    assert_eq!(session.start().await.unwrap(), CoordinatorState::Starting);
    assert_err!(session.pause().await);

    let (first, second) = tokio::join!(session.stop(), session.stop());
    assert_ok!(first);
    assert_ok!(second);

    let counters = &rig.counters;
    assert_eq!(Counters::get(&counters.start_channel), 2);
    assert_eq!(Counters::get(&counters.stop_device), 2);
    assert_eq!(Counters::get(&counters.stop_channel), 2);

    let status = session.status().await.unwrap();
    assert_eq!(status.app_state, AppState::Clear);
    assert_eq!(status.devices, CoordinatorState::Idle);

    // the session can start again
    session.start_and_wait().await.unwrap();
    assert_eq!(session.status().await.unwrap().phase, Phase::Ready);
    session.stop().await.unwrap();
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_teardown_survives_failing_device() {
    let dir = tempfile::tempdir().unwrap();
    let rig = FakeRig::failing_odor_stop();
    let (session, task) = spawn_rig(fast_settings(dir.path()), &rig);

    session.start_and_wait().await.unwrap();
    let err = session.stop().await.unwrap_err();
    match err {
        CondError::ShutdownFailed(errors) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].is_device());
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert_eq!(Counters::get(&rig.counters.stop_device), 2);
    assert_eq!(Counters::get(&rig.counters.stop_channel), 2);
    assert_eq!(session.status().await.unwrap().app_state, AppState::Clear);
    close(session, task).await;
}

#[tokio::test]
async fn test_writers_rotate_per_trial() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = with_class(fast_settings(dir.path()), "7", "OdorOnly");
    settings.video.ports = vec![0, 1];
    settings.video.record = vec![true, false];
    let encoders = MemoryEncoders::default();
    let (session, task) = SessionHandle::spawn(settings, Arc::new(SimulatedDevices), Arc::new(encoders.clone()));

    session.start_and_wait().await.unwrap();
    let trials = session.run_block(AnimalBlock::new("7")).await.unwrap();
    assert_eq!(trials.len(), 2);

    assert!(wait_until(Duration::from_secs(2), || encoders.all_finished()).await);
    assert_eq!(encoders.names(), vec!["R7T0C0.raw", "R7T1C0.raw"]);
    for recording in encoders.streams.lock().values() {
        assert!(recording.frames > 0);
        assert_eq!(recording.first_pts, Some(0.0));
    }

    session.stop().await.unwrap();
    close(session, task).await;
}

#[tokio::test]
async fn test_encode_failures_do_not_abort_block() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = with_class(fast_settings(dir.path()), "7", "OdorOnly");
    settings.video.ports = vec![0];
    settings.video.record = vec![true];
    let encoders = MemoryEncoders::failing();
    let (session, task) = SessionHandle::spawn(settings, Arc::new(SimulatedDevices), Arc::new(encoders.clone()));

    session.start_and_wait().await.unwrap();
    let trials = session.run_block(AnimalBlock::new("7")).await.unwrap();
    assert_eq!(trials.len(), 2);
    assert!(Counters::get(&encoders.attempts) > 0);
    assert_eq!(session.status().await.unwrap().app_state, AppState::Running);

    session.stop().await.unwrap();
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handles_ends_session() {
    let dir = tempfile::tempdir().unwrap();
    let (session, task) = spawn_sim(fast_settings(dir.path()));
    session.start_and_wait().await.unwrap();
    drop(session);
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

async fn wait_for_block_end(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> bool {
    loop {
        match events.recv().await {
            Ok(SessionEvent::BlockFinished { .. }) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_is_retried_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let rig = FakeRig::failing_odor_sets(1);
    let (session, task) = spawn_rig(fast_settings(dir.path()), &rig);
    session.start_and_wait().await.unwrap();

    let mut events = session.subscribe();
    session.start_block(AnimalBlock::new("7")).await.unwrap();
    // the odor write at trial start (80ms) fails
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = session.status().await.unwrap();
    assert_eq!(status.app_state, AppState::Error);
    assert_eq!(status.phase, Phase::Trial);
    assert_eq!(status.trial, Some(0));
    assert!(status.paused);
    assert!(rig.transitions("p1").is_empty());

    assert_ok!(session.resume().await);
    let finished = tokio::time::timeout(Duration::from_secs(5), wait_for_block_end(&mut events))
        .await
        .unwrap();
    assert!(finished);

    let odor = rig.transitions("p1");
    assert_eq!(odor.len(), 2);
    assert!(odor[0].1 && !odor[1].1);
    assert_eq!(rig.transitions("shocker").len(), 2);
    assert_eq!(read_rows(&dir.path().join("rat7.csv")).len(), 2);

    let status = session.status().await.unwrap();
    assert_eq!(status.app_state, AppState::Running);
    assert_eq!(status.phase, Phase::Ready);
    assert_ok!(session.start_block(AnimalBlock::new("7")).await);

    session.stop().await.unwrap();
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_random_valves_rotate_for_block_lifetime() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = fast_settings(dir.path());
    settings.odor.rand_valves = vec![vec!["p4".to_string()], vec!["p5".to_string(), "p6".to_string()]];
    settings.odor.valve_rand_min = 0.01;
    settings.odor.valve_rand_max = 0.02;
    let rig = FakeRig::default();
    let (session, task) = spawn_rig(settings, &rig);

    session.start_and_wait().await.unwrap();
    session.run_block(AnimalBlock::new("7")).await.unwrap();

    let ticks = rig.transitions("p4");
    assert!(ticks.len() >= 5, "only {} rotations", ticks.len());
    assert_eq!(rig.transitions("p5").len(), ticks.len());
    // every gap but the final reset is a drawn rotation delay
    for pair in ticks[..ticks.len() - 1].windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert!(gap >= Duration::from_millis(10) && gap <= Duration::from_millis(21), "gap {:?}", gap);
    }
    assert!(!ticks[ticks.len() - 1].1);
    assert!(!rig.transitions("p5").last().unwrap().1);
    assert!(!rig.transitions("p6").last().unwrap().1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.transitions("p4").len(), ticks.len());

    session.stop().await.unwrap();
    close(session, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_trial_drives_outputs_low() {
    let dir = tempfile::tempdir().unwrap();
    let rig = FakeRig::default();
    let (session, task) = spawn_rig(fast_settings(dir.path()), &rig);
    session.start_and_wait().await.unwrap();

    let runner = session.clone();
    let block = tokio::spawn(async move { runner.run_block(AnimalBlock::new("7")).await });

    // trial runs 80..180ms with the shock from 140ms
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.status().await.unwrap().phase, Phase::Trial);
    session.stop().await.unwrap();
    assert_err!(block.await.unwrap());

    let odor = rig.transitions("p1");
    let shock = rig.transitions("shocker");
    assert_eq!(odor.len(), 2);
    assert_eq!(shock.len(), 2);
    assert!(odor[0].1 && !odor[1].1);
    assert!(shock[0].1 && !shock[1].1);
    assert_eq!(shock[1].0, odor[1].0);
    assert!(odor[1].0 - odor[0].0 < Duration::from_millis(100));

    let status = session.status().await.unwrap();
    assert_eq!(status.app_state, AppState::Clear);
    assert_eq!(status.phase, Phase::Init);
    assert!(status.animal_id.is_none());
    // header only, the aborted trial is not logged
    assert_eq!(read_rows(&dir.path().join("rat7.csv")).len(), 1);
    close(session, task).await;
}
