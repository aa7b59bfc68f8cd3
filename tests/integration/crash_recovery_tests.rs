//! Integration tests for crash detection and restart.
//!
//! Validates:
//! - An exit of a tracked job's current run restarts it no earlier than the
//!   configured delay
//! - Exits of jobs claimed by `stop_module` never restart
//! - Stopping a module cancels a pending restart
//! - Exits of a previous run are not mistaken for crashes
//! - With restarts disabled the job is left exited and still tracked
//! - An exit reported before `start` returns is still a crash

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use server_launcher::models::module::JobState;
use server_launcher::scheduler::JobExit;

use super::test_helpers::{eventually, test_config, test_manager, FakeScheduler, MapResolver};

#[tokio::test(start_paused = true)]
async fn crashed_job_restarts_after_delay() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let manager = test_manager(
        test_config(temp.path(), 1),
        &scheduler,
        MapResolver::with_modules(),
    );
    manager.start_module("backend").await.expect("start");

    let exit = scheduler.crash("backend");
    let crashed_at = Instant::now();
    manager.handle_exit(&exit).await;
    assert_eq!(manager.job_state("backend").await, Some(JobState::Exited));

    sleep(Duration::from_millis(999)).await;
    assert_eq!(scheduler.starts_of("backend").len(), 1, "restarted too early");

    assert!(eventually(|| scheduler.starts_of("backend").len() == 2).await);
    let restarted_at = scheduler.starts_of("backend")[1];
    assert!(restarted_at - crashed_at >= Duration::from_millis(1000));

    let mut state = None;
    for _ in 0..100 {
        state = manager.job_state("backend").await;
        if state == Some(JobState::Running) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, Some(JobState::Running));
    assert_eq!(manager.tracked_jobs("backend").await, vec!["backend".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn exit_after_stop_does_not_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let manager = test_manager(
        test_config(temp.path(), 1),
        &scheduler,
        MapResolver::with_modules(),
    );
    manager.start_module("runner").await.expect("start");
    let run = scheduler.current_run("runner").expect("runner running");

    manager.stop_module("runner").await.expect("stop");
    manager
        .handle_exit(&JobExit {
            name: "runner".into(),
            run,
            code: None,
        })
        .await;

    sleep(Duration::from_secs(5)).await;
    assert_eq!(scheduler.starts_of("runner").len(), 1);
    assert!(scheduler.registered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let manager = test_manager(
        test_config(temp.path(), 2),
        &scheduler,
        MapResolver::with_modules(),
    );
    manager.start_module("processor").await.expect("start");

    let exit = scheduler.crash("processor_1");
    manager.handle_exit(&exit).await;
    sleep(Duration::from_millis(500)).await;
    manager.stop_module("processor").await.expect("stop");

    sleep(Duration::from_secs(3)).await;
    assert_eq!(scheduler.starts_of("processor_1").len(), 1);
    assert!(manager.tracked_jobs("processor").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn exit_of_previous_run_is_ignored() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let manager = test_manager(
        test_config(temp.path(), 1),
        &scheduler,
        MapResolver::with_modules(),
    );
    manager.start_module("main").await.expect("first start");
    let old_run = scheduler.current_run("main").expect("running");
    manager.start_module("main").await.expect("second start");

    manager
        .handle_exit(&JobExit {
            name: "main".into(),
            run: old_run,
            code: None,
        })
        .await;

    sleep(Duration::from_secs(3)).await;
    assert_eq!(manager.job_state("main").await, Some(JobState::Running));
    assert_eq!(scheduler.starts_of("main").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn exit_of_unknown_job_is_ignored() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let manager = test_manager(
        test_config(temp.path(), 1),
        &scheduler,
        MapResolver::with_modules(),
    );

    manager
        .handle_exit(&JobExit {
            name: "processor_7".into(),
            run: 42,
            code: Some(1),
        })
        .await;

    sleep(Duration::from_secs(3)).await;
    assert!(scheduler.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_disabled_leaves_job_exited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let mut config = test_config(temp.path(), 1);
    config.launcher.restart_on_crash = false;
    let manager = test_manager(config, &scheduler, MapResolver::with_modules());
    manager.start_module("storage").await.expect("start");

    let exit = scheduler.crash("storage");
    manager.handle_exit(&exit).await;
    sleep(Duration::from_secs(3)).await;

    assert_eq!(scheduler.starts_of("storage").len(), 1);
    assert_eq!(manager.job_state("storage").await, Some(JobState::Exited));
    assert_eq!(manager.tracked_jobs("storage").await, vec!["storage".to_owned()]);

    // The exited job is still registered and is cleaned up by the next stop.
    manager.stop_module("storage").await.expect("stop");
    assert!(scheduler.registered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn listener_restarts_crashed_job() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let manager = test_manager(
        test_config(temp.path(), 2),
        &scheduler,
        MapResolver::with_modules(),
    );
    let cancel = CancellationToken::new();
    let listener = manager.spawn_exit_listener(cancel.clone());
    manager.start_module("processor").await.expect("start");

    let crashed_at = Instant::now();
    scheduler.crash("processor_1");

    assert!(eventually(|| scheduler.starts_of("processor_1").len() == 2).await);
    let restarted_at = scheduler.starts_of("processor_1")[1];
    assert!(restarted_at - crashed_at >= Duration::from_millis(1000));
    assert_eq!(scheduler.starts_of("processor_0").len(), 1);

    // Intentional stops flow through the listener without restarting.
    manager.stop_module("processor").await.expect("stop");
    sleep(Duration::from_secs(3)).await;
    assert!(scheduler.registered().is_empty());
    assert_eq!(scheduler.starts_of("processor_1").len(), 2);

    cancel.cancel();
    listener.await.expect("listener exits");
}

#[tokio::test(start_paused = true)]
async fn exit_during_start_is_treated_as_crash() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scheduler = FakeScheduler::new();
    let manager = test_manager(
        test_config(temp.path(), 1),
        &scheduler,
        MapResolver::with_modules(),
    );
    let cancel = CancellationToken::new();
    let listener = manager.spawn_exit_listener(cancel.clone());
    scheduler.crash_during_start("storage");

    manager.start_module("storage").await.expect("start");

    assert!(eventually(|| scheduler.starts_of("storage").len() == 2).await);
    let starts = scheduler.starts_of("storage");
    assert!(starts[1] - starts[0] >= Duration::from_millis(1000));

    let mut state = None;
    for _ in 0..100 {
        state = manager.job_state("storage").await;
        if state == Some(JobState::Running) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, Some(JobState::Running));
    assert_eq!(scheduler.starts_of("storage").len(), 2);

    cancel.cancel();
    listener.await.expect("listener exits");
}
