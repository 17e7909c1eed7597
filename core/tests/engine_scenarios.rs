//! End-to-end engine scenarios exercised against real child processes
//! and a real graveyard directory. Pod-watch scenarios need cluster
//! credentials and are covered by unit tests on the handlers instead.

use kubexit_core::engine::{self, Config};
use kubexit_core::tombstone;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(name: &str, graveyard: &Path) -> Config {
    Config {
        name: name.to_string(),
        graveyard: graveyard.to_path_buf(),
        birth_deps: Vec::new(),
        death_deps: Vec::new(),
        birth_timeout: Duration::from_secs(30),
        grace_period: Duration::from_secs(30),
        pod_name: None,
        namespace: None,
        verbose_level: 0,
        instant_logging: false,
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

async fn write_dead_peer(graveyard: &Path, name: &str) {
    let contents =
        "born: 2021-10-15T07:44:37.967Z\ndied: 2021-10-15T07:44:50.693Z\nexitCode: 143\n";
    tokio::fs::write(graveyard.join(name), contents)
        .await
        .expect("write peer tombstone");
}

#[tokio::test]
async fn solo_run_records_birth_and_death() {
    let graveyard = TempDir::new().expect("tempdir");
    let code = engine::run(config("solo", graveyard.path()), argv(&["true"])).await;
    assert_eq!(code, 0);

    let observed = tombstone::read(graveyard.path(), "solo")
        .await
        .expect("own tombstone");
    let born = observed.born().expect("born recorded");
    let died = observed.died().expect("died recorded");
    assert!(died >= born);
    assert_eq!(observed.exit_code(), Some(0));
}

#[tokio::test]
async fn child_exit_code_is_passed_through() {
    let graveyard = TempDir::new().expect("tempdir");
    let code = engine::run(
        config("app", graveyard.path()),
        argv(&["sh", "-c", "exit 3"]),
    )
    .await;
    assert_eq!(code, 3);

    let observed = tombstone::read(graveyard.path(), "app")
        .await
        .expect("own tombstone");
    assert_eq!(observed.exit_code(), Some(3));
}

#[tokio::test]
async fn spawn_failure_is_fatal_and_writes_no_tombstone() {
    let graveyard = TempDir::new().expect("tempdir");
    let code = engine::run(
        config("app", graveyard.path()),
        argv(&["kubexit-test-no-such-binary"]),
    )
    .await;
    assert_eq!(code, 1);

    let err = tombstone::read(graveyard.path(), "app")
        .await
        .expect_err("no tombstone for unstarted child");
    assert!(matches!(err, kubexit_core::CoreError::TombstoneNotFound(_)));
}

#[tokio::test]
async fn empty_argv_writes_no_tombstone() {
    let graveyard = TempDir::new().expect("tempdir");
    let code = engine::run(config("app", graveyard.path()), Vec::new()).await;
    assert_eq!(code, 2);
    assert!(
        tombstone::read(graveyard.path(), "app").await.is_err(),
        "usage errors must not leave a tombstone behind"
    );
}

#[tokio::test]
async fn death_dep_triggers_graceful_shutdown() {
    let graveyard = TempDir::new().expect("tempdir");
    let mut config = config("proxy", graveyard.path());
    config.death_deps = vec!["app".to_string()];

    let graveyard_path = graveyard.path().to_path_buf();
    let run = tokio::spawn(engine::run(config, argv(&["sleep", "30"])));

    // let the watcher arm and the child start
    tokio::time::sleep(Duration::from_millis(500)).await;

    // an unrelated peer's death must be ignored
    write_dead_peer(&graveyard_path, "bystander").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!run.is_finished(), "bystander death must not stop the child");

    let started = Instant::now();
    write_dead_peer(&graveyard_path, "app").await;

    let code = tokio::time::timeout(Duration::from_secs(20), run)
        .await
        .expect("engine should finish soon after the death dep dies")
        .expect("engine task");
    // sleep dies on TERM, which reports as an abnormal exit
    assert_eq!(code, -1);
    assert!(started.elapsed() < Duration::from_secs(20));

    let observed = tombstone::read(&graveyard_path, "proxy")
        .await
        .expect("own tombstone");
    assert!(observed.died().is_some());
    assert_eq!(observed.exit_code(), Some(-1));
}

#[tokio::test]
async fn grace_period_escalates_to_kill_for_stubborn_children() {
    let graveyard = TempDir::new().expect("tempdir");
    let mut config = config("stubborn", graveyard.path());
    config.death_deps = vec!["app".to_string()];
    config.grace_period = Duration::from_millis(500);

    let graveyard_path = graveyard.path().to_path_buf();
    let run = tokio::spawn(engine::run(
        config,
        argv(&["sh", "-c", "trap '' TERM; sleep 30"]),
    ));

    tokio::time::sleep(Duration::from_millis(500)).await;
    write_dead_peer(&graveyard_path, "app").await;

    let code = tokio::time::timeout(Duration::from_secs(20), run)
        .await
        .expect("KILL escalation should reap the child")
        .expect("engine task");
    assert_eq!(code, -1);

    let observed = tombstone::read(&graveyard_path, "stubborn")
        .await
        .expect("own tombstone");
    assert!(observed.died().is_some());
    assert_eq!(observed.exit_code(), Some(-1));
}

#[tokio::test]
async fn verbose_run_still_reports_the_child_code() {
    let graveyard = TempDir::new().expect("tempdir");
    let mut config = config("chatty", graveyard.path());
    config.verbose_level = 1;
    let code = engine::run(config, argv(&["true"])).await;
    assert_eq!(code, 0);
}
