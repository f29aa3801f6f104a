//! Checkpoint-wrapper and resume behaviour, exercised without any container
//! tooling: the compose tool is a fake and step bodies are closures.

use crate::config::{ConfigFile, Settings};
use crate::docker::ComposeTool;
use crate::error::Error;
use crate::orchestrator::Upgrader;
use crate::state::{RunStatus, StateStore, StepStatus};
use std::path::Path;
use tempfile::TempDir;

fn settings(resume: bool) -> Settings {
    let args = crate::args::Args {
        source: Some("./fixtures/db_v14.dump".to_string()),
        version: Some("16.0".to_string()),
        resume,
        ..crate::args::Args::default()
    };
    Settings::resolve(args, ConfigFile::default()).unwrap()
}

fn upgrader(root: &Path, resume: bool) -> Upgrader {
    Upgrader::with_compose(
        settings(resume),
        root,
        ComposeTool::fake(&["docker", "compose"]),
    )
    .unwrap()
}

#[test]
fn run_step_checkpoints_success() {
    let dir = TempDir::new().unwrap();
    let mut upgrader = upgrader(dir.path(), false);
    upgrader.initialize_state().unwrap();

    let result = upgrader
        .run_step("prepare_environment", true, |_| Ok(42))
        .unwrap();
    assert_eq!(result, Some(42));

    let state = upgrader.state_for_tests().unwrap();
    assert!(state.is_step_completed("prepare_environment"));
    assert_eq!(state.current_step, None);

    let manifest = upgrader.manifest_for_tests();
    assert_eq!(manifest.steps.len(), 1);
    assert_eq!(manifest.steps[0].name, "prepare_environment");
    assert_eq!(manifest.steps[0].status, "success");

    // The step boundary is on disk before anything else happens.
    let store = StateStore::new(dir.path().join("output/run-state.json"));
    let persisted = store.load().unwrap().unwrap();
    assert!(persisted.is_step_completed("prepare_environment"));
}

#[test]
fn run_step_records_failure_and_propagates() {
    let dir = TempDir::new().unwrap();
    let mut upgrader = upgrader(dir.path(), false);
    upgrader.initialize_state().unwrap();

    let err = upgrader
        .run_step("restore_database", true, |_| {
            Err::<(), Error>(Error::NoSqlInArchive)
        })
        .unwrap_err();
    assert!(matches!(err, Error::NoSqlInArchive));

    let state = upgrader.state_for_tests().unwrap();
    assert!(!state.is_step_completed("restore_database"));
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.steps.last().unwrap().status, StepStatus::Failed);
    assert!(state
        .last_error
        .as_deref()
        .unwrap()
        .contains("No SQL dump found"));

    let manifest = upgrader.manifest_for_tests();
    assert_eq!(manifest.steps.last().unwrap().status, "failed");
}

#[test]
fn resumed_runs_skip_completed_steps() {
    let dir = TempDir::new().unwrap();

    // First run completes two steps, then dies.
    {
        let mut first = upgrader(dir.path(), true);
        first.initialize_state().unwrap();
        first
            .run_step("validate_docker_environment", true, |_| Ok(()))
            .unwrap();
        first
            .run_step("validate_source_accessibility", true, |_| Ok(()))
            .unwrap();
    }

    // Second run resumes: completed steps are skipped, not re-executed.
    let mut second = upgrader(dir.path(), true);
    let resumed = second.initialize_state().unwrap();
    assert!(resumed);

    let ran = std::cell::Cell::new(false);
    let result = second
        .run_step("validate_docker_environment", true, |_| {
            ran.set(true);
            Ok(())
        })
        .unwrap();
    assert_eq!(result, None);
    assert!(!ran.get(), "completed step body must not run again");

    // A new step still executes and joins the completed set.
    second
        .run_step("prepare_environment", true, |_| Ok(()))
        .unwrap();

    let state = second.state_for_tests().unwrap();
    assert!(state.is_step_completed("validate_docker_environment"));
    assert!(state.is_step_completed("validate_source_accessibility"));
    assert!(state.is_step_completed("prepare_environment"));

    let manifest = second.manifest_for_tests();
    let skipped: Vec<_> = manifest
        .steps
        .iter()
        .filter(|s| s.status == "skipped")
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(skipped, vec!["validate_docker_environment"]);
}

#[test]
fn steps_that_must_rerun_ignore_the_completed_set() {
    let dir = TempDir::new().unwrap();

    {
        let mut first = upgrader(dir.path(), true);
        first.initialize_state().unwrap();
        first.run_step("wait_for_db", false, |_| Ok(())).unwrap();
    }

    let mut second = upgrader(dir.path(), true);
    second.initialize_state().unwrap();

    let ran = std::cell::Cell::new(false);
    second
        .run_step("wait_for_db", false, |_| {
            ran.set(true);
            Ok(())
        })
        .unwrap();
    assert!(ran.get(), "skip_when_completed=false steps always run");
}

#[test]
fn resume_reuses_the_recorded_run_context() {
    let dir = TempDir::new().unwrap();

    let first_run_id = {
        let mut first = upgrader(dir.path(), true);
        first.initialize_state().unwrap();
        first
            .state_for_tests()
            .unwrap()
            .run_context
            .run_id
            .clone()
    };

    let mut second = upgrader(dir.path(), true);
    second.initialize_state().unwrap();
    assert_eq!(
        second.state_for_tests().unwrap().run_context.run_id,
        first_run_id
    );
}

#[test]
fn interrupt_stops_before_the_step_body() {
    let dir = TempDir::new().unwrap();
    let mut upgrader = upgrader(dir.path(), false);
    upgrader.initialize_state().unwrap();
    upgrader.trigger_interrupt();

    let ran = std::cell::Cell::new(false);
    let err = upgrader
        .run_step("prepare_environment", true, |_| {
            ran.set(true);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::Interrupted));
    assert!(!ran.get());
}
