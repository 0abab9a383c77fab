//! Retry and failure propagation tests.
//!
//! These tests verify that failed attempts are retried with feedback, that
//! hung attempts time out, and that a task failing for good takes its
//! dependents down with it without stopping unrelated work.

use autopr::core::{RunStatus, TaskStatus};
use autopr::{Error, RequestOptions};

use crate::fixtures::{
    file_content, plan_completion, test_config, Harness, Script, ScriptedRuntime, REPO,
};

fn partial_plan() -> String {
    plan_completion(
        "Add audit log",
        &[
            ("schema", "create audit schema", &[]),
            ("writer", "write audit entries", &["schema"]),
            ("docs", "document auditing", &[]),
        ],
    )
}

fn partial_runtime() -> ScriptedRuntime {
    ScriptedRuntime::new([
        (
            "create audit schema",
            Script::writes("migrations/001_audit.sql", "CREATE TABLE audit ();\n").failing(10),
        ),
        (
            "write audit entries",
            Script::writes("src/audit.rs", "pub fn record() {}\n"),
        ),
        (
            "document auditing",
            Script::writes("docs/audit.md", "# Auditing\n"),
        ),
    ])
}

/// Test: Failure propagation
/// Given task A that always fails, B depending on A, and independent C
/// When the request is handled
/// Then A is tried 1 + max_retries times, B is never spawned, and the pull
/// request carries only C and names A and B as excluded
#[tokio::test]
async fn test_failed_task_skips_dependents_and_opens_partial_pr() {
    let h = Harness::new(partial_plan(), partial_runtime());

    h.orchestrator
        .handle_request("Record an audit trail", REPO)
        .await
        .expect("partial runs integrate outside strict mode");

    assert_eq!(h.runtime.attempts_of("create audit schema"), 3);
    assert_eq!(h.runtime.attempts_of("write audit entries"), 0);
    assert_eq!(h.runtime.attempts_of("document auditing"), 1);

    let run = h.orchestrator.last_run().unwrap();
    assert_eq!(run.final_status, RunStatus::Partial);
    assert_eq!(run.failed_tasks(), vec!["create audit schema"]);
    assert_eq!(run.skipped_tasks(), vec!["write audit entries"]);
    let skipped = run
        .plan
        .all_tasks()
        .into_iter()
        .find(|t| t.name == "write audit entries")
        .unwrap();
    assert!(matches!(
        &skipped.status,
        TaskStatus::Skipped { reason } if reason.contains("create audit schema")
    ));

    let commits = h.hosting.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].files.len(), 1);
    assert_eq!(file_content(&commits[0], "docs/audit.md"), Some("# Auditing\n"));
    assert!(commits[0].message.contains("Excluded tasks"));

    let body = &h.hosting.pulls()[0].body;
    assert!(body.contains("## Excluded tasks"));
    assert!(body.contains("create audit schema"));
    assert!(body.contains("write audit entries"));
}

/// Test: Strict mode
/// Given the same partial outcome
/// When the request is handled in strict mode
/// Then no branch or pull request is created and the error names the tasks
#[tokio::test]
async fn test_strict_mode_rejects_partial_run() {
    let h = Harness::new(partial_plan(), partial_runtime());

    let err = h
        .orchestrator
        .handle_request_with(
            "Record an audit trail",
            REPO,
            RequestOptions::default().strict(true),
        )
        .await
        .unwrap_err();

    match err {
        Error::PartialRun { failed, skipped } => {
            assert_eq!(failed, vec!["create audit schema"]);
            assert_eq!(skipped, vec!["write audit entries"]);
        }
        other => panic!("expected PartialRun, got {:?}", other),
    }
    assert!(h.hosting.created_branches().is_empty());
    assert!(h.hosting.pulls().is_empty());
    assert_eq!(
        h.orchestrator.last_run().unwrap().final_status,
        RunStatus::Partial
    );
}

#[tokio::test]
async fn test_strict_mode_from_config() {
    let config = autopr::config::Config {
        strict_mode: true,
        ..test_config()
    };
    let h = Harness::with_config(partial_plan(), partial_runtime(), config);

    let err = h
        .orchestrator
        .handle_request("Record an audit trail", REPO)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PartialRun { .. }));
    assert!(h.hosting.pulls().is_empty());
}

/// Test: Total failure
/// Given a single task that always fails
/// When the request is handled
/// Then the run fails and the remote is never touched beyond the probe
#[tokio::test]
async fn test_all_tasks_failing_is_run_failure() {
    let completion = plan_completion("Impossible", &[("1", "do the impossible", &[])]);
    let runtime = ScriptedRuntime::new([(
        "do the impossible",
        Script::writes("x.txt", "x\n").failing(u32::MAX),
    )]);
    let h = Harness::new(completion, runtime);

    let err = h.orchestrator.handle_request("Do it", REPO).await.unwrap_err();

    assert!(matches!(err, Error::RunFailed { ref failed } if failed == &vec!["do the impossible".to_string()]));
    assert_eq!(h.runtime.attempts_of("do the impossible"), 3);
    assert_eq!(h.hosting.calls(), vec!["get_default_branch".to_string()]);
    assert_eq!(
        h.orchestrator.last_run().unwrap().final_status,
        RunStatus::Failure
    );
}

/// Test: Retry with feedback
/// Given a task that fails once
/// When it is retried
/// Then the second attempt's instructions carry the first failure
#[tokio::test]
async fn test_retry_feeds_failure_back_into_instructions() {
    let completion = plan_completion("Fix flake", &[("1", "fix flaky test", &[])]);
    let runtime = ScriptedRuntime::new([(
        "fix flaky test",
        Script::writes("tests/flaky.rs", "#[test]\nfn stable() {}\n").failing(1),
    )]);
    let h = Harness::new(completion, runtime);

    h.orchestrator.handle_request("Fix the flaky test", REPO).await.unwrap();

    assert_eq!(
        h.runtime.spawned(),
        vec![
            ("fix flaky test".to_string(), 1),
            ("fix flaky test".to_string(), 2)
        ]
    );
    let instructions = h.runtime.instructions();
    assert!(!instructions[0].contains("Previous attempts"));
    assert!(instructions[1].contains("## Previous attempts"));
    assert!(instructions[1].contains("fix flaky test broke on attempt 1"));
    assert_eq!(
        h.orchestrator.last_run().unwrap().final_status,
        RunStatus::Success
    );
}

/// Test: Hung attempt
/// Given a task whose first attempt never returns
/// When the task timeout expires
/// Then the attempt counts as failed and the retry succeeds
#[tokio::test]
async fn test_hung_attempt_times_out_and_is_retried() {
    let config = autopr::config::Config {
        task_timeout_secs: 1,
        ..test_config()
    };
    let completion = plan_completion("Speed up", &[("1", "speed up build", &[])]);
    let runtime = ScriptedRuntime::new([(
        "speed up build",
        Script::writes("build.rs", "fn main() {}\n").hanging(1),
    )]);
    let h = Harness::with_config(completion, runtime, config);

    h.orchestrator.handle_request("Make the build faster", REPO).await.unwrap();

    assert_eq!(h.runtime.attempts_of("speed up build"), 2);
    let instructions = h.runtime.instructions();
    assert!(instructions[1].contains("timed out"));
    let commits = h.hosting.commits();
    assert_eq!(file_content(&commits[0], "build.rs"), Some("fn main() {}\n"));
}
