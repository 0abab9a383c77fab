//! Integration conflict and rollback tests.
//!
//! Nothing half-built may stay on the remote: a patch conflict or a hosting
//! failure after branch creation deletes the branch again.

use std::sync::Arc;

use autopr::core::{Patch, RunStatus};
use autopr::error::IntegrationError;
use autopr::orchestration::{branch_name, parse_commit_fingerprint, parse_fingerprint, Integrator};
use autopr::Error;

use crate::fixtures::{plan_completion, Harness, Script, ScriptedRuntime, REPO};

fn rival_readmes() -> Harness {
    let completion = plan_completion(
        "Rewrite readme",
        &[("1", "readme for users", &[]), ("2", "readme for admins", &[])],
    );
    let runtime = ScriptedRuntime::new([
        ("readme for users", Script::writes("README.md", "# Widgets for users\n")),
        ("readme for admins", Script::writes("README.md", "# Widgets for admins\n")),
    ]);
    Harness::new(completion, runtime)
}

/// Test: Conflicting patches
/// Given two independent tasks rewriting the same line
/// When their patches are integrated in order
/// Then integration fails with PatchConflict and the branch is deleted
#[tokio::test]
async fn test_conflicting_patches_roll_back_branch() {
    let h = rival_readmes();

    let err = h
        .orchestrator
        .handle_request("Rewrite the readme", REPO)
        .await
        .unwrap_err();

    let run = h.orchestrator.last_run().unwrap();
    let task_ids: Vec<_> = run.plan.all_tasks().iter().map(|t| t.id).collect();
    match err {
        Error::Integration(IntegrationError::PatchConflict { task_id, .. }) => {
            assert!(task_ids.contains(&task_id));
        }
        other => panic!("expected PatchConflict, got {:?}", other),
    }

    let calls = h.hosting.calls();
    assert!(calls.contains(&"create_branch".to_string()));
    assert!(calls.contains(&"delete_branch".to_string()));
    assert!(h.hosting.created_branches().is_empty());
    assert!(h.hosting.commits().is_empty());
    assert!(h.hosting.pulls().is_empty());
    assert!(run.pr_url.is_none());
    assert_eq!(run.final_status, RunStatus::Success);
}

/// Test: Hosting failure after branch creation
/// Given a hosting API that rejects pull request creation
/// When the run is integrated
/// Then the error names the operation and the branch is deleted
#[tokio::test]
async fn test_pull_request_failure_rolls_back_branch() {
    let completion = plan_completion("Add license", &[("1", "add license", &[])]);
    let runtime = ScriptedRuntime::new([("add license", Script::writes("LICENSE", "MIT\n"))]);
    let h = Harness::new(completion, runtime);
    h.hosting.fail_on("open_pull_request");

    let err = h.orchestrator.handle_request("Add a license", REPO).await.unwrap_err();

    match err {
        Error::Integration(IntegrationError::HostingApiFailure { operation, detail }) => {
            assert_eq!(operation, "open_pull_request");
            assert!(detail.contains("exploded"));
        }
        other => panic!("expected HostingApiFailure, got {:?}", other),
    }
    assert_eq!(h.hosting.commits().len(), 1);
    assert!(h.hosting.created_branches().is_empty());
    assert!(h.hosting.pulls().is_empty());
}

#[tokio::test]
async fn test_commit_failure_rolls_back_branch() {
    let completion = plan_completion("Add license", &[("1", "add license", &[])]);
    let runtime = ScriptedRuntime::new([("add license", Script::writes("LICENSE", "MIT\n"))]);
    let h = Harness::new(completion, runtime);
    h.hosting.fail_on("commit");

    let err = h.orchestrator.handle_request("Add a license", REPO).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Integration(IntegrationError::HostingApiFailure { ref operation, .. }) if operation == "commit"
    ));
    assert!(h.hosting.created_branches().is_empty());
}

/// Test: Resuming a run that stopped after its commit
/// Given a run whose branch and commit exist but whose pull request was never
/// opened (rollback could not delete the branch)
/// When the run is integrated again
/// Then the missing pull request is opened on the existing branch
#[tokio::test]
async fn test_reintegration_opens_missing_pull_request() {
    let completion = plan_completion("Add license", &[("1", "add license", &[])]);
    let runtime = ScriptedRuntime::new([("add license", Script::writes("LICENSE", "MIT\n"))]);
    let h = Harness::new(completion, runtime);
    h.hosting.fail_on("open_pull_request");
    h.hosting.fail_on("delete_branch");

    let err = h.orchestrator.handle_request("Add a license", REPO).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Integration(IntegrationError::HostingApiFailure { ref operation, .. }) if operation == "open_pull_request"
    ));
    let run = h.orchestrator.last_run().unwrap();
    assert_eq!(h.hosting.created_branches(), vec![branch_name(&run)]);
    assert!(h.hosting.pulls().is_empty());

    h.hosting.recover("open_pull_request");
    let integrator = Integrator::new(h.hosting.clone(), Arc::new(h.mirror()));
    let url = integrator.integrate(&run).await.expect("pull request should be opened");

    let pulls = h.hosting.pulls();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].url, url);
    assert_eq!(pulls[0].head, branch_name(&run));
    let commits = h.hosting.commits();
    assert_eq!(commits.len(), 1, "the existing commit is reused");
    assert_eq!(
        parse_fingerprint(&pulls[0].body),
        parse_commit_fingerprint(&commits[0].message)
    );
}

/// Test: Branch taken by a different patch set
/// Given a run whose branch already carries a pull request
/// When a different patch set is integrated under the same branch name
/// Then integration fails with BranchExists and the remote is unchanged
#[tokio::test]
async fn test_existing_branch_with_different_patch_set() {
    let completion = plan_completion("Add notice", &[("1", "add notice", &[])]);
    let runtime = ScriptedRuntime::new([("add notice", Script::writes("NOTICE", "Hello\n"))]);
    let h = Harness::new(completion, runtime);
    h.orchestrator.handle_request("Add a notice", REPO).await.unwrap();

    let mut run = h.orchestrator.last_run().unwrap();
    let task_id = run.plan.all_tasks()[0].id;
    run.plan.get_task_mut(&task_id).unwrap().result_patch = Some(Patch::new(
        task_id,
        "diff --git a/NOTICE b/NOTICE\nnew file mode 100644\n--- /dev/null\n+++ b/NOTICE\n@@ -0,0 +1 @@\n+Goodbye\n",
    ));

    let integrator = Integrator::new(h.hosting.clone(), Arc::new(h.mirror()));
    let err = integrator.integrate(&run).await.unwrap_err();

    match err {
        Error::Integration(IntegrationError::BranchExists { branch }) => {
            assert_eq!(branch, branch_name(&run));
        }
        other => panic!("expected BranchExists, got {:?}", other),
    }
    assert_eq!(h.hosting.pulls().len(), 1);
    assert_eq!(h.hosting.commits().len(), 1);
}

/// Test: Nothing to integrate
/// Given tasks that all succeed without changing any file
/// When the run is integrated
/// Then NothingToIntegrate is returned and no branch is created
#[tokio::test]
async fn test_empty_patches_are_nothing_to_integrate() {
    let completion = plan_completion("Review code", &[("1", "review code", &[])]);
    let runtime = ScriptedRuntime::new([("review code", Script::default())]);
    let h = Harness::new(completion, runtime);

    let err = h.orchestrator.handle_request("Review the code", REPO).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Integration(IntegrationError::NothingToIntegrate)
    ));
    assert!(!h.hosting.calls().contains(&"create_branch".to_string()));
    assert!(h.hosting.created_branches().is_empty());
}
