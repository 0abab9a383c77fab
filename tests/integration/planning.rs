//! Planning rejection tests.
//!
//! A request that cannot be planned must fail before any agent is spawned
//! and before anything is created on the remote.

use autopr::error::PlanningError;
use autopr::Error;

use crate::fixtures::{plan_completion, Harness, Script, ScriptedRuntime, REPO};

fn harness(completion: String) -> Harness {
    Harness::new(
        completion,
        ScriptedRuntime::new([("anything", Script::writes("x.txt", "x\n"))]),
    )
}

fn assert_nothing_happened(h: &Harness) {
    assert_eq!(h.runtime.spawn_count(), 0, "no agent may be spawned");
    assert!(h.hosting.created_branches().is_empty());
    assert!(h.hosting.pulls().is_empty());
    assert!(h.orchestrator.last_run().is_none());
}

/// Test: Empty request
/// Given a request made of whitespace
/// When it is handled
/// Then planning fails with EmptyPlan without calling inference
#[tokio::test]
async fn test_empty_request_is_rejected_before_inference() {
    let h = harness(plan_completion("x", &[("1", "anything", &[])]));

    let err = h.orchestrator.handle_request("   \n\t", REPO).await.unwrap_err();

    assert!(matches!(err, Error::Planning(PlanningError::EmptyPlan)));
    assert_eq!(h.inference.calls(), 0);
    assert!(h.hosting.calls().is_empty());
    assert_nothing_happened(&h);
}

#[tokio::test]
async fn test_malformed_repo_identifier_is_invalid_repo() {
    let h = harness(plan_completion("x", &[("1", "anything", &[])]));

    let err = h
        .orchestrator
        .handle_request("Do something", "not-a-repo")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Planning(PlanningError::InvalidRepo { ref repo, .. }) if repo == "not-a-repo"
    ));
    assert!(h.hosting.calls().is_empty());
    assert_nothing_happened(&h);
}

/// Test: Unresolvable repository
/// Given a well-formed identifier the hosting API does not know
/// When the request is handled
/// Then planning fails with InvalidRepo and no inference happens
#[tokio::test]
async fn test_unknown_repo_is_invalid_repo() {
    let h = harness(plan_completion("x", &[("1", "anything", &[])]));

    let err = h
        .orchestrator
        .handle_request("Do something", "acme/missing")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Planning(PlanningError::InvalidRepo { .. })));
    assert_eq!(h.inference.calls(), 0);
    assert_nothing_happened(&h);
}

#[tokio::test]
async fn test_cyclic_plan_is_rejected() {
    let h = harness(plan_completion(
        "Circular",
        &[("a", "first", &["b"]), ("b", "second", &["a"])],
    ));

    let err = h.orchestrator.handle_request("Loop forever", REPO).await.unwrap_err();

    assert!(matches!(err, Error::Planning(PlanningError::CyclicPlan { .. })));
    assert_nothing_happened(&h);
}

#[tokio::test]
async fn test_unknown_dependency_is_malformed() {
    let h = harness(plan_completion("Dangling", &[("a", "first", &["zzz"])]));

    let err = h.orchestrator.handle_request("Dangle", REPO).await.unwrap_err();

    assert!(matches!(err, Error::Planning(PlanningError::MalformedPlan(_))));
    assert_nothing_happened(&h);
}

#[tokio::test]
async fn test_prose_completion_is_malformed() {
    let h = harness("Sorry, I cannot plan that.".to_string());

    let err = h.orchestrator.handle_request("Do something", REPO).await.unwrap_err();

    assert!(matches!(err, Error::Planning(PlanningError::MalformedPlan(_))));
    assert_nothing_happened(&h);
}

#[tokio::test]
async fn test_plan_without_tasks_is_empty() {
    let h = harness(plan_completion("Nothing", &[]));

    let err = h.orchestrator.handle_request("Do nothing", REPO).await.unwrap_err();

    assert!(matches!(err, Error::Planning(PlanningError::EmptyPlan)));
    assert_eq!(err.stage(), autopr::error::Stage::Planning);
    assert_nothing_happened(&h);
}
