//! Unit tests for cycle planning

use crate::reconciler::plan::*;
use crate::test_utils::{at, request_annotation, test_deployment, test_spec};
use crds::{
    record_handled, reasons, Condition, ConditionStatus, KluctlDeploymentStatus, ManualRequest, RequestKind,
};
use results::CommandResultSummary;
use std::time::Duration;

fn reconciled_status(last: i64, generation: i64) -> KluctlDeploymentStatus {
    KluctlDeploymentStatus {
        observed_generation: generation,
        last_reconcile_time: Some(at(last)),
        last_objects_hash: "hash-1".to_string(),
        last_deploy_result: Some(deploy_summary(last, 0)),
        last_validate_time: Some(at(last)),
        ..Default::default()
    }
}

fn deploy_summary(start: i64, errors: usize) -> CommandResultSummary {
    let mut s = CommandResultSummary {
        errors,
        ..Default::default()
    };
    s.command_info.start_time = at(start);
    s.command_info.command = "deploy".to_string();
    s
}

#[test]
fn test_first_run() {
    let obj = test_deployment("r1", test_spec());
    let plan = plan_cycle(&obj, at(0)).unwrap();
    assert!(plan.should_run());
    assert!(plan.has_trigger(Trigger::FirstRun));
    assert!(plan.requests.is_empty());
}

#[test]
fn test_nothing_due() {
    let mut obj = test_deployment("r1", test_spec());
    obj.status = Some(reconciled_status(0, 1));
    let plan = plan_cycle(&obj, at(60)).unwrap();
    assert!(!plan.should_run());
    assert_eq!(next_requeue(&obj.spec, obj.status.as_ref().unwrap(), at(60)).unwrap(), Duration::from_secs(240));
}

#[test]
fn test_interval_elapsed() {
    let mut obj = test_deployment("r1", test_spec());
    obj.status = Some(reconciled_status(0, 1));
    let plan = plan_cycle(&obj, at(300)).unwrap();
    assert!(plan.has_trigger(Trigger::IntervalElapsed));
    assert!(plan.has_trigger(Trigger::ValidateIntervalElapsed));
    assert!(!plan.has_trigger(Trigger::GenerationChanged));
}

#[test]
fn test_generation_changed() {
    let mut obj = test_deployment("r1", test_spec());
    obj.metadata.generation = Some(2);
    obj.status = Some(reconciled_status(0, 1));
    let plan = plan_cycle(&obj, at(10)).unwrap();
    assert_eq!(plan.triggers, vec![Trigger::GenerationChanged]);
}

#[test]
fn test_failed_cycle_uses_retry_interval() {
    let mut spec = test_spec();
    spec.retry_interval = Some("30s".to_string());
    let mut obj = test_deployment("r1", spec);
    let mut status = reconciled_status(0, 1);
    status.conditions.push(Condition::ready(
        ConditionStatus::False,
        reasons::PREPARE_FAILED,
        "render failed",
        Some(1),
        at(0),
    ));
    obj.status = Some(status);

    assert!(!plan_cycle(&obj, at(29)).unwrap().should_run());
    assert!(plan_cycle(&obj, at(30)).unwrap().has_trigger(Trigger::IntervalElapsed));
    assert_eq!(
        next_requeue(&obj.spec, obj.status.as_ref().unwrap(), at(10)).unwrap(),
        Duration::from_secs(20)
    );
}

#[test]
fn test_deploy_and_validate_intervals() {
    let mut spec = test_spec();
    spec.interval = "10m".to_string();
    spec.deploy_interval = Some("1m".to_string());
    spec.validate_interval = Some("never".to_string());
    let mut obj = test_deployment("r1", spec);
    obj.status = Some(reconciled_status(0, 1));

    let plan = plan_cycle(&obj, at(60)).unwrap();
    assert_eq!(plan.triggers, vec![Trigger::DeployIntervalElapsed]);
    assert_eq!(
        next_requeue(&obj.spec, obj.status.as_ref().unwrap(), at(30)).unwrap(),
        Duration::from_secs(30)
    );
}

#[test]
fn test_manual_request_channels_are_independent() {
    let mut obj = test_deployment("r1", test_spec());
    let mut status = reconciled_status(0, 1);
    status.set_request_result(
        RequestKind::Diff,
        record_handled(None, ManualRequest::new("d1"), at(0), at(0), "rid", None, None),
    );
    obj.status = Some(status);
    obj.metadata.annotations = Some(
        [
            request_annotation(RequestKind::Diff, "d1"),
            request_annotation(RequestKind::Deploy, "p1"),
        ]
        .into_iter()
        .collect(),
    );

    let plan = plan_cycle(&obj, at(10)).unwrap();
    assert_eq!(plan.triggers, vec![Trigger::ManualRequest(RequestKind::Deploy)]);
    assert!(plan.request(RequestKind::Diff).is_none());
    assert_eq!(plan.request(RequestKind::Deploy).unwrap().request_value, "p1");
}

#[test]
fn test_abort_on_error_defers_manual_request() {
    let mut spec = test_spec();
    spec.abort_on_error = true;
    let mut obj = test_deployment("r1", spec);
    obj.status = Some(reconciled_status(0, 1));
    obj.metadata.annotations = Some([request_annotation(RequestKind::Deploy, "p1")].into_iter().collect());

    let plan = plan_cycle(&obj, at(10)).unwrap();
    assert!(!plan.should_run());

    // Picked up by the next regular cycle
    let plan = plan_cycle(&obj, at(300)).unwrap();
    assert!(plan.has_trigger(Trigger::IntervalElapsed));
    assert!(!plan.has_trigger(Trigger::ManualRequest(RequestKind::Deploy)));
    assert_eq!(plan.request(RequestKind::Deploy).unwrap().request_value, "p1");
    assert_eq!(decide_deploy(&obj.spec, obj.status.as_ref().unwrap(), &plan, "hash-1"), DeployDecision::Deploy { dry_run: false });
}

#[test]
fn test_invalid_request_is_planned_separately() {
    let mut obj = test_deployment("r1", test_spec());
    obj.status = Some(reconciled_status(0, 1));
    obj.metadata.annotations = Some(
        [(RequestKind::Prune.annotation().to_string(), "{broken".to_string())]
            .into_iter()
            .collect(),
    );

    let plan = plan_cycle(&obj, at(10)).unwrap();
    assert!(!plan.should_run());
    assert_eq!(plan.invalid_requests.len(), 1);
    assert_eq!(plan.invalid_requests[0].0, RequestKind::Prune);
    assert_eq!(plan.invalid_requests[0].1, "{broken");
}

#[test]
fn test_decide_deploy() {
    let spec = test_spec();
    let status = reconciled_status(0, 1);
    let idle = CyclePlan {
        triggers: vec![Trigger::IntervalElapsed],
        ..Default::default()
    };

    assert_eq!(decide_deploy(&spec, &status, &idle, "hash-1"), DeployDecision::Skip);
    assert_eq!(decide_deploy(&spec, &status, &idle, "hash-2"), DeployDecision::Deploy { dry_run: false });

    let mut failed = status.clone();
    failed.last_deploy_result = Some(deploy_summary(0, 2));
    assert_eq!(decide_deploy(&spec, &failed, &idle, "hash-1"), DeployDecision::Deploy { dry_run: false });

    let requested = CyclePlan {
        triggers: vec![Trigger::ManualRequest(RequestKind::Deploy)],
        requests: vec![(RequestKind::Deploy, ManualRequest::new("t"))],
        ..Default::default()
    };
    assert_eq!(decide_deploy(&spec, &status, &requested, "hash-1"), DeployDecision::Deploy { dry_run: false });

    let mut dry = spec.clone();
    dry.dry_run = true;
    assert_eq!(decide_deploy(&dry, &status, &idle, "hash-2"), DeployDecision::Deploy { dry_run: true });
}

#[test]
fn test_decide_deploy_manual_gate() {
    let mut spec = test_spec();
    spec.manual = true;
    let status = KluctlDeploymentStatus::default();
    let first = CyclePlan {
        triggers: vec![Trigger::FirstRun],
        ..Default::default()
    };

    assert_eq!(decide_deploy(&spec, &status, &first, "hash-1"), DeployDecision::AwaitApproval);

    spec.manual_objects_hash = Some("stale".to_string());
    assert_eq!(decide_deploy(&spec, &status, &first, "hash-1"), DeployDecision::AwaitApproval);

    spec.manual_objects_hash = Some("hash-1".to_string());
    assert_eq!(decide_deploy(&spec, &status, &first, "hash-1"), DeployDecision::Deploy { dry_run: false });
}

#[test]
fn test_overrides_patch_from_first_request() {
    let mut with_patch = ManualRequest::new("p1");
    with_patch.overrides_patch = Some(serde_json::json!({"args": {"a": "b"}}));
    let plan = CyclePlan {
        requests: vec![(RequestKind::Reconcile, ManualRequest::new("r1")), (RequestKind::Deploy, with_patch)],
        ..Default::default()
    };
    assert_eq!(plan.overrides_patch(), Some(&serde_json::json!({"args": {"a": "b"}})));
}
