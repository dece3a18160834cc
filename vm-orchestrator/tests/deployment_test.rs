//! Deployment coordinator: fan-out, derived status, subset retry and the
//! per-environment worker cap.

use std::sync::Arc;
use std::time::Duration;
use vm_gateway::fake::FakeGateways;
use vm_gateway::{SubjectKind, TicketDecision};
use vm_orchestrator::test_utils::{deployment, test_gateways, test_service, TEST_ENV};
use vm_orchestrator::{
    derive_status, DeploymentStatus, FailureKind, OrchestratorError, ProvisioningService,
    RequestStatus, RunStatus, RunSubject, RunTrigger,
};

fn names(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("vm-{i:02}")).collect()
}

async fn submit_and_approve(
    service: &ProvisioningService,
    vm_names: &[&str],
    subnet_id: Option<i64>,
) -> String {
    let mut submit = deployment("web-tier", vm_names);
    for vm in &mut submit.vms {
        vm.subnet_id = subnet_id;
    }
    let detail = service
        .submit_deployment(submit)
        .await
        .expect("Failed to submit deployment");
    service
        .approve_deployment(&detail.deployment.id)
        .await
        .expect("Failed to approve deployment");
    detail.deployment.id
}

// ============================================================================
// Submission and approval gates
// ============================================================================

#[tokio::test]
async fn test_submit_creates_ordered_children() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;

    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01", "web-02", "db-01"]))
        .await
        .expect("Failed to submit deployment");

    assert_eq!(detail.deployment.status, DeploymentStatus::PendingApproval);
    assert_eq!(detail.deployment.ticket_key.as_deref(), Some("INFRA-1"));
    let vm_names: Vec<_> = detail.vms.iter().map(|vm| vm.name.as_str()).collect();
    assert_eq!(vm_names, vec!["web-01", "web-02", "db-01"]);
    for (position, vm) in detail.vms.iter().enumerate() {
        assert_eq!(vm.position, position as i64);
        assert_eq!(vm.status, RequestStatus::PendingApproval);
        assert_eq!(vm.deployment_id.as_deref(), Some(detail.deployment.id.as_str()));
        assert_eq!(vm.environment, TEST_ENV);
        assert_eq!(vm.size_tier.as_deref(), Some("S"));
    }
}

#[tokio::test]
async fn test_deployment_size_is_bounded() {
    let service = test_service(test_gateways(None)).await;

    let twenty_one = names(21);
    let refs: Vec<&str> = twenty_one.iter().map(String::as_str).collect();
    let err = service
        .submit_deployment(deployment("too-big", &refs))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ValidationError");

    let err = service
        .submit_deployment(deployment("empty", &[]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ValidationError");

    let err = service
        .submit_deployment(deployment("dupes", &["web-01", "WEB-01"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("more than once"));
}

#[tokio::test]
async fn test_reject_cascades_to_children() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;

    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01", "web-02"]))
        .await
        .expect("Failed to submit deployment");
    let rejected = service
        .reject_deployment(&detail.deployment.id)
        .await
        .expect("Failed to reject deployment");

    assert_eq!(rejected.deployment.status, DeploymentStatus::Rejected);
    assert!(rejected.vms.iter().all(|vm| vm.status == RequestStatus::Rejected));

    let err = service.approve_deployment(&detail.deployment.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));

    service.wait_idle().await;
    assert_eq!(gateways.env(TEST_ENV).clone_count(), 0);
    assert_eq!(
        gateways.tickets().decisions(),
        vec![("INFRA-1".to_string(), TicketDecision::Rejected)]
    );
}

#[tokio::test]
async fn test_children_cannot_be_driven_individually() {
    let gateways = test_gateways(None);
    let service = test_service(gateways).await;

    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01"]))
        .await
        .expect("Failed to submit deployment");
    let child = &detail.vms[0];

    for result in [
        service.approve_request(&child.id).await,
        service.reject_request(&child.id).await,
        service.retry_request(&child.id).await,
    ] {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), "InvalidStateError");
        assert!(err.to_string().contains("belongs to deployment"));
    }
}

// ============================================================================
// Runs
// ============================================================================

#[tokio::test]
async fn test_all_children_succeed() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;

    let id = submit_and_approve(&service, &["web-01", "web-02"], Some(12)).await;
    service.wait_idle().await;

    let detail = service.get_deployment(&id).await.expect("Failed to get deployment");
    assert_eq!(detail.deployment.status, DeploymentStatus::Completed);
    assert!(detail.deployment.completed_at.is_some());
    assert!(detail.deployment.error_message.is_none());
    assert_eq!(detail.deployment.status, derive_status(&detail.vms));

    for vm in &detail.vms {
        assert_eq!(vm.status, RequestStatus::Completed);
        assert!(vm.vm_id.is_some());
        assert!(vm.ip_address.is_some());
        // Children report to the deployment ticket
        assert_eq!(vm.ticket_key.as_deref(), Some("INFRA-1"));
    }
    assert_eq!(gateways.tickets().issue_count(), 1);

    let provisioned: Vec<_> = gateways
        .tickets()
        .comments()
        .into_iter()
        .filter(|(key, body)| key == "INFRA-1" && body.contains("provisioned"))
        .collect();
    assert_eq!(provisioned.len(), 2);

    let runs = service.deployment_runs(&id).await.expect("Failed to list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_one_timeout_leaves_deployment_partially_completed() {
    let gateways = test_gateways(None);
    gateways.env(TEST_ENV).never_ready("web-03");
    let service = test_service(gateways.clone()).await;

    let id = submit_and_approve(&service, &["web-01", "web-02", "web-03"], Some(12)).await;
    service.wait_idle().await;

    let detail = service.get_deployment(&id).await.expect("Failed to get deployment");
    assert_eq!(detail.deployment.status, DeploymentStatus::PartiallyCompleted);
    assert_eq!(detail.deployment.error_message.as_deref(), Some("1/3 VMs failed"));
    assert!(detail.deployment.completed_at.is_some());
    assert_eq!(detail.deployment.status, derive_status(&detail.vms));

    for vm in &detail.vms[..2] {
        assert_eq!(vm.status, RequestStatus::Completed);
        assert!(vm.vm_id.is_some());
        assert!(vm.ip_address.is_some());
    }

    let timed_out = &detail.vms[2];
    assert_eq!(timed_out.status, RequestStatus::ProvisioningFailed);
    assert_eq!(timed_out.error_kind, Some(FailureKind::ReadinessTimeout));
    assert!(timed_out
        .error_message
        .as_deref()
        .is_some_and(|m| m.starts_with("ReadinessTimeout: ")));
    // The VM is left for inspection
    assert!(timed_out.vm_id.is_some());
    assert!(gateways.env(TEST_ENV).deleted().is_empty());
}

#[tokio::test]
async fn test_all_children_failing_fails_the_deployment() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;

    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01", "web-02"]))
        .await
        .expect("Failed to submit deployment");
    gateways.set_unreachable(TEST_ENV, true);
    service
        .approve_deployment(&detail.deployment.id)
        .await
        .expect("Failed to approve deployment");
    service.wait_idle().await;

    let detail = service
        .get_deployment(&detail.deployment.id)
        .await
        .expect("Failed to get deployment");
    assert_eq!(detail.deployment.status, DeploymentStatus::Failed);
    assert_eq!(detail.deployment.error_message.as_deref(), Some("2/2 VMs failed"));
    assert!(detail.deployment.completed_at.is_none());
    assert!(detail
        .vms
        .iter()
        .all(|vm| vm.error_kind == Some(FailureKind::EnvironmentUnavailable)));
}

#[tokio::test]
async fn test_deployment_ticket_outage_is_a_warning() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;

    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01", "web-02"]))
        .await
        .expect("Failed to submit deployment");
    gateways.tickets().set_unavailable(true);
    service
        .approve_deployment(&detail.deployment.id)
        .await
        .expect("Failed to approve deployment");
    service.wait_idle().await;

    let detail = service
        .get_deployment(&detail.deployment.id)
        .await
        .expect("Failed to get deployment");
    assert_eq!(detail.deployment.status, DeploymentStatus::Completed);
    assert!(detail
        .deployment
        .warning_message
        .as_deref()
        .is_some_and(|w| w.starts_with("TicketingUnavailable: ")));
    for vm in &detail.vms {
        assert_eq!(vm.status, RequestStatus::Completed);
        assert!(vm.warning_message.is_some());
    }
}

#[tokio::test]
async fn test_deployment_ticket_opened_once_after_outage() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;
    let tickets = gateways.tickets();
    gateways.env(TEST_ENV).set_clone_delay(Duration::from_millis(200));

    // Down at submission and when the run starts
    tickets.set_unavailable(true);
    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01", "web-02", "web-03"]))
        .await
        .expect("Failed to submit deployment");
    service
        .approve_deployment(&detail.deployment.id)
        .await
        .expect("Failed to approve deployment");

    // Back before any child reaches its ticket step
    tokio::time::sleep(Duration::from_millis(50)).await;
    tickets.set_unavailable(false);
    service.wait_idle().await;

    assert_eq!(tickets.issue_count(), 1);
    let deployment_upserts = tickets
        .upserts()
        .iter()
        .filter(|u| u.subject_kind == SubjectKind::Deployment)
        .count();
    assert_eq!(deployment_upserts, 1);

    let detail = service
        .get_deployment(&detail.deployment.id)
        .await
        .expect("Failed to get deployment");
    assert_eq!(detail.deployment.status, DeploymentStatus::Completed);
    assert_eq!(detail.deployment.ticket_key.as_deref(), Some("INFRA-1"));
    for vm in &detail.vms {
        assert_eq!(vm.ticket_key.as_deref(), Some("INFRA-1"));
        assert!(vm.warning_message.is_none());
    }
    let comments = tickets.comments();
    assert_eq!(comments.iter().filter(|(key, _)| key == "INFRA-1").count(), 3);
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn test_retry_reruns_only_failed_children() {
    let gateways = test_gateways(None);
    gateways.env(TEST_ENV).never_ready("web-03");
    let service = test_service(gateways.clone()).await;

    let id = submit_and_approve(&service, &["web-01", "web-02", "web-03"], Some(12)).await;
    service.wait_idle().await;

    let before = service.get_deployment(&id).await.expect("Failed to get deployment");
    assert_eq!(before.deployment.status, DeploymentStatus::PartiallyCompleted);
    let completed_before: Vec<_> = before.vms[..2].to_vec();

    gateways.env(TEST_ENV).clear_failures();
    let retried = service.retry_deployment(&id).await.expect("Failed to retry deployment");
    assert_eq!(retried.deployment.status, DeploymentStatus::Provisioning);
    assert_eq!(retried.deployment.attempt, 1);
    assert!(retried.deployment.error_message.is_none());
    service.wait_idle().await;

    let after = service.get_deployment(&id).await.expect("Failed to get deployment");
    assert_eq!(after.deployment.status, DeploymentStatus::Completed);
    assert!(after.deployment.error_message.is_none());
    assert_eq!(after.deployment.status, derive_status(&after.vms));

    // Completed children are untouched, field for field
    assert_eq!(&after.vms[..2], completed_before.as_slice());

    let recovered = &after.vms[2];
    assert_eq!(recovered.status, RequestStatus::Completed);
    assert_eq!(recovered.attempt, 1);
    assert_ne!(recovered.vm_id, before.vms[2].vm_id);
    assert!(recovered.error_kind.is_none());

    let env = gateways.env(TEST_ENV);
    assert_eq!(env.clone_count_for("web-01"), 1);
    assert_eq!(env.clone_count_for("web-02"), 1);
    assert_eq!(env.clone_count_for("web-03"), 2);

    // The retried child gave its first address back before taking a new one
    assert_eq!(gateways.addresses().held().len(), 3);
    assert_eq!(gateways.addresses().released().len(), 1);

    assert!(gateways
        .tickets()
        .comments()
        .iter()
        .any(|(_, body)| body == "Retrying provisioning for 1 failed VM(s)"));

    let runs = service.deployment_runs(&id).await.expect("Failed to list runs");
    let triggers: Vec<_> = runs.iter().map(|r| (r.triggered_by, r.status)).collect();
    assert_eq!(
        triggers,
        vec![
            (RunTrigger::Approval, RunStatus::Failed),
            (RunTrigger::Retry, RunStatus::Succeeded)
        ]
    );
}

#[tokio::test]
async fn test_retry_requires_a_failed_outcome() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;

    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01"]))
        .await
        .expect("Failed to submit deployment");
    let err = service.retry_deployment(&detail.deployment.id).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidStateError");

    service
        .approve_deployment(&detail.deployment.id)
        .await
        .expect("Failed to approve deployment");
    service.wait_idle().await;

    let err = service.retry_deployment(&detail.deployment.id).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidStateError");
    assert!(err.to_string().contains("completed"));
}

#[tokio::test]
async fn test_second_approval_while_running_is_already_running() {
    let gateways = test_gateways(None);
    gateways
        .env(TEST_ENV)
        .set_clone_delay(Duration::from_millis(100));
    let service = test_service(gateways.clone()).await;

    let id = submit_and_approve(&service, &["web-01", "web-02"], None).await;
    let err = service.approve_deployment(&id).await.unwrap_err();
    assert_eq!(err.kind(), "AlreadyRunningError");

    service.wait_idle().await;
    let runs = service.deployment_runs(&id).await.expect("Failed to list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(gateways.env(TEST_ENV).clone_count(), 2);
}

// ============================================================================
// Worker cap
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_cap_bounds_provisioning_children() {
    const CAP: usize = 3;

    let gateways = Arc::new(FakeGateways::new().with_environment(TEST_ENV, Some(CAP)));
    gateways
        .env(TEST_ENV)
        .set_clone_delay(Duration::from_millis(20));
    let service = test_service(gateways.clone()).await;

    let twenty = names(20);
    let refs: Vec<&str> = twenty.iter().map(String::as_str).collect();
    let id = submit_and_approve(&service, &refs, None).await;

    // Sample the persisted statuses while the run is in flight
    let mut peak = 0;
    while service.scheduler().active() > 0 {
        let detail = service.get_deployment(&id).await.expect("Failed to get deployment");
        let provisioning = detail
            .vms
            .iter()
            .filter(|vm| vm.status == RequestStatus::Provisioning)
            .count();
        assert!(provisioning <= CAP, "{provisioning} children provisioning at once");
        peak = peak.max(provisioning);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    service.wait_idle().await;

    assert!(peak >= 1);
    let max_active = gateways.env(TEST_ENV).max_active();
    assert!(max_active <= CAP, "{max_active} concurrent builds");

    let detail = service.get_deployment(&id).await.expect("Failed to get deployment");
    assert_eq!(detail.deployment.status, DeploymentStatus::Completed);
    assert_eq!(detail.vms.len(), 20);
    assert!(detail.vms.iter().all(|vm| vm.status == RequestStatus::Completed));
}

#[tokio::test]
async fn test_resume_picks_up_interrupted_deployment() {
    let gateways = test_gateways(None);
    let service = test_service(gateways.clone()).await;
    let store = service.store();

    let detail = service
        .submit_deployment(deployment("web-tier", &["web-01", "web-02"]))
        .await
        .expect("Failed to submit deployment");
    let id = detail.deployment.id.clone();

    // Approved and started, one child finished before the restart
    store.approve_deployment(&id).await.expect("Failed to approve");
    let attempt = store.start_deployment(&id).await.expect("Failed to start");
    let crashed_run = store
        .start_run(RunSubject::Deployment, &id, RunTrigger::Approval, attempt)
        .await
        .expect("Failed to start run");
    let first = &detail.vms[0];
    let attempt = store.start_request(&first.id).await.expect("Failed to start child");
    store
        .complete_request(&first.id, attempt, None)
        .await
        .expect("Failed to complete child");

    let report = service.reconcile().await.expect("Failed to reconcile");
    assert_eq!(report.deployments, 1);
    assert_eq!(report.requests, 0);
    service.wait_idle().await;

    let detail = service.get_deployment(&id).await.expect("Failed to get deployment");
    assert_eq!(detail.deployment.status, DeploymentStatus::Completed);
    let env = gateways.env(TEST_ENV);
    assert_eq!(env.clone_count_for("web-01"), 0);
    assert_eq!(env.clone_count_for("web-02"), 1);

    let runs = service.deployment_runs(&id).await.expect("Failed to list runs");
    assert_eq!(runs.len(), 2);
    for run in &runs {
        assert!(run.finished_at.is_some());
        if run.id == crashed_run {
            assert_eq!(run.status, RunStatus::Failed);
            assert_eq!(run.error.as_deref(), Some("interrupted by a restart"));
        } else {
            assert_eq!(run.triggered_by, RunTrigger::Resume);
            assert_eq!(run.status, RunStatus::Succeeded);
        }
    }
}
