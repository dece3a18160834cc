//! Conditional writes, attempt fencing and listing in the SQLite store.

use vm_gateway::{Sizing, VmHandle};
use vm_orchestrator::store::Store;
use vm_orchestrator::submit::{NewDeployment, NewVmRequest};
use vm_orchestrator::test_utils::create_test_db;
use vm_orchestrator::{
    DeploymentStatus, FailureKind, OrchestratorError, RequestFilters, RequestStatus, RunStatus,
    RunSubject, RunTrigger,
};

fn new_vm(name: &str) -> NewVmRequest {
    NewVmRequest {
        name: name.to_string(),
        description: Some("test vm".to_string()),
        requestor: "alice".to_string(),
        workload_type: "web".to_string(),
        os_template: "ubuntu-22.04".to_string(),
        size_tier: None,
        sizing: Sizing {
            cpu_cores: 2,
            ram_mb: 2048,
            disk_gb: 40,
        },
        environment: "pve-lab".to_string(),
        subnet_id: Some(3),
    }
}

fn vm_handle(id: &str) -> VmHandle {
    VmHandle {
        vm_id: id.to_string(),
        host: "node-1".to_string(),
    }
}

#[tokio::test]
async fn test_insert_and_get_request() {
    let store = Store::new(create_test_db().await);

    let created = store
        .insert_request(&new_vm("web-01"))
        .await
        .expect("Failed to insert request");

    assert_eq!(created.status, RequestStatus::PendingApproval);
    assert_eq!(created.attempt, 0);
    assert_eq!(created.cpu_cores, 2);
    assert_eq!(created.subnet_id, Some(3));
    assert!(created.is_standalone());

    let fetched = store.get_request(&created.id).await.expect("Failed to get request");
    assert_eq!(fetched, created);

    let missing = store.get_request("missing").await;
    assert!(matches!(missing, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn test_status_writes_are_conditional() {
    let store = Store::new(create_test_db().await);
    let request = store.insert_request(&new_vm("web-01")).await.expect("Failed to insert");

    // Cannot start before approval
    let err = store.start_request(&request.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));

    store.approve_request(&request.id).await.expect("Failed to approve");
    let err = store.approve_request(&request.id).await.unwrap_err();
    assert!(err.to_string().contains("status approved"));
    let err = store.reject_request(&request.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));

    let attempt = store.start_request(&request.id).await.expect("Failed to start");
    assert_eq!(attempt, 0);

    // Restart is only valid from provisioning_failed
    let err = store.restart_request(&request.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));
}

#[tokio::test]
async fn test_pipeline_writes_are_fenced_on_attempt() {
    let store = Store::new(create_test_db().await);
    let request = store.insert_request(&new_vm("web-01")).await.expect("Failed to insert");
    store.approve_request(&request.id).await.expect("Failed to approve");
    let first = store.start_request(&request.id).await.expect("Failed to start");

    store
        .record_address(&request.id, first, Some("10.3.0.10"))
        .await
        .expect("Failed to record address");
    store
        .record_vm(&request.id, first, &vm_handle("100"))
        .await
        .expect("Failed to record VM");
    store
        .fail_request(
            &request.id,
            first,
            Some(FailureKind::ReadinessTimeout),
            "ReadinessTimeout: VM 100 on node-1 was not ready after 600s",
        )
        .await
        .expect("Failed to fail request");

    let failed = store.get_request(&request.id).await.expect("Failed to get");
    assert_eq!(failed.status, RequestStatus::ProvisioningFailed);
    assert_eq!(failed.error_kind, Some(FailureKind::ReadinessTimeout));

    let second = store.restart_request(&request.id).await.expect("Failed to restart");
    assert_eq!(second, first + 1);

    let restarted = store.get_request(&request.id).await.expect("Failed to get");
    assert_eq!(restarted.status, RequestStatus::Provisioning);
    assert!(restarted.vm_id.is_none());
    assert!(restarted.vm_host.is_none());
    assert!(restarted.error_kind.is_none());
    assert!(restarted.error_message.is_none());
    // Released by the next allocation step, not here
    assert_eq!(restarted.ip_address.as_deref(), Some("10.3.0.10"));

    // A stale run can no longer write
    let stale = store.record_vm(&request.id, first, &vm_handle("999")).await;
    assert!(matches!(stale, Err(OrchestratorError::InvalidState(_))));
    let stale = store.complete_request(&request.id, first, None).await;
    assert!(matches!(stale, Err(OrchestratorError::InvalidState(_))));

    store
        .complete_request(&request.id, second, Some("TicketingUnavailable: down"))
        .await
        .expect("Failed to complete request");
    let done = store.get_request(&request.id).await.expect("Failed to get");
    assert_eq!(done.status, RequestStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.warning_message.as_deref(), Some("TicketingUnavailable: down"));

    // Terminal statuses accept no further pipeline writes
    let late = store.fail_request(&request.id, second, None, "late").await;
    assert!(matches!(late, Err(OrchestratorError::InvalidState(_))));
}

#[tokio::test]
async fn test_deployment_gates_cascade() {
    let store = Store::new(create_test_db().await);
    let detail = store
        .insert_deployment(&NewDeployment {
            name: "web tier".to_string(),
            description: None,
            requestor: "alice".to_string(),
            workload_type: "web".to_string(),
            environment: "pve-lab".to_string(),
            vms: vec![new_vm("web-01"), new_vm("web-02")],
        })
        .await
        .expect("Failed to insert deployment");
    let id = detail.deployment.id.clone();

    store.approve_deployment(&id).await.expect("Failed to approve");
    let approved = store.get_deployment_detail(&id).await.expect("Failed to get");
    assert_eq!(approved.deployment.status, DeploymentStatus::Approved);
    assert!(approved.deployment.approved_at.is_some());
    for vm in &approved.vms {
        assert_eq!(vm.status, RequestStatus::Approved);
        assert!(vm.approved_at.is_some());
    }

    let err = store.reject_deployment(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));
    // The failed reject left the children alone
    let children = store.children(&id).await.expect("Failed to list children");
    assert!(children.iter().all(|vm| vm.status == RequestStatus::Approved));

    let err = store.restart_deployment(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));

    store.start_deployment(&id).await.expect("Failed to start");
    store
        .finish_deployment(&id, DeploymentStatus::PartiallyCompleted, Some("1/2 VMs failed"))
        .await
        .expect("Failed to finish");
    let finished = store.get_deployment(&id).await.expect("Failed to get");
    assert!(finished.completed_at.is_some());
    assert_eq!(finished.error_message.as_deref(), Some("1/2 VMs failed"));

    let attempt = store.restart_deployment(&id).await.expect("Failed to restart");
    assert_eq!(attempt, 1);
    let restarted = store.get_deployment(&id).await.expect("Failed to get");
    assert_eq!(restarted.status, DeploymentStatus::Provisioning);
    assert!(restarted.error_message.is_none());
    assert!(restarted.completed_at.is_none());
}

#[tokio::test]
async fn test_list_filters_and_pages() {
    let store = Store::new(create_test_db().await);
    let mut ids = Vec::new();
    for i in 0..5 {
        let request = store
            .insert_request(&new_vm(&format!("web-{i:02}")))
            .await
            .expect("Failed to insert");
        ids.push(request.id);
    }
    store.approve_request(&ids[0]).await.expect("Failed to approve");
    store.reject_request(&ids[1]).await.expect("Failed to reject");

    let pending = RequestFilters {
        status: Some(RequestStatus::PendingApproval),
        ..Default::default()
    };
    assert_eq!(store.count_requests(&pending).await.expect("Failed to count"), 3);

    // Newest first
    let page = store
        .list_requests(&RequestFilters {
            limit: Some(2),
            offset: 0,
            ..Default::default()
        })
        .await
        .expect("Failed to list");
    let names: Vec<_> = page.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["web-04", "web-03"]);

    let rest = store
        .list_requests(&RequestFilters {
            limit: Some(2),
            offset: 4,
            ..Default::default()
        })
        .await
        .expect("Failed to list");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, "web-00");

    let by_requestor = RequestFilters {
        requestor: Some("bob".to_string()),
        ..Default::default()
    };
    assert!(store.list_requests(&by_requestor).await.expect("Failed to list").is_empty());
}

#[tokio::test]
async fn test_runs_record_attempts() {
    let store = Store::new(create_test_db().await);
    let request = store.insert_request(&new_vm("web-01")).await.expect("Failed to insert");

    let run_id = store
        .start_run(RunSubject::Request, &request.id, RunTrigger::Approval, 0)
        .await
        .expect("Failed to start run");
    store.set_run_vm(&run_id, "100").await.expect("Failed to set VM");
    store
        .finish_run(&run_id, RunStatus::Failed, Some("ReadinessTimeout: slow"))
        .await
        .expect("Failed to finish run");

    let runs = store
        .list_runs(RunSubject::Request, &request.id)
        .await
        .expect("Failed to list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].vm_id.as_deref(), Some("100"));
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].triggered_by, RunTrigger::Approval);
    assert!(runs[0].finished_at.is_some());

    let none = store
        .list_runs(RunSubject::Deployment, &request.id)
        .await
        .expect("Failed to list runs");
    assert!(none.is_empty());
}
