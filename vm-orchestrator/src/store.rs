//! SQLite persistence for requests, deployments and runs.
//!
//! Every status change is a conditional `UPDATE ... WHERE status = ...`. A
//! write that matches no row is reported as [`OrchestratorError::InvalidState`]
//! (or `NotFound` when the row does not exist). Pipeline checkpoints are also
//! fenced on the request's `attempt`, so a stale run can never overwrite the
//! results of a newer one.

use crate::deployment::{Deployment, DeploymentDetail, DeploymentStatus};
use crate::error::{OrchestratorError, Result};
use crate::request::{FailureKind, RequestStatus, VmRequest};
use crate::run::{Run, RunStatus, RunSubject, RunTrigger};
use crate::submit::{NewDeployment, NewVmRequest};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;
use vm_gateway::VmHandle;

#[derive(Debug, Clone, Default)]
pub struct RequestFilters {
    pub status: Option<RequestStatus>,
    pub requestor: Option<String>,
    /// Only requests without a parent deployment.
    pub standalone_only: bool,
    pub limit: Option<i64>,
    pub offset: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentFilters {
    pub status: Option<DeploymentStatus>,
    pub requestor: Option<String>,
    pub limit: Option<i64>,
    pub offset: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------
    // Inserts
    // ---------------------------------------------------------------

    pub async fn insert_request(&self, new: &NewVmRequest) -> Result<VmRequest> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        insert_request_row(&mut tx, &id, None, 0, new).await?;
        tx.commit().await?;

        self.get_request(&id).await
    }

    /// Insert a deployment and all of its children atomically.
    pub async fn insert_deployment(&self, new: &NewDeployment) -> Result<DeploymentDetail> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO deployments (id, name, description, requestor, workload_type, environment, status, attempt, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.requestor)
        .bind(&new.workload_type)
        .bind(&new.environment)
        .bind(DeploymentStatus::PendingApproval)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (position, vm) in new.vms.iter().enumerate() {
            let child_id = Uuid::new_v4().to_string();
            insert_request_row(&mut tx, &child_id, Some(&id), position as i64, vm).await?;
        }
        tx.commit().await?;

        self.get_deployment_detail(&id).await
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub async fn get_request(&self, id: &str) -> Result<VmRequest> {
        let row = sqlx::query_as::<_, VmRequestRow>("SELECT * FROM vm_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("VM request {id}")))?;

        Ok(row.into())
    }

    pub async fn list_requests(&self, filters: &RequestFilters) -> Result<Vec<VmRequest>> {
        let mut query = "SELECT * FROM vm_requests WHERE 1=1".to_string();
        push_request_filters(&mut query, filters);
        query.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<_, VmRequestRow>(&query);
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }
        if let Some(requestor) = &filters.requestor {
            q = q.bind(requestor);
        }
        let rows = q
            .bind(filters.limit.unwrap_or(-1))
            .bind(filters.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(VmRequest::from).collect())
    }

    pub async fn count_requests(&self, filters: &RequestFilters) -> Result<i64> {
        let mut query = "SELECT COUNT(*) FROM vm_requests WHERE 1=1".to_string();
        push_request_filters(&mut query, filters);

        let mut q = sqlx::query_scalar::<_, i64>(&query);
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }
        if let Some(requestor) = &filters.requestor {
            q = q.bind(requestor);
        }
        Ok(q.fetch_one(&self.pool).await?)
    }

    /// Standalone requests in any of `statuses`, oldest first.
    pub async fn standalone_requests_in(&self, statuses: &[RequestStatus]) -> Result<Vec<VmRequest>> {
        let query = format!(
            "SELECT * FROM vm_requests WHERE deployment_id IS NULL AND status IN ({}) ORDER BY created_at, rowid",
            status_list(statuses.iter().map(|s| s.as_str()))
        );
        let rows = sqlx::query_as::<_, VmRequestRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(VmRequest::from).collect())
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Deployment> {
        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {id}")))?;

        Ok(row.into())
    }

    pub async fn get_deployment_detail(&self, id: &str) -> Result<DeploymentDetail> {
        let deployment = self.get_deployment(id).await?;
        let vms = self.children(id).await?;
        Ok(DeploymentDetail { deployment, vms })
    }

    /// Children of a deployment in creation order.
    pub async fn children(&self, deployment_id: &str) -> Result<Vec<VmRequest>> {
        let rows = sqlx::query_as::<_, VmRequestRow>(
            "SELECT * FROM vm_requests WHERE deployment_id = ? ORDER BY position",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(VmRequest::from).collect())
    }

    pub async fn list_deployments(&self, filters: &DeploymentFilters) -> Result<Vec<Deployment>> {
        let mut query = "SELECT * FROM deployments WHERE 1=1".to_string();
        push_deployment_filters(&mut query, filters);
        query.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<_, DeploymentRow>(&query);
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }
        if let Some(requestor) = &filters.requestor {
            q = q.bind(requestor);
        }
        let rows = q
            .bind(filters.limit.unwrap_or(-1))
            .bind(filters.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Deployment::from).collect())
    }

    pub async fn count_deployments(&self, filters: &DeploymentFilters) -> Result<i64> {
        let mut query = "SELECT COUNT(*) FROM deployments WHERE 1=1".to_string();
        push_deployment_filters(&mut query, filters);

        let mut q = sqlx::query_scalar::<_, i64>(&query);
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }
        if let Some(requestor) = &filters.requestor {
            q = q.bind(requestor);
        }
        Ok(q.fetch_one(&self.pool).await?)
    }

    pub async fn deployments_in(&self, statuses: &[DeploymentStatus]) -> Result<Vec<Deployment>> {
        let query = format!(
            "SELECT * FROM deployments WHERE status IN ({}) ORDER BY created_at, rowid",
            status_list(statuses.iter().map(|s| s.as_str()))
        );
        let rows = sqlx::query_as::<_, DeploymentRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Deployment::from).collect())
    }

    // ---------------------------------------------------------------
    // Request transitions
    // ---------------------------------------------------------------

    /// `pending_approval -> approved`
    pub async fn approve_request(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE vm_requests SET status = ?, approved_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(RequestStatus::Approved)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::PendingApproval)
        .execute(&self.pool)
        .await?;

        self.expect_request_change(result, id, "approve").await
    }

    /// `pending_approval -> rejected`
    pub async fn reject_request(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE vm_requests SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(RequestStatus::Rejected)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::PendingApproval)
        .execute(&self.pool)
        .await?;

        self.expect_request_change(result, id, "reject").await
    }

    /// `approved -> provisioning`. Returns the attempt the run executes.
    pub async fn start_request(&self, id: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE vm_requests SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(RequestStatus::Provisioning)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::Approved)
        .execute(&self.pool)
        .await?;

        self.expect_request_change(result, id, "start").await?;
        Ok(self.get_request(id).await?.attempt)
    }

    /// `provisioning_failed -> provisioning` under a new attempt.
    ///
    /// The hypervisor fields and the failure are cleared. The recorded
    /// address stays until the new attempt's allocation step releases it.
    pub async fn restart_request(&self, id: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE vm_requests
             SET status = ?, attempt = attempt + 1, vm_id = NULL, vm_host = NULL,
                 error_kind = NULL, error_message = NULL, warning_message = NULL,
                 completed_at = NULL, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(RequestStatus::Provisioning)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::ProvisioningFailed)
        .execute(&self.pool)
        .await?;

        self.expect_request_change(result, id, "retry").await?;
        Ok(self.get_request(id).await?.attempt)
    }

    /// Outcome of a successful pipeline run.
    pub async fn complete_request(&self, id: &str, attempt: i64, warning: Option<&str>) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE vm_requests
             SET status = ?, warning_message = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND status = ? AND attempt = ?",
        )
        .bind(RequestStatus::Completed)
        .bind(warning)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::Provisioning)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        fenced(result, id, attempt)
    }

    /// Outcome of a failed pipeline run.
    pub async fn fail_request(
        &self,
        id: &str,
        attempt: i64,
        kind: Option<FailureKind>,
        message: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE vm_requests
             SET status = ?, error_kind = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status = ? AND attempt = ?",
        )
        .bind(RequestStatus::ProvisioningFailed)
        .bind(kind)
        .bind(message)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::Provisioning)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        fenced(result, id, attempt)
    }

    // ---------------------------------------------------------------
    // Pipeline checkpoints
    // ---------------------------------------------------------------

    pub async fn record_address(&self, id: &str, attempt: i64, ip: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vm_requests SET ip_address = ?, updated_at = ?
             WHERE id = ? AND status = 'provisioning' AND attempt = ?",
        )
        .bind(ip)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        fenced(result, id, attempt)
    }

    pub async fn record_vm(&self, id: &str, attempt: i64, vm: &VmHandle) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vm_requests SET vm_id = ?, vm_host = ?, updated_at = ?
             WHERE id = ? AND status = 'provisioning' AND attempt = ?",
        )
        .bind(&vm.vm_id)
        .bind(&vm.host)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        fenced(result, id, attempt)
    }

    pub async fn record_ticket(&self, id: &str, attempt: i64, key: &str, url: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vm_requests SET ticket_key = ?, ticket_url = ?, updated_at = ?
             WHERE id = ? AND status = 'provisioning' AND attempt = ?",
        )
        .bind(key)
        .bind(url)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        fenced(result, id, attempt)
    }

    /// Ticket opened at submission time.
    pub async fn set_request_ticket(&self, id: &str, key: &str, url: &str) -> Result<()> {
        sqlx::query("UPDATE vm_requests SET ticket_key = ?, ticket_url = ?, updated_at = ? WHERE id = ?")
            .bind(key)
            .bind(url)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Deployment transitions
    // ---------------------------------------------------------------

    /// `pending_approval -> approved` for the deployment and its children.
    pub async fn approve_deployment(&self, id: &str) -> Result<()> {
        self.gate_deployment(id, DeploymentStatus::Approved, RequestStatus::Approved, "approve")
            .await
    }

    /// `pending_approval -> rejected` for the deployment and its children.
    pub async fn reject_deployment(&self, id: &str) -> Result<()> {
        self.gate_deployment(id, DeploymentStatus::Rejected, RequestStatus::Rejected, "reject")
            .await
    }

    async fn gate_deployment(
        &self,
        id: &str,
        to: DeploymentStatus,
        children_to: RequestStatus,
        action: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let approved_at = (to == DeploymentStatus::Approved).then_some(now);
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE deployments SET status = ?, approved_at = COALESCE(?, approved_at), updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(approved_at)
        .bind(now)
        .bind(id)
        .bind(DeploymentStatus::PendingApproval)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let current = self.get_deployment(id).await?;
            return Err(OrchestratorError::InvalidState(format!(
                "cannot {action} deployment {id} in status {}",
                current.status
            )));
        }

        sqlx::query(
            "UPDATE vm_requests SET status = ?, approved_at = COALESCE(?, approved_at), updated_at = ?
             WHERE deployment_id = ? AND status = ?",
        )
        .bind(children_to)
        .bind(approved_at)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::PendingApproval)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// `approved -> provisioning`
    pub async fn start_deployment(&self, id: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE deployments SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(DeploymentStatus::Provisioning)
        .bind(now)
        .bind(id)
        .bind(DeploymentStatus::Approved)
        .execute(&self.pool)
        .await?;

        self.expect_deployment_change(result, id, "start").await?;
        Ok(self.get_deployment(id).await?.attempt)
    }

    /// `{partially_completed, failed} -> provisioning` under a new attempt.
    pub async fn restart_deployment(&self, id: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE deployments
             SET status = ?, attempt = attempt + 1, error_message = NULL, warning_message = NULL,
                 completed_at = NULL, updated_at = ?
             WHERE id = ? AND status IN ('partially_completed', 'failed')",
        )
        .bind(DeploymentStatus::Provisioning)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.expect_deployment_change(result, id, "retry").await?;
        Ok(self.get_deployment(id).await?.attempt)
    }

    /// Write the derived terminal status of a deployment run.
    pub async fn finish_deployment(
        &self,
        id: &str,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let completed_at = matches!(
            status,
            DeploymentStatus::Completed | DeploymentStatus::PartiallyCompleted
        )
        .then_some(now);

        let result = sqlx::query(
            "UPDATE deployments SET status = ?, error_message = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(status)
        .bind(error_message)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .bind(DeploymentStatus::Provisioning)
        .execute(&self.pool)
        .await?;

        self.expect_deployment_change(result, id, "finish").await
    }

    pub async fn set_deployment_ticket(&self, id: &str, key: &str, url: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET ticket_key = ?, ticket_url = ?, updated_at = ? WHERE id = ?")
            .bind(key)
            .bind(url)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_deployment_warning(&self, id: &str, warning: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE deployments SET warning_message = ?, updated_at = ? WHERE id = ?")
            .bind(warning)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------

    pub async fn start_run(
        &self,
        subject: RunSubject,
        subject_id: &str,
        trigger: RunTrigger,
        attempt: i64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO runs (id, subject_kind, subject_id, triggered_by, status, attempt, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(subject)
        .bind(subject_id)
        .bind(trigger)
        .bind(RunStatus::Running)
        .bind(attempt)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn set_run_vm(&self, run_id: &str, vm_id: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET vm_id = ? WHERE id = ?")
            .bind(vm_id)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_run(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE runs SET status = ?, error = ?, finished_at = ? WHERE id = ?")
            .bind(status)
            .bind(error)
            .bind(Utc::now().timestamp())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fail every run of the subject still marked `running`. Only valid
    /// while no worker of this process owns the subject.
    pub async fn close_interrupted_runs(
        &self,
        subject: RunSubject,
        subject_id: &str,
        error: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, error = ?, finished_at = ?
             WHERE subject_kind = ? AND subject_id = ? AND status = ?",
        )
        .bind(RunStatus::Failed)
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(subject)
        .bind(subject_id)
        .bind(RunStatus::Running)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_runs(&self, subject: RunSubject, subject_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE subject_kind = ? AND subject_id = ? ORDER BY started_at, rowid",
        )
        .bind(subject)
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Run::from).collect())
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    async fn expect_request_change(&self, result: SqliteQueryResult, id: &str, action: &str) -> Result<()> {
        if result.rows_affected() > 0 {
            return Ok(());
        }
        let current = self.get_request(id).await?;
        Err(OrchestratorError::InvalidState(format!(
            "cannot {action} request {id} in status {}",
            current.status
        )))
    }

    async fn expect_deployment_change(&self, result: SqliteQueryResult, id: &str, action: &str) -> Result<()> {
        if result.rows_affected() > 0 {
            return Ok(());
        }
        let current = self.get_deployment(id).await?;
        Err(OrchestratorError::InvalidState(format!(
            "cannot {action} deployment {id} in status {}",
            current.status
        )))
    }
}

fn fenced(result: SqliteQueryResult, id: &str, attempt: i64) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(OrchestratorError::InvalidState(format!(
            "request {id} is no longer provisioning attempt {attempt}"
        )));
    }
    Ok(())
}

fn status_list<'a>(statuses: impl Iterator<Item = &'a str>) -> String {
    statuses
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_request_filters(query: &mut String, filters: &RequestFilters) {
    if filters.status.is_some() {
        query.push_str(" AND status = ?");
    }
    if filters.requestor.is_some() {
        query.push_str(" AND requestor = ?");
    }
    if filters.standalone_only {
        query.push_str(" AND deployment_id IS NULL");
    }
}

fn push_deployment_filters(query: &mut String, filters: &DeploymentFilters) {
    if filters.status.is_some() {
        query.push_str(" AND status = ?");
    }
    if filters.requestor.is_some() {
        query.push_str(" AND requestor = ?");
    }
}

async fn insert_request_row(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    deployment_id: Option<&str>,
    position: i64,
    new: &NewVmRequest,
) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO vm_requests (id, deployment_id, position, name, description, requestor, workload_type,
                                 os_template, size_tier, cpu_cores, ram_mb, disk_gb, environment, subnet_id,
                                 status, attempt, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(id)
    .bind(deployment_id)
    .bind(position)
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.requestor)
    .bind(&new.workload_type)
    .bind(&new.os_template)
    .bind(&new.size_tier)
    .bind(new.sizing.cpu_cores)
    .bind(new.sizing.ram_mb)
    .bind(new.sizing.disk_gb)
    .bind(&new.environment)
    .bind(new.subnet_id)
    .bind(RequestStatus::PendingApproval)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct VmRequestRow {
    id: String,
    deployment_id: Option<String>,
    position: i64,
    name: String,
    description: Option<String>,
    requestor: String,
    workload_type: String,
    os_template: String,
    size_tier: Option<String>,
    cpu_cores: u32,
    ram_mb: u32,
    disk_gb: u32,
    environment: String,
    subnet_id: Option<i64>,
    status: RequestStatus,
    attempt: i64,
    vm_id: Option<String>,
    vm_host: Option<String>,
    ip_address: Option<String>,
    ticket_key: Option<String>,
    ticket_url: Option<String>,
    error_kind: Option<FailureKind>,
    error_message: Option<String>,
    warning_message: Option<String>,
    created_at: i64,
    updated_at: i64,
    approved_at: Option<i64>,
    completed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    name: String,
    description: Option<String>,
    requestor: String,
    workload_type: String,
    environment: String,
    status: DeploymentStatus,
    attempt: i64,
    ticket_key: Option<String>,
    ticket_url: Option<String>,
    error_message: Option<String>,
    warning_message: Option<String>,
    created_at: i64,
    updated_at: i64,
    approved_at: Option<i64>,
    completed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    subject_kind: RunSubject,
    subject_id: String,
    triggered_by: RunTrigger,
    status: RunStatus,
    attempt: i64,
    vm_id: Option<String>,
    error: Option<String>,
    started_at: i64,
    finished_at: Option<i64>,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn optional_timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|ts| DateTime::from_timestamp(ts, 0))
}

impl From<VmRequestRow> for VmRequest {
    fn from(row: VmRequestRow) -> Self {
        Self {
            id: row.id,
            deployment_id: row.deployment_id,
            position: row.position,
            name: row.name,
            description: row.description,
            requestor: row.requestor,
            workload_type: row.workload_type,
            os_template: row.os_template,
            size_tier: row.size_tier,
            cpu_cores: row.cpu_cores,
            ram_mb: row.ram_mb,
            disk_gb: row.disk_gb,
            environment: row.environment,
            subnet_id: row.subnet_id,
            status: row.status,
            attempt: row.attempt,
            vm_id: row.vm_id,
            vm_host: row.vm_host,
            ip_address: row.ip_address,
            ticket_key: row.ticket_key,
            ticket_url: row.ticket_url,
            error_kind: row.error_kind,
            error_message: row.error_message,
            warning_message: row.warning_message,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            approved_at: optional_timestamp(row.approved_at),
            completed_at: optional_timestamp(row.completed_at),
        }
    }
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            requestor: row.requestor,
            workload_type: row.workload_type,
            environment: row.environment,
            status: row.status,
            attempt: row.attempt,
            ticket_key: row.ticket_key,
            ticket_url: row.ticket_url,
            error_message: row.error_message,
            warning_message: row.warning_message,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            approved_at: optional_timestamp(row.approved_at),
            completed_at: optional_timestamp(row.completed_at),
        }
    }
}

impl From<RunRow> for Run {
    fn from(row: RunRow) -> Self {
        Self {
            id: row.id,
            subject_kind: row.subject_kind,
            subject_id: row.subject_id,
            triggered_by: row.triggered_by,
            status: row.status,
            attempt: row.attempt,
            vm_id: row.vm_id,
            error: row.error,
            started_at: timestamp(row.started_at),
            finished_at: optional_timestamp(row.finished_at),
        }
    }
}
