//! The `Store` trait: everything the gateway and worker need from storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use velu_contracts::JobRecord;
use velu_core::{ApiKeyId, JobId, OrgId, Plan, ProjectId};

use crate::error::StoreError;
use crate::types::{ApiKeyRecord, NewApiKey, OrgRecord, ProjectRecord};

pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    // ----- orgs & projects -----

    /// Create an org. Slugs are unique; a collision is `SlugTaken`.
    async fn create_org(&self, slug: &str, name: &str, plan: Plan)
        -> Result<OrgRecord, StoreError>;

    async fn get_org(&self, org_id: OrgId) -> Result<OrgRecord, StoreError>;

    /// Newest orgs first; `query` filters by slug/name substring.
    async fn list_orgs(&self, limit: i64, query: Option<&str>)
        -> Result<Vec<OrgRecord>, StoreError>;

    async fn update_org_plan(&self, org_id: OrgId, plan: Plan) -> Result<OrgRecord, StoreError>;

    /// Idempotent by (org, name): returns the existing project if present.
    async fn ensure_project(&self, org_id: OrgId, name: &str)
        -> Result<ProjectRecord, StoreError>;

    async fn project_belongs_to_org(
        &self,
        project_id: ProjectId,
        org_id: OrgId,
    ) -> Result<bool, StoreError>;

    // ----- api keys -----

    async fn create_api_key(&self, key: NewApiKey) -> Result<ApiKeyRecord, StoreError>;

    /// Keys for an org, newest first. Revoked keys are included.
    async fn list_api_keys(&self, org_id: OrgId) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Idempotent: revoking an already-revoked key succeeds quietly.
    /// `NotFound` only when the key does not exist in this org.
    async fn revoke_api_key(&self, org_id: OrgId, key_id: ApiKeyId) -> Result<(), StoreError>;

    /// Swap in a new hash, un-revoke, and optionally extend expiry
    /// (a `None` expiry keeps whatever was there).
    async fn rotate_api_key(
        &self,
        org_id: OrgId,
        key_id: ApiKeyId,
        hashed_key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKeyRecord, StoreError>;

    /// Resolve a presented credential hash to its key and org plan.
    ///
    /// Only active keys resolve. Bumps `last_used_at`, but at most once per
    /// `touch_after` window to keep the hot path read-mostly.
    async fn lookup_api_key(
        &self,
        hashed_key: &str,
        touch_after: Duration,
    ) -> Result<Option<(ApiKeyRecord, Plan)>, StoreError>;

    // ----- jobs -----

    async fn enqueue(&self, job: JobRecord) -> Result<JobId, StoreError>;

    /// Atomically claim one runnable job: queued, or working past its lease.
    /// Highest priority first, then oldest.
    async fn claim_one(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Extend a lease. Returns false when the job is no longer held by
    /// `worker_id` (reclaimed or finished) — the caller lost it.
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool, StoreError>;

    async fn finish(&self, job_id: JobId, result: Value) -> Result<(), StoreError>;

    async fn fail(&self, job_id: JobId, error: Value) -> Result<(), StoreError>;

    /// Cancel a job that has not started; anything else is a `Conflict`.
    async fn cancel(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Housekeeping: push expired `working` rows back to `queued`.
    async fn requeue_expired(&self, limit: i64) -> Result<u64, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Tenant-scoped read: a job in another org reads as absent.
    async fn get_job_for_org(
        &self,
        job_id: JobId,
        org_id: OrgId,
    ) -> Result<Option<JobRecord>, StoreError>;

    async fn list_recent_for_org(
        &self,
        org_id: OrgId,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Global recent listing, used by the legacy (untenanted) mode.
    async fn list_recent(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError>;

    /// Readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}
