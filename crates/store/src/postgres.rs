//! Postgres-backed store.
//!
//! Claim atomicity comes from `FOR UPDATE SKIP LOCKED` inside a single
//! UPDATE ... FROM CTE, so any number of workers can poll the same table.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use velu_contracts::{JobRecord, JobStatus};
use velu_core::{ApiKeyId, JobId, OrgId, Plan, ProjectId};

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{ApiKeyRecord, NewApiKey, OrgRecord, ProjectRecord};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn org_from_row(row: &PgRow) -> Result<OrgRecord, StoreError> {
    Ok(OrgRecord {
        id: OrgId::from_uuid(row.try_get("id")?),
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        plan: Plan::parse(&row.try_get::<String, _>("plan")?),
        created_at: row.try_get("created_at")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<ProjectRecord, StoreError> {
    Ok(ProjectRecord {
        id: ProjectId::from_uuid(row.try_get("id")?),
        org_id: OrgId::from_uuid(row.try_get("org_id")?),
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn api_key_from_row(row: &PgRow) -> Result<ApiKeyRecord, StoreError> {
    Ok(ApiKeyRecord {
        id: ApiKeyId::from_uuid(row.try_get("id")?),
        org_id: OrgId::from_uuid(row.try_get("org_id")?),
        name: row.try_get("name")?,
        scopes: row.try_get("scopes")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
        revoked_at: row.try_get("revoked_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get("id")?),
        org_id: row
            .try_get::<Option<Uuid>, _>("org_id")?
            .map(OrgId::from_uuid),
        project_id: row
            .try_get::<Option<Uuid>, _>("project_id")?
            .map(ProjectId::from_uuid),
        task: row.try_get("task")?,
        status: JobStatus::parse(&row.try_get::<String, _>("status")?),
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        actor_type: row.try_get("actor_type")?,
        actor_id: row.try_get("actor_id")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

const JOB_COLUMNS: &str = "id, org_id, project_id, task, status, payload, result, error, \
     priority, attempts, actor_type, actor_id, claimed_by, claimed_at, \
     lease_expires_at, created_at, updated_at, finished_at";

#[async_trait]
impl Store for PostgresStore {
    async fn create_org(
        &self,
        slug: &str,
        name: &str,
        plan: Plan,
    ) -> Result<OrgRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO organizations (id, slug, name, plan)
             VALUES ($1, $2, $3, $4)
             RETURNING id, slug, name, plan, created_at",
        )
        .bind(Uuid::now_v7())
        .bind(slug)
        .bind(name)
        .bind(plan.as_str())
        .fetch_one(&self.pool)
        .await?;
        org_from_row(&row)
    }

    async fn get_org(&self, org_id: OrgId) -> Result<OrgRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, slug, name, plan, created_at FROM organizations WHERE id = $1",
        )
        .bind(org_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        org_from_row(&row)
    }

    async fn list_orgs(
        &self,
        limit: i64,
        query: Option<&str>,
    ) -> Result<Vec<OrgRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, slug, name, plan, created_at
               FROM organizations
              WHERE $2::text IS NULL
                 OR slug ILIKE '%' || $2 || '%'
                 OR name ILIKE '%' || $2 || '%'
              ORDER BY created_at DESC
              LIMIT $1",
        )
        .bind(limit)
        .bind(query)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(org_from_row).collect()
    }

    async fn update_org_plan(&self, org_id: OrgId, plan: Plan) -> Result<OrgRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE organizations SET plan = $2
              WHERE id = $1
             RETURNING id, slug, name, plan, created_at",
        )
        .bind(org_id.as_uuid())
        .bind(plan.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        org_from_row(&row)
    }

    async fn ensure_project(
        &self,
        org_id: OrgId,
        name: &str,
    ) -> Result<ProjectRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO projects (id, org_id, name)
             VALUES ($1, $2, $3)
             ON CONFLICT (org_id, name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, org_id, name, created_at",
        )
        .bind(Uuid::now_v7())
        .bind(org_id.as_uuid())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        project_from_row(&row)
    }

    async fn project_belongs_to_org(
        &self,
        project_id: ProjectId,
        org_id: OrgId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM projects WHERE id = $1 AND org_id = $2")
            .bind(project_id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn create_api_key(&self, key: NewApiKey) -> Result<ApiKeyRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO api_keys (id, org_id, name, hashed_key, scopes, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, org_id, name, scopes, created_at, last_used_at, revoked_at, expires_at",
        )
        .bind(Uuid::now_v7())
        .bind(key.org_id.as_uuid())
        .bind(&key.name)
        .bind(&key.hashed_key)
        .bind(&key.scopes)
        .bind(key.expires_at)
        .fetch_one(&self.pool)
        .await?;
        api_key_from_row(&row)
    }

    async fn list_api_keys(&self, org_id: OrgId) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, org_id, name, scopes, created_at, last_used_at, revoked_at, expires_at
               FROM api_keys
              WHERE org_id = $1
              ORDER BY created_at DESC",
        )
        .bind(org_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(api_key_from_row).collect()
    }

    async fn revoke_api_key(&self, org_id: OrgId, key_id: ApiKeyId) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE api_keys SET revoked_at = now()
              WHERE id = $1 AND org_id = $2 AND revoked_at IS NULL",
        )
        .bind(key_id.as_uuid())
        .bind(org_id.as_uuid())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 1 {
            return Ok(());
        }
        // Already revoked is fine; missing is not.
        let exists = sqlx::query("SELECT 1 AS one FROM api_keys WHERE id = $1 AND org_id = $2")
            .bind(key_id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn rotate_api_key(
        &self,
        org_id: OrgId,
        key_id: ApiKeyId,
        hashed_key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKeyRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE api_keys
                SET hashed_key = $1,
                    revoked_at = NULL,
                    expires_at = COALESCE($2, expires_at)
              WHERE id = $3 AND org_id = $4
             RETURNING id, org_id, name, scopes, created_at, last_used_at, revoked_at, expires_at",
        )
        .bind(hashed_key)
        .bind(expires_at)
        .bind(key_id.as_uuid())
        .bind(org_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        api_key_from_row(&row)
    }

    async fn lookup_api_key(
        &self,
        hashed_key: &str,
        touch_after: Duration,
    ) -> Result<Option<(ApiKeyRecord, Plan)>, StoreError> {
        let Some(row) = sqlx::query(
            "SELECT k.id, k.org_id, k.name, k.scopes, k.created_at, k.last_used_at,
                    k.revoked_at, k.expires_at, o.plan
               FROM api_keys k
               JOIN organizations o ON o.id = k.org_id
              WHERE k.revoked_at IS NULL
                AND (k.expires_at IS NULL OR k.expires_at > now())
                AND k.hashed_key = $1
              LIMIT 1",
        )
        .bind(hashed_key)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let record = api_key_from_row(&row)?;
        let plan = Plan::parse(&row.try_get::<String, _>("plan")?);

        sqlx::query(
            "UPDATE api_keys SET last_used_at = now()
              WHERE id = $1
                AND (last_used_at IS NULL
                     OR last_used_at <= now() - ($2::bigint * interval '1 second'))",
        )
        .bind(record.id.as_uuid())
        .bind(touch_after.num_seconds())
        .execute(&self.pool)
        .await?;

        Ok(Some((record, plan)))
    }

    async fn enqueue(&self, job: JobRecord) -> Result<JobId, StoreError> {
        // Tenanted backend: every job must carry its org.
        let Some(org_id) = job.org_id else {
            return Err(StoreError::AttributionRequired);
        };
        let row = sqlx::query(
            "INSERT INTO jobs_v2
                (id, org_id, project_id, task, status, payload, priority, actor_type, actor_id)
             VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(job.id.as_uuid())
        .bind(org_id.as_uuid())
        .bind(job.project_id.map(|p| *p.as_uuid()))
        .bind(&job.task)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.actor_type.as_deref().unwrap_or("api_key"))
        .bind(job.actor_id.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(JobId::from_uuid(row.try_get("id")?))
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        let lease = lease_seconds.max(5);
        let row = sqlx::query(&format!(
            "WITH picked AS (
                SELECT id
                  FROM jobs_v2
                 WHERE status = 'queued'
                    OR (status = 'working'
                        AND lease_expires_at IS NOT NULL
                        AND lease_expires_at < now())
                 ORDER BY priority DESC, created_at ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             UPDATE jobs_v2 j
                SET status = 'working',
                    attempts = COALESCE(attempts, 0) + 1,
                    claimed_by = $1,
                    claimed_at = now(),
                    lease_expires_at = now() + ($2::int * interval '1 second'),
                    updated_at = now()
               FROM picked
              WHERE j.id = picked.id
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id)
        .bind(lease as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE jobs_v2
                SET lease_expires_at = now() + ($3::int * interval '1 second'),
                    updated_at = now()
              WHERE id = $1 AND status = 'working' AND claimed_by = $2",
        )
        .bind(job_id.as_uuid())
        .bind(worker_id)
        .bind(lease_seconds.max(5) as i32)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn finish(&self, job_id: JobId, result: Value) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs_v2
                SET status = 'done',
                    result = $2,
                    error = NULL,
                    finished_at = now(),
                    lease_expires_at = NULL,
                    updated_at = now()
              WHERE id = $1",
        )
        .bind(job_id.as_uuid())
        .bind(&result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: JobId, error: Value) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs_v2
                SET status = 'error',
                    error = $2,
                    finished_at = now(),
                    lease_expires_at = NULL,
                    updated_at = now()
              WHERE id = $1",
        )
        .bind(job_id.as_uuid())
        .bind(&error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE jobs_v2
                SET status = 'cancelled',
                    finished_at = now(),
                    lease_expires_at = NULL,
                    updated_at = now()
              WHERE id = $1 AND status = 'queued'",
        )
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 1 {
            return Ok(());
        }
        let row = sqlx::query("SELECT status FROM jobs_v2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Err(StoreError::NotFound),
            Some(row) => {
                let status: String = row.try_get("status")?;
                Err(StoreError::conflict(format!(
                    "cannot cancel job in status {status}"
                )))
            }
        }
    }

    async fn requeue_expired(&self, limit: i64) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "WITH picked AS (
                SELECT id
                  FROM jobs_v2
                 WHERE status = 'working'
                   AND lease_expires_at IS NOT NULL
                   AND lease_expires_at < now()
                 ORDER BY lease_expires_at ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT $1
             )
             UPDATE jobs_v2 j
                SET status = 'queued',
                    lease_expires_at = NULL,
                    updated_at = now()
               FROM picked
              WHERE j.id = picked.id",
        )
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs_v2 WHERE id = $1 LIMIT 1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job_for_org(
        &self,
        job_id: JobId,
        org_id: OrgId,
    ) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs_v2 WHERE id = $1 AND org_id = $2 LIMIT 1"
        ))
        .bind(job_id.as_uuid())
        .bind(org_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_recent_for_org(
        &self,
        org_id: OrgId,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs_v2
              WHERE org_id = $1
              ORDER BY created_at DESC
              LIMIT $2"
        ))
        .bind(org_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs_v2 ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1 AS one").fetch_one(&self.pool).await?;
        Ok(())
    }
}
