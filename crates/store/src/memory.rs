//! In-memory store.
//!
//! Single-node backend for local runs and tests. One lock serializes claim
//! races, standing in for the row locking a real database provides; every
//! other semantic matches the Postgres backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use velu_contracts::{JobRecord, JobStatus};
use velu_core::{ApiKeyId, JobId, OrgId, Plan, ProjectId};

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{ApiKeyRecord, NewApiKey, OrgRecord, ProjectRecord};

#[derive(Debug, Clone)]
struct StoredKey {
    record: ApiKeyRecord,
    hashed_key: String,
}

#[derive(Debug, Default)]
struct Inner {
    orgs: HashMap<OrgId, OrgRecord>,
    projects: HashMap<ProjectId, ProjectRecord>,
    keys: HashMap<ApiKeyId, StoredKey>,
    jobs: HashMap<JobId, JobRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    require_org: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Multi-tenant variant: refuses jobs without org attribution, the same
    /// way the Postgres backend does.
    pub fn tenanted() -> Self {
        Self {
            require_org: true,
            ..Self::default()
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_org(
        &self,
        slug: &str,
        name: &str,
        plan: Plan,
    ) -> Result<OrgRecord, StoreError> {
        let mut inner = self.write();
        if inner.orgs.values().any(|o| o.slug == slug) {
            return Err(StoreError::SlugTaken);
        }
        let org = OrgRecord {
            id: OrgId::new(),
            slug: slug.to_string(),
            name: name.to_string(),
            plan,
            created_at: Utc::now(),
        };
        inner.orgs.insert(org.id, org.clone());
        Ok(org)
    }

    async fn get_org(&self, org_id: OrgId) -> Result<OrgRecord, StoreError> {
        self.read()
            .orgs
            .get(&org_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_orgs(
        &self,
        limit: i64,
        query: Option<&str>,
    ) -> Result<Vec<OrgRecord>, StoreError> {
        let inner = self.read();
        let needle = query.map(|q| q.to_ascii_lowercase());
        let mut orgs: Vec<OrgRecord> = inner
            .orgs
            .values()
            .filter(|o| {
                needle
                    .as_deref()
                    .map(|q| {
                        o.slug.to_ascii_lowercase().contains(q)
                            || o.name.to_ascii_lowercase().contains(q)
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        orgs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orgs.truncate(limit.max(0) as usize);
        Ok(orgs)
    }

    async fn update_org_plan(&self, org_id: OrgId, plan: Plan) -> Result<OrgRecord, StoreError> {
        let mut inner = self.write();
        let org = inner.orgs.get_mut(&org_id).ok_or(StoreError::NotFound)?;
        org.plan = plan;
        Ok(org.clone())
    }

    async fn ensure_project(
        &self,
        org_id: OrgId,
        name: &str,
    ) -> Result<ProjectRecord, StoreError> {
        let mut inner = self.write();
        if !inner.orgs.contains_key(&org_id) {
            return Err(StoreError::NotFound);
        }
        if let Some(existing) = inner
            .projects
            .values()
            .find(|p| p.org_id == org_id && p.name == name)
        {
            return Ok(existing.clone());
        }
        let project = ProjectRecord {
            id: ProjectId::new(),
            org_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn project_belongs_to_org(
        &self,
        project_id: ProjectId,
        org_id: OrgId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .read()
            .projects
            .get(&project_id)
            .map(|p| p.org_id == org_id)
            .unwrap_or(false))
    }

    async fn create_api_key(&self, key: NewApiKey) -> Result<ApiKeyRecord, StoreError> {
        let mut inner = self.write();
        if !inner.orgs.contains_key(&key.org_id) {
            return Err(StoreError::NotFound);
        }
        let record = ApiKeyRecord {
            id: ApiKeyId::new(),
            org_id: key.org_id,
            name: key.name,
            scopes: key.scopes,
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
            expires_at: key.expires_at,
        };
        inner.keys.insert(
            record.id,
            StoredKey {
                record: record.clone(),
                hashed_key: key.hashed_key,
            },
        );
        Ok(record)
    }

    async fn list_api_keys(&self, org_id: OrgId) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let inner = self.read();
        let mut keys: Vec<ApiKeyRecord> = inner
            .keys
            .values()
            .filter(|k| k.record.org_id == org_id)
            .map(|k| k.record.clone())
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn revoke_api_key(&self, org_id: OrgId, key_id: ApiKeyId) -> Result<(), StoreError> {
        let mut inner = self.write();
        let key = inner
            .keys
            .get_mut(&key_id)
            .filter(|k| k.record.org_id == org_id)
            .ok_or(StoreError::NotFound)?;
        if key.record.revoked_at.is_none() {
            key.record.revoked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn rotate_api_key(
        &self,
        org_id: OrgId,
        key_id: ApiKeyId,
        hashed_key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKeyRecord, StoreError> {
        let mut inner = self.write();
        let key = inner
            .keys
            .get_mut(&key_id)
            .filter(|k| k.record.org_id == org_id)
            .ok_or(StoreError::NotFound)?;
        key.hashed_key = hashed_key.to_string();
        key.record.revoked_at = None;
        if expires_at.is_some() {
            key.record.expires_at = expires_at;
        }
        Ok(key.record.clone())
    }

    async fn lookup_api_key(
        &self,
        hashed_key: &str,
        touch_after: Duration,
    ) -> Result<Option<(ApiKeyRecord, Plan)>, StoreError> {
        let now = Utc::now();
        let mut inner = self.write();
        let Some(stored) = inner
            .keys
            .values_mut()
            .find(|k| k.hashed_key == hashed_key && k.record.is_active(now))
        else {
            return Ok(None);
        };
        let stale = stored
            .record
            .last_used_at
            .map(|t| now - t >= touch_after)
            .unwrap_or(true);
        if stale {
            stored.record.last_used_at = Some(now);
        }
        let record = stored.record.clone();
        let plan = inner
            .orgs
            .get(&record.org_id)
            .map(|o| o.plan)
            .unwrap_or_default();
        Ok(Some((record, plan)))
    }

    async fn enqueue(&self, job: JobRecord) -> Result<JobId, StoreError> {
        if self.require_org && job.org_id.is_none() {
            return Err(StoreError::AttributionRequired);
        }
        let mut inner = self.write();
        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        let now = Utc::now();
        let mut inner = self.write();
        let mut candidates: Vec<(i32, DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();
        // priority DESC, created_at ASC, id ASC
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.as_uuid().cmp(b.2.as_uuid())));
        let Some((_, _, id)) = candidates.first().copied() else {
            return Ok(None);
        };
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        job.mark_claimed(worker_id, lease_seconds.max(5), now);
        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut inner = self.write();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Working || job.claimed_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.lease_expires_at = Some(now + Duration::seconds(lease_seconds.max(5)));
        job.updated_at = now;
        Ok(true)
    }

    async fn finish(&self, job_id: JobId, result: Value) -> Result<(), StoreError> {
        // Last write wins; a finish for a reclaimed job still lands.
        let mut inner = self.write();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.mark_done(result, Utc::now());
        }
        Ok(())
    }

    async fn fail(&self, job_id: JobId, error: Value) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.mark_failed(error, Utc::now());
        }
        Ok(())
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut inner = self.write();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound)?;
        if job.status != JobStatus::Queued {
            return Err(StoreError::conflict(format!(
                "cannot cancel job in status {}",
                job.status
            )));
        }
        job.mark_cancelled(Utc::now());
        Ok(())
    }

    async fn requeue_expired(&self, limit: i64) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut inner = self.write();
        let mut count = 0u64;
        for job in inner.jobs.values_mut() {
            if count >= limit.max(0) as u64 {
                break;
            }
            if job.status == JobStatus::Working
                && job.lease_expires_at.map(|e| e < now).unwrap_or(false)
            {
                job.mark_requeued(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.read().jobs.get(&job_id).cloned())
    }

    async fn get_job_for_org(
        &self,
        job_id: JobId,
        org_id: OrgId,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .read()
            .jobs
            .get(&job_id)
            .filter(|j| j.org_id == Some(org_id))
            .cloned())
    }

    async fn list_recent_for_org(
        &self,
        org_id: OrgId,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.read();
        let mut jobs: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|j| j.org_id == Some(org_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.read();
        let mut jobs: Vec<JobRecord> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(task: &str, priority: i32, org: Option<OrgId>) -> JobRecord {
        JobRecord::queued(task, json!({}), priority, org, None, None, None, Utc::now())
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_age() {
        let store = MemoryStore::new();
        let low = job("a", 0, None);
        let high = job("b", 5, None);
        let low_id = store.enqueue(low).await.unwrap();
        let high_id = store.enqueue(high).await.unwrap();

        let first = store.claim_one("w", 300).await.unwrap().unwrap();
        assert_eq!(first.id, high_id);
        let second = store.claim_one("w", 300).await.unwrap().unwrap();
        assert_eq!(second.id, low_id);
        assert!(store.claim_one("w", 300).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_sets_working_state() {
        let store = MemoryStore::new();
        let id = store.enqueue(job("t", 0, None)).await.unwrap();
        let claimed = store.claim_one("w1", 300).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Working);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
        assert!(claimed.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_attempt_bump() {
        let store = MemoryStore::new();
        let id = store.enqueue(job("t", 0, None)).await.unwrap();
        store.claim_one("w1", 300).await.unwrap().unwrap();

        // Force the lease into the past.
        {
            let mut inner = store.write();
            let j = inner.jobs.get_mut(&id).unwrap();
            j.lease_expires_at = Some(Utc::now() - Duration::seconds(10));
        }

        let reclaimed = store.claim_one("w2", 300).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn heartbeat_only_for_current_holder() {
        let store = MemoryStore::new();
        let id = store.enqueue(job("t", 0, None)).await.unwrap();
        store.claim_one("w1", 300).await.unwrap().unwrap();

        assert!(store.heartbeat(id, "w1", 300).await.unwrap());
        assert!(!store.heartbeat(id, "w2", 300).await.unwrap());

        store.finish(id, json!({"ok": true})).await.unwrap();
        assert!(!store.heartbeat(id, "w1", 300).await.unwrap());
    }

    #[tokio::test]
    async fn finish_clears_lease_and_sets_result() {
        let store = MemoryStore::new();
        let id = store.enqueue(job("t", 0, None)).await.unwrap();
        store.claim_one("w1", 300).await.unwrap().unwrap();
        store.finish(id, json!({"ok": true})).await.unwrap();

        let done = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert!(done.lease_expires_at.is_none());
        assert!(done.finished_at.is_some());
        assert_eq!(done.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn cancel_only_from_queued() {
        let store = MemoryStore::new();
        let id = store.enqueue(job("t", 0, None)).await.unwrap();
        store.cancel(id).await.unwrap();
        let cancelled = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let id2 = store.enqueue(job("t", 0, None)).await.unwrap();
        store.claim_one("w", 300).await.unwrap();
        let err = store.cancel(id2).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn tenant_scoped_reads() {
        let store = MemoryStore::new();
        let org_a = store.create_org("a", "A", Plan::Base).await.unwrap();
        let org_b = store.create_org("b", "B", Plan::Base).await.unwrap();
        let id = store.enqueue(job("t", 0, Some(org_a.id))).await.unwrap();

        assert!(store.get_job_for_org(id, org_a.id).await.unwrap().is_some());
        assert!(store.get_job_for_org(id, org_b.id).await.unwrap().is_none());
        assert_eq!(store.list_recent_for_org(org_a.id, 10).await.unwrap().len(), 1);
        assert!(store.list_recent_for_org(org_b.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slug_collisions_are_rejected() {
        let store = MemoryStore::new();
        store.create_org("acme", "Acme", Plan::Base).await.unwrap();
        let err = store.create_org("acme", "Other", Plan::Hero).await.unwrap_err();
        assert!(matches!(err, StoreError::SlugTaken));
    }

    #[tokio::test]
    async fn ensure_project_is_idempotent() {
        let store = MemoryStore::new();
        let org = store.create_org("acme", "Acme", Plan::Base).await.unwrap();
        let p1 = store.ensure_project(org.id, "default").await.unwrap();
        let p2 = store.ensure_project(org.id, "default").await.unwrap();
        assert_eq!(p1.id, p2.id);
        assert!(store.project_belongs_to_org(p1.id, org.id).await.unwrap());
    }

    #[tokio::test]
    async fn key_lifecycle_lookup_revoke_rotate() {
        let store = MemoryStore::new();
        let org = store.create_org("acme", "Acme", Plan::Hero).await.unwrap();
        let record = store
            .create_api_key(NewApiKey {
                org_id: org.id,
                name: "builder".to_string(),
                scopes: vec!["jobs:submit".to_string()],
                hashed_key: "hash-1".to_string(),
                expires_at: None,
            })
            .await
            .unwrap();

        let hit = store
            .lookup_api_key("hash-1", Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.0.id, record.id);
        assert_eq!(hit.1, Plan::Hero);

        store.revoke_api_key(org.id, record.id).await.unwrap();
        // idempotent
        store.revoke_api_key(org.id, record.id).await.unwrap();
        assert!(store
            .lookup_api_key("hash-1", Duration::seconds(300))
            .await
            .unwrap()
            .is_none());

        let rotated = store
            .rotate_api_key(org.id, record.id, "hash-2", None)
            .await
            .unwrap();
        assert!(rotated.revoked_at.is_none());
        assert!(store
            .lookup_api_key("hash-1", Duration::seconds(300))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .lookup_api_key("hash-2", Duration::seconds(300))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn tenanted_store_refuses_orgless_jobs() {
        let store = MemoryStore::tenanted();
        let err = store.enqueue(job("t", 0, None)).await.unwrap_err();
        assert!(matches!(err, StoreError::AttributionRequired));

        let org = store.create_org("acme", "Acme", Plan::Base).await.unwrap();
        assert!(store.enqueue(job("t", 0, Some(org.id))).await.is_ok());

        // the untenanted variant keeps accepting them
        assert!(MemoryStore::new()
            .enqueue(job("t", 0, None))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn expired_keys_do_not_resolve() {
        let store = MemoryStore::new();
        let org = store.create_org("acme", "Acme", Plan::Base).await.unwrap();
        store
            .create_api_key(NewApiKey {
                org_id: org.id,
                name: "stale".to_string(),
                scopes: vec![],
                hashed_key: "hash-old".to_string(),
                expires_at: Some(Utc::now() - Duration::seconds(60)),
            })
            .await
            .unwrap();

        assert!(store
            .lookup_api_key("hash-old", Duration::seconds(300))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lookup_touch_is_throttled() {
        let store = MemoryStore::new();
        let org = store.create_org("acme", "Acme", Plan::Base).await.unwrap();
        store
            .create_api_key(NewApiKey {
                org_id: org.id,
                name: "k".to_string(),
                scopes: vec![],
                hashed_key: "h".to_string(),
                expires_at: None,
            })
            .await
            .unwrap();

        let first = store
            .lookup_api_key("h", Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        let touched = first.0.last_used_at.unwrap();

        let second = store
            .lookup_api_key("h", Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.0.last_used_at.unwrap(), touched);
    }

    #[tokio::test]
    async fn requeue_expired_flips_rows_back() {
        let store = MemoryStore::new();
        let id = store.enqueue(job("t", 0, None)).await.unwrap();
        store.claim_one("w", 300).await.unwrap();
        {
            let mut inner = store.write();
            inner.jobs.get_mut(&id).unwrap().lease_expires_at =
                Some(Utc::now() - Duration::seconds(1));
        }
        assert_eq!(store.requeue_expired(10).await.unwrap(), 1);
        let j = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Queued);
        assert!(j.lease_expires_at.is_none());
    }
}
