//! Persisted job rows and their wire projection.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use velu_core::{JobId, OrgId, ProjectId};

use crate::envelope::{decode_task_and_payload, loads_json_maybe};
use crate::status::JobStatus;

/// A job row as the store persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub org_id: Option<OrgId>,
    pub project_id: Option<ProjectId>,
    pub task: String,
    pub status: JobStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub priority: i32,
    pub attempts: i32,
    pub actor_type: Option<String>,
    pub actor_id: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a freshly queued row.
    #[allow(clippy::too_many_arguments)]
    pub fn queued(
        task: impl Into<String>,
        payload: Value,
        priority: i32,
        org_id: Option<OrgId>,
        project_id: Option<ProjectId>,
        actor_type: Option<String>,
        actor_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            org_id,
            project_id,
            task: task.into(),
            status: JobStatus::Queued,
            payload,
            result: None,
            error: None,
            priority,
            attempts: 0,
            actor_type,
            actor_id,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Whether a claim pass may pick this row up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Working => self
                .lease_expires_at
                .map(|exp| exp < now)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Transition to `working` under a fresh lease.
    pub fn mark_claimed(&mut self, worker_id: &str, lease_seconds: i64, now: DateTime<Utc>) {
        self.status = JobStatus::Working;
        self.attempts += 1;
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_at = Some(now);
        self.lease_expires_at = Some(now + Duration::seconds(lease_seconds));
        self.updated_at = now;
    }

    /// Terminal success. Clears the lease and any prior error.
    pub fn mark_done(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = JobStatus::Done;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now);
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Terminal failure. Clears the lease.
    pub fn mark_failed(&mut self, error: Value, now: DateTime<Utc>) {
        self.status = JobStatus::Error;
        self.error = Some(error);
        self.finished_at = Some(now);
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Terminal cancellation (only valid from `queued`; callers enforce that).
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(now);
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Put an expired `working` row back in the queue.
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.lease_expires_at = None;
        self.updated_at = now;
    }
}

/// Wire projection of a job row, as read endpoints return it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    pub id: String,
    pub status: JobStatus,
    pub task: Option<String>,
    pub payload: Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<OrgId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobItem {
    pub fn from_record(record: &JobRecord) -> Self {
        let (task, payload) = decode_task_and_payload(
            &Value::String(record.task.clone()),
            Some(&record.payload),
        );
        Self {
            id: record.id.to_string(),
            status: record.status,
            task,
            payload,
            result: record.result.as_ref().map(loads_json_maybe),
            error: record.error.as_ref().map(loads_json_maybe),
            org_id: record.org_id,
            project_id: record.project_id,
            actor_type: record.actor_type.clone(),
            actor_id: record.actor_id.clone(),
            created_at: Some(record.created_at),
            updated_at: Some(record.updated_at),
        }
    }
}
