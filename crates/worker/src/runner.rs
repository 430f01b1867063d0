//! The claim → execute → complete loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use velu_contracts::{sanitize_json, JobRecord};
use velu_registry::{TaskContext, TaskRegistry};
use velu_store::{SharedStore, StoreError};

use crate::workspace::{job_workspace, materialize_files, IsolatedEnv};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub lease_seconds: i64,
    pub poll_interval: Duration,
    pub workspace_base: PathBuf,
    /// Tenanted deployments refuse jobs without an org.
    pub require_org: bool,
    /// Optional pause right after claiming, for observing `working` state.
    pub hold_after_claim: Option<Duration>,
    /// Test mode disables the debug hold.
    pub test_mode: bool,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, workspace_base: PathBuf) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease_seconds: 300,
            poll_interval: Duration::from_millis(100),
            workspace_base,
            require_org: false,
            hold_after_claim: None,
            test_mode: false,
        }
    }

    /// `VELU_WORKER_ID`, falling back to `<hostname>:<pid>`.
    pub fn default_worker_id() -> String {
        if let Ok(wid) = std::env::var("VELU_WORKER_ID") {
            let wid = wid.trim().to_string();
            if !wid.is_empty() {
                return wid;
            }
        }
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "host".to_string());
        format!("{host}:{}", std::process::id())
    }
}

pub struct Worker {
    store: SharedStore,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(store: SharedStore, registry: Arc<TaskRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Poll forever. Returns only on a store error during claim that
    /// persists past the poll backoff (logged and retried otherwise).
    pub async fn run(&self) {
        info!(worker_id = %self.config.worker_id, "worker online");
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.config.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "claim failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Claim and process at most one job. Returns whether one was claimed.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let Some(job) = self
            .store
            .claim_one(&self.config.worker_id, self.config.lease_seconds)
            .await?
        else {
            return Ok(false);
        };

        debug!(job_id = %job.id, task = %job.task, "claimed job");

        if !self.config.test_mode {
            if let Some(hold) = self.config.hold_after_claim {
                tokio::time::sleep(hold).await;
            }
        }

        self.process(job).await;
        Ok(true)
    }

    async fn process(&self, job: JobRecord) {
        let job_id = job.id;
        match self.execute(&job).await {
            Ok(result) => {
                if let Err(err) = self.store.finish(job_id, sanitize_json(&result)).await {
                    error!(job_id = %job_id, error = %err, "finish failed");
                } else {
                    info!(job_id = %job_id, "done");
                }
            }
            Err(failure) => {
                if let Err(err) = self.store.fail(job_id, sanitize_json(&failure)).await {
                    error!(job_id = %job_id, error = %err, "fail write failed");
                } else {
                    warn!(job_id = %job_id, "job failed");
                }
            }
        }
    }

    /// Run the job's handler. `Ok` is a result to finish with; `Err` is an
    /// error document to fail with.
    async fn execute(&self, job: &JobRecord) -> Result<Value, Value> {
        let task = job.task.trim().to_string();

        // Unknown tasks complete "successfully" with an error marker: there
        // is nothing to retry, and the submitter should see why.
        if !self.registry.contains(&task) {
            return Ok(json!({"ok": false, "error": format!("unknown task: {task}")}));
        }

        let (ws, tmp) = job_workspace(job, &self.config.workspace_base, self.config.require_org)
            .map_err(|e| {
                json!({
                    "error": e.to_string(),
                    "trace": format!("workspace setup for job {}", job.id),
                    "job_id": job.id.to_string(),
                })
            })?;

        let payload = job
            .payload
            .as_object()
            .cloned()
            .unwrap_or_else(Map::new);
        let ctx = TaskContext::new(payload).with_workspace(ws.clone());

        let registry = Arc::clone(&self.registry);
        let task_for_handler = task.clone();
        let ws_for_handler = ws.clone();
        let tmp_for_handler = tmp.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let _iso = IsolatedEnv::enter(&ws_for_handler, &tmp_for_handler)
                .map_err(|e| format!("isolation setup failed: {e}"))?;
            let handler = registry
                .get(&task_for_handler)
                .ok_or_else(|| format!("unknown task: {task_for_handler}"))?;
            handler(&ctx).map_err(|e| e.to_string())
        })
        .await;

        let handler_result = match outcome {
            Ok(res) => res,
            Err(join_err) => Err(format!("handler panicked: {join_err}")),
        };

        match handler_result {
            Ok(value) => {
                let mut result = match value {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("ok".to_string(), Value::Bool(true));
                        map.insert("data".to_string(), other);
                        map
                    }
                };

                let wrote = match materialize_files(&ws, result.get("files")) {
                    Ok(wrote) => wrote,
                    Err(e) => {
                        return Err(json!({
                            "error": format!("materialize failed: {e}"),
                            "trace": format!("{task} materialize for job {}", job.id),
                            "job_id": job.id.to_string(),
                        }))
                    }
                };
                result.insert("wrote".to_string(), json!(wrote));
                result.insert("cwd".to_string(), json!(ws.to_string_lossy()));

                attach_result_meta(&mut result, job, &self.config.worker_id);
                Ok(Value::Object(result))
            }
            Err(message) => Err(json!({
                "error": message,
                "trace": format!("{task} handler failed for job {}", job.id),
                "job_id": job.id.to_string(),
            })),
        }
    }
}

/// Stamp attribution into the result document so downstream artifacts stay
/// auditable even when a handler forgets to include it. Never overwrites a
/// meta object the handler set itself, and never fails the job.
fn attach_result_meta(result: &mut Map<String, Value>, job: &JobRecord, worker_id: &str) {
    if result.get("_velu_meta").map(Value::is_object).unwrap_or(false) {
        return;
    }
    let mut meta = Map::new();
    if let Some(org_id) = job.org_id {
        meta.insert("org_id".to_string(), json!(org_id.to_string()));
    }
    if let Some(project_id) = job.project_id {
        meta.insert("project_id".to_string(), json!(project_id.to_string()));
    }
    if let Some(actor_type) = &job.actor_type {
        meta.insert("actor_type".to_string(), json!(actor_type));
    }
    if let Some(actor_id) = &job.actor_id {
        meta.insert("actor_id".to_string(), json!(actor_id));
    }
    if let Some(claimed_by) = &job.claimed_by {
        meta.insert("claimed_by".to_string(), json!(claimed_by));
    }
    meta.insert("job_id".to_string(), json!(job.id.to_string()));
    meta.insert("worker_id".to_string(), json!(worker_id));
    result.insert("_velu_meta".to_string(), Value::Object(meta));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use velu_contracts::JobStatus;
    use velu_store::MemoryStore;

    fn test_worker(store: SharedStore) -> Worker {
        let base = std::env::temp_dir()
            .join("velu-runner-tests")
            .join(uuid::Uuid::now_v7().to_string());
        let mut config = WorkerConfig::new("w-test", base);
        config.test_mode = true;
        Worker::new(store, Arc::new(TaskRegistry::builtin()), config)
    }

    fn queued(task: &str, payload: Value) -> JobRecord {
        JobRecord::queued(
            task,
            payload,
            0,
            None,
            None,
            Some("api_key".to_string()),
            Some("key-1".to_string()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn echo_job_runs_to_done() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let worker = test_worker(Arc::clone(&store));
        let id = store
            .enqueue(queued("echo", json!({"msg": "hi"})))
            .await
            .unwrap();

        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        let result = job.result.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["data"]["msg"], "hi");
        assert_eq!(result["_velu_meta"]["worker_id"], "w-test");
        assert_eq!(result["_velu_meta"]["claimed_by"], "w-test");
        assert_eq!(result["_velu_meta"]["actor_id"], "key-1");
        assert!(result["cwd"].as_str().unwrap().contains("local"));
    }

    #[tokio::test]
    async fn unknown_task_finishes_with_error_marker() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let worker = test_worker(Arc::clone(&store));
        let id = store.enqueue(queued("nope", json!({}))).await.unwrap();

        worker.run_once().await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        let result = job.result.unwrap();
        assert_eq!(result["ok"], false);
        assert_eq!(result["error"], "unknown task: nope");
    }

    #[tokio::test]
    async fn handler_error_fails_the_job() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let worker = test_worker(Arc::clone(&store));
        // pipeline_waiter without parent_job returns Err
        let id = store
            .enqueue(queued("pipeline_waiter", json!({})))
            .await
            .unwrap();

        worker.run_once().await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        let error = job.error.unwrap();
        assert!(error["error"].as_str().unwrap().contains("parent_job"));
        assert!(error["trace"].as_str().unwrap().contains("pipeline_waiter"));
    }

    #[tokio::test]
    async fn scaffold_files_are_written_into_workspace() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let worker = test_worker(Arc::clone(&store));
        let id = store
            .enqueue(queued("ui_scaffold", json!({"name": "Demo"})))
            .await
            .unwrap();

        worker.run_once().await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        let result = job.result.unwrap();
        let wrote: Vec<String> = result["wrote"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(wrote.contains(&"ui/index.html".to_string()));
        let cwd = PathBuf::from(result["cwd"].as_str().unwrap());
        assert!(cwd.join("ui/index.html").is_file());
    }

    #[tokio::test]
    async fn materialize_failure_fails_the_job() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let base = std::env::temp_dir()
            .join("velu-runner-tests")
            .join(uuid::Uuid::now_v7().to_string());
        let mut registry = TaskRegistry::new();
        // second entry nests under the file the first one wrote, so the
        // directory creation for it cannot succeed
        registry.register("clobber", |_ctx| {
            Ok(json!({
                "ok": true,
                "files": [
                    {"path": "blocker", "content": "x"},
                    {"path": "blocker/child.txt", "content": "y"},
                ],
            }))
        });
        let mut config = WorkerConfig::new("w-test", base);
        config.test_mode = true;
        let worker = Worker::new(Arc::clone(&store), Arc::new(registry), config);

        let id = store.enqueue(queued("clobber", json!({}))).await.unwrap();
        worker.run_once().await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        let error = job.error.unwrap();
        assert!(error["error"]
            .as_str()
            .unwrap()
            .contains("materialize failed"));
        assert!(error["trace"].as_str().unwrap().contains("clobber"));
    }

    #[tokio::test]
    async fn handler_meta_is_not_overwritten() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let base = std::env::temp_dir()
            .join("velu-runner-tests")
            .join(uuid::Uuid::now_v7().to_string());
        let mut registry = TaskRegistry::new();
        registry.register("custom", |_ctx| {
            Ok(json!({"ok": true, "_velu_meta": {"source": "handler"}}))
        });
        let mut config = WorkerConfig::new("w-test", base);
        config.test_mode = true;
        let worker = Worker::new(Arc::clone(&store), Arc::new(registry), config);

        let id = store.enqueue(queued("custom", json!({}))).await.unwrap();
        worker.run_once().await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        let result = job.result.unwrap();
        assert_eq!(result["_velu_meta"]["source"], "handler");
    }
}
