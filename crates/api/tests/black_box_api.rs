//! Black-box HTTP tests: the real router on an ephemeral port, backed by
//! the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};

use velu_api::app::{build_app, AppState};
use velu_api::config::{AppConfig, Env};
use velu_registry::TaskRegistry;
use velu_store::{MemoryStore, SharedStore};
use velu_worker::{Worker, WorkerConfig};

const ADMIN_KEY: &str = "velu_platform_admin_key_for_tests";

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.env = Env::Test;
    config.store_credentials = true;
    config.admin_key = Some(ADMIN_KEY.to_string());
    config
}

struct TestServer {
    base_url: String,
    store: SharedStore,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: AppConfig) -> Self {
        let store: SharedStore = if config.store_credentials {
            Arc::new(MemoryStore::tenanted())
        } else {
            Arc::new(MemoryStore::new())
        };
        let state = AppState::new(config, store.clone(), TaskRegistry::builtin().names());
        let app = build_app(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            client: reqwest::Client::new(),
            handle,
        }
    }

    async fn run_worker_once(&self) {
        let base = std::env::temp_dir()
            .join("velu-api-tests")
            .join(uuid::Uuid::now_v7().to_string());
        let mut config = WorkerConfig::new("test-worker:1", base);
        config.test_mode = true;
        config.poll_interval = Duration::from_millis(1);
        let worker = Worker::new(self.store.clone(), Arc::new(TaskRegistry::builtin()), config);
        let claimed = worker.run_once().await.expect("worker iteration failed");
        assert!(claimed, "expected a job to be claimed");
    }

    /// Provision an org through the API and return `(org_id, keys)` where
    /// `keys` maps role name to raw key.
    async fn bootstrap(&self, slug: &str, plan: &str) -> (String, Value) {
        let res = self
            .client
            .post(format!("{}/orgs/bootstrap", self.base_url))
            .header("x-api-key", ADMIN_KEY)
            .json(&json!({ "name": slug, "slug": slug, "plan": plan }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["ok"], true);
        let org_id = body["org"]["id"].as_str().unwrap().to_string();
        (org_id, body["keys"].clone())
    }

    async fn submit(&self, key: &str, task: &str, payload: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/tasks", self.base_url))
            .header("x-api-key", key)
            .json(&json!({ "task": task, "payload": payload }))
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn raw_key(keys: &Value, role: &str) -> String {
    keys[role]["raw_key"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_version_are_open() {
    let srv = TestServer::spawn(test_config()).await;

    let res = srv
        .client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["server"], "velu");
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], true);

    let res = srv
        .client
        .get(format!("{}/version", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn submit_then_worker_then_read() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("acme", "hero").await;
    let builder = raw_key(&keys, "builder");

    let res = srv.submit(&builder, "plan", json!({ "idea": "x" })).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], true);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    srv.run_worker_once().await;

    let res = srv
        .client
        .get(format!("{}/results/{}", srv.base_url, job_id))
        .header("x-api-key", &builder)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["item"]["id"], job_id);
    assert_eq!(body["item"]["status"], "done");
    assert_eq!(body["item"]["task"], "plan");
    // attribution survives into the result document
    assert!(body["item"]["result"]["_velu_meta"]["job_id"].is_string());
}

#[tokio::test]
async fn cross_tenant_reads_are_not_found() {
    let srv = TestServer::spawn(test_config()).await;
    let (org_a, keys_a) = srv.bootstrap("org-a", "hero").await;
    let (_org_b, keys_b) = srv.bootstrap("org-b", "hero").await;
    let builder_a = raw_key(&keys_a, "builder");
    let builder_b = raw_key(&keys_b, "builder");

    let res = srv.submit(&builder_a, "echo", json!({ "msg": "hi" })).await;
    assert_eq!(res.status(), StatusCode::OK);
    let job_id = res.json::<Value>().await.unwrap()["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    // owner sees it through the org route
    let res = srv
        .client
        .get(format!("{}/orgs/{}/jobs/{}", srv.base_url, org_a, job_id))
        .header("x-api-key", &builder_a)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // the other tenant gets a 404, not a 403
    let res = srv
        .client
        .get(format!("{}/orgs/{}/jobs/{}", srv.base_url, org_a, job_id))
        .header("x-api-key", &builder_b)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // untenanted read route hides it behind an ok:false envelope
    let res = srv
        .client
        .get(format!("{}/results/{}", srv.base_url, job_id))
        .header("x-api-key", &builder_b)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn scopes_gate_submission_and_reads() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("scoped", "superhero").await;
    let org_admin = raw_key(&keys, "admin");

    let mint = |scopes: Vec<String>| {
        let client = srv.client.clone();
        let url = format!("{}/admin/api-keys", srv.base_url);
        let admin = org_admin.clone();
        async move {
            let res = client
                .post(url)
                .header("x-api-key", admin)
                .json(&json!({ "name": "t", "scopes": scopes }))
                .send()
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            res.json::<Value>().await.unwrap()["item"]["raw_key"]
                .as_str()
                .unwrap()
                .to_string()
        }
    };

    let no_scopes = mint(Vec::new()).await;
    let res = srv.submit(&no_scopes, "echo", json!({})).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["detail"], "missing required scope");

    let submit_only = mint(vec!["jobs:submit".to_string()]).await;
    let res = srv.submit(&submit_only, "echo", json!({})).await;
    assert_eq!(res.status(), StatusCode::OK);
    let job_id = res.json::<Value>().await.unwrap()["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    // same key cannot read back
    let res = srv
        .client
        .get(format!("{}/results/{}", srv.base_url, job_id))
        .header("x-api-key", &submit_only)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let both = mint(vec!["jobs:submit".to_string(), "jobs:read".to_string()]).await;
    let res = srv
        .client
        .get(format!("{}/results/{}", srv.base_url, job_id))
        .header("x-api-key", &both)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn reserved_payload_keys_are_rejected() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("reserved", "hero").await;
    let builder = raw_key(&keys, "builder");

    let res = srv.submit(&builder, "echo", json!({ "_velu": 1 })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["detail"], "payload_reserved_keys");
}

#[tokio::test]
async fn unknown_tasks_are_rejected() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("ghosts", "superhero").await;
    let builder = raw_key(&keys, "builder");

    let res = srv.submit(&builder, "ghost_task", json!({})).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["detail"], "task_not_allowed");
}

#[tokio::test]
async fn tier_gate_blocks_tasks_above_plan() {
    let mut config = test_config();
    config.enforce_tiers = true;
    let srv = TestServer::spawn(config).await;
    let (_org, keys) = srv.bootstrap("starter-co", "base").await;
    let builder = raw_key(&keys, "builder");

    let res = srv.submit(&builder, "plan", json!({})).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["detail"], "upgrade_required");

    // starter tier still gets the intake tasks
    let res = srv.submit(&builder, "assistant_intake", json!({})).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_kicks_in_per_key() {
    let mut config = test_config();
    config.rate_requests = 3;
    config.rate_window = Duration::from_secs(2);
    let srv = TestServer::spawn(config).await;
    let (_org, keys) = srv.bootstrap("limited", "hero").await;
    let builder = raw_key(&keys, "builder");

    for _ in 0..3 {
        let res = srv.submit(&builder, "echo", json!({})).await;
        assert_eq!(res.status(), StatusCode::OK);
    }
    let res = srv.submit(&builder, "echo", json!({})).await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn oversize_payloads_are_rejected() {
    let mut config = test_config();
    config.max_request_bytes = 64;
    let srv = TestServer::spawn(config).await;
    let (_org, keys) = srv.bootstrap("big", "hero").await;
    let builder = raw_key(&keys, "builder");

    let res = srv
        .submit(&builder, "echo", json!({ "blob": "x".repeat(200) }))
        .await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["detail"], "payload too large");
}

#[tokio::test]
async fn revoked_keys_stop_authenticating() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("revoked-co", "hero").await;
    let org_admin = raw_key(&keys, "admin");
    let builder = raw_key(&keys, "builder");
    let builder_id = keys["builder"]["id"].as_str().unwrap().to_string();

    let res = srv.submit(&builder, "echo", json!({})).await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = srv
        .client
        .post(format!(
            "{}/admin/api-keys/{}/revoke",
            srv.base_url, builder_id
        ))
        .header("x-api-key", &org_admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = srv.submit(&builder, "echo", json!({})).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rotation_swaps_the_secret() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("rotated-co", "hero").await;
    let org_admin = raw_key(&keys, "admin");
    let builder = raw_key(&keys, "builder");
    let builder_id = keys["builder"]["id"].as_str().unwrap().to_string();

    let res = srv
        .client
        .post(format!(
            "{}/admin/api-keys/{}/rotate",
            srv.base_url, builder_id
        ))
        .header("x-api-key", &org_admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    let new_raw = body["item"]["raw_key"].as_str().unwrap().to_string();
    assert_ne!(new_raw, builder);

    // old secret is dead, new one works
    let res = srv.submit(&builder, "echo", json!({})).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let res = srv.submit(&new_raw, "echo", json!({})).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn bootstrap_requires_the_platform_admin() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("first", "hero").await;
    let org_admin = raw_key(&keys, "admin");

    // an org admin key has key-management scope but not org management
    let res = srv
        .client
        .post(format!("{}/orgs/bootstrap", srv.base_url))
        .header("x-api-key", &org_admin)
        .json(&json!({ "name": "second", "slug": "second", "plan": "base" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // no key at all
    let res = srv
        .client
        .post(format!("{}/orgs/bootstrap", srv.base_url))
        .json(&json!({ "name": "second", "slug": "second", "plan": "base" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tasks_allowed_reflects_the_caller_tier() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("entitled", "base").await;
    let viewer = raw_key(&keys, "viewer");

    let res = srv
        .client
        .get(format!("{}/tasks/allowed", srv.base_url))
        .header("x-api-key", &viewer)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["tier"], "starter");
    let allowed = body["allowed"].as_array().unwrap();
    assert!(allowed.iter().any(|v| v == "assistant_intake"));
    assert!(!allowed.iter().any(|v| v == "plan"));
}

#[tokio::test]
async fn failed_handlers_surface_as_error_status() {
    let srv = TestServer::spawn(test_config()).await;
    let (_org, keys) = srv.bootstrap("failing", "superhero").await;
    let builder = raw_key(&keys, "builder");

    // pipeline_waiter without a parent_job fails its handler
    let res = srv.submit(&builder, "pipeline_waiter", json!({})).await;
    assert_eq!(res.status(), StatusCode::OK);
    let job_id = res.json::<Value>().await.unwrap()["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    srv.run_worker_once().await;

    let res = srv
        .client
        .get(format!("{}/results/{}", srv.base_url, job_id))
        .header("x-api-key", &builder)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["item"]["status"], "error");
    assert!(body["item"]["error"]["error"].is_string());
}
