//! Per-job workspaces and filesystem isolation.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;

use velu_contracts::JobRecord;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("refusing job without org attribution")]
    MissingOrg,

    #[error("missing job id")]
    MissingJobId,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Keep only characters safe for a path segment.
fn safe_seg(v: &str) -> String {
    v.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

fn run_id_from_payload(payload: &Value) -> Option<String> {
    let rid = payload.get("_velu")?.get("run_id")?.as_str()?;
    let seg = safe_seg(rid);
    (!seg.is_empty()).then_some(seg)
}

/// Resolve and create the workspace and tmp directories for a job.
///
/// Layout: `<base>/<org>/<run_id or job_id>/` with a `tmp/` inside. Both are
/// chmod 0700 where the platform allows. `require_org` is set in tenanted
/// deployments; untenanted jobs land under `local`.
pub fn job_workspace(
    job: &JobRecord,
    base: &Path,
    require_org: bool,
) -> Result<(PathBuf, PathBuf), WorkspaceError> {
    let org = match job.org_id {
        Some(org_id) => safe_seg(&org_id.to_string()),
        None if require_org => return Err(WorkspaceError::MissingOrg),
        None => "local".to_string(),
    };

    let leaf = match run_id_from_payload(&job.payload) {
        Some(run_id) => run_id,
        None => {
            let jid = safe_seg(&job.id.to_string());
            if jid.is_empty() {
                return Err(WorkspaceError::MissingJobId);
            }
            jid
        }
    };

    let ws = base.join(org).join(leaf);
    let tmp = ws.join("tmp");
    fs::create_dir_all(&tmp)?;
    restrict_permissions(&ws);
    restrict_permissions(&tmp);
    Ok((ws, tmp))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

static ISOLATION: Mutex<()> = Mutex::new(());

/// Process-level isolation for one handler run.
///
/// Points TMPDIR/TEMP/TMP at the job's tmp dir and moves cwd into the
/// workspace; everything is restored on drop. A process-wide lock serializes
/// runs, since cwd and env are process state.
pub struct IsolatedEnv {
    _guard: MutexGuard<'static, ()>,
    old_cwd: Option<PathBuf>,
    old_env: Vec<(&'static str, Option<String>)>,
}

const TMP_VARS: [&str; 3] = ["TMPDIR", "TEMP", "TMP"];

impl IsolatedEnv {
    pub fn enter(workspace: &Path, tmpdir: &Path) -> Result<Self, WorkspaceError> {
        let guard = ISOLATION.lock().unwrap_or_else(|e| e.into_inner());
        let old_cwd = std::env::current_dir().ok();
        let old_env = TMP_VARS
            .iter()
            .map(|name| (*name, std::env::var(name).ok()))
            .collect();

        fs::create_dir_all(workspace)?;
        for name in TMP_VARS {
            // Process env mutation; serialized by the isolation lock.
            unsafe { std::env::set_var(name, tmpdir) };
        }
        std::env::set_current_dir(workspace)?;

        Ok(Self {
            _guard: guard,
            old_cwd,
            old_env,
        })
    }
}

impl Drop for IsolatedEnv {
    fn drop(&mut self) {
        if let Some(cwd) = &self.old_cwd {
            let _ = std::env::set_current_dir(cwd);
        }
        for (name, value) in &self.old_env {
            match value {
                Some(v) => unsafe { std::env::set_var(name, v) },
                None => unsafe { std::env::remove_var(name) },
            }
        }
    }
}

/// Write a result's `files` array into the workspace.
///
/// Only relative, traversal-free paths with string content are honored;
/// everything else is silently skipped. Returns the sorted list of paths
/// actually written.
pub fn materialize_files(workspace: &Path, files: Option<&Value>) -> io::Result<Vec<String>> {
    let mut wrote = Vec::new();
    let Some(Value::Array(items)) = files else {
        return Ok(wrote);
    };

    for item in items {
        let Some(obj) = item.as_object() else { continue };
        let Some(raw_path) = obj.get("path").and_then(Value::as_str) else {
            continue;
        };
        let Some(content) = obj.get("content").and_then(Value::as_str) else {
            continue;
        };

        let rel = raw_path.trim().replace('\\', "/");
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() || rel == "." {
            continue;
        }

        let rel_path = Path::new(rel);
        let traversal = rel_path.components().any(|c| {
            !matches!(c, Component::Normal(_) | Component::CurDir)
        });
        if traversal {
            continue;
        }

        let out = workspace.join(rel_path);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&out, content)?;
        wrote.push(rel.to_string());
    }

    wrote.sort();
    Ok(wrote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use velu_core::OrgId;

    fn tmp_base(name: &str) -> PathBuf {
        let base = std::env::temp_dir()
            .join("velu-worker-tests")
            .join(format!("{name}-{}", uuid::Uuid::now_v7()));
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn job(org: Option<OrgId>, payload: Value) -> JobRecord {
        JobRecord::queued("echo", payload, 0, org, None, None, None, Utc::now())
    }

    #[test]
    fn workspace_paths_by_org_and_job() {
        let base = tmp_base("paths");
        let org = OrgId::new();
        let j = job(Some(org), json!({}));
        let (ws, tmp) = job_workspace(&j, &base, true).unwrap();
        assert!(ws.starts_with(base.join(safe_seg(&org.to_string()))));
        assert!(ws.ends_with(safe_seg(&j.id.to_string())));
        assert!(tmp.ends_with("tmp"));
        assert!(ws.is_dir());
        assert!(tmp.is_dir());
    }

    #[test]
    fn run_id_overrides_job_id_leaf() {
        let base = tmp_base("runid");
        let j = job(None, json!({"_velu": {"run_id": "run-42"}}));
        let (ws, _) = job_workspace(&j, &base, false).unwrap();
        assert!(ws.ends_with("run-42"));
        assert!(ws.starts_with(base.join("local")));
    }

    #[test]
    fn tenanted_mode_refuses_missing_org() {
        let base = tmp_base("noorg");
        let j = job(None, json!({}));
        assert!(matches!(
            job_workspace(&j, &base, true),
            Err(WorkspaceError::MissingOrg)
        ));
    }

    #[test]
    fn materialize_rejects_traversal() {
        let base = tmp_base("mat");
        let files = json!([
            {"path": "ok/one.txt", "content": "a"},
            {"path": "../escape.txt", "content": "b"},
            {"path": "/abs.txt", "content": "c"},
            {"path": "nested/../up.txt", "content": "d"},
            {"path": "", "content": "e"},
            {"path": "no-content.txt"},
        ]);
        let wrote = materialize_files(&base, Some(&files)).unwrap();
        assert_eq!(wrote, vec!["abs.txt".to_string(), "ok/one.txt".to_string()]);
        assert!(base.join("ok/one.txt").is_file());
        assert!(!base.join("escape.txt").exists());
        assert!(!base.parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn isolation_restores_env_and_cwd() {
        let base = tmp_base("iso");
        let ws = base.join("ws");
        let tmp = ws.join("tmp");
        fs::create_dir_all(&tmp).unwrap();

        let before_cwd = std::env::current_dir().unwrap();
        let before_tmp = std::env::var("TMPDIR").ok();
        {
            let _guard = IsolatedEnv::enter(&ws, &tmp).unwrap();
            assert_eq!(
                std::env::current_dir().unwrap().canonicalize().unwrap(),
                ws.canonicalize().unwrap()
            );
            assert_eq!(std::env::var("TMPDIR").unwrap(), tmp.to_string_lossy());
        }
        assert_eq!(std::env::current_dir().unwrap(), before_cwd);
        assert_eq!(std::env::var("TMPDIR").ok(), before_tmp);
    }
}
