//! Environment-driven gateway configuration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use velu_auth::{parse_api_keys, KeysetEntry};

/// Deployment environment. Local and test relax several gates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Env {
    Local,
    Test,
    Prod,
}

impl Env {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "test" => Self::Test,
            "prod" | "production" => Self::Prod,
            _ => Self::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }

    /// Local and test deployments skip the tier gate and raw-key stripping.
    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Local | Self::Test)
    }
}

/// Everything the gateway reads from the environment, resolved once at boot.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: Env,
    pub database_url: Option<String>,
    /// `VELU_JOBS_BACKEND=postgres` selects the Postgres store; anything
    /// else runs the single-node in-memory store.
    pub jobs_backend_postgres: bool,
    /// Multi-tenant credential mode: API keys live in the store rather than
    /// in the `API_KEYS` env keyset.
    pub store_credentials: bool,
    /// Legacy env keyset, `token[:role[:tier]]`.
    pub keyset: HashMap<String, KeysetEntry>,
    pub admin_key: Option<String>,
    pub disabled_keys: HashSet<String>,
    pub min_api_key_len: usize,
    pub key_pepper: String,
    /// `last_used_at` touch throttle for key lookups.
    pub touch_after_secs: i64,
    pub max_request_bytes: u64,
    /// Rate limiting is off when either of these is zero.
    pub rate_requests: u32,
    pub rate_window: Duration,
    pub rate_limit_by_ip: bool,
    pub audit_log: Option<PathBuf>,
    pub audit_log_include_ip: bool,
    pub enforce_scopes: bool,
    pub enforce_roles: bool,
    pub enforce_tiers: bool,
    /// Outside local/test, bootstrap strips raw keys unless this is set.
    pub bootstrap_return_raw: bool,
    pub cors_origins: Vec<String>,
    pub lease_seconds: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: Env::Local,
            database_url: None,
            jobs_backend_postgres: false,
            store_credentials: false,
            keyset: HashMap::new(),
            admin_key: None,
            disabled_keys: HashSet::new(),
            min_api_key_len: 0,
            key_pepper: String::new(),
            touch_after_secs: 300,
            max_request_bytes: 1_048_576,
            rate_requests: 0,
            rate_window: Duration::from_secs(0),
            rate_limit_by_ip: false,
            audit_log: None,
            audit_log_include_ip: false,
            enforce_scopes: false,
            enforce_roles: false,
            enforce_tiers: false,
            bootstrap_return_raw: false,
            cors_origins: vec!["*".to_string()],
            lease_seconds: 300,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_str(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn truthy(name: &str) -> bool {
    matches!(
        env_str(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl AppConfig {
    pub fn from_env() -> Self {
        let env = Env::parse(&env_str("ENV").unwrap_or_default());
        let database_url = env_str("DATABASE_URL");

        let pg_url = database_url
            .as_deref()
            .map(|u| {
                let u = u.to_ascii_lowercase();
                u.starts_with("postgres://") || u.starts_with("postgresql://")
            })
            .unwrap_or(false);

        let store_credentials = match env_str("VELU_API_KEYS_BACKEND").as_deref() {
            Some("postgres") => true,
            Some(_) => false,
            None => pg_url,
        };

        let keyset = env_str("API_KEYS")
            .map(|raw| parse_api_keys(&raw))
            .unwrap_or_default();

        // VELU_ADMIN_KEY is canonical; the old test-only name still works.
        let admin_key = env_str("VELU_ADMIN_KEY").or_else(|| env_str("TEST_PLATFORM_ADMIN_KEY"));

        let disabled_keys = env_str("DISABLED_API_KEYS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let min_api_key_len = env_u64(
            "MIN_API_KEY_LEN",
            if env.is_dev() { 0 } else { 24 },
        ) as usize;

        let audit_log = env_str("AUDIT_LOG").map(PathBuf::from);

        let cors_origins = env_str("CORS_ORIGINS")
            .or_else(|| env_str("ALLOWED_ORIGINS"))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| {
                if env.is_dev() {
                    vec!["*".to_string()]
                } else {
                    vec![
                        "http://localhost:3000".to_string(),
                        "http://localhost:3001".to_string(),
                    ]
                }
            });

        Self {
            env,
            jobs_backend_postgres: env_str("VELU_JOBS_BACKEND").as_deref() == Some("postgres"),
            store_credentials,
            keyset,
            admin_key,
            disabled_keys,
            min_api_key_len,
            key_pepper: env_str("VELU_API_KEY_PEPPER").unwrap_or_default(),
            touch_after_secs: env_u64("API_KEY_TOUCH_SEC", 300) as i64,
            max_request_bytes: env_u64("MAX_REQUEST_BYTES", 1_048_576),
            rate_requests: env_u64("RATE_REQUESTS", 0) as u32,
            rate_window: Duration::from_secs(env_u64("RATE_WINDOW_SEC", 0)),
            rate_limit_by_ip: truthy("RATE_LIMIT_BY_IP"),
            audit_log,
            audit_log_include_ip: truthy("AUDIT_LOG_INCLUDE_IP"),
            enforce_scopes: truthy("ENFORCE_SCOPES") || truthy("VELU_ENFORCE_SCOPES"),
            enforce_roles: truthy("ENFORCE_ROLES"),
            enforce_tiers: truthy("ENFORCE_TIERS") || truthy("VELU_ENFORCE_TIERS"),
            bootstrap_return_raw: truthy("ORG_BOOTSTRAP_RETURN_RAW"),
            cors_origins,
            lease_seconds: env_u64("VELU_JOB_LEASE_SEC", 300).max(5) as i64,
            database_url,
        }
    }

    /// Whether the tier gate applies to submissions.
    pub fn tier_gate_enforced(&self) -> bool {
        !(self.env.is_dev() && !self.enforce_tiers)
    }

    /// Raw keys may only leave bootstrap in dev, or when explicitly allowed.
    pub fn allow_raw_keys(&self) -> bool {
        self.bootstrap_return_raw || self.env.is_dev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parsing() {
        assert_eq!(Env::parse("TEST"), Env::Test);
        assert_eq!(Env::parse("prod"), Env::Prod);
        assert_eq!(Env::parse("anything"), Env::Local);
        assert!(Env::Test.is_dev());
        assert!(!Env::Prod.is_dev());
    }

    #[test]
    fn tier_gate_default_off_in_dev() {
        let mut cfg = AppConfig::default();
        assert!(!cfg.tier_gate_enforced());
        cfg.enforce_tiers = true;
        assert!(cfg.tier_gate_enforced());
        cfg.enforce_tiers = false;
        cfg.env = Env::Prod;
        assert!(cfg.tier_gate_enforced());
    }

    #[test]
    fn raw_keys_gated_by_env() {
        let mut cfg = AppConfig::default();
        assert!(cfg.allow_raw_keys());
        cfg.env = Env::Prod;
        assert!(!cfg.allow_raw_keys());
        cfg.bootstrap_return_raw = true;
        assert!(cfg.allow_raw_keys());
    }
}
