//! Request middleware: authentication, rate/size limits, headers, audit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;

use velu_auth::{hash_key, key_id, normalize_scopes, Claims, Role};
use velu_core::Tier;

use crate::app::errors::json_error;
use crate::app::AppState;

/// Per-request authentication outcome, inserted as a request extension by
/// [`auth_middleware`] and read by route handlers and the guard middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: Option<Claims>,
    /// Short hash of the presented token; `anon` when none was sent.
    pub kid: String,
    /// A token was sent, whether or not it resolved to claims.
    pub presented: bool,
}

impl AuthContext {
    fn anonymous() -> Self {
        Self {
            claims: None,
            kid: "anon".to_string(),
            presented: false,
        }
    }

    fn rejected(kid: String) -> Self {
        Self {
            claims: None,
            kid,
            presented: true,
        }
    }
}

/// Pull the credential out of an `Authorization: Bearer` or `X-API-Key`.
/// Bearer wins when both are sent.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    let v = headers.get("x-api-key")?.to_str().ok()?.trim();
    (!v.is_empty()).then(|| v.to_string())
}

/// Resolve a presented token to claims.
///
/// Order matters: the deny list wins over everything, the platform admin
/// key never hits the store, and the legacy env keyset only applies when
/// store-backed credentials are off.
pub async fn resolve_claims(state: &AppState, token: Option<&str>) -> AuthContext {
    let token = token.unwrap_or("").trim();
    if token.is_empty() {
        return AuthContext::anonymous();
    }
    let kid = key_id(token);
    let cfg = &state.config;

    if cfg.disabled_keys.contains(token) {
        return AuthContext::rejected(kid);
    }

    if cfg.admin_key.as_deref() == Some(token) {
        return AuthContext {
            claims: Some(Claims::platform_admin(kid.clone())),
            kid,
            presented: true,
        };
    }

    if cfg.min_api_key_len > 0 && token.len() < cfg.min_api_key_len {
        return AuthContext::rejected(kid);
    }

    if cfg.store_credentials {
        let hashed = hash_key(token, &cfg.key_pepper);
        let touch = chrono::Duration::seconds(cfg.touch_after_secs);
        match state.store.lookup_api_key(&hashed, touch).await {
            Ok(Some((key, plan))) => {
                let scopes = normalize_scopes(&key.scopes);
                let claims = Claims::for_org_key(
                    kid.clone(),
                    key.org_id,
                    key.id.to_string(),
                    scopes,
                    Tier::from_plan(plan),
                );
                return AuthContext {
                    claims: Some(claims),
                    kid,
                    presented: true,
                };
            }
            Ok(None) => return AuthContext::rejected(kid),
            Err(e) => {
                tracing::warn!("api key lookup failed: {e}");
                return AuthContext::rejected(kid);
            }
        }
    }

    if let Some(entry) = cfg.keyset.get(token) {
        return AuthContext {
            claims: Some(Claims::legacy(kid.clone(), entry.role, entry.tier)),
            kid,
            presented: true,
        };
    }

    AuthContext::rejected(kid)
}

/// Authentication middleware: resolves claims once and stashes them as a
/// request extension. Never rejects by itself; the gates live in handlers.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = extract_api_key(req.headers());
    let ctx = resolve_claims(&state, token.as_deref()).await;
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

struct RateBuckets {
    map: HashMap<String, VecDeque<Instant>>,
    swept_at: Instant,
}

/// Sliding-window request counter, one bucket per key.
pub struct RateLimiter {
    buckets: Mutex<RateBuckets>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(RateBuckets {
                map: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }
}

impl RateLimiter {
    /// Record a hit; false means the bucket is over its limit.
    pub fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        // At most once per window, drop buckets whose newest hit has aged
        // out; otherwise the map grows with every kid/IP ever seen.
        if now.duration_since(buckets.swept_at) > window {
            buckets.map.retain(|_, b| {
                b.back()
                    .map(|t| now.duration_since(*t) <= window)
                    .unwrap_or(false)
            });
            buckets.swept_at = now;
        }

        let bucket = buckets.map.entry(key.to_string()).or_default();
        while bucket
            .front()
            .map(|t| now.duration_since(*t) > window)
            .unwrap_or(false)
        {
            bucket.pop_front();
        }
        if bucket.len() >= limit as usize {
            return false;
        }
        bucket.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .len()
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Size limit, rate limit, and audit trail in one pass around the handler.
pub async fn guard_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let cfg = state.config.clone();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let ip = client_ip(req.headers());

    if method == Method::POST && cfg.max_request_bytes > 0 {
        let declared = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if declared > cfg.max_request_bytes {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
        }
    }

    let auth = req
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .unwrap_or_else(AuthContext::anonymous);

    if cfg.rate_requests > 0 && !cfg.rate_window.is_zero() {
        // A presented-but-invalid token is about to 401; don't count it.
        let countable = auth.claims.is_some() || !auth.presented;
        if countable {
            let bucket_key = if auth.claims.is_some() {
                auth.kid.clone()
            } else if cfg.rate_limit_by_ip {
                format!("ip:{ip}")
            } else {
                "anon".to_string()
            };
            if !state.rate.allow(&bucket_key, cfg.rate_requests, cfg.rate_window) {
                return json_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            }
            if cfg.rate_limit_by_ip && !bucket_key.starts_with("ip:") {
                let ip_key = format!("ip:{ip}");
                if !state.rate.allow(&ip_key, cfg.rate_requests, cfg.rate_window) {
                    return json_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
                }
            }
        }
    }

    let response = next.run(req).await;

    if let Some(path_buf) = &cfg.audit_log {
        let (role, tier, org_id) = match &auth.claims {
            Some(c) => (
                c.role.as_str().to_string(),
                c.tier.as_str().to_string(),
                c.org_id.map(|o| o.to_string()),
            ),
            None => (String::new(), String::new(), None),
        };
        let rec = json!({
            "ts": Utc::now().timestamp(),
            "ms": started.elapsed().as_millis() as u64,
            "method": method.as_str(),
            "path": path,
            "status": response.status().as_u16(),
            "kid": auth.kid,
            "role": role,
            "tier": tier,
            "org_id": org_id,
            "ip": cfg.audit_log_include_ip.then_some(ip),
        });
        append_audit_line(path_buf, &rec);
    }

    response
}

fn append_audit_line(path: &std::path::Path, rec: &serde_json::Value) {
    use std::io::Write;

    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "{rec}")
    };
    if let Err(e) = write() {
        tracing::warn!("audit log write failed: {e}");
    }
}

/// Browser-facing response headers applied to everything, plus a minimal
/// CORS policy driven by the configured origin list.
pub async fn headers_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let preflight = req.method() == Method::OPTIONS;

    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "cross-origin-opener-policy",
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        "cross-origin-resource-policy",
        HeaderValue::from_static("same-site"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("geolocation=(), microphone=()"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; frame-ancestors 'none'; object-src 'none'; base-uri 'self'",
        ),
    );

    let cors = &state.config.cors_origins;
    let allow_all = cors.iter().any(|o| o == "*");
    let allowed = if allow_all {
        Some("*".to_string())
    } else {
        origin.filter(|o| cors.contains(o))
    };
    if let Some(value) = allowed {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("authorization, content-type, x-api-key"),
        );
        if !allow_all {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }

    response
}

/// Scope gate shared by route handlers.
///
/// Store-credential mode requires tenanted (or platform admin) claims on
/// every gated route. Legacy mode only enforces when asked to, so an open
/// local instance keeps working without any keys at all.
pub fn require_scopes(
    state: &AppState,
    auth: &AuthContext,
    required: &[velu_auth::Scope],
) -> Result<(), Response> {
    let cfg = &state.config;

    if cfg.store_credentials {
        let Some(claims) = &auth.claims else {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "missing or invalid api key",
            ));
        };
        if claims.org_id.is_none() && !claims.is_platform_admin {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "missing or invalid api key",
            ));
        }
        if !claims.has_scopes(required) {
            return Err(json_error(StatusCode::FORBIDDEN, "missing required scope"));
        }
        return Ok(());
    }

    let enforce = cfg.enforce_scopes
        || auth
            .claims
            .as_ref()
            .map(|c| c.org_id.is_some())
            .unwrap_or(false);
    if !enforce {
        return Ok(());
    }
    let Some(claims) = &auth.claims else {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid api key",
        ));
    };
    if !claims.has_scopes(required) {
        return Err(json_error(StatusCode::FORBIDDEN, "missing required scope"));
    }
    Ok(())
}

/// Role floor used by read routes when `ENFORCE_ROLES` is on.
pub fn require_role(state: &AppState, auth: &AuthContext, min: Role) -> Result<(), Response> {
    if !state.config.enforce_roles {
        return Ok(());
    }
    if state.config.keyset.is_empty() && !state.config.store_credentials {
        return Ok(());
    }
    let Some(claims) = &auth.claims else {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid api key",
        ));
    };
    let rank = |r: Role| match r {
        Role::Viewer => 10,
        Role::Builder => 20,
        Role::Admin => 30,
    };
    if rank(claims.role) < rank(min) {
        return Err(json_error(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(())
}
