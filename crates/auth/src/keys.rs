//! Credential hashing, generation, and display.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix carried by every generated raw key.
pub const RAW_KEY_PREFIX: &str = "velu_";

/// Stable DB-safe hash for API key lookup.
///
/// Must match everywhere (create + lookup): SHA-256 over `pepper + raw`,
/// stored as base64url without padding. The pepper is optional; hashing
/// works the same without one.
pub fn hash_key(raw: &str, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(raw.trim().as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a fresh raw key: the `velu_` prefix plus 32 random bytes,
/// base64url-encoded. The raw form is shown to the caller exactly once.
pub fn generate_raw_key() -> String {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    format!("{}{}", RAW_KEY_PREFIX, URL_SAFE_NO_PAD.encode(secret))
}

/// Short non-reversible identifier for a presented token, used in rate
/// buckets and audit lines. `anon` when no token was presented.
pub fn key_id(token: &str) -> String {
    let token = token.trim();
    if token.is_empty() {
        return "anon".to_string();
    }
    let digest = Sha256::digest(token.as_bytes());
    format!("k_{}", &hex::encode(digest)[..12])
}

/// Safe key display: never returns the full key.
///
/// Example: `velu_abc...wxyz`
pub fn mask_key(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 12 {
        let head: String = chars[..2.min(chars.len())].iter().collect();
        let tail: String = chars[chars.len().saturating_sub(2)..].iter().collect();
        return format!("{head}...{tail}");
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
