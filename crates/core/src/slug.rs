//! Org slug normalization.

/// Normalize a display name into a URL-safe slug.
///
/// Lowercases, replaces runs of non-alphanumerics with a single `-`, trims
/// leading/trailing dashes, and caps the length. Falls back to `"org"` when
/// nothing survives.
pub fn normalize_slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= 64 {
            break;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { "org".to_string() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_normalization() {
        assert_eq!(normalize_slug("Acme Corp"), "acme-corp");
        assert_eq!(normalize_slug("  Acme -- Corp!  "), "acme-corp");
        assert_eq!(normalize_slug("already-fine"), "already-fine");
    }

    #[test]
    fn empty_input_falls_back() {
        assert_eq!(normalize_slug(""), "org");
        assert_eq!(normalize_slug("!!!"), "org");
    }

    #[test]
    fn long_names_are_capped() {
        let slug = normalize_slug(&"a".repeat(200));
        assert!(slug.len() <= 64);
    }
}
