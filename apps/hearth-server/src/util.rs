use std::path::{Path, PathBuf};

/// RFC3339 UTC timestamp with millisecond precision; the one format used
/// on events, rows, and retry stamps.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Minute-resolution key used by the scheduler's double-fire guard.
pub fn minute_key(at: &chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M").to_string()
}

/// Join a client-supplied relative file name under a base directory,
/// rejecting path traversal.
pub fn safe_join(base: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return None;
    }
    let candidate = Path::new(name);
    if candidate
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::Prefix(_)))
    {
        return None;
    }
    Some(base.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_traversal() {
        let base = Path::new("/data");
        assert!(safe_join(base, "zim/wiki.zim").is_some());
        assert!(safe_join(base, "../etc/passwd").is_none());
        assert!(safe_join(base, "/etc/passwd").is_none());
        assert!(safe_join(base, "a/../../b").is_none());
        assert!(safe_join(base, "").is_none());
    }
}
