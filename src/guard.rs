//! Path and filename safety. Every filesystem mutation the transfer pipeline
//! performs goes through `safe_join` first.

use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Resolve `rel` under `root`, failing if the resolved path escapes `root`.
///
/// Resolution is textual where the target doesn't yet exist (a file we're
/// about to create can't be `canonicalize`d), but any existing prefix is
/// canonicalized so symlinked ancestors can't be used to climb out of root.
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, AppError> {
    let rel = rel.trim_start_matches('/');
    if rel.split('/').any(|part| part == "..") {
        return Err(AppError::UnsafePath(rel.to_string()));
    }

    let root_canonical = root
        .canonicalize()
        .map_err(|_| AppError::UnsafePath(format!("storage root missing: {}", root.display())))?;

    let joined = root_canonical.join(rel);
    let resolved = resolve_best_effort(&joined);

    if resolved != root_canonical && !resolved.starts_with(&root_canonical) {
        return Err(AppError::UnsafePath(rel.to_string()));
    }

    Ok(joined)
}

/// Canonicalize the longest existing prefix of `path`, then re-append the
/// remaining (not-yet-existing) components unresolved.
fn resolve_best_effort(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for component in tail.into_iter().rev() {
                    out.push(component);
                }
                return out;
            }
            Err(_) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name.to_owned());
                    existing.pop();
                } else {
                    return path.to_path_buf();
                }
            }
        }
    }
}

const ALLOWED_FILENAME_CHARS: fn(char) -> bool =
    |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-';

/// Reduce `name` to a safe basename: keep only `[A-Za-z0-9_.-]`, collapse
/// whitespace to `_`, strip leading/trailing `._`, truncate to 128 bytes.
/// Falls back to `default` if nothing survives.
pub fn sanitize_filename(name: &str, default: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut cleaned = String::with_capacity(base.len());
    for c in base.chars() {
        if c.is_whitespace() {
            cleaned.push('_');
        } else if ALLOWED_FILENAME_CHARS(c) {
            cleaned.push(c);
        }
    }

    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    let truncated: String = trimmed.chars().take(128).collect();

    if truncated.is_empty() {
        default.to_string()
    } else {
        truncated
    }
}

/// `job_id` must match `[A-Za-z0-9_-]{8,128}`.
pub fn is_safe_job_id(s: &str) -> bool {
    let len = s.len();
    (8..=128).contains(&len)
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_is_a_fixed_point() {
        for input in ["../../etc/passwd", "  weird name!!.zip  ", "", "...", "a/b/c.zip"] {
            let once = sanitize_filename(input, "default.bin");
            let twice = sanitize_filename(&once, "default.bin");
            assert_eq!(once, twice, "not a fixed point for {input:?}");
            assert!(once.chars().all(|c| ALLOWED_FILENAME_CHARS(c)));
            assert!(once.len() <= 128);
        }
    }

    #[test]
    fn sanitize_falls_back_to_default_when_empty() {
        assert_eq!(sanitize_filename("...", "fallback.zip"), "fallback.zip");
        assert_eq!(sanitize_filename("___", "fallback.zip"), "fallback.zip");
    }

    #[test]
    fn sanitize_truncates_to_128_bytes() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_filename(&long, "x").len(), 128);
    }

    #[test]
    fn job_id_validation() {
        assert!(is_safe_job_id("job_abcdef01"));
        assert!(!is_safe_job_id("short"));
        assert!(!is_safe_job_id("has a space"));
        assert!(!is_safe_job_id("../escape"));
        assert!(!is_safe_job_id(&"x".repeat(129)));
    }

    #[test]
    fn safe_join_confines_to_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("temp")).unwrap();

        let ok = safe_join(dir.path(), "temp/job_abcdef01/file.zip").unwrap();
        assert!(ok.starts_with(dir.path().canonicalize().unwrap()));

        assert!(safe_join(dir.path(), "../evil").is_err());
        assert!(safe_join(dir.path(), "temp/../../evil").is_err());
    }

    #[test]
    fn safe_join_rejects_symlink_escape() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("temp")).unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), dir.path().join("temp/escape")).unwrap();
            let result = safe_join(dir.path(), "temp/escape/file.txt");
            assert!(result.is_err());
        }
    }
}
