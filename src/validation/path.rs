//! Path and name validation for remote file operations.
//!
//! Normalization is purely lexical: no filesystem syscalls are made for remote
//! paths, so symlinks on the remote side can't change the answer between the
//! check and the use.

use super::validate_username;
use crate::error::{AppError, AppResult};
use std::path::{Component, Path, PathBuf};

/// Maximum length of a single file or directory name
pub const MAX_NAME_LENGTH: usize = 255;

/// Replacement for unsafe characters in uploaded file names
pub const PLACEHOLDER: char = '_';

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>', '"'];

/// Home directory that bounds every remote operation for `username`
pub fn remote_home(username: &str) -> PathBuf {
    PathBuf::from(format!("/home/{}", username))
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Fold path components without touching any filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    path.components().fold(PathBuf::new(), |mut acc, component| {
        match component {
            Component::ParentDir => {
                acc.pop();
            }
            Component::Normal(c) => acc.push(c),
            Component::RootDir => acc.push("/"),
            Component::CurDir | Component::Prefix(_) => {}
        }
        acc
    })
}

/// Validate and normalize a remote path, bounding it to `/home/{username}`.
///
/// Relative paths resolve against the home directory; an empty path means the
/// home directory itself.
pub fn validate_remote_path(remote_path: &str, username: &str) -> AppResult<PathBuf> {
    validate_username(username)?;

    if remote_path.contains('\0') {
        return Err(AppError::InvalidName("Path contains a null byte".to_string()));
    }

    let path = Path::new(remote_path);
    if has_parent_component(path) {
        tracing::warn!(remote_path, username, "Path traversal attempt detected");
        return Err(AppError::PathTraversalRejected(
            "Parent directory components (..) are not allowed".to_string(),
        ));
    }

    let home = remote_home(username);
    let full_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    };

    let normalized = normalize_lexically(&full_path);

    if !normalized.starts_with(&home) {
        tracing::warn!(
            remote_path,
            normalized = %normalized.display(),
            username,
            "Access denied: path outside user directory"
        );
        return Err(AppError::PathTraversalRejected(format!(
            "Path must be within {}",
            home.display()
        )));
    }

    Ok(normalized)
}

/// Validate a bare entry name (e.g. a new folder). Returns the trimmed name.
pub fn validate_name(name: &str) -> AppResult<&str> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(AppError::InvalidName("Name cannot be empty".to_string()));
    }

    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(AppError::InvalidName(format!(
            "Name too long. Maximum is {} characters",
            MAX_NAME_LENGTH
        )));
    }

    if trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains("..") {
        return Err(AppError::InvalidName(
            "Name cannot contain '/', '\\' or '..'".to_string(),
        ));
    }

    if trimmed == "." || trimmed.contains('\0') {
        return Err(AppError::InvalidName(format!("'{}' is not a valid name", trimmed.escape_default())));
    }

    Ok(trimmed)
}

/// Turn a local file name into a safe remote file name.
///
/// Separators and null bytes, then shell metacharacters, become [`PLACEHOLDER`].
/// Runs of inserted placeholders collapse to one and inserted placeholders at
/// either end are trimmed; underscores already in the name are left alone.
pub fn sanitize_filename(name: &str) -> AppResult<String> {
    // `None` marks an inserted placeholder
    let mut tokens: Vec<Option<char>> = Vec::with_capacity(name.len());
    for c in name.chars() {
        let unsafe_char = matches!(c, '/' | '\\' | '\0') || SHELL_METACHARACTERS.contains(&c);
        match (unsafe_char, tokens.last()) {
            (true, Some(None)) => {}
            (true, _) => tokens.push(None),
            (false, _) => tokens.push(Some(c)),
        }
    }

    let trimmable = |t: &Option<char>| t.map_or(true, char::is_whitespace);
    let first = tokens.iter().position(|t| !trimmable(t)).unwrap_or(tokens.len());
    let last = tokens.iter().rposition(|t| !trimmable(t)).map_or(first, |i| i + 1);
    let sanitized: String = tokens[first..last]
        .iter()
        .map(|t| t.unwrap_or(PLACEHOLDER))
        .collect();
    let sanitized = sanitized.as_str();

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return Err(AppError::InvalidName(format!(
            "File name '{}' has no usable characters",
            name.escape_default()
        )));
    }

    if sanitized.chars().count() > MAX_NAME_LENGTH {
        return Err(AppError::InvalidName(format!(
            "File name too long. Maximum is {} characters",
            MAX_NAME_LENGTH
        )));
    }

    Ok(sanitized.to_string())
}

/// Validate a local path for transfers, bounding it to `local_root`.
///
/// Unlike remote paths this one is canonicalized, so symlinks are followed.
/// A path that doesn't exist yet is accepted when its parent resolves inside
/// the root.
pub fn validate_local_path(local_path: &str, local_root: &Path) -> AppResult<PathBuf> {
    let path = Path::new(local_path);

    if has_parent_component(path) {
        tracing::warn!(local_path, "Local path traversal attempt detected");
        return Err(AppError::PathTraversalRejected(
            "Parent directory components (..) are not allowed".to_string(),
        ));
    }

    let root = local_root.canonicalize()?;
    let full_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    let normalized = match full_path.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let parent = full_path
                .parent()
                .ok_or_else(|| AppError::InvalidName("Invalid local path".to_string()))?;
            let file_name = full_path
                .file_name()
                .ok_or_else(|| AppError::InvalidName("Local path has no file name".to_string()))?;
            parent.canonicalize()?.join(file_name)
        }
    };

    if !normalized.starts_with(&root) {
        tracing::warn!(
            normalized = %normalized.display(),
            root = %root.display(),
            "Access denied: local path outside allowed root"
        );
        return Err(AppError::PathTraversalRejected(format!(
            "Local path must be within {}",
            root.display()
        )));
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_resolves_under_home() {
        let p = validate_remote_path("docs/report.pdf", "alice").unwrap();
        assert_eq!(p, PathBuf::from("/home/alice/docs/report.pdf"));
    }

    #[test]
    fn test_empty_path_is_home() {
        assert_eq!(validate_remote_path("", "alice").unwrap(), PathBuf::from("/home/alice"));
        assert_eq!(validate_remote_path(".", "alice").unwrap(), PathBuf::from("/home/alice"));
    }

    #[test]
    fn test_cur_dir_components_dropped() {
        let p = validate_remote_path("/home/alice/./a/./b", "alice").unwrap();
        assert_eq!(p, PathBuf::from("/home/alice/a/b"));
    }

    #[test]
    fn test_parent_components_always_rejected() {
        let attempts = [
            "..",
            "../bob",
            "docs/../../etc",
            "/home/alice/..",
            "/home/alice/docs/../notes",
            "a/b/c/..",
            "./..",
            "/../home/alice",
        ];
        for attempt in attempts {
            assert!(
                matches!(
                    validate_remote_path(attempt, "alice"),
                    Err(AppError::PathTraversalRejected(_))
                ),
                "expected rejection for {attempt}"
            );
        }
    }

    #[test]
    fn test_absolute_path_outside_home_rejected() {
        assert!(matches!(
            validate_remote_path("/etc/passwd", "alice"),
            Err(AppError::PathTraversalRejected(_))
        ));
        assert!(matches!(
            validate_remote_path("/home/alice2/file", "alice"),
            Err(AppError::PathTraversalRejected(_))
        ));
    }

    #[test]
    fn test_dotted_names_are_not_parent_dirs() {
        let p = validate_remote_path("archive..tar", "alice").unwrap();
        assert_eq!(p, PathBuf::from("/home/alice/archive..tar"));
    }

    #[test]
    fn test_invalid_username_rejected_first() {
        assert!(matches!(
            validate_remote_path("docs", "../root"),
            Err(AppError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  reports ").unwrap(), "reports");
        for bad in ["", "   ", "a/b", "a\\b", "..", "x..y", "."] {
            assert!(matches!(validate_name(bad), Err(AppError::InvalidName(_))), "{bad}");
        }
        assert!(validate_name(&"a".repeat(255)).is_ok());
        assert!(validate_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_sanitize_command_substitution() {
        let name = sanitize_filename("report$(whoami).pdf").unwrap();
        assert_eq!(name, "report_whoami_.pdf");
        assert!(!name.chars().any(|c| SHELL_METACHARACTERS.contains(&c)));
    }

    #[test]
    fn test_sanitize_separators_and_boundaries() {
        assert_eq!(sanitize_filename("a/b\\c").unwrap(), "a_b_c");
        assert_eq!(sanitize_filename(";rm -rf ~;").unwrap(), "rm -rf ~");
        assert_eq!(sanitize_filename("x\0y").unwrap(), "x_y");
        assert_eq!(sanitize_filename("a;&|b").unwrap(), "a_b");
        assert_eq!(sanitize_filename("plain.txt").unwrap(), "plain.txt");
    }

    #[test]
    fn test_sanitize_keeps_original_underscores() {
        assert_eq!(sanitize_filename("__init__.py").unwrap(), "__init__.py");
        assert_eq!(sanitize_filename("_config.yml").unwrap(), "_config.yml");
        assert_eq!(sanitize_filename("my__notes.txt").unwrap(), "my__notes.txt");
        assert_eq!(sanitize_filename("___").unwrap(), "___");
        assert_eq!(sanitize_filename("_a;|b_").unwrap(), "_a_b_");
        assert_eq!(sanitize_filename("$(x)_log").unwrap(), "x__log");
    }

    #[test]
    fn test_sanitize_rejects_empty_result() {
        assert!(sanitize_filename("$()").is_err());
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("").is_err());
    }

    #[test]
    fn test_local_path_bounded_by_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("in.txt"), b"x").unwrap();

        let ok = validate_local_path("in.txt", root.path()).unwrap();
        assert!(ok.ends_with("in.txt"));

        let new_file = validate_local_path("new.txt", root.path()).unwrap();
        assert!(new_file.ends_with("new.txt"));

        assert!(matches!(
            validate_local_path("../escape.txt", root.path()),
            Err(AppError::PathTraversalRejected(_))
        ));
        assert!(matches!(
            validate_local_path("/etc/hostname", root.path()),
            Err(AppError::PathTraversalRejected(_))
        ));
    }
}
