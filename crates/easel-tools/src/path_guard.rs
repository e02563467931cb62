//! Keeps file tools inside the workspace.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

fn join_workspace(raw: &str, workspace: &Path) -> PathBuf {
    let raw = Path::new(raw);
    if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        workspace.join(raw)
    }
}

/// Canonical form of `path`, resolving through its deepest existing ancestor
/// so paths that do not exist yet are still checked against symlinks.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf> {
    let mut ancestor = path;
    let mut missing = Vec::new();
    while !ancestor.exists() {
        match (ancestor.parent(), ancestor.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                ancestor = parent;
            }
            _ => bail!("No existing ancestor for {}", path.display()),
        }
    }

    let mut resolved = ancestor.canonicalize()?;
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

fn ensure_inside(path: &Path, workspace: &Path) -> Result<()> {
    let root = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    // `..` left in a not-yet-existing tail must not sneak past the prefix test.
    let escapes = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if escapes || !path.starts_with(&root) {
        bail!(
            "Path '{}' is outside the workspace '{}'",
            path.display(),
            root.display()
        );
    }
    Ok(())
}

/// Resolve an existing or prospective path for reading.
pub fn validate_path(raw: &str, workspace: &Path, restrict: bool) -> Result<PathBuf> {
    let path = join_workspace(raw, workspace);
    let resolved = canonicalize_lenient(&path)?;
    if restrict {
        ensure_inside(&resolved, workspace)?;
    }
    Ok(resolved)
}

/// Resolve a path for writing, optionally creating its parent directories.
pub fn validate_write_path(
    raw: &str,
    workspace: &Path,
    restrict: bool,
    create_dirs: bool,
) -> Result<PathBuf> {
    let path = validate_path(raw, workspace, restrict)?;

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if !create_dirs {
                bail!("Parent directory does not exist: {}", parent.display());
            }
            std::fs::create_dir_all(parent)?;
        }
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path();
        std::fs::write(workspace.join("test.txt"), "hello").unwrap();

        let result = validate_path("test.txt", workspace, true).unwrap();
        assert!(result.starts_with(workspace.canonicalize().unwrap()));
    }

    #[test]
    fn test_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path();
        std::fs::create_dir_all(workspace.join("sub")).unwrap();

        assert!(validate_path("../../etc/passwd", workspace, true).is_err());
        assert!(validate_path("missing/../../outside.txt", workspace, true).is_err());
    }

    #[test]
    fn test_unrestricted_allows_escape() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_path("/tmp", dir.path(), false).is_ok());
    }

    #[test]
    fn test_write_path_requires_parent_unless_created() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path();

        assert!(validate_write_path("a/b/out.txt", workspace, true, false).is_err());
        let path = validate_write_path("a/b/out.txt", workspace, true, true).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
