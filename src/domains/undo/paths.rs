use super::error::UndoError;
use std::path::{Component, Path, PathBuf};

/// Allowed roots for undo targets, stored canonicalized.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    roots: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(roots: &[PathBuf]) -> Self {
        let roots = roots
            .iter()
            .filter_map(|root| match std::fs::canonicalize(root) {
                Ok(canonical) => Some(canonical),
                Err(e) => {
                    log::warn!("Ignoring undo root {}: {e}", root.display());
                    None
                }
            })
            .collect::<Vec<_>>();
        if roots.is_empty() {
            log::warn!("No usable undo roots configured; every undo path will be denied");
        }
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Accepts `path` only if it is absolute, already normalized, and its real
    /// location (following symlinks of the existing prefix) is inside a root.
    pub async fn validate(&self, path: &Path) -> Result<(), UndoError> {
        if !path.is_absolute() {
            return Err(UndoError::denied(path, "path must be absolute"));
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(UndoError::denied(path, "path contains traversal segments"));
        }
        let normalized: PathBuf = path.components().collect();
        if normalized.as_os_str() != path.as_os_str() {
            return Err(UndoError::denied(path, "path is not in normal form"));
        }

        let resolved = resolve_existing_prefix(path).await?;
        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(())
        } else {
            Err(UndoError::denied(path, "path is outside the allowed roots"))
        }
    }
}

/// Canonicalizes the longest existing ancestor and re-appends the rest.
async fn resolve_existing_prefix(path: &Path) -> Result<PathBuf, UndoError> {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        match tokio::fs::canonicalize(existing).await {
            Ok(mut canonical) => {
                for name in missing.iter().rev() {
                    canonical.push(name);
                }
                return Ok(canonical);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(UndoError::io(path, e));
                };
                missing.push(name);
                existing = parent;
            }
            Err(e) => return Err(UndoError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reason(err: UndoError) -> String {
        match err {
            UndoError::AccessDenied { reason, .. } => reason,
            other => panic!("expected access denied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepts_existing_and_new_files_inside_root() {
        let root = TempDir::new().unwrap();
        let policy = PathPolicy::new(&[root.path().to_path_buf()]);
        let base = policy.roots()[0].clone();
        std::fs::write(base.join("a.txt"), "a").unwrap();

        policy.validate(&base.join("a.txt")).await.unwrap();
        policy.validate(&base.join("new/dir/b.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_relative_traversal_and_outside_paths() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let policy = PathPolicy::new(&[root.path().to_path_buf()]);
        let base = policy.roots()[0].clone();

        assert_eq!(
            reason(policy.validate(Path::new("a.txt")).await.unwrap_err()),
            "path must be absolute"
        );
        assert_eq!(
            reason(policy.validate(&base.join("../escape.txt")).await.unwrap_err()),
            "path contains traversal segments"
        );
        let dotted = PathBuf::from(format!("{}/./a.txt", base.display()));
        assert!(policy.validate(&dotted).await.is_err());
        assert_eq!(
            reason(policy.validate(&other.path().join("x.txt")).await.unwrap_err()),
            "path is outside the allowed roots"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escaping_the_root_is_denied() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let policy = PathPolicy::new(&[root.path().to_path_buf()]);
        let base = policy.roots()[0].clone();
        std::os::unix::fs::symlink(outside.path(), base.join("link")).unwrap();

        assert_eq!(
            reason(policy.validate(&base.join("link/file.txt")).await.unwrap_err()),
            "path is outside the allowed roots"
        );
    }
}
