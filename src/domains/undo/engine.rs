use super::error::UndoError;
use super::paths::PathPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SNIPPET_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UndoOperation {
    /// Replaces the single occurrence of `old_text`.
    #[serde(rename_all = "camelCase")]
    Replace {
        path: PathBuf,
        old_text: String,
        new_text: String,
    },
    Delete {
        path: PathBuf,
    },
    /// Creates the file or overwrites it entirely.
    Write {
        path: PathBuf,
        content: String,
    },
}

impl UndoOperation {
    pub fn path(&self) -> &Path {
        match self {
            UndoOperation::Replace { path, .. }
            | UndoOperation::Delete { path }
            | UndoOperation::Write { path, .. } => path,
        }
    }

    fn leaves_file(&self) -> bool {
        !matches!(self, UndoOperation::Delete { .. })
    }
}

/// State a single applied operation replaced; `None` means the file did not exist.
#[derive(Debug)]
pub struct AppliedRecord {
    pub path: PathBuf,
    pub previous: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySuccess {
    pub applied: usize,
}

#[derive(Debug)]
pub struct ApplyFailure {
    pub error: UndoError,
    pub rolled_back: usize,
}

pub struct UndoTransactionEngine {
    policy: PathPolicy,
}

impl UndoTransactionEngine {
    pub fn new(allowed_roots: &[PathBuf]) -> Self {
        Self {
            policy: PathPolicy::new(allowed_roots),
        }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Applies `operations` in order. Either all of them land, or every one
    /// that did land is reverted before the error is returned.
    pub async fn apply(&self, operations: &[UndoOperation]) -> Result<ApplySuccess, ApplyFailure> {
        for op in operations {
            self.policy
                .validate(op.path())
                .await
                .map_err(|error| ApplyFailure {
                    error,
                    rolled_back: 0,
                })?;
        }

        let mut applied = Vec::with_capacity(operations.len());
        for (index, op) in operations.iter().enumerate() {
            match apply_one(op).await {
                Ok(record) => applied.push(record),
                Err(error) => {
                    log::warn!(
                        "Undo operation {} of {} failed, rolling back {} applied: {error}",
                        index + 1,
                        operations.len(),
                        applied.len()
                    );
                    let rolled_back = rollback(applied).await;
                    return Err(ApplyFailure { error, rolled_back });
                }
            }
        }

        log::debug!("Applied undo batch of {} operations", applied.len());
        Ok(ApplySuccess {
            applied: applied.len(),
        })
    }

    /// The batch that restores every path `operations` touches to what is on
    /// disk right now. Capture it before applying `operations`.
    pub async fn capture_inverse(
        &self,
        operations: &[UndoOperation],
    ) -> Result<Vec<UndoOperation>, UndoError> {
        let mut order: Vec<&Path> = Vec::new();
        let mut exists_after: HashMap<&Path, bool> = HashMap::new();
        for op in operations {
            self.policy.validate(op.path()).await?;
            if exists_after.insert(op.path(), op.leaves_file()).is_none() {
                order.push(op.path());
            }
        }

        let mut inverse = Vec::with_capacity(order.len());
        for path in order {
            match read_optional(path).await? {
                Some(bytes) => {
                    let content = String::from_utf8(bytes).map_err(|e| UndoError::Io {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    })?;
                    inverse.push(UndoOperation::Write {
                        path: path.to_path_buf(),
                        content,
                    });
                }
                None if exists_after.get(path).copied().unwrap_or(false) => {
                    inverse.push(UndoOperation::Delete {
                        path: path.to_path_buf(),
                    });
                }
                None => {}
            }
        }
        Ok(inverse)
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, UndoError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(UndoError::io(path, e)),
    }
}

fn snippet(text: &str) -> String {
    let mut out: String = text.chars().take(SNIPPET_CHARS).collect();
    if text.chars().count() > SNIPPET_CHARS {
        out.push_str("...");
    }
    format!("{out:?}")
}

/// Counts every position where `needle` starts, overlaps included, so
/// "aa" in "aaa" is ambiguous.
fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut from = 0;
    while let Some(offset) = haystack[from..].find(needle) {
        let at = from + offset;
        count += 1;
        from = at + haystack[at..].chars().next().map_or(1, char::len_utf8);
    }
    count
}

async fn apply_one(op: &UndoOperation) -> Result<AppliedRecord, UndoError> {
    match op {
        UndoOperation::Replace {
            path,
            old_text,
            new_text,
        } => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| UndoError::io(path, e))?;
            let current = String::from_utf8(bytes).map_err(|e| UndoError::Io {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
            let occurrences = count_occurrences(&current, old_text);
            if occurrences != 1 {
                return Err(UndoError::Conflict {
                    path: path.clone(),
                    expected: format!("exactly one occurrence of {}", snippet(old_text)),
                    found: format!("{occurrences} occurrences"),
                });
            }
            let updated = current.replacen(old_text.as_str(), new_text, 1);
            tokio::fs::write(path, updated.as_bytes())
                .await
                .map_err(|e| UndoError::io(path, e))?;
            Ok(AppliedRecord {
                path: path.clone(),
                previous: Some(current.into_bytes()),
            })
        }
        UndoOperation::Delete { path } => {
            let previous = tokio::fs::read(path)
                .await
                .map_err(|e| UndoError::io(path, e))?;
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| UndoError::io(path, e))?;
            Ok(AppliedRecord {
                path: path.clone(),
                previous: Some(previous),
            })
        }
        UndoOperation::Write { path, content } => {
            let previous = read_optional(path).await?;
            tokio::fs::write(path, content.as_bytes())
                .await
                .map_err(|e| UndoError::io(path, e))?;
            Ok(AppliedRecord {
                path: path.clone(),
                previous,
            })
        }
    }
}

async fn revert(record: &AppliedRecord) -> std::io::Result<()> {
    match &record.previous {
        Some(bytes) => tokio::fs::write(&record.path, bytes).await,
        None => match tokio::fs::remove_file(&record.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

/// Reverts newest first. Failures are logged and skipped; returns how many
/// records were restored.
async fn rollback(applied: Vec<AppliedRecord>) -> usize {
    let mut restored = 0;
    for record in applied.iter().rev() {
        match revert(record).await {
            Ok(()) => restored += 1,
            Err(e) => log::warn!("Failed to roll back {}: {e}", record.path.display()),
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        engine: UndoTransactionEngine,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = UndoTransactionEngine::new(&[dir.path().to_path_buf()]);
        let root = engine.policy().roots()[0].clone();
        Fixture {
            _dir: dir,
            root,
            engine,
        }
    }

    fn replace(path: &Path, old: &str, new: &str) -> UndoOperation {
        UndoOperation::Replace {
            path: path.to_path_buf(),
            old_text: old.into(),
            new_text: new.into(),
        }
    }

    #[tokio::test]
    async fn applies_every_kind_of_operation() {
        let fx = fixture();
        let edited = fx.root.join("edited.txt");
        let removed = fx.root.join("removed.txt");
        let created = fx.root.join("created.txt");
        std::fs::write(&edited, "let x = 1;\n").unwrap();
        std::fs::write(&removed, "bye").unwrap();

        let ops = vec![
            replace(&edited, "x = 1", "x = 2"),
            UndoOperation::Delete {
                path: removed.clone(),
            },
            UndoOperation::Write {
                path: created.clone(),
                content: "fresh".into(),
            },
        ];
        let outcome = fx.engine.apply(&ops).await.unwrap();
        assert_eq!(outcome, ApplySuccess { applied: 3 });
        assert_eq!(std::fs::read_to_string(&edited).unwrap(), "let x = 2;\n");
        assert!(!removed.exists());
        assert_eq!(std::fs::read_to_string(&created).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn ambiguous_replacement_is_a_conflict_and_leaves_file_untouched() {
        let fx = fixture();
        let path = fx.root.join("dup.txt");
        std::fs::write(&path, "foo and foo").unwrap();

        let failure = fx
            .engine
            .apply(&[replace(&path, "foo", "bar")])
            .await
            .unwrap_err();
        assert_eq!(failure.rolled_back, 0);
        match failure.error {
            UndoError::Conflict { expected, found, .. } => {
                assert_eq!(expected, "exactly one occurrence of \"foo\"");
                assert_eq!(found, "2 occurrences");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo and foo");
    }

    #[tokio::test]
    async fn overlapping_matches_make_a_replacement_ambiguous() {
        let fx = fixture();
        let path = fx.root.join("overlap.txt");
        std::fs::write(&path, "aaa").unwrap();

        let failure = fx
            .engine
            .apply(&[replace(&path, "aa", "b")])
            .await
            .unwrap_err();
        match failure.error {
            UndoError::Conflict { found, .. } => assert_eq!(found, "2 occurrences"),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "aaa");
    }

    #[test]
    fn occurrence_count_steps_one_char_at_a_time() {
        assert_eq!(count_occurrences("aaa", "aa"), 2);
        assert_eq!(count_occurrences("ééé", "éé"), 2);
        assert_eq!(count_occurrences("abc", "x"), 0);
        assert_eq!(count_occurrences("abc", ""), 0);
    }

    #[tokio::test]
    async fn failure_midway_rolls_back_in_reverse_and_stops() {
        let fx = fixture();
        let first = fx.root.join("first.txt");
        let missing = fx.root.join("missing.txt");
        let third = fx.root.join("third.txt");
        std::fs::write(&first, "original").unwrap();

        let ops = vec![
            UndoOperation::Write {
                path: first.clone(),
                content: "changed".into(),
            },
            replace(&missing, "a", "b"),
            UndoOperation::Write {
                path: third.clone(),
                content: "never".into(),
            },
        ];
        let failure = fx.engine.apply(&ops).await.unwrap_err();
        assert_eq!(failure.rolled_back, 1);
        assert!(matches!(failure.error, UndoError::NotFound { .. }));
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "original");
        assert!(!third.exists());
    }

    #[tokio::test]
    async fn rollback_removes_files_the_batch_created() {
        let fx = fixture();
        let created = fx.root.join("created.txt");
        let target = fx.root.join("target.txt");
        std::fs::write(&target, "no match here").unwrap();

        let failure = fx
            .engine
            .apply(&[
                UndoOperation::Write {
                    path: created.clone(),
                    content: "temp".into(),
                },
                replace(&target, "absent", "x"),
            ])
            .await
            .unwrap_err();
        assert_eq!(failure.rolled_back, 1);
        assert!(!created.exists());
    }

    #[tokio::test]
    async fn invalid_path_anywhere_aborts_before_any_write() {
        let fx = fixture();
        let inside = fx.root.join("inside.txt");
        let outside = TempDir::new().unwrap();

        let failure = fx
            .engine
            .apply(&[
                UndoOperation::Write {
                    path: inside.clone(),
                    content: "x".into(),
                },
                UndoOperation::Write {
                    path: outside.path().join("o.txt"),
                    content: "x".into(),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(failure.error, UndoError::AccessDenied { .. }));
        assert_eq!(failure.rolled_back, 0);
        assert!(!inside.exists());
    }

    #[tokio::test]
    async fn captured_inverse_restores_contents_and_existence() {
        let fx = fixture();
        let edited = fx.root.join("edited.txt");
        let removed = fx.root.join("removed.txt");
        let created = fx.root.join("created.txt");
        let transient = fx.root.join("transient.txt");
        std::fs::write(&edited, "alpha beta\n").unwrap();
        std::fs::write(&removed, "keep me").unwrap();

        let ops = vec![
            replace(&edited, "beta", "gamma"),
            UndoOperation::Delete {
                path: removed.clone(),
            },
            UndoOperation::Write {
                path: created.clone(),
                content: "new".into(),
            },
            UndoOperation::Write {
                path: transient.clone(),
                content: "short-lived".into(),
            },
            UndoOperation::Delete {
                path: transient.clone(),
            },
        ];
        let inverse = fx.engine.capture_inverse(&ops).await.unwrap();
        assert_eq!(inverse.len(), 3);

        fx.engine.apply(&ops).await.unwrap();
        fx.engine.apply(&inverse).await.unwrap();

        assert_eq!(std::fs::read(&edited).unwrap(), b"alpha beta\n");
        assert_eq!(std::fs::read(&removed).unwrap(), b"keep me");
        assert!(!created.exists());
        assert!(!transient.exists());
    }

    #[test]
    fn operations_use_tagged_camel_case_json() {
        let op: UndoOperation = serde_json::from_str(
            r#"{"type":"replace","path":"/tmp/a","oldText":"a","newText":"b"}"#,
        )
        .unwrap();
        assert_eq!(op, replace(Path::new("/tmp/a"), "a", "b"));
        let json = serde_json::to_value(ApplySuccess { applied: 2 }).unwrap();
        assert_eq!(json["applied"], 2);
    }
}
