use super::error::UndoError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Opaque per-session undo state, one `<session>.json` file each.
#[derive(Debug, Clone)]
pub struct UndoSnapshotStore {
    dir: PathBuf,
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl UndoSnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, UndoError> {
        if !valid_session_id(session_id) {
            return Err(UndoError::denied(
                self.dir.join(session_id),
                "session id must be a plain file name",
            ));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    /// Writes through a temp file and rename, then reads the file back to
    /// confirm it holds exactly `data`.
    pub async fn save(&self, session_id: &str, data: &[u8]) -> Result<(), UndoError> {
        let target = self.path_for(session_id)?;
        let dir = self.dir.clone();
        let destination = target.clone();
        let bytes = data.to_vec();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&destination).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| UndoError::io(&target, std::io::Error::other(e)))?
        .map_err(|e| UndoError::io(&target, e))?;

        let written = tokio::fs::read(&target)
            .await
            .map_err(|e| UndoError::io(&target, e))?;
        if written != data {
            return Err(UndoError::Conflict {
                path: target,
                expected: format!("{} bytes", data.len()),
                found: format!("{} bytes read back", written.len()),
            });
        }
        log::debug!("Saved undo state for {session_id} ({} bytes)", data.len());
        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>, UndoError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UndoError::io(&path, e)),
        }
    }

    /// Returns whether a snapshot existed.
    pub async fn remove(&self, session_id: &str) -> Result<bool, UndoError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(UndoError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_load_and_remove() {
        let tmp = TempDir::new().unwrap();
        let store = UndoSnapshotStore::new(tmp.path().join("undo"));

        assert_eq!(store.load("s1").await.unwrap(), None);
        store.save("s1", br#"{"stack":[1,2]}"#).await.unwrap();
        store.save("s1", br#"{"stack":[3]}"#).await.unwrap();
        assert_eq!(
            store.load("s1").await.unwrap().as_deref(),
            Some(br#"{"stack":[3]}"#.as_slice())
        );
        assert!(tmp.path().join("undo/s1.json").exists());

        assert!(store.remove("s1").await.unwrap());
        assert!(!store.remove("s1").await.unwrap());
        assert_eq!(store.load("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_ids_that_are_not_plain_names() {
        let tmp = TempDir::new().unwrap();
        let store = UndoSnapshotStore::new(tmp.path().to_path_buf());
        for bad in ["", "../escape", "a/b", "."] {
            assert!(matches!(
                store.save(bad, b"{}").await,
                Err(UndoError::AccessDenied { .. })
            ));
        }
    }
}
