//! On-disk store for state records, one JSON file per resource name.

use crate::{
    errors::{ReconcileError, ReconcileResult},
    models::observed::ObjectState,
};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resource names become file names, so they must stay a single path component.
    fn path_for(&self, name: &str) -> ReconcileResult<PathBuf> {
        let valid = !name.is_empty()
            && name.len() <= 255
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(ReconcileError::validation(format!(
                "invalid resource name `{}`",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }

    pub async fn load(&self, name: &str) -> ReconcileResult<Option<ObjectState>> {
        let path = self.path_for(name)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ReconcileError::State { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ReconcileError::StateDecode { path, source })
    }

    /// Write through a temp file and rename, so readers never see half a record.
    pub async fn save(&self, state: &ObjectState) -> ReconcileResult<()> {
        let path = self.path_for(&state.name)?;
        let json = serde_json::to_vec_pretty(state).map_err(|source| ReconcileError::StateDecode {
            path: path.clone(),
            source,
        })?;

        let io_err = |source| ReconcileError::State {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let tmp_path = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::write(&tmp_path, &json).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_err(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_err(err));
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> ReconcileResult<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ReconcileError::State { path, source }),
        }
    }

    /// Names of every stored record.
    pub async fn list(&self) -> ReconcileResult<Vec<String>> {
        let io_err = |source| ReconcileError::State {
            path: self.dir.clone(),
            source,
        };
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(err)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(name) = file_name.strip_suffix(".json") {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        desired::ObjectHeaders, identity::ObjectId, lock::LockState, observed::ObservedState,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(name: &str) -> ObjectState {
        ObjectState {
            name: name.into(),
            id: ObjectId::new("bucket", "key"),
            observed: ObservedState {
                etag: "d41d8cd98f00b204e9800998ecf8427e".into(),
                version_id: None,
                content_length: 0,
                headers: ObjectHeaders::default(),
                storage_class: "STANDARD".into(),
                server_side_encryption: None,
                kms_key_id: None,
                bucket_key_enabled: false,
                lock: LockState::default(),
                metadata: BTreeMap::new(),
                tags: BTreeMap::new(),
                last_modified: Utc::now(),
            },
            content_hash: "d41d8cd98f00b204e9800998ecf8427e".into(),
            source_hash: None,
            acl: Some("private".into()),
            force_destroy: true,
        }
    }

    #[tokio::test]
    async fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));

        assert!(store.load("object").await.unwrap().is_none());
        let saved = record("object");
        store.save(&saved).await.unwrap();
        assert_eq!(store.load("object").await.unwrap(), Some(saved));
        assert_eq!(store.list().await.unwrap(), vec!["object".to_string()]);

        store.remove("object").await.unwrap();
        store.remove("object").await.unwrap();
        assert!(store.load("object").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn names_must_be_plain_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        for name in ["", "../escape", "a/b", ".hidden"] {
            let err = store.load(name).await.unwrap_err();
            assert!(matches!(err, ReconcileError::Validation(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn garbage_record_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let store = StateStore::new(dir.path());
        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, ReconcileError::StateDecode { .. }));
    }
}
