use crate::config::SessionStoreConfig;
use crate::error::SessionStoreError;
use log::{debug, info};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Per-instance credential directories under one root.
///
/// A directory counts as a known instance once the transport has written
/// its credential file into it.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    creds_file: String,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, config: &SessionStoreConfig) -> Self {
        Self {
            root: root.into(),
            creds_file: config.creds_file.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, instance_id: &str) -> Result<PathBuf, SessionStoreError> {
        validate_instance_id(instance_id)?;
        Ok(self.root.join(instance_id))
    }

    pub async fn is_known(&self, instance_id: &str) -> Result<bool, SessionStoreError> {
        let creds = self.instance_dir(instance_id)?.join(&self.creds_file);
        Ok(tokio::fs::try_exists(creds).await?)
    }

    /// Ids of every known instance, sorted. A missing root is an empty list.
    pub async fn list_instances(&self) -> Result<Vec<String>, SessionStoreError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if tokio::fs::try_exists(entry.path().join(&self.creds_file)).await? {
                instances.push(name);
            }
        }
        instances.sort();
        debug!(
            target: "Instance/Store",
            "Found {} instance(s) under {}",
            instances.len(),
            self.root.display()
        );
        Ok(instances)
    }

    /// Removes the instance directory. Returns false if there was none.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<bool, SessionStoreError> {
        let dir = self.instance_dir(instance_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(
                    target: "Instance/Store",
                    "Deleted session directory {}",
                    dir.display()
                );
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_instance_id(instance_id: &str) -> Result<(), SessionStoreError> {
    let invalid = instance_id.is_empty()
        || instance_id == "."
        || instance_id.contains("..")
        || instance_id.contains(['/', '\\'])
        || instance_id.contains('\0');
    if invalid {
        return Err(SessionStoreError::InvalidInstanceId(instance_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_with(dirs: &[(&str, bool)]) -> (TempDir, SessionStore) {
        let root = tempfile::tempdir().unwrap();
        for (id, with_creds) in dirs {
            let dir = root.path().join(id);
            tokio::fs::create_dir_all(&dir).await.unwrap();
            if *with_creds {
                tokio::fs::write(dir.join("creds.json"), b"{}").await.unwrap();
            }
        }
        let store = SessionStore::new(root.path(), &SessionStoreConfig::default());
        (root, store)
    }

    #[tokio::test]
    async fn test_lists_only_dirs_with_credentials() {
        let (root, store) = store_with(&[("work", true), ("home", true), ("half", false)]).await;
        tokio::fs::write(root.path().join("stray.txt"), b"x").await.unwrap();

        assert_eq!(store.list_instances().await.unwrap(), vec!["home", "work"]);
        assert!(store.is_known("work").await.unwrap());
        assert!(!store.is_known("half").await.unwrap());
        assert!(!store.is_known("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = SessionStore::new(root.path().join("nope"), &SessionStoreConfig::default());
        assert!(store.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_instance() {
        let (_root, store) = store_with(&[("work", true)]).await;

        assert!(store.delete_instance("work").await.unwrap());
        assert!(!store.delete_instance("work").await.unwrap());
        assert!(store.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_escapes() {
        let (_root, store) = store_with(&[]).await;
        for id in ["", ".", "..", "../etc", "a/b", "a\\b"] {
            assert!(
                matches!(
                    store.delete_instance(id).await,
                    Err(SessionStoreError::InvalidInstanceId(_))
                ),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_custom_creds_file() {
        let config = SessionStoreConfig {
            creds_file: "session.db".into(),
        };
        let store = SessionStore::new("/var/lib/instances", &config);
        assert_eq!(
            store.instance_dir("work").unwrap(),
            PathBuf::from("/var/lib/instances/work")
        );
    }
}
