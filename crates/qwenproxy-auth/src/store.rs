use std::path::{Path, PathBuf};

use crate::credentials::Credentials;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential file not found at {0}")]
    NotFound(PathBuf),
    #[error("credential file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("permission denied reading {0}")]
    PermissionDenied(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Loads and saves the on-disk credential record at
/// `<working_dir>/<qwen_dir>/oauth_creds.json`.
///
/// Holds no in-memory cache; the Auth Coordinator is the authoritative
/// in-process copy and is the store's sole caller.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(working_dir: impl AsRef<Path>, qwen_dir: impl AsRef<Path>) -> Self {
        Self {
            path: working_dir.as_ref().join(qwen_dir).join("oauth_creds.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Credentials, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()));
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(StoreError::PermissionDenied(self.path.clone()));
            }
            Err(err) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source: err,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes via a temp file + rename in the same directory so a concurrent
    /// `load` never observes a torn write.
    pub async fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let Some(parent) = self.path.parent() else {
            return Err(StoreError::Io {
                path: self.path.clone(),
                source: std::io::Error::other("credential path has no parent directory"),
            });
        };
        create_dir_user_only(parent).await.map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;

        let body = serde_json::to_vec_pretty(credentials).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        set_mode(&tmp_path, 0o644).await.map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(unix)]
async fn create_dir_user_only(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn create_dir_user_only(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credentials {
        Credentials {
            access_token: "tok".into(),
            token_type: "Bearer".into(),
            refresh_token: "ref".into(),
            expiry_date: 1_700_000_000_000,
            resource_url: Some("https://dashscope.example.com/v1".into()),
        }
    }

    #[tokio::test]
    async fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), ".qwen");
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), ".qwen");
        let creds = sample();
        store.save(&creds).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, creds);
    }

    #[tokio::test]
    async fn corrupt_file_is_distinguished_from_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), ".qwen");
        tokio::fs::create_dir_all(dir.path().join(".qwen")).await.unwrap();
        tokio::fs::write(store.path(), b"not json").await.unwrap();
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn save_is_idempotent_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), ".qwen");
        let creds = sample();
        store.save(&creds).await.unwrap();
        let first = tokio::fs::read(store.path()).await.unwrap();
        store.save(&creds).await.unwrap();
        let second = tokio::fs::read(store.path()).await.unwrap();
        assert_eq!(first, second);
    }
}
