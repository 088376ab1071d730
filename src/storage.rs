//! Artifact storage: rendered videos land on local disk or in GCS.
//!
//! Backend is selected by env: `LOCAL_STORAGE_PATH` wins, otherwise GCS via
//! `GOOGLE_APPLICATION_CREDENTIALS`.

use bytes::Bytes;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    NotConfigured,
    Io(std::io::Error),
    Gcs(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotConfigured => write!(
                f,
                "no storage backend configured (set LOCAL_STORAGE_PATH or GOOGLE_APPLICATION_CREDENTIALS)"
            ),
            StorageError::Io(e) => write!(f, "local storage error: {}", e),
            StorageError::Gcs(s) => write!(f, "GCS error: {}", s),
        }
    }
}

impl std::error::Error for StorageError {}

pub struct ArtifactStore {
    gcs: Option<google_cloud_storage::client::Storage>,
    local_path: Option<PathBuf>,
    bucket: String,
    public_base_url: Option<String>,
}

impl ArtifactStore {
    pub fn new(
        gcs: Option<google_cloud_storage::client::Storage>,
        local_path: Option<PathBuf>,
        bucket: String,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            gcs,
            local_path,
            bucket,
            public_base_url,
        }
    }

    /// Store artifact bytes under `path` and return the URL the publish
    /// collaborator will fetch it from.
    pub async fn store(&self, path: &str, data: &[u8]) -> Result<String, StorageError> {
        if let Some(local) = &self.local_path {
            let full_path = local.join(path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(StorageError::Io)?;
            }
            tokio::fs::write(&full_path, data)
                .await
                .map_err(StorageError::Io)?;
            Ok(self.url_for(path, &full_path))
        } else if let Some(gcs) = &self.gcs {
            let bucket = format!("projects/_/buckets/{}", self.bucket);
            let bytes = Bytes::copy_from_slice(data);
            gcs.write_object(&bucket, path, bytes)
                .send_buffered()
                .await
                .map_err(|e| StorageError::Gcs(e.to_string()))?;
            Ok(format!(
                "https://storage.googleapis.com/{}/{}",
                self.bucket, path
            ))
        } else {
            Err(StorageError::NotConfigured)
        }
    }

    fn url_for(&self, path: &str, full_path: &std::path::Path) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), path),
            None => full_path.to_string_lossy().into_owned(),
        }
    }
}
