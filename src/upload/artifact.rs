//! Artifact Store
//!
//! Durable directory of completed uploads. Artifacts are named after their
//! content hash and published by renaming a fully written staging file, so a
//! reader either sees a complete artifact or none at all.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::types::UploadError;

/// Staging directory name inside the upload directory
const STAGING_DIR: &str = ".staging";

/// Directory of published artifacts
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the artifact and staging directories. Staging files left by
    /// an interrupted merge are deleted.
    pub async fn init(&self) -> Result<(), UploadError> {
        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "part") {
                tracing::debug!(path = %path.display(), "Removing leftover staging file");
                tokio::fs::remove_file(&path).await?;
            }
        }

        Ok(())
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Artifact name for a verified digest: `<hash><.ext>`
    pub fn artifact_name(content_hash: &str, extension: &str) -> String {
        format!("{}{}", content_hash, extension)
    }

    /// Resolve an artifact name to its path.
    ///
    /// Returns `None` for anything that is not a plain file name inside the
    /// store, including the staging directory.
    pub fn artifact_path(&self, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.contains("..");
        plain.then(|| self.root.join(name))
    }

    /// Size of a published artifact, or `None` if it does not exist
    pub async fn size(&self, name: &str) -> Result<Option<u64>, UploadError> {
        let Some(path) = self.artifact_path(name) else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, UploadError> {
        Ok(self.size(name).await?.is_some())
    }

    /// Open a new staging file for an assembly
    pub async fn stage(&self) -> Result<StagedArtifact, UploadError> {
        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.part", Uuid::new_v4()));
        let file = tokio::fs::File::create(&path).await?;

        Ok(StagedArtifact {
            file,
            path,
            root: self.root.clone(),
            written: 0,
        })
    }
}

/// An artifact being assembled in the staging directory
pub struct StagedArtifact {
    file: tokio::fs::File,
    path: PathBuf,
    root: PathBuf,
    written: u64,
}

impl StagedArtifact {
    /// Append bytes
    pub async fn write(&mut self, data: &[u8]) -> Result<(), UploadError> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush to disk and atomically move into place under `name`.
    ///
    /// Publishing over an existing artifact of the same name is harmless:
    /// same name means same verified content.
    pub async fn publish(mut self, name: &str) -> Result<PathBuf, UploadError> {
        let target = self.root.join(name);

        let published = async {
            self.file.flush().await?;
            self.file.sync_all().await?;
            tokio::fs::rename(&self.path, &target).await
        }
        .await;

        if let Err(e) = published {
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(UploadError::StorageError(format!(
                "Failed to publish artifact {}: {}",
                name, e
            )));
        }

        Ok(target)
    }

    /// Throw the staging file away
    pub async fn discard(self) {
        let StagedArtifact { file, path, .. } = self;
        drop(file);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stage_and_publish() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path());
        store.init().await.unwrap();

        let mut staged = store.stage().await.unwrap();
        staged.write(b"hello ").await.unwrap();
        staged.write(b"world").await.unwrap();
        assert_eq!(staged.written(), 11);

        // Not visible until published
        assert!(!store.exists("abc.txt").await.unwrap());

        let path = staged.publish("abc.txt").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
        assert_eq!(store.size("abc.txt").await.unwrap(), Some(11));

        // Staging directory is empty again
        assert_eq!(std::fs::read_dir(temp_dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_init_clears_leftover_staging_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path());

        let mut staged = store.stage().await.unwrap();
        staged.write(b"half").await.unwrap();
        drop(staged);

        store.init().await.unwrap();

        let leftovers = std::fs::read_dir(temp_dir.path().join(STAGING_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp_dir.path());

        let mut staged = store.stage().await.unwrap();
        staged.write(b"partial").await.unwrap();
        staged.discard().await;

        assert_eq!(std::fs::read_dir(temp_dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_artifact_path_rejects_traversal() {
        let store = ArtifactStore::new("/srv/uploads");
        assert!(store.artifact_path("abc.pdf").is_some());
        assert!(store.artifact_path("../etc/passwd").is_none());
        assert!(store.artifact_path(".staging").is_none());
        assert!(store.artifact_path("a/b").is_none());
        assert!(store.artifact_path("").is_none());
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(ArtifactStore::artifact_name("ab12", ".pdf"), "ab12.pdf");
        assert_eq!(ArtifactStore::artifact_name("ab12", ""), "ab12");
    }
}
