use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Bucket holding uploaded audio.
pub const AUDIO_BUCKET: &str = "beat-files";
/// Bucket holding cover art.
pub const COVER_BUCKET: &str = "cover-arts";

/// File storage rooted at a directory. Objects live at `<root>/<bucket>/<path>`
/// and are served from `<public_url>/<bucket>/<path>`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    public_url: String,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Store `bytes` and return the public URL of the object.
    pub async fn upload(&self, bucket: &str, path: &str, bytes: &[u8]) -> Result<String> {
        let target = self.object_path(bucket, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}/{}", bucket, path))?;
        debug!(bucket, path, size = bytes.len(), "blob stored");
        Ok(self.public_url_for(bucket, path))
    }

    /// Delete an object. Removing a missing object is not an error.
    pub async fn remove(&self, bucket: &str, path: &str) -> Result<()> {
        let target = self.object_path(bucket, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                debug!(bucket, path, "blob removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove blob {}/{}", bucket, path)),
        }
    }

    pub fn public_url_for(&self, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", self.public_url, bucket, path)
    }

    /// Recover the object path from a public URL: everything after `/<bucket>/`.
    pub fn path_from_url<'a>(&self, bucket: &str, url: &'a str) -> Option<&'a str> {
        let marker = format!("/{}/", bucket);
        url.split_once(marker.as_str())
            .map(|(_, path)| path)
            .filter(|path| !path.is_empty())
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            bail!("Invalid blob path: {:?}", path);
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

/// Object name for an upload: `<owner>/<millis>_<file name>` with unsafe characters replaced.
pub fn object_name(owner: &str, file_name: &str, millis: i64) -> String {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let safe: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}/{}_{}", owner, millis, safe)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_upload_then_remove() -> Result<()> {
        let dir = TempDir::new()?;
        let store = BlobStore::new(dir.path(), "http://cdn.local/");
        let on_disk = dir.path().join("beat-files/u1/1_take.mp3");

        let url = store.upload(AUDIO_BUCKET, "u1/1_take.mp3", b"ID3").await?;
        assert_eq!(url, "http://cdn.local/beat-files/u1/1_take.mp3");
        assert_eq!(std::fs::read(&on_disk)?, b"ID3");

        store.remove(AUDIO_BUCKET, "u1/1_take.mp3").await?;
        assert!(!on_disk.exists());
        // second removal is a no-op
        store.remove(AUDIO_BUCKET, "u1/1_take.mp3").await?;
        Ok(())
    }

    #[test]
    fn test_path_from_url() {
        let store = BlobStore::new("/tmp", "http://cdn.local");
        let url = store.public_url_for(COVER_BUCKET, "u1/9_art.png");
        assert_eq!(store.path_from_url(COVER_BUCKET, &url), Some("u1/9_art.png"));
        assert_eq!(store.path_from_url(AUDIO_BUCKET, &url), None);
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let store = BlobStore::new("/tmp", "http://cdn.local");
        assert!(store.upload(AUDIO_BUCKET, "../etc/passwd", b"x").await.is_err());
        assert!(store.upload(AUDIO_BUCKET, "/abs", b"x").await.is_err());
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name("u1", "My Beat (final).wav", 42), "u1/42_My_Beat__final_.wav");
        assert_eq!(object_name("u1", "/home/me/loop.mp3", 7), "u1/7_loop.mp3");
    }
}
