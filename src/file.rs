use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A file written for one request, deleted again when the handle is dropped.
pub struct TemporaryFile {
    path: PathBuf,
}

impl TemporaryFile {
    /// Write `contents` to a fresh file named `name` in the system temp
    /// directory.
    pub async fn create(name: &str, contents: &[u8]) -> Result<Self> {
        let path = std::env::temp_dir().join(name);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(TemporaryFile { path })
    }

    /// Return the path on the filesystem.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TemporaryFile {
    fn drop(&mut self) {
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tracing::trace!(path = %path.display(), "removing dropped file");
                    let _ = tokio::fs::remove_file(path).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
