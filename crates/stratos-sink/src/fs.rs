//! Filesystem sink: one file per (client, data type) under a root directory.
//!
//! Writes replace the previous file contents. They are not atomic, so a crash
//! in the middle of a write can leave a truncated file behind.

use std::path::{Component, Path, PathBuf};

use crate::SinkError;

/// Writes packet payloads to files under `root`.
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    /// Use `root` as the sink directory, creating it if needed.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(SinkError::io(&root))?;
        Ok(Self { root })
    }

    /// The sink directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create or overwrite `file_name` under the root with `contents`.
    ///
    /// Returns the full path written.
    pub async fn write(&self, file_name: &str, contents: &[u8]) -> Result<PathBuf, SinkError> {
        let path = self.resolve(file_name)?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(SinkError::io(&path))?;
        tracing::debug!(path = %path.display(), bytes = contents.len(), "Wrote sink file");
        Ok(path)
    }

    /// Delete every file directly under the root.
    ///
    /// Subdirectories and their contents are left alone. Returns the number of
    /// files removed; clearing an empty directory is not an error.
    pub async fn clear_logs(&self) -> Result<usize, SinkError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(SinkError::io(&self.root))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(SinkError::io(&self.root))?
        {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(SinkError::io(&path))?;
            if file_type.is_dir() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                // Another session or process got there first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SinkError::io(&path)(e)),
            }
        }

        tracing::info!(root = %self.root.display(), removed, "Cleared sink directory");
        Ok(removed)
    }

    fn resolve(&self, file_name: &str) -> Result<PathBuf, SinkError> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(file_name)),
            _ => Err(SinkError::InvalidFileName(file_name.to_string())),
        }
    }
}
