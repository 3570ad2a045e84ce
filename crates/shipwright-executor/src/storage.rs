//! On-disk layout of the worker's storage directory.
//!
//! ```text
//! <root>/repositories/<project-id>/   project checkouts
//! <root>/keys/<key-id>                key material, owner-only
//! ```

use shipwright_core::Key;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::ExecutorResult;

/// Paths below the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Creates a layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every checkout
    #[must_use]
    pub fn repositories_dir(&self) -> PathBuf {
        self.root.join("repositories")
    }

    /// Checkout of one project
    #[must_use]
    pub fn repository(&self, project_id: u64) -> PathBuf {
        self.repositories_dir().join(project_id.to_string())
    }

    /// Directory holding key files
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    /// File of one key
    #[must_use]
    pub fn key_path(&self, key_id: u64) -> PathBuf {
        self.keys_dir().join(key_id.to_string())
    }

    /// Writes `key` to its file, replacing any previous content
    ///
    /// The keys directory is created with mode 0700 and the file with mode
    /// 0600.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory or the file cannot be written.
    pub async fn write_key(&self, key: &Key) -> ExecutorResult<PathBuf> {
        let dir = self.keys_dir();
        create_private_dir(&dir).await?;

        let path = self.key_path(key.id);
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path).await?;
        file.write_all(key.key.as_bytes()).await?;
        file.flush().await?;
        restrict(&path, 0o600).await?;

        debug!(key_id = key.id, path = %path.display(), "key written");
        Ok(path)
    }
}

async fn create_private_dir(dir: &Path) -> ExecutorResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    restrict(dir, 0o700).await
}

#[cfg(unix)]
async fn restrict(path: &Path, mode: u32) -> ExecutorResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict(_path: &Path, _mode: u32) -> ExecutorResult<()> {
    Ok(())
}
