use std::path::Path;

use crate::config::SystemConfig;
use crate::error::Result;

use super::ServerFileSystem;

/// Creates per-server sandbox roots under the daemon's base directory.
#[derive(Debug)]
pub struct FileSystemManager {
    config: SystemConfig,
}

impl FileSystemManager {
    pub fn new(config: SystemConfig) -> Self {
        Self { config }
    }

    /// Directory under which every server root is created.
    pub fn base_path(&self) -> &Path {
        &self.config.root_directory
    }

    /// Creates the root directory for `server_id` if needed and returns a
    /// filesystem confined to it. This is the only place a root is created;
    /// the instance itself requires it to exist. A `disk_limit_bytes` of 0
    /// means unlimited.
    pub async fn create_server_filesystem(
        &self,
        server_id: &str,
        disk_limit_bytes: u64,
    ) -> Result<ServerFileSystem> {
        let root = self.config.root_directory.join(server_id);

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        builder.mode(0o755);
        builder.create(&root).await?;

        ServerFileSystem::new(root, disk_limit_bytes, &self.config).await
    }
}
