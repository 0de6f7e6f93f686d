use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ambient system configuration handed to the filesystem layer at
/// construction. The daemon loads and persists this record; this crate only
/// consumes it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Base directory under which every server's sandbox root lives.
    pub root_directory: PathBuf,
    /// Minimum number of seconds between full disk-usage recounts.
    #[serde(default = "default_disk_check_interval")]
    pub disk_check_interval: u64,
    /// Ownership applied to files and directories created on behalf of a
    /// server. Nothing is chowned when unset.
    #[serde(default)]
    pub user: Option<OwnershipConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct OwnershipConfig {
    pub uid: u32,
    pub gid: u32,
}

fn default_disk_check_interval() -> u64 {
    150
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("/var/lib/pinion/volumes"),
            disk_check_interval: default_disk_check_interval(),
            user: None,
        }
    }
}
