//! Driver configuration.
//!
//! The values are supplied by the daemon (flags or environment); this module
//! only holds them and checks the ones that make serving impossible.

use std::path::PathBuf;

use base64::{Engine, engine::general_purpose};

use crate::error::VolumeError;
use crate::mount::AccountKey;

/// Default DNS suffix of the public Azure cloud.
pub const DEFAULT_STORAGE_BASE: &str = "core.windows.net";
/// Default directory under which every volume gets its mountpoint.
pub const DEFAULT_MOUNT_ROOT: &str = "/var/run/docker/volumedriver/azurefile";
/// Default directory holding one metadata file per volume.
pub const DEFAULT_METADATA_ROOT: &str = "/etc/docker/plugins/azurefile/volumes";

/// Everything the coordinator needs to know about its environment.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Storage account name; also the identity stamped into new volumes.
    pub account_name: String,
    pub account_key: AccountKey,
    pub storage_base: String,
    pub mount_root: PathBuf,
    pub metadata_root: PathBuf,
    /// Delete the backing share when a volume is removed.
    pub remove_shares: bool,
}

impl DriverConfig {
    pub fn new(account_name: impl Into<String>, account_key: AccountKey) -> Self {
        Self {
            account_name: account_name.into(),
            account_key,
            storage_base: DEFAULT_STORAGE_BASE.to_owned(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            metadata_root: PathBuf::from(DEFAULT_METADATA_ROOT),
            remove_shares: false,
        }
    }

    /// Reject configurations the driver cannot serve with.
    pub fn validate(&self) -> Result<(), VolumeError> {
        if self.account_name.is_empty() || self.account_key.is_empty() {
            return Err(VolumeError::Config(
                "azure storage account name and key must be provided".into(),
            ));
        }
        if general_purpose::STANDARD
            .decode(self.account_key.expose())
            .is_err()
        {
            return Err(VolumeError::Config(
                "azure storage account key is not valid base64".into(),
            ));
        }
        if self.storage_base.is_empty() {
            return Err(VolumeError::Config("storage base must not be empty".into()));
        }
        if !self.mount_root.is_absolute() || !self.metadata_root.is_absolute() {
            return Err(VolumeError::Config(
                "mount root and metadata root must be absolute paths".into(),
            ));
        }
        Ok(())
    }
}
