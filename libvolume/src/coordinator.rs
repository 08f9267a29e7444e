//! Volume lifecycle coordinator.
//!
//! [`VolumeCoordinator`] is the [`VolumeDriver`] served to the orchestrator.
//! It owns no mount state of its own:
//!
//! * volume existence lives in the [`MetadataStore`] (one file per volume),
//! * mount activity lives in the kernel mount table and is re-read through a
//!   [`MountInspector`] on every unmount.
//!
//! # Serialization
//!
//! Every operation, for every volume, runs under one async mutex that is held
//! across the remote share calls and the mount invocations.
//!
//! # Failure model
//!
//! Nothing is rolled back.  Share creation happens before the metadata write
//! and share deletion before the metadata delete, so a failure can at worst
//! leave a share without a volume record.  Nothing is retried internally.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DriverConfig;
use crate::driver::VolumeDriver;
use crate::error::VolumeError;
use crate::metadata::MetadataStore;
use crate::mount::{CifsMounter, MountInspector, MountOptions, MountRequest, MountTable, Mounter};
use crate::share::{AzureFileClient, ShareClient};
use crate::types::{VolumeEntry, VolumeInfo, VolumeName};

const MOUNTPOINT_MODE: u32 = 0o700;

/// Serializes all volume operations and reconciles them with the OS.
pub struct VolumeCoordinator {
    config: DriverConfig,
    store: MetadataStore,
    shares: Arc<dyn ShareClient>,
    mounter: Arc<dyn Mounter>,
    inspector: Arc<dyn MountInspector>,
    lock: Mutex<()>,
}

impl VolumeCoordinator {
    /// Build a coordinator from explicit collaborators.
    ///
    /// Fails if `config` is unusable or the metadata root cannot be created.
    pub async fn new(
        config: DriverConfig,
        shares: Arc<dyn ShareClient>,
        mounter: Arc<dyn Mounter>,
        inspector: Arc<dyn MountInspector>,
    ) -> Result<Self, VolumeError> {
        config.validate()?;
        let store = MetadataStore::open(&config.metadata_root).await?;
        Ok(Self {
            config,
            store,
            shares,
            mounter,
            inspector,
            lock: Mutex::new(()),
        })
    }

    /// Production wiring: Azure Files, `mount -t cifs`, `/proc/self/mountinfo`.
    pub async fn from_config(config: DriverConfig) -> Result<Self, VolumeError> {
        config.validate()?;
        let shares = AzureFileClient::new(
            &config.account_name,
            &config.account_key,
            &config.storage_base,
        )?;
        Self::new(
            config,
            Arc::new(shares),
            Arc::new(CifsMounter::default()),
            Arc::new(MountTable::default()),
        )
        .await
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// `<mount_root>/<name>`.
    pub fn mountpoint(&self, name: &VolumeName) -> PathBuf {
        self.config.mount_root.join(name.as_str())
    }

    fn mount_request(&self, share: &str, target: PathBuf) -> MountRequest {
        MountRequest {
            account: self.config.account_name.clone(),
            key: self.config.account_key.clone(),
            storage_base: self.config.storage_base.clone(),
            share: share.to_owned(),
            target,
            options: MountOptions::default(),
        }
    }

    async fn create_locked(
        &self,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<(), VolumeError> {
        let name = VolumeName::parse(name)?;
        let mut meta = MetadataStore::validate(options)?;
        if meta.options.share.is_empty() {
            return Err(VolumeError::MissingShare);
        }

        match self.store.get(&name).await {
            // A record left by another account cannot be mounted from here.
            Ok(existing)
                if existing.options == meta.options
                    && existing.account == self.config.account_name =>
            {
                debug!(%name, "volume already exists with the same options");
                return Ok(());
            }
            Ok(existing) => {
                return Err(VolumeError::AlreadyExists {
                    name: name.to_string(),
                    share: existing.options.share,
                });
            }
            Err(VolumeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        debug!("request accepted");
        let share = meta.options.share.clone();
        if self.shares.create_share_if_absent(&share).await? {
            info!(%share, "created backing share");
        }

        meta.account = self.config.account_name.clone();
        meta.created_at = Utc::now();
        self.store.set(&name, &meta).await?;
        info!(%name, %share, "volume created");
        Ok(())
    }

    async fn mount_locked(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let name = existing_name(name)?;
        let path = self.mountpoint(&name);
        let fresh_dir = ensure_mountpoint(&path).await?;

        match self.mount_prepared(&name, &path).await {
            Ok(()) => Ok(path),
            Err(e) => {
                // Only undo a directory this call created; an existing one may
                // carry another consumer's mount.
                if fresh_dir && let Err(rm) = tokio::fs::remove_dir(&path).await {
                    warn!(path = %path.display(), error = %rm, "failed to remove unused mountpoint");
                }
                Err(e)
            }
        }
    }

    async fn mount_prepared(&self, name: &VolumeName, path: &Path) -> Result<(), VolumeError> {
        let meta = self.store.get(name).await?;
        if meta.account != self.config.account_name {
            return Err(VolumeError::CrossAccount {
                account: meta.account,
            });
        }
        let req = self.mount_request(&meta.options.share, path.to_path_buf());
        self.mounter.mount(&req).await
    }

    async fn unmount_locked(&self, name: &str) -> Result<(), VolumeError> {
        let name = existing_name(name)?;
        self.store.get(&name).await?;

        let path = self.mountpoint(&name);
        self.mounter.unmount(&path).await?;

        // The orchestrator mounts once per consumer, so the same directory
        // can carry several stacked mounts.  Only the last unmount may remove
        // the directory; whether this was the last is decided by the kernel's
        // mount table, not by counting requests.
        if self.inspector.is_active(&path).await? {
            debug!(path = %path.display(), "mountpoint still has active mounts, not removing");
            return Ok(());
        }

        debug!(path = %path.display(), "mountpoint has no further mounts, removing");
        match tokio::fs::remove_dir(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::cleanup(&path, e)),
        }
    }

    async fn remove_locked(&self, name: &str) -> Result<(), VolumeError> {
        let name = existing_name(name)?;
        let meta = self.store.get(&name).await?;

        let share = &meta.options.share;
        if self.config.remove_shares {
            if self.shares.delete_share_if_present(share).await? {
                info!(%share, "removed backing share");
            }
        } else {
            debug!(%share, "not removing share upon volume removal");
        }

        debug!("removing volume metadata");
        self.store.delete(&name).await?;
        info!(%name, "volume removed");
        Ok(())
    }

    async fn get_locked(&self, name: &str) -> Result<VolumeInfo, VolumeError> {
        let name = existing_name(name)?;
        let metadata = self.store.get(&name).await?;
        Ok(VolumeInfo {
            mountpoint: self.mountpoint(&name),
            name: name.to_string(),
            metadata,
        })
    }

    async fn list_locked(&self) -> Result<Vec<VolumeEntry>, VolumeError> {
        let mut names = self.store.list().await?;
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| VolumeEntry {
                mountpoint: self.mountpoint(&name),
                name: name.to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl VolumeDriver for VolumeCoordinator {
    #[instrument(skip(self), fields(operation = "create"))]
    async fn create(
        &self,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<(), VolumeError> {
        let _guard = self.lock.lock().await;
        self.create_locked(name, options)
            .await
            .inspect_err(|e| error!(error = %e, "create failed"))
    }

    #[instrument(skip(self), fields(operation = "remove"))]
    async fn remove(&self, name: &str) -> Result<(), VolumeError> {
        let _guard = self.lock.lock().await;
        self.remove_locked(name)
            .await
            .inspect_err(|e| error!(error = %e, "remove failed"))
    }

    #[instrument(skip(self), fields(operation = "path"))]
    async fn path(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let _guard = self.lock.lock().await;
        debug!("request accepted");
        self.get_locked(name)
            .await
            .map(|info| info.mountpoint)
            .inspect_err(|e| error!(error = %e, "path failed"))
    }

    #[instrument(skip(self), fields(operation = "mount"))]
    async fn mount(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let _guard = self.lock.lock().await;
        debug!("request accepted");
        self.mount_locked(name)
            .await
            .inspect_err(|e| error!(error = %e, "mount failed"))
    }

    #[instrument(skip(self), fields(operation = "unmount"))]
    async fn unmount(&self, name: &str) -> Result<(), VolumeError> {
        let _guard = self.lock.lock().await;
        debug!("request accepted");
        self.unmount_locked(name)
            .await
            .inspect_err(|e| error!(error = %e, "unmount failed"))
    }

    #[instrument(skip(self), fields(operation = "get"))]
    async fn get(&self, name: &str) -> Result<VolumeInfo, VolumeError> {
        let _guard = self.lock.lock().await;
        debug!("request accepted");
        self.get_locked(name)
            .await
            .inspect_err(|e| error!(error = %e, "get failed"))
    }

    #[instrument(skip(self), fields(operation = "list"))]
    async fn list(&self) -> Result<Vec<VolumeEntry>, VolumeError> {
        let _guard = self.lock.lock().await;
        debug!("request accepted");
        let entries = self
            .list_locked()
            .await
            .inspect_err(|e| error!(error = %e, "failed to list managed volumes"))?;
        debug!(count = entries.len(), "response ready");
        Ok(entries)
    }
}

/// Parse a name for an operation on an existing volume.  A name that could
/// never have been created cannot have a record.
fn existing_name(name: &str) -> Result<VolumeName, VolumeError> {
    VolumeName::parse(name).map_err(|_| VolumeError::NotFound(name.to_owned()))
}

/// Create the mountpoint directory if needed.  Returns `true` if it was
/// created by this call.
async fn ensure_mountpoint(path: &Path) -> Result<bool, VolumeError> {
    match tokio::fs::metadata(path).await {
        Ok(m) if m.is_dir() => Ok(false),
        Ok(_) => Err(VolumeError::mkdir(path, "exists and is not a directory")),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(MOUNTPOINT_MODE)
                .create(path)
                .await
                .map_err(|e| VolumeError::mkdir(path, e))?;
            Ok(true)
        }
        Err(e) => Err(VolumeError::mkdir(path, e)),
    }
}
