//! Volume driver service trait.
//!
//! This is the operation surface the plugin transport dispatches to.  The
//! orchestrator that calls it does not track mount state, so implementations
//! must tolerate repeated and overlapping `mount` / `unmount` calls for the
//! same volume.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::types::{Scope, VolumeEntry, VolumeInfo};

/// Named-volume lifecycle operations.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Provision the backing share and record the volume.
    async fn create(&self, name: &str, options: &HashMap<String, String>)
    -> Result<(), VolumeError>;

    /// Forget the volume, optionally deleting its backing share.
    async fn remove(&self, name: &str) -> Result<(), VolumeError>;

    /// Host path where the volume is (or would be) mounted.
    async fn path(&self, name: &str) -> Result<PathBuf, VolumeError>;

    /// Mount the volume for one more consumer and return the mountpoint.
    async fn mount(&self, name: &str) -> Result<PathBuf, VolumeError>;

    /// Release one consumer's mount.  The mountpoint directory is removed
    /// only once nothing is mounted on it any more.
    async fn unmount(&self, name: &str) -> Result<(), VolumeError>;

    async fn get(&self, name: &str) -> Result<VolumeInfo, VolumeError>;

    async fn list(&self) -> Result<Vec<VolumeEntry>, VolumeError>;

    /// Visibility scope of the volumes this driver manages.
    fn scope(&self) -> Scope {
        Scope::Local
    }
}
