//! Remote file-share provisioning.
//!
//! The coordinator only needs two idempotent operations from the storage
//! service, both expressed by [`ShareClient`].  [`azure::AzureFileClient`] is
//! the production implementation.

pub mod azure;

use async_trait::async_trait;

use crate::error::VolumeError;

pub use azure::AzureFileClient;

/// Create-if-absent / delete-if-present operations on backing shares.
#[async_trait]
pub trait ShareClient: Send + Sync {
    /// Ensure `share` exists.  Returns `true` if this call created it and
    /// `false` if it already existed.
    async fn create_share_if_absent(&self, share: &str) -> Result<bool, VolumeError>;

    /// Ensure `share` is gone.  Returns `true` if this call deleted it and
    /// `false` if it was already absent.
    async fn delete_share_if_present(&self, share: &str) -> Result<bool, VolumeError>;
}
