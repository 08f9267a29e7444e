//! Volume driver error types.
//!
//! Every fallible operation in `libvolume` returns [`VolumeError`].  The
//! variants follow the failure signals each driver operation can report, so
//! the transport layer only ever needs the [`std::fmt::Display`] text to build
//! the plugin protocol's `Err` field.

use std::path::Path;

use thiserror::Error;

/// Unified error type for volume driver operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// The volume name cannot be used as a single path component.
    #[error("invalid volume name {0:?}")]
    InvalidName(String),

    /// The caller supplied an option key outside the recognized set.
    #[error("not a recognized volume driver option: {0:?}")]
    InvalidOption(String),

    /// The required `share` option was absent or empty.
    #[error("missing volume option: 'share'")]
    MissingShare,

    /// A volume with this name already exists with different options.
    #[error("volume {name} already exists backed by share {share:?}")]
    AlreadyExists {
        /// Volume name.
        name: String,
        /// Share recorded in the existing metadata.
        share: String,
    },

    /// No metadata record exists for the volume.
    #[error("volume {0} not found")]
    NotFound(String),

    /// The volume was created under a different storage account.
    #[error("volume hosted on a different account ({account:?}) cannot mount")]
    CrossAccount {
        /// Account recorded in the volume metadata.
        account: String,
    },

    /// Provisioning or deleting the backing share failed.
    #[error("remote share error: {0}")]
    Remote(String),

    /// The OS mount invocation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Mountpoint the mount was attempted on.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The OS unmount invocation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Mountpoint the unmount was attempted on.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The mountpoint directory could not be created.
    #[error("could not create mount point {path}: {reason}")]
    Mkdir { path: String, reason: String },

    /// The mountpoint directory could not be removed after the last unmount.
    #[error("error removing mountpoint {path}: {reason}")]
    Cleanup { path: String, reason: String },

    /// The live mount table could not be read or parsed.
    #[error("cannot inspect mount table: {0}")]
    MountTable(String),

    /// Reading, writing or (de)serializing volume metadata failed.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// The driver configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Plugin transport failure (bind, accept, spec file).
    #[error("transport error: {0}")]
    Transport(String),
}

impl VolumeError {
    /// Create a [`VolumeError::Metadata`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn metadata<E: std::fmt::Display>(e: E) -> Self {
        Self::Metadata(e.to_string())
    }

    /// Create a [`VolumeError::Remote`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn remote<E: std::fmt::Display>(e: E) -> Self {
        Self::Remote(e.to_string())
    }

    /// Create a [`VolumeError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`VolumeError::MountTable`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn mount_table<E: std::fmt::Display>(e: E) -> Self {
        Self::MountTable(e.to_string())
    }

    pub(crate) fn mkdir<E: std::fmt::Display>(path: &Path, e: E) -> Self {
        Self::Mkdir {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }

    pub(crate) fn cleanup<E: std::fmt::Display>(path: &Path, e: E) -> Self {
        Self::Cleanup {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }

    /// `true` for the validation family: the request itself was malformed and
    /// retrying it unchanged cannot succeed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidName(_) | Self::InvalidOption(_) | Self::MissingShare
        )
    }
}
