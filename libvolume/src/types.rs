//! Core volume types: names, persisted metadata, and the views returned to
//! the transport layer.
//!
//! [`VolumeMetadata`] is the only persisted type.  Mountpoints are always
//! derived from the configured mount root and the volume name, never stored.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VolumeError;

// ---------------------------------------------------------------------------
// Volume name
// ---------------------------------------------------------------------------

/// Caller-supplied volume name, checked to be a single safe path component.
///
/// Accepted names match `[A-Za-z0-9][A-Za-z0-9_.-]*`, which is the same shape
/// Docker uses for named volumes.  Rejecting everything else keeps names from
/// escaping the metadata root or the mount root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeName(String);

impl VolumeName {
    pub fn parse(name: &str) -> Result<Self, VolumeError> {
        if Self::is_valid(name) {
            Ok(Self(name.to_owned()))
        } else {
            Err(VolumeError::InvalidName(name.to_owned()))
        }
    }

    pub fn is_valid(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VolumeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Persisted metadata
// ---------------------------------------------------------------------------

/// Option keys accepted by `create`.
pub const RECOGNIZED_OPTIONS: &[&str] = &["share"];

/// The closed set of per-volume options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Name of the remote file share backing this volume.
    pub share: String,
}

/// Metadata persisted for every created volume.
///
/// The volume name is the record's key and is not repeated inside the
/// document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    /// When the volume was created (UTC).
    pub created_at: DateTime<Utc>,
    /// Storage account that owns the backing share.
    pub account: String,
    /// Validated volume options.
    pub options: VolumeOptions,
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A volume as listed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub name: String,
    pub mountpoint: PathBuf,
}

/// A single volume together with its stored metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: PathBuf,
    pub metadata: VolumeMetadata,
}

impl VolumeInfo {
    /// Free-form status map reported to the orchestrator.
    pub fn status(&self) -> HashMap<String, String> {
        HashMap::from([
            ("share".to_owned(), self.metadata.options.share.clone()),
            ("account".to_owned(), self.metadata.account.clone()),
        ])
    }
}

/// Visibility scope advertised to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Volumes are only meaningful on this host.
    Local,
    /// Volumes are visible cluster wide.
    Global,
}
