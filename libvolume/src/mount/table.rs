//! Live mount-table inspection.
//!
//! The orchestrator issues a mount for every consumer of a volume and an
//! unmount when each consumer goes away, without telling us how many there
//! are.  Each duplicate mount stacks another entry on the same directory, and
//! one `umount` only pops one of them.  After an unmount we therefore ask the
//! kernel whether anything is still mounted on the directory before removing
//! it.
//!
//! Entries are matched by `(st_dev, st_ino)` of the mounted directory rather
//! than by path text: bind mounts, symlinked roots and escaped paths can all
//! make two different strings name the same directory.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::VolumeError;

/// Default mount table source on Linux.
pub const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Answers whether a directory still has something mounted on it.
#[async_trait]
pub trait MountInspector: Send + Sync {
    /// Return `true` if at least one mount-table entry refers to `path`.
    ///
    /// A `path` that no longer exists is never active.
    async fn is_active(&self, path: &Path) -> Result<bool, VolumeError>;
}

/// [`MountInspector`] backed by a `mountinfo`-formatted file.
#[derive(Debug, Clone)]
pub struct MountTable {
    source: PathBuf,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new(PROC_MOUNTINFO)
    }
}

impl MountTable {
    /// Read entries from `source` instead of `/proc/self/mountinfo`.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[async_trait]
impl MountInspector for MountTable {
    async fn is_active(&self, path: &Path) -> Result<bool, VolumeError> {
        let target = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "mountpoint is gone, not active");
                return Ok(false);
            }
            Err(e) => {
                return Err(VolumeError::mount_table(format!(
                    "cannot stat mountpoint {}: {e}",
                    path.display()
                )));
            }
        };

        // Mount points are raw bytes and need not be UTF-8.
        let table = tokio::fs::read(&self.source).await.map_err(|e| {
            VolumeError::mount_table(format!("cannot read {}: {e}", self.source.display()))
        })?;

        for mount_dir in mount_points(&table)? {
            let entry = match tokio::fs::metadata(&mount_dir).await {
                Ok(m) => m,
                Err(e) => {
                    // Entries from other namespaces or on dead remotes may not
                    // be reachable; they cannot be our directory anyway.
                    debug!(mount_dir = %mount_dir.display(), error = %e, "skipping unreachable mount entry");
                    continue;
                }
            };
            if entry.dev() == target.dev() && entry.ino() == target.ino() {
                debug!(path = %path.display(), entry = %mount_dir.display(), "mountpoint still active");
                return Ok(true);
            }
        }

        debug!(path = %path.display(), "mountpoint not found in mount table");
        Ok(false)
    }
}

/// Extract the mount point column of every `mountinfo` line.
///
/// ```text
/// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
/// (1)(2)(3)   (4)   (5)
/// ```
///
/// Field 5 is the mount point relative to the process root.
pub fn mount_points(table: impl AsRef<[u8]>) -> Result<Vec<PathBuf>, VolumeError> {
    table
        .as_ref()
        .split(|&b| b == b'\n')
        .filter(|line| !line.trim_ascii().is_empty())
        .map(|line| {
            line.split(u8::is_ascii_whitespace)
                .filter(|field| !field.is_empty())
                .nth(4)
                .map(|field| PathBuf::from(unescape(field)))
                .ok_or_else(|| {
                    VolumeError::mount_table(format!(
                        "mountinfo line {:?} has less than 5 fields, cannot parse mountpoint",
                        String::from_utf8_lossy(line)
                    ))
                })
        })
        .collect()
}

/// Decode the kernel's octal escapes (`\040`, `\011`, `\012`, `\134`).
fn unescape(field: &[u8]) -> OsString {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;
    while i < field.len() {
        if field[i] == b'\\'
            && i + 3 < field.len()
            && let Some(v) = octal(&field[i + 1..i + 4])
        {
            out.push(v);
            i += 4;
            continue;
        }
        out.push(field[i]);
        i += 1;
    }
    OsString::from_vec(out)
}

fn octal(digits: &[u8]) -> Option<u8> {
    digits.iter().try_fold(0u8, |acc, d| match d {
        b'0'..=b'7' => acc.checked_mul(8)?.checked_add(d - b'0'),
        _ => None,
    })
}
