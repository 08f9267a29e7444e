//! CIFS mount / unmount invocation.
//!
//! Option resolution is pure and lives in [`MountRequest::options_string`];
//! [`CifsMounter`] only turns a resolved request into a `mount(8)` or
//! `umount(8)` process and maps a non-zero exit status to an error.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::VolumeError;

const DEFAULT_FILE_MODE: &str = "0777";
const DEFAULT_DIR_MODE: &str = "0777";
const DEFAULT_UID: &str = "0";
const DEFAULT_GID: &str = "0";

/// SMB protocol dialect requested from the kernel client.
const SMB_VERSION: &str = "3.0";

/// Tunables for a single CIFS mount.  Unset fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub file_mode: Option<String>,
    pub dir_mode: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    /// Disable byte-range locking (`nolock`).
    pub nolock: bool,
}

/// Storage account key.  Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountKey(String);

impl AccountKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountKey(<redacted>)")
    }
}

/// Everything needed to mount one share on one local directory.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub account: String,
    pub key: AccountKey,
    /// DNS suffix of the storage service, e.g. `core.windows.net`.
    pub storage_base: String,
    pub share: String,
    pub target: PathBuf,
    pub options: MountOptions,
}

impl MountRequest {
    /// UNC-style source, `//<account>.file.<base>/<share>`.
    pub fn source(&self) -> String {
        format!(
            "//{}.file.{}/{}",
            self.account, self.storage_base, self.share
        )
    }

    /// Resolve defaults and render the `-o` option string.
    pub fn options_string(&self) -> String {
        let o = &self.options;
        let mut opts = vec![
            format!("vers={SMB_VERSION}"),
            format!("username={}", self.account),
            format!("password={}", self.key.expose()),
            format!(
                "file_mode={}",
                o.file_mode.as_deref().unwrap_or(DEFAULT_FILE_MODE)
            ),
            format!(
                "dir_mode={}",
                o.dir_mode.as_deref().unwrap_or(DEFAULT_DIR_MODE)
            ),
            format!("uid={}", o.uid.as_deref().unwrap_or(DEFAULT_UID)),
            format!("gid={}", o.gid.as_deref().unwrap_or(DEFAULT_GID)),
        ];
        if o.nolock {
            opts.push("nolock".to_owned());
        }
        opts.join(",")
    }

    /// Option string with the password masked, for logs.
    fn redacted_options(&self) -> String {
        self.options_string()
            .replace(self.key.expose(), "<redacted>")
    }
}

/// Performs the OS-level mount and unmount.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self, req: &MountRequest) -> Result<(), VolumeError>;

    async fn unmount(&self, target: &Path) -> Result<(), VolumeError>;
}

/// [`Mounter`] that shells out to `mount -t cifs` and `umount`.
#[derive(Debug, Clone)]
pub struct CifsMounter {
    mount_program: PathBuf,
    umount_program: PathBuf,
}

impl Default for CifsMounter {
    fn default() -> Self {
        Self {
            mount_program: PathBuf::from("mount"),
            umount_program: PathBuf::from("umount"),
        }
    }
}

impl CifsMounter {
    /// Use alternative `mount` / `umount` executables.
    pub fn with_programs(mount: impl Into<PathBuf>, umount: impl Into<PathBuf>) -> Self {
        Self {
            mount_program: mount.into(),
            umount_program: umount.into(),
        }
    }
}

#[async_trait]
impl Mounter for CifsMounter {
    #[instrument(skip(self, req), fields(target = %req.target.display(), share = %req.share))]
    async fn mount(&self, req: &MountRequest) -> Result<(), VolumeError> {
        let source = req.source();
        debug!(%source, options = %req.redacted_options(), "invoking mount");

        // mount(8) is used instead of mount(2): it resolves the server name
        // and rewrites options before handing them to the cifs module.
        let output = tokio::process::Command::new(&self.mount_program)
            .arg("-t")
            .arg("cifs")
            .arg(&source)
            .arg(&req.target)
            .arg("-o")
            .arg(req.options_string())
            .arg("--verbose")
            .output()
            .await
            .map_err(|e| VolumeError::MountFailed {
                path: req.target.display().to_string(),
                reason: format!("cannot run {}: {e}", self.mount_program.display()),
            })?;

        if !output.status.success() {
            return Err(VolumeError::MountFailed {
                path: req.target.display().to_string(),
                reason: format!("{}, output={:?}", output.status, combined(&output)),
            });
        }

        info!(%source, "share mounted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unmount(&self, target: &Path) -> Result<(), VolumeError> {
        let output = tokio::process::Command::new(&self.umount_program)
            .arg(target)
            .output()
            .await
            .map_err(|e| VolumeError::UnmountFailed {
                path: target.display().to_string(),
                reason: format!("cannot run {}: {e}", self.umount_program.display()),
            })?;

        if !output.status.success() {
            return Err(VolumeError::UnmountFailed {
                path: target.display().to_string(),
                reason: format!("{}, output={:?}", output.status, combined(&output)),
            });
        }

        debug!(target = %target.display(), "unmount successful");
        Ok(())
    }
}

fn combined(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_owned()
}
