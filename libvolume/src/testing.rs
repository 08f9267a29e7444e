//! In-process stand-ins for the external collaborators.
//!
//! * [`MemoryShares`]: a [`ShareClient`] over an in-memory set of share
//!   names, with failure injection.
//! * [`FakeMounter`]: a [`Mounter`] that records mounts as lines in a
//!   synthetic `mountinfo` file instead of calling the kernel.  Pointing a
//!   real [`MountTable`](crate::mount::MountTable) at the same file exercises
//!   the identity-based reconciliation without privileges.
//!
//! ```ignore
//! let mounter = Arc::new(FakeMounter::new(dir.join("mountinfo")));
//! let table = Arc::new(MountTable::new(dir.join("mountinfo")));
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::mount::{MountRequest, Mounter, table};
use crate::share::ShareClient;

/// [`ShareClient`] backed by an in-memory set.
#[derive(Debug, Default)]
pub struct MemoryShares {
    shares: Mutex<BTreeSet<String>>,
    failing: AtomicBool,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryShares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, share: &str) -> bool {
        self.lock().contains(share)
    }

    /// Add a share out of band, as if someone else had created it.
    pub fn insert(&self, share: &str) {
        self.lock().insert(share.to_owned());
    }

    /// Delete a share out of band.
    pub fn remove(&self, share: &str) {
        self.lock().remove(share);
    }

    /// Make every subsequent call fail with [`VolumeError::Remote`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.shares.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self) -> Result<(), VolumeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VolumeError::Remote("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ShareClient for MemoryShares {
    async fn create_share_if_absent(&self, share: &str) -> Result<bool, VolumeError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.lock().insert(share.to_owned()))
    }

    async fn delete_share_if_present(&self, share: &str) -> Result<bool, VolumeError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.lock().remove(share))
    }
}

/// [`Mounter`] writing to a synthetic `mountinfo` file.
///
/// Every `mount` appends an entry for the target, so repeated mounts stack
/// exactly like repeated kernel mounts.  `unmount` drops the most recent
/// entry for the target and fails if there is none, like `umount(8)`.
#[derive(Debug)]
pub struct FakeMounter {
    table: PathBuf,
    // Serializes read-modify-write of the table file.
    file: Mutex<()>,
    next_id: AtomicUsize,
    mount_calls: AtomicUsize,
    unmount_calls: AtomicUsize,
    fail_mount: AtomicBool,
    fail_unmount: AtomicBool,
}

impl FakeMounter {
    pub fn new(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
            file: Mutex::new(()),
            next_id: AtomicUsize::new(100),
            mount_calls: AtomicUsize::new(0),
            unmount_calls: AtomicUsize::new(0),
            fail_mount: AtomicBool::new(false),
            fail_unmount: AtomicBool::new(false),
        }
    }

    /// Path of the synthetic mount table.
    pub fn table(&self) -> &Path {
        &self.table
    }

    pub fn mount_calls(&self) -> usize {
        self.mount_calls.load(Ordering::SeqCst)
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmount_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_mount(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Number of entries currently recorded for `target`.
    pub fn entries_for(&self, target: &Path) -> usize {
        let _guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        self.read_lines()
            .iter()
            .filter(|line| entry_target(line).as_deref() == Some(target))
            .count()
    }

    fn read_lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.table)
            .map(|s| s.lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    fn write_lines(&self, lines: &[String]) -> std::io::Result<()> {
        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        std::fs::write(&self.table, contents)
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(&self, req: &MountRequest) -> Result<(), VolumeError> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        let fail = |reason: String| VolumeError::MountFailed {
            path: req.target.display().to_string(),
            reason,
        };
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(fail("injected failure".into()));
        }

        let _guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut lines = self.read_lines();
        lines.push(format!(
            "{id} 1 0:{id} / {} rw,relatime - cifs {} rw",
            escape(&req.target),
            req.source()
        ));
        self.write_lines(&lines).map_err(|e| fail(e.to_string()))
    }

    async fn unmount(&self, target: &Path) -> Result<(), VolumeError> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        let fail = |reason: &str| VolumeError::UnmountFailed {
            path: target.display().to_string(),
            reason: reason.to_owned(),
        };
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(fail("injected failure"));
        }

        let _guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let mut lines = self.read_lines();
        let Some(pos) = lines
            .iter()
            .rposition(|line| entry_target(line).as_deref() == Some(target))
        else {
            return Err(fail("not mounted"));
        };
        lines.remove(pos);
        self.write_lines(&lines).map_err(|e| fail(&e.to_string()))
    }
}

fn entry_target(line: &str) -> Option<PathBuf> {
    table::mount_points(line).ok()?.into_iter().next()
}

fn escape(path: &Path) -> String {
    let mut out = String::new();
    for c in path.to_string_lossy().chars() {
        match c {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{AccountKey, MountInspector, MountOptions, MountTable};

    fn request(target: &Path) -> MountRequest {
        MountRequest {
            account: "acct".into(),
            key: AccountKey::new("c2VjcmV0"),
            storage_base: "core.windows.net".into(),
            share: "data".into(),
            target: target.to_path_buf(),
            options: MountOptions::default(),
        }
    }

    #[tokio::test]
    async fn fake_mounts_stack_and_pop() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("with space");
        std::fs::create_dir(&target).unwrap();
        let mounter = FakeMounter::new(tmp.path().join("mountinfo"));
        let table = MountTable::new(mounter.table());

        mounter.mount(&request(&target)).await.unwrap();
        mounter.mount(&request(&target)).await.unwrap();
        assert_eq!(mounter.entries_for(&target), 2);
        assert!(table.is_active(&target).await.unwrap());

        mounter.unmount(&target).await.unwrap();
        assert!(table.is_active(&target).await.unwrap());
        mounter.unmount(&target).await.unwrap();
        assert!(!table.is_active(&target).await.unwrap());

        assert!(matches!(
            mounter.unmount(&target).await,
            Err(VolumeError::UnmountFailed { .. })
        ));
    }

    #[tokio::test]
    async fn memory_shares_are_idempotent() {
        let shares = MemoryShares::new();
        assert!(shares.create_share_if_absent("s").await.unwrap());
        assert!(!shares.create_share_if_absent("s").await.unwrap());
        assert!(shares.delete_share_if_present("s").await.unwrap());
        assert!(!shares.delete_share_if_present("s").await.unwrap());
        assert_eq!(shares.create_calls(), 2);
        assert_eq!(shares.delete_calls(), 2);
    }
}
