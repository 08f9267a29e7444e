//! Durable per-volume metadata.
//!
//! # On-disk layout
//!
//! ```text
//! <metadata_root>/
//!   <volume-name>          # JSON VolumeMetadata document
//!   .<volume-name>.tmp     # transient, only present while a write is in flight
//! ```
//!
//! There is no in-memory cache: every call goes to the
//! filesystem, so a restarted process sees exactly what was committed.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::VolumeError;
use crate::types::{RECOGNIZED_OPTIONS, VolumeMetadata, VolumeName, VolumeOptions};

const ROOT_MODE: u32 = 0o700;
const RECORD_MODE: u32 = 0o600;

/// File-per-volume metadata store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Open the store, creating `root` (mode `0700`) if it does not exist.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, VolumeError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            VolumeError::Metadata(format!("error creating {}: {e}", root.display()))
        })?;
        tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(ROOT_MODE))
            .await
            .map_err(|e| {
                VolumeError::Metadata(format!("error restricting {}: {e}", root.display()))
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check raw create options against the recognized set and build a
    /// metadata record from them.
    ///
    /// `created_at` and `account` are placeholders; the coordinator stamps
    /// them.  An empty `share` is accepted here and rejected by the caller.
    pub fn validate(raw: &HashMap<String, String>) -> Result<VolumeMetadata, VolumeError> {
        if let Some(key) = raw
            .keys()
            .find(|k| !RECOGNIZED_OPTIONS.contains(&k.as_str()))
        {
            return Err(VolumeError::InvalidOption(key.clone()));
        }

        Ok(VolumeMetadata {
            created_at: Default::default(),
            account: String::new(),
            options: VolumeOptions {
                share: raw.get("share").cloned().unwrap_or_default(),
            },
        })
    }

    /// Persist `meta` for `name`, replacing any previous record.
    ///
    /// The document is written to a hidden temporary file, synced, and then
    /// renamed over the record so readers never observe a partial write.
    pub async fn set(&self, name: &VolumeName, meta: &VolumeMetadata) -> Result<(), VolumeError> {
        let payload = serde_json::to_vec(meta)
            .map_err(|e| VolumeError::Metadata(format!("cannot serialize metadata: {e}")))?;

        let tmp = self.tmp_path(name);
        let write = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(RECORD_MODE)
                .open(&tmp)
                .await?;
            file.write_all(&payload).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, self.path(name)).await
        };

        if let Err(e) = write.await {
            if let Err(rm) = tokio::fs::remove_file(&tmp).await
                && rm.kind() != ErrorKind::NotFound
            {
                warn!(path = %tmp.display(), error = %rm, "failed to remove temporary metadata file");
            }
            return Err(VolumeError::Metadata(format!(
                "cannot write metadata for {name}: {e}"
            )));
        }

        debug!(%name, "metadata saved");
        Ok(())
    }

    /// Load the record for `name`.
    pub async fn get(&self, name: &VolumeName) -> Result<VolumeMetadata, VolumeError> {
        let bytes = match tokio::fs::read(self.path(name)).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VolumeError::NotFound(name.to_string()));
            }
            Err(e) => {
                return Err(VolumeError::Metadata(format!(
                    "cannot read metadata for {name}: {e}"
                )));
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| VolumeError::Metadata(format!("cannot deserialize metadata: {e}")))
    }

    pub async fn delete(&self, name: &VolumeName) -> Result<(), VolumeError> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VolumeError::NotFound(name.to_string()))
            }
            Err(e) => Err(VolumeError::Metadata(format!(
                "cannot delete metadata for {name}: {e}"
            ))),
        }
    }

    /// Names of every volume with a committed record, in directory order.
    pub async fn list(&self) -> Result<Vec<VolumeName>, VolumeError> {
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            VolumeError::Metadata(format!("cannot list {}: {e}", self.root.display()))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(VolumeError::metadata)? {
            let file_type = entry.file_type().await.map_err(VolumeError::metadata)?;
            if !file_type.is_file() {
                continue;
            }
            // Temporaries start with a dot and never pass name validation.
            if let Some(Ok(name)) = entry.file_name().to_str().map(VolumeName::parse) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn path(&self, name: &VolumeName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn tmp_path(&self, name: &VolumeName) -> PathBuf {
        self.root.join(format!(".{name}.tmp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn name(s: &str) -> VolumeName {
        VolumeName::parse(s).unwrap()
    }

    fn record(share: &str) -> VolumeMetadata {
        VolumeMetadata {
            created_at: Utc::now(),
            account: "acct".into(),
            options: VolumeOptions {
                share: share.into(),
            },
        }
    }

    #[test]
    fn validate_accepts_share() {
        let raw = HashMap::from([("share".to_owned(), "data".to_owned())]);
        let meta = MetadataStore::validate(&raw).unwrap();
        assert_eq!(meta.options.share, "data");
    }

    #[test]
    fn validate_allows_empty_share() {
        let meta = MetadataStore::validate(&HashMap::new()).unwrap();
        assert!(meta.options.share.is_empty());
    }

    #[test]
    fn validate_rejects_unknown_key() {
        let raw = HashMap::from([
            ("share".to_owned(), "data".to_owned()),
            ("size".to_owned(), "10G".to_owned()),
        ]);
        assert_eq!(
            MetadataStore::validate(&raw),
            Err(VolumeError::InvalidOption("size".into()))
        );
    }

    #[tokio::test]
    async fn open_creates_private_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("a/b/volumes");
        let store = MetadataStore::open(&root).await.unwrap();
        let mode = std::fs::metadata(store.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn set_get_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path()).await.unwrap();
        let meta = record("data");

        store.set(&name("vol1"), &meta).await.unwrap();
        assert_eq!(store.get(&name("vol1")).await.unwrap(), meta);

        store.delete(&name("vol1")).await.unwrap();
        assert_eq!(
            store.get(&name("vol1")).await,
            Err(VolumeError::NotFound("vol1".into()))
        );
        assert_eq!(
            store.delete(&name("vol1")).await,
            Err(VolumeError::NotFound("vol1".into()))
        );
    }

    #[tokio::test]
    async fn set_overwrites_and_leaves_no_temporaries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path()).await.unwrap();

        store.set(&name("vol1"), &record("first")).await.unwrap();
        store.set(&name("vol1"), &record("second")).await.unwrap();

        let got = store.get(&name("vol1")).await.unwrap();
        assert_eq!(got.options.share, "second");

        let files: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec!["vol1".to_owned()]);

        let mode = std::fs::metadata(tmp.path().join("vol1"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn get_reports_corrupt_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path()).await.unwrap();
        std::fs::write(tmp.path().join("broken"), b"{not json").unwrap();

        let err = store.get(&name("broken")).await.unwrap_err();
        assert!(matches!(err, VolumeError::Metadata(_)), "{err:?}");
    }

    #[tokio::test]
    async fn list_skips_temporaries_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path()).await.unwrap();

        store.set(&name("a"), &record("s")).await.unwrap();
        store.set(&name("b"), &record("s")).await.unwrap();
        std::fs::write(tmp.path().join(".c.tmp"), b"partial").unwrap();
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();

        let mut names = store.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec![name("a"), name("b")]);
    }
}
