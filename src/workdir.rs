use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PatcherError, Result};

const DIR_PREFIX: &str = "autoproxy-patcher";

/// Scratch directory owned by one patch job.
///
/// Created with a random suffix and removed when dropped, whichever way the
/// pipeline exits.
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn create_in(base: &Path) -> Result<Self> {
        fs::create_dir_all(base).map_err(|e| PatcherError::from_io_error(base, e))?;

        // create_dir fails on collision, so two jobs never share a tree.
        for _ in 0..8 {
            let suffix = format!("{:016x}", rand::random::<u64>());
            let root = base.join(format!("{DIR_PREFIX}-{suffix}"));
            match fs::create_dir(&root) {
                Ok(()) => {
                    debug!(path = %root.display(), "created working tree");
                    return Ok(Self { root });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(PatcherError::from_io_error(&root, err)),
            }
        }
        Err(PatcherError::from_io_error(
            base,
            io::Error::new(io::ErrorKind::AlreadyExists, "no free working tree name"),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Apktool output directory for APK jobs.
    pub fn decoded_dir(&self) -> PathBuf {
        self.root.join("decoded")
    }

    pub fn rebuilt_apk(&self) -> PathBuf {
        self.root.join("rebuilt.apk")
    }

    pub fn aligned_apk(&self) -> PathBuf {
        self.root.join("aligned.apk")
    }

    pub fn signed_apk(&self) -> PathBuf {
        self.root.join("signed.apk")
    }

    /// `Payload/` of an unpacked IPA.
    pub fn payload_dir(&self) -> PathBuf {
        self.root.join("Payload")
    }

    pub fn entitlements(&self) -> PathBuf {
        self.root.join("entitlements.plist")
    }

    pub fn staged_ipa(&self) -> PathBuf {
        self.root.join("staged.ipa")
    }

    fn cleanup(&self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(path = %self.root.display(), "removed working tree"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.root.display(), "failed to remove working tree: {err}"),
        }
    }
}

impl Drop for WorkingTree {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tree_is_removed_on_drop() -> anyhow::Result<()> {
        let base = TempDir::new()?;
        let root = {
            let tree = WorkingTree::create_in(base.path())?;
            fs::write(tree.path().join("file"), b"x")?;
            fs::create_dir_all(tree.decoded_dir().join("res"))?;
            tree.path().to_path_buf()
        };
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn tree_is_removed_when_job_fails() -> anyhow::Result<()> {
        let base = TempDir::new()?;
        let mut seen = None;
        let result: Result<()> = (|| {
            let tree = WorkingTree::create_in(base.path())?;
            seen = Some(tree.path().to_path_buf());
            Err(PatcherError::MissingPrimaryDex)
        })();
        assert!(result.is_err());
        assert!(!seen.unwrap().exists());
        Ok(())
    }

    #[test]
    fn trees_get_unique_names() -> anyhow::Result<()> {
        let base = TempDir::new()?;
        let a = WorkingTree::create_in(base.path())?;
        let b = WorkingTree::create_in(base.path())?;
        assert_ne!(a.path(), b.path());
        assert!(a.path().file_name().unwrap().to_string_lossy().starts_with(DIR_PREFIX));
        Ok(())
    }
}
