use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::artifacts::FRAMEWORK_NAME;
use crate::error::{PatcherError, Result};

/// Copy `framework` into `<App>.app/Frameworks/`, replacing an older copy.
pub fn install_framework(app_dir: &Path, framework: &Path) -> Result<PathBuf> {
    let frameworks = app_dir.join("Frameworks");
    let target = frameworks.join(FRAMEWORK_NAME);

    match fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(&target).map_err(|e| PatcherError::from_io_error(&target, e))?
        }
        Ok(_) => fs::remove_file(&target).map_err(|e| PatcherError::from_io_error(&target, e))?,
        Err(_) => {}
    }
    fs::create_dir_all(&frameworks).map_err(|e| PatcherError::from_io_error(&frameworks, e))?;

    copy_tree(framework, &target)?;
    info!("Installed {FRAMEWORK_NAME} into {}", frameworks.display());
    Ok(target)
}

/// Recursive copy that keeps file modes and recreates symlinks as symlinks.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            PatcherError::from_io_error(&path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PatcherError::ContainerFormat(e.to_string()))?;
        let out = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&out).map_err(|e| PatcherError::from_io_error(&out, e))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .map_err(|e| PatcherError::from_io_error(entry.path(), e))?;
            symlink(&link, &out)?;
        } else {
            fs::copy(entry.path(), &out).map_err(|e| PatcherError::from_io_error(&out, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &Path, out: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, out).map_err(|e| PatcherError::from_io_error(out, e))
}

#[cfg(not(unix))]
fn symlink(link: &Path, out: &Path) -> Result<()> {
    let resolved = out.parent().map(|p| p.join(link)).unwrap_or_else(|| link.to_path_buf());
    fs::copy(&resolved, out)
        .map(|_| ())
        .map_err(|e| PatcherError::from_io_error(out, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_framework(root: &Path) -> anyhow::Result<PathBuf> {
        let fw = root.join("build").join(FRAMEWORK_NAME);
        fs::create_dir_all(fw.join("AutoProxy.bundle"))?;
        fs::write(fw.join("AutoProxy"), b"\xcf\xfa\xed\xfe")?;
        fs::write(fw.join("Info.plist"), b"<plist/>")?;
        Ok(fw)
    }

    #[test]
    fn copies_into_frameworks_dir() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let fw = fake_framework(temp.path())?;
        let app = temp.path().join("Demo.app");
        fs::create_dir_all(&app)?;

        let installed = install_framework(&app, &fw)?;
        assert_eq!(installed, app.join("Frameworks/AutoProxy.framework"));
        assert_eq!(fs::read(installed.join("AutoProxy"))?, b"\xcf\xfa\xed\xfe");
        assert!(installed.join("AutoProxy.bundle").is_dir());
        Ok(())
    }

    #[test]
    fn replaces_previous_copy() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let fw = fake_framework(temp.path())?;
        let app = temp.path().join("Demo.app");
        let stale = app.join("Frameworks/AutoProxy.framework");
        fs::create_dir_all(&stale)?;
        fs::write(stale.join("stale.txt"), b"old")?;

        install_framework(&app, &fw)?;
        assert!(!stale.join("stale.txt").exists());
        assert!(stale.join("AutoProxy").is_file());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn keeps_symlinks() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let fw = fake_framework(temp.path())?;
        std::os::unix::fs::symlink("AutoProxy", fw.join("Current"))?;
        let app = temp.path().join("Demo.app");

        let installed = install_framework(&app, &fw)?;
        let link = installed.join("Current");
        assert!(fs::symlink_metadata(&link)?.file_type().is_symlink());
        assert_eq!(fs::read_link(&link)?, PathBuf::from("AutoProxy"));
        Ok(())
    }
}
