//! Opening and closing the application containers.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{PatcherError, Result};
use crate::manifest::{android, bundle};
use crate::workdir::WorkingTree;

pub const ANDROID_MANIFEST: &str = "AndroidManifest.xml";
const PAYLOAD_DIR: &str = "Payload";
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// The `.app` directory of an unpacked IPA.
#[derive(Clone, Debug)]
pub struct AppBundle {
    pub app_dir: PathBuf,
    pub info_plist: PathBuf,
    pub executable: PathBuf,
}

/// Resolve `CFBundleExecutable` to a file that lives inside `app_dir`.
fn bundle_executable(app_dir: &Path, name: &str) -> Result<PathBuf> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single {
        return Err(PatcherError::ContainerFormat(format!(
            "CFBundleExecutable '{name}' is not a file name inside the bundle"
        )));
    }

    let executable = app_dir.join(name);
    if !executable.is_file() {
        return Err(PatcherError::ExecutableNotFound(executable));
    }

    // A symlinked executable must still resolve into the bundle.
    let canonical_app =
        fs::canonicalize(app_dir).map_err(|e| PatcherError::from_io_error(app_dir, e))?;
    let canonical_exe =
        fs::canonicalize(&executable).map_err(|e| PatcherError::from_io_error(&executable, e))?;
    if !canonical_exe.starts_with(&canonical_app) {
        return Err(PatcherError::ContainerFormat(format!(
            "CFBundleExecutable '{name}' resolves outside the bundle"
        )));
    }
    Ok(executable)
}

/// Extract `ipa` into the working tree and locate its app bundle.
pub fn unpack_ipa(ipa: &Path, tree: &WorkingTree) -> Result<AppBundle> {
    let file = File::open(ipa).map_err(|e| PatcherError::from_io_error(ipa, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| PatcherError::from_zip_error(ipa, e))?;
    archive
        .extract(tree.path())
        .map_err(|e| PatcherError::from_zip_error(ipa, e))?;
    debug!(entries = archive.len(), "extracted IPA");

    let payload = tree.payload_dir();
    if !payload.is_dir() {
        return Err(PatcherError::ContainerFormat(
            "Payload directory not found in IPA".into(),
        ));
    }

    let mut apps = Vec::new();
    for entry in fs::read_dir(&payload).map_err(|e| PatcherError::from_io_error(&payload, e))? {
        let path = entry
            .map_err(|e| PatcherError::from_io_error(&payload, e))?
            .path();
        if path.is_dir() && path.extension().and_then(|e| e.to_str()) == Some("app") {
            apps.push(path);
        }
    }
    apps.sort();
    let app_dir = apps
        .into_iter()
        .next()
        .ok_or_else(|| PatcherError::ContainerFormat("No .app bundle found in Payload".into()))?;

    let info_plist = app_dir.join("Info.plist");
    if !info_plist.is_file() {
        return Err(PatcherError::ContainerFormat(format!(
            "Info.plist not found in {}",
            app_dir.display()
        )));
    }
    let executable = bundle_executable(&app_dir, &bundle::read_executable(&info_plist)?)?;

    info!(
        "Unpacked {}",
        app_dir.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    Ok(AppBundle {
        app_dir,
        info_plist,
        executable,
    })
}

/// Check a decoded APK tree and return its package name.
pub fn locate_android_root(decoded_dir: &Path) -> Result<String> {
    let manifest = decoded_dir.join(ANDROID_MANIFEST);
    if !manifest.is_file() {
        return Err(PatcherError::ContainerFormat(format!(
            "{ANDROID_MANIFEST} not found in decoded APK"
        )));
    }
    let xml = fs::read_to_string(&manifest).map_err(|e| PatcherError::from_io_error(&manifest, e))?;
    android::read_package(&xml)
}

/// Zip `src_dir` into `out`, storing entries under `prefix/`.
///
/// Entries are sorted, directories get explicit entries, file modes are kept
/// and symlinks stay symlinks.
pub fn pack_dir(src_dir: &Path, prefix: &str, out: &Path) -> Result<()> {
    let file = File::create(out).map_err(|e| PatcherError::from_io_error(out, e))?;
    let mut zip = ZipWriter::new(file);
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(src_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src_dir).to_path_buf();
            PatcherError::from_io_error(&path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| PatcherError::ContainerFormat(e.to_string()))?;
        let name = entry_name(prefix, relative);
        if name.is_empty() {
            continue;
        }

        let zip_err = |e| PatcherError::from_zip_error(out, e);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            zip.add_directory(name, base.unix_permissions(DEFAULT_DIR_MODE))
                .map_err(zip_err)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| PatcherError::from_io_error(entry.path(), e))?;
            zip.add_symlink(name, target.to_string_lossy().into_owned(), base)
                .map_err(zip_err)?;
        } else {
            let options = base.unix_permissions(file_mode(entry.path()));
            zip.start_file(name, options).map_err(zip_err)?;
            let mut source =
                File::open(entry.path()).map_err(|e| PatcherError::from_io_error(entry.path(), e))?;
            io::copy(&mut source, &mut zip).map_err(|e| PatcherError::from_io_error(entry.path(), e))?;
        }
    }

    zip.finish().map_err(|e| PatcherError::from_zip_error(out, e))?;
    Ok(())
}

fn entry_name(prefix: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !prefix.is_empty() {
        parts.push(prefix.trim_matches('/').to_string());
    }
    parts.extend(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(DEFAULT_FILE_MODE)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    DEFAULT_FILE_MODE
}

/// Zip the IPA's `Payload/` back up.
pub fn pack_ipa(tree: &WorkingTree, out: &Path) -> Result<()> {
    pack_dir(&tree.payload_dir(), PAYLOAD_DIR, out)
}

/// Move a fully built artifact to its final location.
pub fn finalize_output(staged: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PatcherError::from_io_error(parent, e))?;
    }
    if fs::rename(staged, output).is_err() {
        // Different file systems: stage a copy next to the output first.
        copy_then_rename(staged, output)?;
        if let Err(err) = fs::remove_file(staged) {
            warn!(path = %staged.display(), "failed to remove staged output: {err}");
        }
    }
    info!("Output written to {}", output.display());
    Ok(())
}

/// Copy `staged` to a hidden sibling of `output` and rename it into place, so
/// `output` never holds a partial file.
fn copy_then_rename(staged: &Path, output: &Path) -> Result<()> {
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let sibling = output.with_file_name(format!(
        ".{file_name}.{:08x}.partial",
        rand::random::<u32>()
    ));

    let result = fs::copy(staged, &sibling)
        .map_err(|e| PatcherError::from_io_error(&sibling, e))
        .and_then(|_| {
            fs::rename(&sibling, output).map_err(|e| PatcherError::from_io_error(output, e))
        });
    if result.is_err() {
        if let Err(cleanup) = fs::remove_file(&sibling) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(path = %sibling.display(), "failed to remove partial output: {cleanup}");
            }
        }
    }
    result
}
