//! Resolution of the prebuilt SDK artifacts that get injected into packages.
//!
//! Each artifact is looked up in order: explicit path from the job, the
//! search directory (`AUTOPROXY_SDK_DIR`), the copy embedded at
//! compile time (`bundled-sdk` feature, dex only), then the directory holding
//! the running executable.

use std::borrow::Cow;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ArtifactPaths;
use crate::error::{PatcherError, Result};

pub const SDK_DEX_NAME: &str = "sdk.dex";
pub const RUNTIME_DEX_NAME: &str = "kotlin-runtime.dex";
pub const FRAMEWORK_NAME: &str = "AutoProxy.framework";

/// A dex payload plus a description of where it came from, for error messages.
#[derive(Clone, Debug)]
pub struct DexArtifact {
    pub origin: String,
    pub bytes: Cow<'static, [u8]>,
}

impl DexArtifact {
    pub fn from_bytes(origin: impl Into<String>, bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        Self {
            origin: origin.into(),
            bytes: bytes.into(),
        }
    }

    fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| PatcherError::from_io_error(path, e))?;
        Ok(Self::from_bytes(path.display().to_string(), bytes))
    }
}

/// Interception SDK dex. Always required for APK jobs.
pub fn resolve_sdk_dex(paths: &ArtifactPaths) -> Result<DexArtifact> {
    match find_dex(paths.sdk_dex.as_deref(), paths, SDK_DEX_NAME, embedded::sdk_dex())? {
        Some(artifact) => Ok(artifact),
        None => Err(PatcherError::ArtifactNotFound {
            what: "SDK dex",
            hint: missing_hint("--sdk-dex", SDK_DEX_NAME),
        }),
    }
}

/// Kotlin runtime dex. Only needed when the target does not ship Kotlin, so
/// absence is not an error here.
pub fn resolve_runtime_dex(paths: &ArtifactPaths) -> Result<Option<DexArtifact>> {
    find_dex(
        paths.runtime_dex.as_deref(),
        paths,
        RUNTIME_DEX_NAME,
        embedded::runtime_dex(),
    )
}

/// Hint used when the runtime dex turns out to be required but unresolved.
pub fn runtime_dex_hint() -> String {
    missing_hint("--runtime-dex", RUNTIME_DEX_NAME)
}

/// `AutoProxy.framework` directory for IPA jobs.
pub fn resolve_framework(paths: &ArtifactPaths) -> Result<PathBuf> {
    if let Some(explicit) = &paths.framework {
        if !explicit.is_dir() {
            return Err(PatcherError::ArtifactNotFound {
                what: "AutoProxy.framework",
                hint: format!("{} is not a directory", explicit.display()),
            });
        }
        return Ok(explicit.clone());
    }

    for dir in search_dirs(paths) {
        let candidate = dir.join(FRAMEWORK_NAME);
        if candidate.is_dir() {
            debug!(path = %candidate.display(), "resolved framework");
            return Ok(candidate);
        }
    }

    Err(PatcherError::ArtifactNotFound {
        what: "AutoProxy.framework",
        hint: missing_hint("--framework", FRAMEWORK_NAME),
    })
}

fn find_dex(
    explicit: Option<&Path>,
    paths: &ArtifactPaths,
    file_name: &str,
    embedded: Option<&'static [u8]>,
) -> Result<Option<DexArtifact>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(PatcherError::ArtifactNotFound {
                what: "dex artifact",
                hint: format!("{} does not exist", path.display()),
            });
        }
        return DexArtifact::load(path).map(Some);
    }

    if let Some(dir) = &paths.search_dir {
        let candidate = dir.join(file_name);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "resolved {file_name} from search dir");
            return DexArtifact::load(&candidate).map(Some);
        }
    }

    if let Some(bytes) = embedded {
        debug!("using embedded {file_name}");
        return Ok(Some(DexArtifact::from_bytes(
            format!("embedded {file_name}"),
            bytes,
        )));
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(file_name);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "resolved {file_name} beside executable");
            return DexArtifact::load(&candidate).map(Some);
        }
    }

    Ok(None)
}

fn search_dirs(paths: &ArtifactPaths) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = &paths.search_dir {
        dirs.push(dir.clone());
    }
    if let Some(dir) = exe_dir() {
        dirs.push(dir);
    }
    dirs
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe().ok()?.parent().map(Path::to_path_buf)
}

fn missing_hint(flag: &str, file_name: &str) -> String {
    format!(
        "pass {flag} <path>, set {} to a directory containing {file_name}, or build with --features bundled-sdk",
        crate::config::SDK_DIR_ENV
    )
}

mod embedded {
    #[cfg(feature = "bundled-sdk")]
    pub fn sdk_dex() -> Option<&'static [u8]> {
        Some(include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/assets/sdk/sdk.dex"
        )))
    }

    #[cfg(feature = "bundled-sdk")]
    pub fn runtime_dex() -> Option<&'static [u8]> {
        Some(include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/assets/sdk/kotlin-runtime.dex"
        )))
    }

    #[cfg(not(feature = "bundled-sdk"))]
    pub fn sdk_dex() -> Option<&'static [u8]> {
        None
    }

    #[cfg(not(feature = "bundled-sdk"))]
    pub fn runtime_dex() -> Option<&'static [u8]> {
        None
    }
}
