//! SDK dex injection into a decoded APK

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::header::verify_dex_header;
use super::kind::detect_dex_kind;
use super::slots::{slot_file_name, DexSet};
use crate::artifacts::{self, DexArtifact};
use crate::error::{PatcherError, Result};

/// Type descriptor present in every dex compiled against the Kotlin stdlib.
pub const KOTLIN_RUNTIME_MARKER: &[u8] = b"Lkotlin/jvm/internal/Intrinsics;";

/// What [`inject_sdk`] wrote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionReport {
    pub sdk_slot: u32,
    /// Set when the Kotlin runtime had to be added alongside the SDK.
    pub runtime_slot: Option<u32>,
    pub kotlin_present: bool,
}

/// Naive substring search over raw dex bytes.
pub fn contains_marker(data: &[u8], marker: &[u8]) -> bool {
    if marker.is_empty() || data.len() < marker.len() {
        return false;
    }
    data.windows(marker.len()).any(|window| window == marker)
}

/// Add the SDK dex (and the Kotlin runtime when the app lacks it) as new
/// multidex slots in `decoded_dir`.
///
/// Nothing is written unless every precondition holds. If the second write
/// fails the first one is rolled back.
pub fn inject_sdk(
    decoded_dir: &Path,
    sdk: &DexArtifact,
    runtime: Option<&DexArtifact>,
) -> Result<InjectionReport> {
    let mut set = DexSet::scan(decoded_dir)?;
    if !set.has_primary() {
        return Err(PatcherError::MissingPrimaryDex);
    }

    validate_artifact("SDK dex", sdk)?;

    let kotlin_present = app_has_kotlin(&set)?;
    debug!(kotlin_present, dex_count = set.len(), "scanned dex payloads");

    let runtime = if kotlin_present {
        None
    } else {
        let runtime = runtime.ok_or_else(|| PatcherError::ArtifactNotFound {
            what: "Kotlin runtime dex",
            hint: artifacts::runtime_dex_hint(),
        })?;
        validate_artifact("Kotlin runtime dex", runtime)?;
        Some(runtime)
    };

    let sdk_slot = set.next_free_slot();
    let sdk_path = write_slot(decoded_dir, sdk_slot, &sdk.bytes)?;
    set.occupy(sdk_slot, sdk_path.clone());
    info!("Injected SDK as {}", slot_file_name(sdk_slot));

    let runtime_slot = match runtime {
        Some(runtime) => {
            let slot = set.next_free_slot();
            if let Err(err) = write_slot(decoded_dir, slot, &runtime.bytes) {
                if let Err(cleanup) = fs::remove_file(&sdk_path) {
                    warn!(path = %sdk_path.display(), "failed to roll back SDK dex: {cleanup}");
                }
                return Err(err);
            }
            info!("Injected Kotlin runtime as {}", slot_file_name(slot));
            Some(slot)
        }
        None => None,
    };

    Ok(InjectionReport {
        sdk_slot,
        runtime_slot,
        kotlin_present,
    })
}

fn app_has_kotlin(set: &DexSet) -> Result<bool> {
    for path in set.paths() {
        let data = fs::read(path).map_err(|e| PatcherError::from_io_error(path, e))?;
        if contains_marker(&data, KOTLIN_RUNTIME_MARKER) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn validate_artifact(what: &'static str, artifact: &DexArtifact) -> Result<()> {
    let invalid = |reason: &str| PatcherError::InvalidArtifact {
        what,
        path: artifact.origin.clone(),
        reason: reason.to_string(),
    };

    match detect_dex_kind(&artifact.bytes) {
        Some(kind) if kind.is_installable() => {}
        Some(kind) => return Err(invalid(&format!("{kind} payloads cannot be loaded from an APK"))),
        None => return Err(invalid("bad dex magic")),
    }

    let check = verify_dex_header(&artifact.bytes).ok_or_else(|| invalid("truncated header"))?;
    if !check.is_loadable() {
        return Err(invalid("header checksum or file size does not match the payload"));
    }
    if !check.signature_ok {
        warn!(origin = %artifact.origin, "{what} has a stale SHA-1 signature");
    }
    Ok(())
}

fn write_slot(dir: &Path, slot: u32, bytes: &[u8]) -> Result<PathBuf> {
    let name = slot_file_name(slot);
    let target = dir.join(&name);
    if target.exists() {
        return Err(PatcherError::from_io_error(
            &target,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "dex slot already taken"),
        ));
    }

    let staging = dir.join(format!(".{name}.tmp"));
    fs::write(&staging, bytes).map_err(|e| PatcherError::from_io_error(&staging, e))?;
    if let Err(err) = fs::rename(&staging, &target) {
        let _ = fs::remove_file(&staging);
        return Err(PatcherError::from_io_error(&target, err));
    }
    Ok(target)
}
