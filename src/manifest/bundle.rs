//! Info.plist editing for IPA bundles

use std::path::Path;

use plist::Value;
use tracing::info;

use crate::config::BundleIdPolicy;
use crate::error::{PatcherError, Result};

pub const PATCHED_PREFIX: &str = "com.patched.";
const BUNDLE_ID_KEY: &str = "CFBundleIdentifier";
const EXECUTABLE_KEY: &str = "CFBundleExecutable";
const UNKNOWN_BUNDLE_ID: &str = "unknown";

/// `com.patched.<original>`, without stacking the prefix on re-runs.
pub fn derive_bundle_id(original: &str) -> String {
    if original.starts_with(PATCHED_PREFIX) {
        original.to_string()
    } else {
        format!("{PATCHED_PREFIX}{original}")
    }
}

fn load(info_plist: &Path) -> Result<Value> {
    Value::from_file(info_plist).map_err(|e| PatcherError::from_plist_error(info_plist, e))
}

fn string_key(value: &Value, key: &str) -> Option<String> {
    value
        .as_dictionary()?
        .get(key)?
        .as_string()
        .map(str::to_string)
}

pub fn read_bundle_id(info_plist: &Path) -> Result<Option<String>> {
    Ok(string_key(&load(info_plist)?, BUNDLE_ID_KEY))
}

/// `CFBundleExecutable`, the name of the main binary inside the `.app`.
pub fn read_executable(info_plist: &Path) -> Result<String> {
    let value = load(info_plist).map_err(|e| {
        PatcherError::ContainerFormat(format!("unreadable Info.plist: {e}"))
    })?;
    string_key(&value, EXECUTABLE_KEY)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| PatcherError::ContainerFormat(format!("{EXECUTABLE_KEY} not found in Info.plist")))
}

/// Apply `policy` to the bundle identifier. Returns `(old, new)` when the
/// file was rewritten.
pub fn patch_bundle_id(info_plist: &Path, policy: &BundleIdPolicy) -> Result<Option<(String, String)>> {
    if *policy == BundleIdPolicy::Keep {
        return Ok(None);
    }

    let mut value = load(info_plist)?;
    let original = string_key(&value, BUNDLE_ID_KEY).unwrap_or_else(|| UNKNOWN_BUNDLE_ID.to_string());
    let updated = match policy {
        BundleIdPolicy::Keep => return Ok(None),
        BundleIdPolicy::Derive => derive_bundle_id(&original),
        BundleIdPolicy::Override(id) => id.trim().to_string(),
    };

    let dict = value.as_dictionary_mut().ok_or_else(|| {
        PatcherError::ContainerFormat("Info.plist root is not a dictionary".into())
    })?;
    dict.insert(BUNDLE_ID_KEY.to_string(), Value::String(updated.clone()));
    value
        .to_file_xml(info_plist)
        .map_err(|e| PatcherError::from_plist_error(info_plist, e))?;

    info!("Bundle ID: {original} -> {updated}");
    Ok(Some((original, updated)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::Dictionary;
    use tempfile::TempDir;

    fn write_info(dir: &Path, bundle_id: Option<&str>) -> anyhow::Result<std::path::PathBuf> {
        let mut dict = Dictionary::new();
        dict.insert(EXECUTABLE_KEY.into(), Value::String("Demo".into()));
        if let Some(id) = bundle_id {
            dict.insert(BUNDLE_ID_KEY.into(), Value::String(id.into()));
        }
        let path = dir.join("Info.plist");
        Value::Dictionary(dict).to_file_binary(&path)?;
        Ok(path)
    }

    #[test]
    fn derive_does_not_stack_prefix() {
        assert_eq!(derive_bundle_id("com.acme.app"), "com.patched.com.acme.app");
        assert_eq!(
            derive_bundle_id("com.patched.com.acme.app"),
            "com.patched.com.acme.app"
        );
    }

    #[test]
    fn keep_leaves_file_alone() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = write_info(temp.path(), Some("com.acme.app"))?;
        let before = std::fs::read(&path)?;
        assert_eq!(patch_bundle_id(&path, &BundleIdPolicy::Keep)?, None);
        assert_eq!(std::fs::read(&path)?, before);
        Ok(())
    }

    #[test]
    fn derive_rewrites_as_xml() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = write_info(temp.path(), Some("com.acme.app"))?;
        let change = patch_bundle_id(&path, &BundleIdPolicy::Derive)?;
        assert_eq!(
            change,
            Some(("com.acme.app".to_string(), "com.patched.com.acme.app".to_string()))
        );
        assert!(std::fs::read_to_string(&path)?.starts_with("<?xml"));
        assert_eq!(read_bundle_id(&path)?.as_deref(), Some("com.patched.com.acme.app"));
        assert_eq!(read_executable(&path)?, "Demo");
        Ok(())
    }

    #[test]
    fn missing_id_becomes_unknown() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = write_info(temp.path(), None)?;
        let (old, new) = patch_bundle_id(&path, &BundleIdPolicy::Derive)?.unwrap();
        assert_eq!(old, "unknown");
        assert_eq!(new, "com.patched.unknown");
        Ok(())
    }

    #[test]
    fn override_sets_explicit_id() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = write_info(temp.path(), Some("com.acme.app"))?;
        patch_bundle_id(&path, &BundleIdPolicy::Override("io.test.mine".into()))?;
        assert_eq!(read_bundle_id(&path)?.as_deref(), Some("io.test.mine"));
        Ok(())
    }

    #[test]
    fn executable_is_required() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("Info.plist");
        Value::Dictionary(Dictionary::new()).to_file_xml(&path)?;
        assert!(matches!(
            read_executable(&path),
            Err(PatcherError::ContainerFormat(_))
        ));
        Ok(())
    }
}
