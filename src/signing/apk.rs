use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::ApkSigning;
use crate::error::Result;
use crate::toolchain::Toolchain;

pub const DEBUG_KEYSTORE_NAME: &str = "autoproxy-debug.keystore";
pub const DEBUG_KEY_ALIAS: &str = "autoproxy-debug";
pub const DEBUG_PASSWORD: &str = "android";

/// Everything apksigner needs to pick a key out of a keystore.
#[derive(Clone, PartialEq, Eq)]
pub struct KeystoreCredential {
    pub path: PathBuf,
    pub store_pass: String,
    pub key_alias: String,
    pub key_pass: String,
}

impl std::fmt::Debug for KeystoreCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreCredential")
            .field("path", &self.path)
            .field("key_alias", &self.key_alias)
            .finish_non_exhaustive()
    }
}

impl KeystoreCredential {
    /// Debug key kept beside the patched output.
    pub fn debug_for(output: &Path) -> Self {
        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self {
            path: dir.join(DEBUG_KEYSTORE_NAME),
            store_pass: DEBUG_PASSWORD.to_string(),
            key_alias: DEBUG_KEY_ALIAS.to_string(),
            key_pass: DEBUG_PASSWORD.to_string(),
        }
    }
}

/// Credential to sign with. The debug keystore is generated on first use and
/// reused afterwards.
pub fn resolve_apk_key(
    signing: &ApkSigning,
    output: &Path,
    toolchain: &dyn Toolchain,
) -> Result<KeystoreCredential> {
    match signing {
        ApkSigning::Keystore {
            path,
            store_pass,
            key_alias,
            key_pass,
        } => Ok(KeystoreCredential {
            path: path.clone(),
            store_pass: store_pass.clone(),
            key_alias: key_alias.clone(),
            key_pass: key_pass.clone(),
        }),
        ApkSigning::Debug => {
            let key = KeystoreCredential::debug_for(output);
            if key.path.is_file() {
                info!("Reusing debug keystore {}", key.path.display());
            } else {
                toolchain.generate_debug_keystore(&key)?;
            }
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingToolchain {
        generated: Cell<usize>,
    }

    impl Toolchain for CountingToolchain {
        fn decode_apk(&self, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn build_apk(&self, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn zipalign(&self, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn sign_apk(&self, _: &Path, _: &Path, _: &KeystoreCredential) -> Result<()> {
            unreachable!()
        }
        fn generate_debug_keystore(&self, key: &KeystoreCredential) -> Result<()> {
            self.generated.set(self.generated.get() + 1);
            fs::write(&key.path, b"keystore").map_err(|e| crate::error::PatcherError::from_io_error(&key.path, e))
        }
        fn codesign(&self, _: &Path, _: &str, _: Option<&Path>) -> Result<()> {
            unreachable!()
        }
        fn decode_profile(&self, _: &Path) -> Result<Vec<u8>> {
            unreachable!()
        }
    }

    #[test]
    fn debug_key_is_generated_once() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let output = temp.path().join("app-patched.apk");
        let toolchain = CountingToolchain::default();

        let first = resolve_apk_key(&ApkSigning::Debug, &output, &toolchain)?;
        let second = resolve_apk_key(&ApkSigning::Debug, &output, &toolchain)?;
        assert_eq!(first, second);
        assert_eq!(toolchain.generated.get(), 1);
        assert_eq!(first.path, temp.path().join(DEBUG_KEYSTORE_NAME));
        assert_eq!(first.key_alias, "autoproxy-debug");
        Ok(())
    }

    #[test]
    fn explicit_keystore_is_passed_through() -> anyhow::Result<()> {
        let toolchain = CountingToolchain::default();
        let signing = ApkSigning::Keystore {
            path: PathBuf::from("/keys/release.jks"),
            store_pass: "s3cret".into(),
            key_alias: "release".into(),
            key_pass: "k3y".into(),
        };
        let key = resolve_apk_key(&signing, Path::new("out.apk"), &toolchain)?;
        assert_eq!(key.key_alias, "release");
        assert_eq!(toolchain.generated.get(), 0);
        assert!(!format!("{key:?}").contains("s3cret"));
        Ok(())
    }

    #[test]
    fn bare_output_name_uses_current_dir() {
        let key = KeystoreCredential::debug_for(Path::new("out.apk"));
        assert_eq!(key.path, PathBuf::from("./autoproxy-debug.keystore"));
    }
}
