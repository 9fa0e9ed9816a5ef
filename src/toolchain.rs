//! Seam between the pipeline and the external tools it drives.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::config::ToolSettings;
use crate::error::Result;
use crate::signing::apk::KeystoreCredential;
use crate::tools::{Tool, ToolKind};

/// Keystore validity for generated debug keys, in days (30 years).
const DEBUG_KEY_VALIDITY_DAYS: &str = "10950";
const DEBUG_KEY_DNAME: &str = "CN=Auto Proxy Debug, O=Auto Proxy";

/// Every operation the pipeline delegates to a tool outside the process.
pub trait Toolchain {
    /// Decode `apk` into `out_dir`, keeping dex files as-is.
    fn decode_apk(&self, apk: &Path, out_dir: &Path) -> Result<()>;
    /// Rebuild a decoded tree into an unsigned APK.
    fn build_apk(&self, decoded_dir: &Path, out_apk: &Path) -> Result<()>;
    fn zipalign(&self, input: &Path, output: &Path) -> Result<()>;
    fn sign_apk(&self, input: &Path, output: &Path, key: &KeystoreCredential) -> Result<()>;
    fn generate_debug_keystore(&self, key: &KeystoreCredential) -> Result<()>;
    fn codesign(&self, target: &Path, identity: &str, entitlements: Option<&Path>) -> Result<()>;
    /// Strip the CMS envelope from a provisioning profile, returning the plist.
    fn decode_profile(&self, profile: &Path) -> Result<Vec<u8>>;
}

/// [`Toolchain`] backed by apktool, the Android SDK build-tools, keytool and
/// the macOS signing tools.
#[derive(Clone, Debug)]
pub struct SystemToolchain {
    timeout: Duration,
}

impl SystemToolchain {
    pub fn new(settings: &ToolSettings) -> Self {
        Self {
            timeout: settings.timeout,
        }
    }

    fn run(&self, kind: ToolKind, args: &[&OsStr]) -> Result<Vec<u8>> {
        let tool = Tool::resolve(kind)?;
        Ok(tool.run(args, self.timeout)?.stdout)
    }
}

impl Toolchain for SystemToolchain {
    fn decode_apk(&self, apk: &Path, out_dir: &Path) -> Result<()> {
        info!("Decoding APK with apktool");
        self.run(
            ToolKind::Apktool,
            &[
                OsStr::new("d"),
                OsStr::new("-f"),
                OsStr::new("-s"),
                OsStr::new("-o"),
                out_dir.as_os_str(),
                apk.as_os_str(),
            ],
        )?;
        Ok(())
    }

    fn build_apk(&self, decoded_dir: &Path, out_apk: &Path) -> Result<()> {
        info!("Rebuilding APK with apktool");
        self.run(
            ToolKind::Apktool,
            &[OsStr::new("b"), decoded_dir.as_os_str(), OsStr::new("-o"), out_apk.as_os_str()],
        )?;
        Ok(())
    }

    fn zipalign(&self, input: &Path, output: &Path) -> Result<()> {
        info!("Aligning APK");
        self.run(
            ToolKind::Zipalign,
            &[
                OsStr::new("-f"),
                OsStr::new("-p"),
                OsStr::new("4"),
                input.as_os_str(),
                output.as_os_str(),
            ],
        )?;
        Ok(())
    }

    fn sign_apk(&self, input: &Path, output: &Path, key: &KeystoreCredential) -> Result<()> {
        info!("Signing APK with key '{}'", key.key_alias);
        let store_pass = format!("pass:{}", key.store_pass);
        let key_pass = format!("pass:{}", key.key_pass);
        let args: Vec<&OsStr> = vec![
            OsStr::new("sign"),
            OsStr::new("--ks"),
            key.path.as_os_str(),
            OsStr::new("--ks-key-alias"),
            OsStr::new(&key.key_alias),
            OsStr::new("--ks-pass"),
            OsStr::new(&store_pass),
            OsStr::new("--key-pass"),
            OsStr::new(&key_pass),
            OsStr::new("--v1-signing-enabled"),
            OsStr::new("true"),
            OsStr::new("--v2-signing-enabled"),
            OsStr::new("true"),
            OsStr::new("--v3-signing-enabled"),
            OsStr::new("true"),
            OsStr::new("--out"),
            output.as_os_str(),
            input.as_os_str(),
        ];
        self.run(ToolKind::Apksigner, &args)?;
        Ok(())
    }

    fn generate_debug_keystore(&self, key: &KeystoreCredential) -> Result<()> {
        info!("Generating debug keystore at {}", key.path.display());
        let args: Vec<&OsStr> = vec![
            OsStr::new("-genkeypair"),
            OsStr::new("-v"),
            OsStr::new("-keystore"),
            key.path.as_os_str(),
            OsStr::new("-alias"),
            OsStr::new(&key.key_alias),
            OsStr::new("-keyalg"),
            OsStr::new("RSA"),
            OsStr::new("-keysize"),
            OsStr::new("2048"),
            OsStr::new("-validity"),
            OsStr::new(DEBUG_KEY_VALIDITY_DAYS),
            OsStr::new("-storepass"),
            OsStr::new(&key.store_pass),
            OsStr::new("-keypass"),
            OsStr::new(&key.key_pass),
            OsStr::new("-dname"),
            OsStr::new(DEBUG_KEY_DNAME),
        ];
        self.run(ToolKind::Keytool, &args)?;
        Ok(())
    }

    fn codesign(&self, target: &Path, identity: &str, entitlements: Option<&Path>) -> Result<()> {
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("-f"),
            OsStr::new("-s"),
            OsStr::new(identity),
            OsStr::new("--timestamp=none"),
        ];
        if let Some(entitlements) = entitlements {
            args.push(OsStr::new("--entitlements"));
            args.push(entitlements.as_os_str());
        }
        args.push(target.as_os_str());
        self.run(ToolKind::Codesign, &args)?;
        Ok(())
    }

    fn decode_profile(&self, profile: &Path) -> Result<Vec<u8>> {
        self.run(
            ToolKind::Security,
            &[OsStr::new("cms"), OsStr::new("-D"), OsStr::new("-i"), profile.as_os_str()],
        )
    }
}
