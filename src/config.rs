use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PatcherError, Result};

pub const OUTPUT_SUFFIX: &str = "-patched";
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 600;
pub const TOOL_TIMEOUT_ENV: &str = "AUTOPROXY_TOOL_TIMEOUT";
pub const SDK_DIR_ENV: &str = "AUTOPROXY_SDK_DIR";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Apk,
    Ipa,
}

impl Platform {
    pub fn extension(&self) -> &'static str {
        match self {
            Platform::Apk => "apk",
            Platform::Ipa => "ipa",
        }
    }

    /// Guess the platform from a container file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "apk" => Some(Platform::Apk),
            "ipa" => Some(Platform::Ipa),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// Build an endpoint from raw CLI values. Port 0 and blank hosts are rejected.
    pub fn new(host: &str, port: u32) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(PatcherError::Config("--host is required".into()));
        }
        if port == 0 || port > u16::MAX as u32 {
            return Err(PatcherError::Config(format!(
                "--port must be between 1 and 65535, got {port}"
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port: port as u16,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApkSigning {
    /// Sign with an operator-supplied keystore.
    Keystore {
        path: PathBuf,
        store_pass: String,
        key_alias: String,
        key_pass: String,
    },
    /// Sign with a debug keystore generated once beside the output.
    Debug,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpaSigning {
    /// Sign with a codesigning identity and its provisioning profile.
    Identity { identity: String, profile: PathBuf },
    /// Ad-hoc signature, enough for simulators and jailbroken devices.
    AdHoc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BundleIdPolicy {
    Keep,
    /// `com.patched.<original>`
    Derive,
    Override(String),
}

#[derive(Clone, Debug)]
pub struct ApkOptions {
    pub signing: ApkSigning,
}

impl Default for ApkOptions {
    fn default() -> Self {
        Self {
            signing: ApkSigning::Debug,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IpaOptions {
    pub signing: IpaSigning,
    pub bundle_id: BundleIdPolicy,
}

impl Default for IpaOptions {
    fn default() -> Self {
        Self {
            signing: IpaSigning::AdHoc,
            bundle_id: BundleIdPolicy::Derive,
        }
    }
}

/// Operator overrides for the SDK artifacts injected into the package.
#[derive(Clone, Debug, Default)]
pub struct ArtifactPaths {
    /// Pre-built interception SDK dex.
    pub sdk_dex: Option<PathBuf>,
    /// Kotlin runtime dex, injected when the target lacks the Kotlin stdlib.
    pub runtime_dex: Option<PathBuf>,
    /// Pre-built `AutoProxy.framework` directory.
    pub framework: Option<PathBuf>,
    /// Directory searched for any artifact not given explicitly.
    pub search_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct ToolSettings {
    pub timeout: Duration,
}

impl Default for ToolSettings {
    fn default() -> Self {
        let secs = env::var(TOOL_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS);
        Self {
            timeout: Duration::from_secs(secs),
        }
    }
}

/// One patch run: what to read, what to write, and how to configure the SDK.
#[derive(Clone, Debug)]
pub struct PatchJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub platform: Platform,
    pub proxy: ProxyEndpoint,
    pub cert: Option<PathBuf>,
    pub apk: ApkOptions,
    pub ipa: IpaOptions,
    pub artifacts: ArtifactPaths,
    pub tools: ToolSettings,
    /// Parent of the per-job working tree.
    pub scratch_dir: PathBuf,
}

impl PatchJob {
    /// Create a job with defaults for everything except the required values.
    pub fn new(input: impl Into<PathBuf>, proxy: ProxyEndpoint) -> Result<Self> {
        let input = input.into();
        let platform = Platform::from_path(&input).ok_or_else(|| {
            PatcherError::Config(format!(
                "cannot infer platform from '{}', pass --platform apk|ipa",
                input.display()
            ))
        })?;
        Ok(Self::with_platform(input, platform, proxy))
    }

    pub fn with_platform(input: impl Into<PathBuf>, platform: Platform, proxy: ProxyEndpoint) -> Self {
        let input = input.into();
        let output = default_output_path(&input, platform);
        Self {
            input,
            output,
            platform,
            proxy,
            cert: None,
            apk: ApkOptions::default(),
            ipa: IpaOptions::default(),
            artifacts: ArtifactPaths {
                search_dir: env::var_os(SDK_DIR_ENV).map(PathBuf::from),
                ..ArtifactPaths::default()
            },
            tools: ToolSettings::default(),
            scratch_dir: env::temp_dir(),
        }
    }

    /// Checks that need no working tree. Runs before anything is unpacked.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.host.trim().is_empty() {
            return Err(PatcherError::Config("--host is required".into()));
        }
        if self.proxy.port == 0 {
            return Err(PatcherError::Config("--port is required and must be > 0".into()));
        }
        if !self.input.is_file() {
            return Err(PatcherError::InputNotFound(self.input.clone()));
        }
        if self.output == self.input {
            return Err(PatcherError::Config(
                "output path must differ from the input path".into(),
            ));
        }
        if let Some(cert) = &self.cert {
            if !cert.is_file() {
                return Err(PatcherError::CertificateNotFound(cert.clone()));
            }
        }

        match self.platform {
            Platform::Apk => {
                if let ApkSigning::Keystore { path, .. } = &self.apk.signing {
                    if !path.is_file() {
                        return Err(PatcherError::Config(format!(
                            "keystore not found: {}",
                            path.display()
                        )));
                    }
                }
            }
            Platform::Ipa => {
                if let IpaSigning::Identity { identity, profile } = &self.ipa.signing {
                    if identity.trim().is_empty() {
                        return Err(PatcherError::Config("--identity must not be empty".into()));
                    }
                    if !profile.is_file() {
                        return Err(PatcherError::Config(format!(
                            "provisioning profile not found: {}",
                            profile.display()
                        )));
                    }
                }
                if let BundleIdPolicy::Override(id) = &self.ipa.bundle_id {
                    if id.trim().is_empty() {
                        return Err(PatcherError::Config("--bundle-id must not be empty".into()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// `<dir>/<stem>-patched.<ext>` next to the input.
pub fn default_output_path(input: &Path, platform: Platform) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string());
    let file = format!("{stem}{OUTPUT_SUFFIX}.{}", platform.extension());
    match input.parent() {
        Some(parent) => parent.join(file),
        None => PathBuf::from(file),
    }
}
