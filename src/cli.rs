use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::config::{ApkSigning, BundleIdPolicy, IpaSigning, PatchJob, Platform, ProxyEndpoint};
use crate::error::{PatcherError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "autoproxy",
    about = "Patch APK/IPA packages so their HTTP traffic goes through an intercepting proxy",
    version,
    propagate_version = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Only print errors.
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    pub quiet: bool,

    /// Print debug output.
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inject the proxy SDK into an APK or IPA and re-sign it.
    Patch(PatchCommand),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum PlatformArg {
    Apk,
    Ipa,
}

impl From<PlatformArg> for Platform {
    fn from(value: PlatformArg) -> Self {
        match value {
            PlatformArg::Apk => Platform::Apk,
            PlatformArg::Ipa => Platform::Ipa,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PatchCommand {
    /// Package to patch (.apk or .ipa).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Proxy host the patched app connects to.
    #[arg(long, value_name = "HOST")]
    pub host: String,

    /// Proxy port.
    #[arg(long, value_name = "PORT")]
    pub port: u32,

    /// CA certificate to trust (PEM or DER). A built-in one is used otherwise.
    #[arg(long, value_name = "PEM")]
    pub cert: Option<PathBuf>,

    /// Where to write the patched package.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Override platform detection from the input extension.
    #[arg(long, value_enum)]
    pub platform: Option<PlatformArg>,

    /// Keystore used to sign the APK.
    #[arg(long, value_name = "PATH", help_heading = "APK signing")]
    pub keystore: Option<PathBuf>,

    #[arg(long = "ks-pass", value_name = "PASS", help_heading = "APK signing")]
    pub ks_pass: Option<String>,

    #[arg(long = "key-alias", value_name = "ALIAS", help_heading = "APK signing")]
    pub key_alias: Option<String>,

    #[arg(long = "key-pass", value_name = "PASS", help_heading = "APK signing")]
    pub key_pass: Option<String>,

    /// Codesigning identity, e.g. "Apple Development: Jane (TEAMID)".
    #[arg(long, value_name = "NAME", help_heading = "IPA signing")]
    pub identity: Option<String>,

    /// Provisioning profile matching the identity.
    #[arg(long, value_name = "PATH", help_heading = "IPA signing")]
    pub profile: Option<PathBuf>,

    /// Ad-hoc sign instead of using an identity.
    #[arg(
        long = "skip-signing",
        action = ArgAction::SetTrue,
        conflicts_with_all = ["identity", "profile"],
        help_heading = "IPA signing"
    )]
    pub skip_signing: bool,

    /// Bundle identifier for the patched app. Defaults to com.patched.<original>.
    #[arg(long = "bundle-id", value_name = "ID", help_heading = "IPA signing")]
    pub bundle_id: Option<String>,

    /// Leave CFBundleIdentifier untouched.
    #[arg(
        long = "keep-bundle-id",
        action = ArgAction::SetTrue,
        conflicts_with = "bundle_id",
        help_heading = "IPA signing"
    )]
    pub keep_bundle_id: bool,

    /// Pre-built AutoProxy.framework directory.
    #[arg(long, value_name = "DIR", help_heading = "SDK artifacts")]
    pub framework: Option<PathBuf>,

    /// Pre-built SDK dex.
    #[arg(long = "sdk-dex", value_name = "FILE", help_heading = "SDK artifacts")]
    pub sdk_dex: Option<PathBuf>,

    /// Kotlin runtime dex for apps that do not ship the Kotlin stdlib.
    #[arg(long = "runtime-dex", value_name = "FILE", help_heading = "SDK artifacts")]
    pub runtime_dex: Option<PathBuf>,

    /// Seconds each external tool may run before it is killed.
    #[arg(long = "tool-timeout", value_name = "SECS")]
    pub tool_timeout: Option<u64>,
}

impl PatchCommand {
    pub fn to_job(&self) -> Result<PatchJob> {
        let proxy = ProxyEndpoint::new(&self.host, self.port)?;
        let mut job = match self.platform {
            Some(platform) => PatchJob::with_platform(&self.input, platform.into(), proxy),
            None => PatchJob::new(&self.input, proxy)?,
        };

        if let Some(output) = &self.output {
            job.output = output.clone();
        }
        job.cert = self.cert.clone();

        job.artifacts.sdk_dex = self.sdk_dex.clone();
        job.artifacts.runtime_dex = self.runtime_dex.clone();
        job.artifacts.framework = self.framework.clone();

        if let Some(secs) = self.tool_timeout {
            if secs == 0 {
                return Err(PatcherError::Config("--tool-timeout must be > 0".into()));
            }
            job.tools.timeout = Duration::from_secs(secs);
        }

        job.apk.signing = self.apk_signing()?;
        if job.platform == Platform::Ipa {
            job.ipa.signing = self.ipa_signing()?;
        }
        job.ipa.bundle_id = match (&self.bundle_id, self.keep_bundle_id) {
            (_, true) => BundleIdPolicy::Keep,
            (Some(id), false) => BundleIdPolicy::Override(id.clone()),
            (None, false) => BundleIdPolicy::Derive,
        };
        Ok(job)
    }

    fn apk_signing(&self) -> Result<ApkSigning> {
        match (&self.keystore, &self.ks_pass, &self.key_alias, &self.key_pass) {
            (None, None, None, None) => Ok(ApkSigning::Debug),
            (Some(path), Some(store_pass), Some(key_alias), Some(key_pass)) => {
                Ok(ApkSigning::Keystore {
                    path: path.clone(),
                    store_pass: store_pass.clone(),
                    key_alias: key_alias.clone(),
                    key_pass: key_pass.clone(),
                })
            }
            _ => Err(PatcherError::Config(
                "--keystore, --ks-pass, --key-alias and --key-pass must be given together".into(),
            )),
        }
    }

    fn ipa_signing(&self) -> Result<IpaSigning> {
        if self.skip_signing {
            return Ok(IpaSigning::AdHoc);
        }
        match (&self.identity, &self.profile) {
            (Some(identity), Some(profile)) => Ok(IpaSigning::Identity {
                identity: identity.clone(),
                profile: profile.clone(),
            }),
            _ => Err(PatcherError::Config(
                "--identity and --profile are required unless --skip-signing is set".into(),
            )),
        }
    }
}
