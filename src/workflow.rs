use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::artifacts::{self, DexArtifact};
use crate::config::{PatchJob, Platform};
use crate::container::{self, ANDROID_MANIFEST};
use crate::dex::{self, InjectionReport};
use crate::error::{PatcherError, Result};
use crate::inject::{self, cert, CertSource};
use crate::macho::{self, InjectOutcome, AUTOPROXY_DYLIB};
use crate::manifest::{self, bundle, TrustPolicyOutcome};
use crate::signing;
use crate::toolchain::Toolchain;
use crate::workdir::WorkingTree;

/// Pipeline stages, in the only order they may be entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Validating,
    Unpacking,
    Injecting,
    PatchingMetadata,
    WritingConfig,
    Rebuilding,
    Resigning,
    Repacking,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Validating => "validating",
            Stage::Unpacking => "unpacking",
            Stage::Injecting => "injecting",
            Stage::PatchingMetadata => "patching metadata",
            Stage::WritingConfig => "writing config",
            Stage::Rebuilding => "rebuilding",
            Stage::Resigning => "re-signing",
            Stage::Repacking => "repacking",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Records the stages a job passes through. Stages may be skipped but never
/// revisited.
#[derive(Debug)]
pub struct StageTracker {
    visited: Vec<Stage>,
    failed_in: Option<Stage>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            visited: vec![Stage::Validating],
            failed_in: None,
        }
    }

    pub fn current(&self) -> Stage {
        match self.failed_in {
            Some(_) => Stage::Failed,
            None => *self.visited.last().unwrap_or(&Stage::Validating),
        }
    }

    pub fn advance(&mut self, next: Stage) {
        let current = self.current();
        assert!(
            next > current && next != Stage::Failed,
            "stage {next:?} cannot follow {current:?}"
        );
        debug!(stage = %next, "entering stage");
        self.visited.push(next);
    }

    /// Mark the job failed and return the stage the failure happened in.
    pub fn fail(&mut self) -> Stage {
        let stage = *self.visited.last().unwrap_or(&Stage::Validating);
        self.failed_in = Some(stage);
        stage
    }

    pub fn failed_in(&self) -> Option<Stage> {
        self.failed_in
    }

    pub fn visited(&self) -> &[Stage] {
        &self.visited
    }
}

/// Platform specific results of a patch run.
#[derive(Clone, Debug)]
pub enum PlatformReport {
    Apk {
        dex: InjectionReport,
        trust_policy: TrustPolicyOutcome,
        keystore: PathBuf,
    },
    Ipa {
        load_command: InjectOutcome,
        bundle_id_change: Option<(String, String)>,
        signed_items: usize,
    },
}

#[derive(Clone, Debug)]
pub struct PatchReport {
    pub output: PathBuf,
    pub platform: Platform,
    /// Android package name or iOS bundle identifier of the output.
    pub identifier: String,
    pub cert: CertSource,
    pub details: PlatformReport,
    pub stages: Vec<Stage>,
}

/// Run one patch job from start to finish.
///
/// The job is validated before anything touches the disk. The working tree
/// is removed on every exit path, and the output only appears once every
/// stage succeeded.
pub fn run_patch(job: &PatchJob, toolchain: &dyn Toolchain) -> Result<PatchReport> {
    let mut tracker = StageTracker::new();
    let result = drive(job, toolchain, &mut tracker);
    if let Err(err) = &result {
        let stage = tracker.fail();
        error!(stage = %stage, kind = ?err.kind(), "patch aborted");
    }
    result
}

enum Prepared {
    Apk {
        sdk: DexArtifact,
        runtime: Option<DexArtifact>,
    },
    Ipa {
        framework: PathBuf,
    },
}

fn drive(job: &PatchJob, toolchain: &dyn Toolchain, tracker: &mut StageTracker) -> Result<PatchReport> {
    job.validate()?;
    let prepared = match job.platform {
        Platform::Apk => Prepared::Apk {
            sdk: artifacts::resolve_sdk_dex(&job.artifacts)?,
            runtime: artifacts::resolve_runtime_dex(&job.artifacts)?,
        },
        Platform::Ipa => Prepared::Ipa {
            framework: artifacts::resolve_framework(&job.artifacts)?,
        },
    };

    info!(
        "Patching {} for proxy {}:{}",
        job.input.display(),
        job.proxy.host,
        job.proxy.port
    );
    let tree = WorkingTree::create_in(&job.scratch_dir)?;

    match prepared {
        Prepared::Apk { sdk, runtime } => {
            patch_apk(job, toolchain, &tree, tracker, &sdk, runtime.as_ref())
        }
        Prepared::Ipa { framework } => patch_ipa(job, toolchain, &tree, tracker, &framework),
    }
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| PatcherError::from_io_error(path, e))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).map_err(|e| PatcherError::from_io_error(path, e))
}

fn patch_apk(
    job: &PatchJob,
    toolchain: &dyn Toolchain,
    tree: &WorkingTree,
    tracker: &mut StageTracker,
    sdk: &DexArtifact,
    runtime: Option<&DexArtifact>,
) -> Result<PatchReport> {
    tracker.advance(Stage::Unpacking);
    let decoded = tree.decoded_dir();
    toolchain.decode_apk(&job.input, &decoded)?;
    let package = container::locate_android_root(&decoded)?;
    info!("Package: {package}");

    tracker.advance(Stage::Injecting);
    let dex = dex::inject_sdk(&decoded, sdk, runtime)?;

    tracker.advance(Stage::PatchingMetadata);
    let manifest_path = decoded.join(ANDROID_MANIFEST);
    let patched = manifest::patch_manifest(&read_text(&manifest_path)?)?;
    write_text(&manifest_path, &patched)?;
    info!("Registered ContentProvider {}", manifest::PROVIDER_CLASS);
    let trust_policy = manifest::patch_trust_policy(&decoded)?;

    tracker.advance(Stage::WritingConfig);
    inject::write_android_config(&decoded, &job.proxy)?;
    let cert = inject::install_cert(&cert::android_cert_target(&decoded), job.cert.as_deref())?;

    tracker.advance(Stage::Rebuilding);
    toolchain.build_apk(&decoded, &tree.rebuilt_apk())?;
    toolchain.zipalign(&tree.rebuilt_apk(), &tree.aligned_apk())?;

    tracker.advance(Stage::Resigning);
    let key = signing::resolve_apk_key(&job.apk.signing, &job.output, toolchain)?;
    toolchain.sign_apk(&tree.aligned_apk(), &tree.signed_apk(), &key)?;

    tracker.advance(Stage::Repacking);
    container::finalize_output(&tree.signed_apk(), &job.output)?;

    tracker.advance(Stage::Done);
    Ok(PatchReport {
        output: job.output.clone(),
        platform: Platform::Apk,
        identifier: package,
        cert,
        details: PlatformReport::Apk {
            dex,
            trust_policy,
            keystore: key.path,
        },
        stages: tracker.visited().to_vec(),
    })
}

fn patch_ipa(
    job: &PatchJob,
    toolchain: &dyn Toolchain,
    tree: &WorkingTree,
    tracker: &mut StageTracker,
    framework: &Path,
) -> Result<PatchReport> {
    tracker.advance(Stage::Unpacking);
    let app = container::unpack_ipa(&job.input, tree)?;

    tracker.advance(Stage::Injecting);
    inject::install_framework(&app.app_dir, framework)?;
    let load_command = macho::inject_load_dylib(&app.executable, AUTOPROXY_DYLIB)?;
    if !macho::has_load_dylib(&app.executable, AUTOPROXY_DYLIB)? {
        return Err(PatcherError::MalformedMachO(format!(
            "{} does not load {AUTOPROXY_DYLIB} after injection",
            app.executable.display()
        )));
    }

    tracker.advance(Stage::PatchingMetadata);
    let bundle_id_change = manifest::patch_bundle_id(&app.info_plist, &job.ipa.bundle_id)?;
    let identifier = match &bundle_id_change {
        Some((_, new)) => new.clone(),
        None => bundle::read_bundle_id(&app.info_plist)?.unwrap_or_else(|| "unknown".into()),
    };

    tracker.advance(Stage::WritingConfig);
    inject::write_ios_config(&app.app_dir, &job.proxy)?;
    let cert = inject::install_cert(&cert::ios_cert_target(&app.app_dir), job.cert.as_deref())?;

    tracker.advance(Stage::Resigning);
    let signed_items =
        signing::sign_app(&app.app_dir, &job.ipa.signing, &tree.entitlements(), toolchain)?;

    tracker.advance(Stage::Repacking);
    let staged = tree.staged_ipa();
    container::pack_ipa(tree, &staged)?;
    container::finalize_output(&staged, &job.output)?;

    tracker.advance(Stage::Done);
    Ok(PatchReport {
        output: job.output.clone(),
        platform: Platform::Ipa,
        identifier,
        cert,
        details: PlatformReport::Ipa {
            load_command,
            bundle_id_change,
            signed_items,
        },
        stages: tracker.visited().to_vec(),
    })
}
