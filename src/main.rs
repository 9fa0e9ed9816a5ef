use std::process::ExitCode;

use autoproxy_patcher::cli::{Cli, Commands};
use autoproxy_patcher::dex::slot_file_name;
use autoproxy_patcher::workflow::PlatformReport;
use autoproxy_patcher::{logging, run_patch, PatchReport, PatcherError, SystemToolchain};
use clap::Parser;
use tracing::info;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.quiet, cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = match err.downcast_ref::<PatcherError>() {
                Some(patcher) => patcher.user_message(),
                None => format!("{err:#}"),
            };
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Patch(opts) => {
            let job = opts.to_job()?;
            let toolchain = SystemToolchain::new(&job.tools);
            let report = run_patch(&job, &toolchain)?;
            summarize(&report);
            Ok(())
        }
    }
}

fn summarize(report: &PatchReport) {
    match &report.details {
        PlatformReport::Apk { dex, keystore, .. } => {
            info!(
                "Patched {} (SDK in {}, signed with {})",
                report.identifier,
                slot_file_name(dex.sdk_slot),
                keystore.display()
            );
        }
        PlatformReport::Ipa { signed_items, .. } => {
            info!(
                "Patched {} ({} item(s) signed)",
                report.identifier, signed_items
            );
        }
    }
    info!("Done: {}", report.output.display());
}
