use std::path::PathBuf;

use dropbox_backup::config::BackupConfig;
use dropbox_backup::logging::init_logging;
use dropbox_backup::operator::Operator;
use dropbox_backup::run::{RunOptions, RunOutcome, run_backup};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliOptions {
    run: RunOptions,
    verbose: bool,
    help: bool,
    local_root: Option<PathBuf>,
}

fn parse_cli_options<I>(args: I) -> anyhow::Result<CliOptions>
where
    I: IntoIterator<Item = String>,
{
    let mut options = CliOptions::default();
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--yes" | "-y" => options.run.assume_yes = true,
            "--dry-run" => options.run.dry_run = true,
            "--verbose" | "-v" => options.verbose = true,
            "--help" | "-h" => options.help = true,
            other if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
            other => {
                if options.local_root.is_some() {
                    anyhow::bail!("unexpected extra argument: {other}");
                }
                options.local_root = Some(PathBuf::from(other));
            }
        }
    }
    Ok(options)
}

fn print_usage() {
    println!("Usage: dropbox-backup [--yes] [--dry-run] [--verbose] [LOCAL_DIR]");
    println!("  --yes, -y      Apply the plan without asking");
    println!("  --dry-run      Print the plan and exit");
    println!("  --verbose, -v  Debug logging for the backup itself");
    println!("  LOCAL_DIR      Backup directory (default: DROPBOX_LOCAL_ROOT or prompt)");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let options = parse_cli_options(std::env::args())?;
    if options.help {
        print_usage();
        return Ok(());
    }
    init_logging(options.verbose);

    let cancel = CancellationToken::new();
    let arm_interrupt = {
        let cancel = cancel.clone();
        move || {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping after the current item");
                    cancel.cancel();
                }
            });
        }
    };

    let mut config = BackupConfig::from_env();
    if let Some(root) = options.local_root {
        config.local_root = Some(root);
    }

    let mut operator = Operator::stdio();
    match run_backup(&config, options.run, &mut operator, &cancel, arm_interrupt).await? {
        RunOutcome::UpToDate | RunOutcome::DryRun(_) => {}
        RunOutcome::Declined(_) => anyhow::bail!("Backup aborted."),
        RunOutcome::Applied(report) => {
            for (from, to) in &report.failed_moves {
                tracing::warn!("could not move {from} -> {to}");
            }
            for path in &report.failed_removals {
                tracing::warn!("could not remove {path}");
            }
            for path in &report.failed_downloads {
                tracing::warn!("could not download {path}");
            }
            if report.is_clean() {
                operator.say("Backup finished.")?;
            } else {
                let failures = report.failed_moves.len()
                    + report.failed_removals.len()
                    + report.failed_downloads.len();
                operator.say(&format!(
                    "Backup finished with {failures} failed item(s); run again to retry."
                ))?;
            }
        }
    }
    Ok(())
}
