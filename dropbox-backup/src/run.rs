use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;

use crate::config::BackupConfig;
use crate::operator::Operator;
use crate::sync::backoff::Backoff;
use crate::sync::executor::{
    ExecutorError, MoveFailures, apply_downloads, apply_moves, apply_removals, stamp_moved_files,
};
use crate::sync::local::scan_local_tree;
use crate::sync::reconcile::{Plan, reconcile};
use crate::sync::remote::RemoteTree;
use crate::sync::snapshot_cache::save_snapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Apply the plan without asking.
    pub assume_yes: bool,
    /// Print the plan and stop before touching anything.
    pub dry_run: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub plan: Plan,
    pub failed_moves: MoveFailures,
    pub failed_removals: Vec<String>,
    pub failed_downloads: Vec<String>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failed_moves.is_empty()
            && self.failed_removals.is_empty()
            && self.failed_downloads.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    UpToDate,
    DryRun(Plan),
    Declined(Plan),
    Applied(RunReport),
}

/// One full backup pass: gather both snapshots, reconcile, confirm, then
/// apply moves, removals and downloads strictly in that order.
///
/// `arm_interrupt` runs once the plan is accepted, right before the first
/// mutation. Prompts block the thread on input, so until then an interrupt
/// keeps its default effect of ending the process.
pub async fn run_backup<R, W, F>(
    config: &BackupConfig,
    options: RunOptions,
    operator: &mut Operator<R, W>,
    cancel: &CancellationToken,
    arm_interrupt: F,
) -> anyhow::Result<RunOutcome>
where
    R: BufRead,
    W: Write,
    F: FnOnce(),
{
    let local_root = operator.choose_local_root(config.local_root.clone())?;
    tracing::info!(root = %local_root.display(), "building local snapshot");
    let scan_root = local_root.clone();
    let mut local = tokio::task::spawn_blocking(move || scan_local_tree(&scan_root))
        .await
        .context("local scan panicked")?;
    tracing::info!(entries = local.len(), "local snapshot ready");

    let client = operator
        .choose_client(config.token.clone(), |token| config.client(token))
        .await?;
    let remote_root = operator
        .choose_remote_root(&client, config.remote_root.clone())
        .await?;
    let remote_tree = RemoteTree::new(client, remote_root)
        .with_retries(Backoff::default(), config.list_retries);

    tracing::info!(root = %remote_tree.root(), "listing remote folder");
    let remote = tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled while listing the remote folder"),
        listed = remote_tree.snapshot() => match listed {
            Ok(remote) => remote,
            Err(err) if err.is_auth() => {
                bail!("access token was rejected while listing, please issue a new one: {err}")
            }
            Err(err) => return Err(err).context("failed to list the remote folder"),
        },
    };
    if let Some(cache) = &config.snapshot_cache
        && let Err(err) = save_snapshot(cache, &remote)
    {
        tracing::warn!(path = %cache.display(), %err, "unable to write snapshot cache");
    }

    tracing::info!("resolving differences");
    let plan_root: PathBuf = local_root.clone();
    let (plan, remote, local_after) = tokio::task::spawn_blocking(move || {
        let plan = reconcile(&remote, &local, &plan_root);
        (plan, remote, local)
    })
    .await
    .context("reconciliation panicked")?;
    local = local_after;

    if plan.is_empty() {
        operator.say("Local folder is already up to date.")?;
        return Ok(RunOutcome::UpToDate);
    }
    if options.dry_run {
        operator.print_plan(&plan)?;
        return Ok(RunOutcome::DryRun(plan));
    }
    if options.assume_yes {
        operator.say(&format!("Resolved: {}.", plan.summary()))?;
    } else if !operator.confirm_plan(&plan)? {
        return Ok(RunOutcome::Declined(plan));
    }
    arm_interrupt();

    let failed_moves = apply_moves(&plan.moves, &mut local, &local_root, cancel)
        .await
        .map_err(phase_error)?;
    stamp_moved_files(&plan.moves, &failed_moves, &remote, &mut local, &local_root);
    let failed_removals = apply_removals(&plan.removals, &mut local, &local_root, cancel)
        .await
        .map_err(phase_error)?;
    let failed_downloads = apply_downloads(&plan.downloads, &remote_tree, &local_root, cancel)
        .await
        .map_err(phase_error)?;

    Ok(RunOutcome::Applied(RunReport {
        plan,
        failed_moves,
        failed_removals,
        failed_downloads,
    }))
}

fn phase_error(err: ExecutorError) -> anyhow::Error {
    match err {
        ExecutorError::Cancelled => anyhow::anyhow!("interrupted by operator, exiting"),
        ExecutorError::Auth(_) => anyhow::Error::new(err),
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
