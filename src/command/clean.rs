//! `clean`: reverse whatever crashed or killed sessions left behind

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::pid::{clean_pid_files, is_process_alive};
use super::{connect, now, Context};
use crate::error::AppResult;
use crate::registry::{apply, preview, scan_and_classify, ApplyReport, ExpiryPolicy, ResourceToClean};

#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    /// Only report what would be cleaned
    pub dry_run: bool,
    /// Heartbeat age in minutes; overrides the configured threshold
    pub threshold_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanOutcome {
    pub resources: ResourceToClean,
    /// Set unless it was a dry run or there was nothing to do
    pub report: Option<ApplyReport>,
    pub preview: Vec<String>,
}

pub async fn run(ctx: &Context, opts: &CleanOptions) -> AppResult<CleanOutcome> {
    let ns = ctx.namespace();
    let alive = clean_pid_files(&ctx.config.state_dir, opts.dry_run);

    let mut policy = ExpiryPolicy::from_config(&ctx.config);
    if let Some(threshold) = opts.threshold_minutes {
        policy.threshold_minutes = threshold;
    }

    let resources = scan_and_classify(ctx.cluster.as_ref(), ns, &policy, now()).await?;
    let mut outcome = CleanOutcome {
        resources,
        ..Default::default()
    };

    if outcome.resources.is_empty() {
        info!(namespace = ns, "No unavailing resource found, nothing to clean");
    } else if opts.dry_run {
        outcome.preview = preview(&outcome.resources);
        for line in &outcome.preview {
            info!("{}", line);
        }
    } else {
        outcome.report = Some(apply(ctx.cluster.as_ref(), &outcome.resources, ns).await);
    }

    if !opts.dry_run {
        debug!("Cleaning up unused local keys");
        clean_keys(&ctx.keys_root());
        if !alive.iter().any(|p| p.component == connect::COMPONENT) {
            debug!("No connect session alive, restoring resolver");
            if let Err(e) = ctx.name_server.drop_hosts() {
                warn!(error = %e, "Failed to clean hosts file");
            }
            if let Err(e) = ctx.name_server.restore_name_server() {
                warn!(error = %e, "Failed to restore name server");
            }
        }
    }
    Ok(outcome)
}

/// Remove the key directories of processes that are gone. Keys are grouped
/// by owning pid, so a live session in any namespace keeps its keys.
fn clean_keys(keys_root: &Path) {
    for stale in stale_key_dirs(keys_root) {
        debug!(path = %stale.display(), "Removing stale keys");
        if let Err(e) = std::fs::remove_dir_all(&stale) {
            warn!(path = %stale.display(), error = %e, "Failed to remove stale keys");
        }
    }
}

fn stale_key_dirs(keys_root: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(keys_root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut stale: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let pid = e.file_name().to_str()?.parse::<u32>().ok()?;
            (!is_process_alive(pid)).then(|| e.path())
        })
        .collect();
    stale.sort();
    stale
}
