//! Reversal of classified shadow resources

use tracing::{error, info};

use super::classify::ResourceToClean;
use super::meta::ANNOTATION_LOCK;
use crate::error::AppResult;
use crate::k8s::{recover_original_service, ClusterApi};

/// Outcome counters of one `apply` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl ApplyReport {
    fn record(&mut self, result: AppResult<()>, what: &str, name: &str) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => {
                self.failed += 1;
                error!(error = %e, "Failed to {} {}", what, name);
            }
        }
    }
}

/// Reverse everything in `r`, one category after another. Each item is
/// independent: a failure is logged and the pass moves on. Nothing is rolled
/// back; a later scan picks up whatever is still outstanding.
pub async fn apply(cluster: &dyn ClusterApi, r: &ResourceToClean, namespace: &str) -> ApplyReport {
    let mut report = ApplyReport::default();

    info!("Deleting {} unavailing pods", r.pods_to_delete.len());
    for name in &r.pods_to_delete {
        report.record(cluster.remove_pod(name, namespace).await, "delete pod", name);
    }

    info!("Deleting {} unavailing config maps", r.config_maps_to_delete.len());
    for name in &r.config_maps_to_delete {
        report.record(
            cluster.remove_config_map(name, namespace).await,
            "delete config map",
            name,
        );
    }

    info!("Recovering {} scaled deployments", r.deployments_to_scale.len());
    for (name, replicas) in &r.deployments_to_scale {
        report.record(
            cluster.scale_deployment(name, namespace, *replicas).await,
            &format!("scale to {} deployment", replicas),
            name,
        );
    }

    info!("Deleting {} unavailing services", r.services_to_delete.len());
    for name in &r.services_to_delete {
        report.record(
            cluster.remove_service(name, namespace).await,
            "delete service",
            name,
        );
    }

    info!("Recovering {} meshed services", r.services_to_recover.len());
    for name in &r.services_to_recover {
        report.record(
            recover_original_service(cluster, name, namespace).await,
            "recover service",
            name,
        );
    }

    info!("Recovering {} locked services", r.services_to_unlock.len());
    for name in &r.services_to_unlock {
        report.record(unlock(cluster, name, namespace).await, "unlock service", name);
    }

    info!("Done");
    report
}

async fn unlock(cluster: &dyn ClusterApi, name: &str, namespace: &str) -> AppResult<()> {
    let mut service = match cluster.get_service(name, namespace).await {
        Ok(service) => service,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let removed = service
        .metadata
        .annotations
        .as_mut()
        .and_then(|a| a.remove(ANNOTATION_LOCK));
    if removed.is_some() {
        cluster.update_service(&service, namespace).await?;
    }
    Ok(())
}

/// Side-effect free rendering of what `apply` would do, one line per entry
pub fn preview(r: &ResourceToClean) -> Vec<String> {
    let mut lines = Vec::new();
    let mut section = |title: String, items: Vec<String>| {
        lines.push(title);
        lines.extend(items.into_iter().map(|item| format!(" * {}", item)));
    };

    section(
        format!("Find {} unavailing pods to delete:", r.pods_to_delete.len()),
        r.pods_to_delete.clone(),
    );
    section(
        format!(
            "Find {} unavailing config maps to delete:",
            r.config_maps_to_delete.len()
        ),
        r.config_maps_to_delete.clone(),
    );
    section(
        format!(
            "Find {} exchanged deployments to recover:",
            r.deployments_to_scale.len()
        ),
        r.deployments_to_scale
            .iter()
            .map(|(name, replicas)| format!("{} -> {}", name, replicas))
            .collect(),
    );
    section(
        format!(
            "Find {} unavailing services to delete:",
            r.services_to_delete.len()
        ),
        r.services_to_delete.clone(),
    );
    section(
        format!(
            "Find {} meshed services to recover:",
            r.services_to_recover.len()
        ),
        r.services_to_recover.clone(),
    );
    section(
        format!(
            "Find {} locked services to recover:",
            r.services_to_unlock.len()
        ),
        r.services_to_unlock.clone(),
    );

    lines
}
