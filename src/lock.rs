//! Service lock coordinator
//!
//! Before an exchange or mesh session rewires a service it stamps the service
//! with a lock annotation. A second session finding a live lock fails fast with
//! `AppError::Locked`. The check and the write are two separate API calls, so
//! two sessions racing within the same instant can both succeed; the lock only
//! guards against human-paced overlap, not adversarial concurrency.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::k8s::ClusterApi;
use crate::registry::meta::{LockRecord, ANNOTATION_LOCK};

pub struct LockCoordinator {
    cluster: Arc<dyn ClusterApi>,
    timeout_secs: i64,
}

impl LockCoordinator {
    pub fn new(cluster: Arc<dyn ClusterApi>, timeout_secs: i64) -> Self {
        Self {
            cluster,
            timeout_secs,
        }
    }

    pub fn from_config(cluster: Arc<dyn ClusterApi>, config: &Config) -> Self {
        Self::new(cluster, config.lock_timeout_secs)
    }

    /// Claim `service`. Fails with `AppError::Locked` if another session holds
    /// a lock younger than the timeout; an abandoned lock is overwritten.
    pub async fn acquire(&self, service: &str, namespace: &str, now: i64) -> AppResult<()> {
        let mut svc = self.cluster.get_service(service, namespace).await?;

        if let Some(lock) = LockRecord::from_service(&svc) {
            if !lock.is_abandoned(self.timeout_secs, now) {
                let age_secs = lock.locked_at.map(|ts| now - ts).unwrap_or_default();
                return Err(AppError::Locked {
                    service: service.to_string(),
                    age_secs,
                });
            }
            warn!(service, "Taking over abandoned lock");
        }

        svc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_LOCK.to_string(), now.to_string());
        self.cluster.update_service(&svc, namespace).await?;
        info!(service, "Service locked");
        Ok(())
    }

    /// Drop the lock annotation. A missing service or lock is not an error.
    pub async fn release(&self, service: &str, namespace: &str) -> AppResult<()> {
        let mut svc = match self.cluster.get_service(service, namespace).await {
            Ok(svc) => svc,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let removed = svc
            .metadata
            .annotations
            .as_mut()
            .and_then(|a| a.remove(ANNOTATION_LOCK));
        if removed.is_none() {
            debug!(service, "No lock to release");
            return Ok(());
        }
        self.cluster.update_service(&svc, namespace).await?;
        info!(service, "Service unlocked");
        Ok(())
    }
}
