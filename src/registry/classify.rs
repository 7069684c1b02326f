//! Expiry detection and classification of orphaned shadow resources

use k8s_openapi::api::core::v1::Service;
use std::collections::BTreeMap;
use tracing::debug;

use super::meta::{control_by_selector, LockRecord, Role, ShadowRecord, ANNOTATION_SELECTOR};
use crate::config::Config;
use crate::error::AppResult;
use crate::k8s::resources::router_name;
use crate::k8s::{ClusterApi, ObjectKind};

/// Everything one cleanup pass intends to reverse, grouped by kind of reversal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceToClean {
    pub pods_to_delete: Vec<String>,
    pub config_maps_to_delete: Vec<String>,
    /// Deployment name to the replica count it had before an exchange
    pub deployments_to_scale: BTreeMap<String, i32>,
    pub services_to_delete: Vec<String>,
    /// Services redirected through a mesh router that must be restored
    pub services_to_recover: Vec<String>,
    pub services_to_unlock: Vec<String>,
}

impl ResourceToClean {
    pub fn is_empty(&self) -> bool {
        self.pods_to_delete.is_empty()
            && self.config_maps_to_delete.is_empty()
            && self.deployments_to_scale.is_empty()
            && self.services_to_delete.is_empty()
            && self.services_to_recover.is_empty()
            && self.services_to_unlock.is_empty()
    }
}

/// Thresholds deciding when a heartbeat or a lock is too old
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    pub threshold_minutes: i64,
    pub lock_timeout_secs: i64,
}

impl ExpiryPolicy {
    pub fn new(threshold_minutes: i64, lock_timeout_secs: i64) -> Self {
        Self {
            threshold_minutes,
            lock_timeout_secs,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.clean_threshold_minutes, config.lock_timeout_secs)
    }

    /// Age equal to the threshold is still alive; only strictly older expires
    pub fn is_expired(&self, last_heartbeat: i64, now: i64) -> bool {
        now - last_heartbeat > self.threshold_minutes * 60
    }

    /// Records without a readable heartbeat are never considered orphaned
    pub fn is_orphaned(&self, record: &ShadowRecord, now: i64) -> bool {
        record
            .heartbeat
            .is_some_and(|hb| self.is_expired(hb, now))
    }

    /// Partition records into the reversal queues. Pure; `now` is unix seconds.
    pub fn classify(
        &self,
        records: &[ShadowRecord],
        locks: &[LockRecord],
        now: i64,
    ) -> ResourceToClean {
        let mut result = ResourceToClean::default();

        for record in records.iter().filter(|r| self.is_orphaned(r, now)) {
            debug!(kind = %record.kind, name = %record.name, heartbeat = ?record.heartbeat, "Expired");
            match record.kind {
                ObjectKind::Pod => classify_pod(record, &mut result),
                ObjectKind::ConfigMap => result.config_maps_to_delete.push(record.name.clone()),
                ObjectKind::Service => result.services_to_delete.push(record.name.clone()),
            }
        }

        for lock in locks {
            if lock.is_abandoned(self.lock_timeout_secs, now) {
                debug!(service = %lock.service, locked_at = ?lock.locked_at, "Abandoned lock");
                result.services_to_unlock.push(lock.service.clone());
            }
        }

        result
    }
}

fn classify_pod(record: &ShadowRecord, result: &mut ResourceToClean) {
    if !record.deleting {
        result.pods_to_delete.push(record.name.clone());
    }
    match record.role {
        Some(Role::ExchangeShadow) => {
            let app = record.config.get("app").map(String::as_str).unwrap_or("");
            let replicas = record
                .config
                .get("replicas")
                .and_then(|r| r.parse::<i32>().ok())
                .unwrap_or(0);
            if replicas > 0 && !app.is_empty() {
                result.deployments_to_scale.insert(app.to_string(), replicas);
            }
        }
        Some(Role::MeshRouter) => {
            if let Some(service) = record.config.get("service") {
                if !result.services_to_recover.contains(service) {
                    result.services_to_recover.push(service.clone());
                }
            }
        }
        _ => {}
    }
}

/// List every object the tool recognizes in `namespace` and classify it.
///
/// Listing failures are fatal and propagate; nothing meaningful can be done
/// per item without basic listing access.
pub async fn scan_and_classify(
    cluster: &dyn ClusterApi,
    namespace: &str,
    policy: &ExpiryPolicy,
    now: i64,
) -> AppResult<ResourceToClean> {
    let selector = control_by_selector();

    let pods = cluster.list_pods(namespace, &selector).await?;
    let config_maps = cluster.list_config_maps(namespace, &selector).await?;
    let services = cluster.list_services(namespace, &selector).await?;
    debug!(
        pods = pods.len(),
        config_maps = config_maps.len(),
        services = services.len(),
        "Found shadow resources"
    );

    let records: Vec<ShadowRecord> = pods
        .iter()
        .map(ShadowRecord::from_pod)
        .chain(config_maps.iter().map(ShadowRecord::from_config_map))
        .chain(services.iter().map(ShadowRecord::from_service))
        .collect();

    // Locks live on the user's services, which carry none of our labels
    let all_services = cluster.list_services(namespace, "").await?;
    let locks: Vec<LockRecord> = all_services
        .iter()
        .filter_map(LockRecord::from_service)
        .collect();

    let mut result = policy.classify(&records, &locks, now);
    for service in redirected_without_router(&all_services, &records) {
        if !result.services_to_recover.contains(&service) {
            debug!(service = %service, "Redirected service has no router");
            result.services_to_recover.push(service);
        }
    }
    Ok(result)
}

/// Services still carrying a saved selector while their router pod is gone
fn redirected_without_router(services: &[Service], records: &[ShadowRecord]) -> Vec<String> {
    services
        .iter()
        .filter(|s| {
            s.metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(ANNOTATION_SELECTOR))
        })
        .filter_map(|s| s.metadata.name.clone())
        .filter(|name| {
            let router = router_name(name);
            !records
                .iter()
                .any(|r| r.kind == ObjectKind::Pod && r.name == router)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::meta::parse_config;

    const NOW: i64 = 1_700_000_000;

    fn pod(name: &str, role: Option<Role>, heartbeat: Option<i64>, config: &str) -> ShadowRecord {
        ShadowRecord {
            kind: ObjectKind::Pod,
            name: name.to_string(),
            role,
            heartbeat,
            config: parse_config(config),
            deleting: false,
        }
    }

    fn policy() -> ExpiryPolicy {
        ExpiryPolicy::new(10, 120)
    }

    #[test]
    fn test_threshold_boundary() {
        let p = policy();
        assert!(!p.is_expired(NOW - 600, NOW));
        assert!(p.is_expired(NOW - 601, NOW));
    }

    #[test]
    fn test_fresh_and_unmarked_resources_are_kept() {
        let records = vec![
            pod("fresh", Some(Role::ConnectShadow), Some(NOW - 30), ""),
            pod("no-heartbeat", Some(Role::ConnectShadow), None, ""),
        ];
        assert!(policy().classify(&records, &[], NOW).is_empty());
    }

    #[test]
    fn test_exchange_shadow_restores_deployment() {
        let records = vec![pod(
            "orders-kb-exchange-abcde",
            Some(Role::ExchangeShadow),
            Some(NOW - 3600),
            "app=orders,replicas=3",
        )];
        let result = policy().classify(&records, &[], NOW);
        assert_eq!(result.pods_to_delete, vec!["orders-kb-exchange-abcde"]);
        assert_eq!(result.deployments_to_scale.get("orders"), Some(&3));
    }

    #[test]
    fn test_exchange_shadow_with_bad_config_is_only_deleted() {
        let records = vec![
            pod("a", Some(Role::ExchangeShadow), Some(NOW - 3600), "app=orders,replicas=x"),
            pod("b", Some(Role::ExchangeShadow), Some(NOW - 3600), "replicas=2"),
        ];
        let result = policy().classify(&records, &[], NOW);
        assert_eq!(result.pods_to_delete.len(), 2);
        assert!(result.deployments_to_scale.is_empty());
    }

    #[test]
    fn test_router_recovers_service_once() {
        let records = vec![
            pod("web-kb-router", Some(Role::MeshRouter), Some(NOW - 3600), "service=web"),
            pod("web-kb-router-2", Some(Role::MeshRouter), Some(NOW - 3600), "service=web"),
        ];
        let result = policy().classify(&records, &[], NOW);
        assert_eq!(result.services_to_recover, vec!["web"]);
    }

    #[test]
    fn test_deleting_pod_still_restores_deployment() {
        let mut record = pod(
            "orders-kb-exchange-abcde",
            Some(Role::ExchangeShadow),
            Some(NOW - 3600),
            "app=orders,replicas=2",
        );
        record.deleting = true;
        let result = policy().classify(&[record], &[], NOW);
        assert!(result.pods_to_delete.is_empty());
        assert_eq!(result.deployments_to_scale.get("orders"), Some(&2));
    }

    #[test]
    fn test_config_maps_services_and_locks() {
        let records = vec![
            ShadowRecord {
                kind: ObjectKind::ConfigMap,
                name: "kb-connect-abcde-key".to_string(),
                role: None,
                heartbeat: Some(NOW - 3600),
                config: Default::default(),
                deleting: false,
            },
            ShadowRecord {
                kind: ObjectKind::Service,
                name: "web-kb-mesh-v1".to_string(),
                role: None,
                heartbeat: Some(NOW - 3600),
                config: Default::default(),
                deleting: false,
            },
        ];
        let locks = vec![
            LockRecord {
                service: "stale".to_string(),
                locked_at: Some(NOW - 121),
            },
            LockRecord {
                service: "held".to_string(),
                locked_at: Some(NOW - 10),
            },
        ];
        let result = policy().classify(&records, &locks, NOW);
        assert_eq!(result.config_maps_to_delete, vec!["kb-connect-abcde-key"]);
        assert_eq!(result.services_to_delete, vec!["web-kb-mesh-v1"]);
        assert_eq!(result.services_to_unlock, vec!["stale"]);
    }
}
