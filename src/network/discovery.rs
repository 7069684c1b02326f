//! Pod and service CIDR discovery
//!
//! Node objects are trusted first. Many clusters hide pod-CIDR metadata from
//! the permissions the tool has, so the fallback samples live addresses and
//! reduces them to covering ranges.

use std::collections::BTreeSet;
use tracing::{debug, info};

use super::range::calculate_minimal_ip_range;
use crate::config::Config;
use crate::error::AppResult;
use crate::k8s::ClusterApi;

pub struct NetworkDiscovery<'a> {
    cluster: &'a dyn ClusterApi,
    pod_prefix: u8,
    service_prefix: u8,
}

impl<'a> NetworkDiscovery<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, config: &Config) -> Self {
        Self {
            cluster,
            pod_prefix: config.pod_sample_prefix,
            service_prefix: config.service_sample_prefix,
        }
    }

    /// Pod CIDRs: the distinct node-reported CIDRs when any node has one,
    /// otherwise ranges sampled from pod IPs in `hint` (or `namespace`).
    /// No nodes and no pods yields an empty list.
    pub async fn get_pod_cidrs(&self, namespace: &str, hint: Option<&str>) -> AppResult<Vec<String>> {
        let nodes = self.cluster.list_nodes().await?;
        let node_cidrs: BTreeSet<String> = nodes
            .iter()
            .filter_map(|n| n.spec.as_ref())
            .flat_map(|spec| {
                spec.pod_cidr
                    .iter()
                    .chain(spec.pod_cidrs.iter().flatten())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|cidr| !cidr.is_empty())
            .collect();
        if !node_cidrs.is_empty() {
            debug!(cidrs = ?node_cidrs, "Using pod CIDRs reported by nodes");
            return Ok(node_cidrs.into_iter().collect());
        }

        let sample_namespace = hint.filter(|h| !h.is_empty()).unwrap_or(namespace);
        let pods = self.cluster.list_pods(sample_namespace, "").await?;
        let ips: Vec<String> = pods
            .iter()
            .filter(|p| {
                !p.spec
                    .as_ref()
                    .and_then(|s| s.host_network)
                    .unwrap_or(false)
            })
            .filter_map(|p| p.status.as_ref()?.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
            .collect();
        debug!(namespace = sample_namespace, samples = ips.len(), "Sampling pod IPs");
        Ok(calculate_minimal_ip_range(&ips, self.pod_prefix))
    }

    /// Service CIDRs sampled from service cluster IPs in `namespace`
    pub async fn get_service_cidr(&self, namespace: &str) -> AppResult<Vec<String>> {
        let services = self.cluster.list_services(namespace, "").await?;
        let ips: Vec<String> = services
            .iter()
            .filter_map(|s| s.spec.as_ref()?.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None")
            .collect();
        debug!(namespace, samples = ips.len(), "Sampling service IPs");
        Ok(calculate_minimal_ip_range(&ips, self.service_prefix))
    }

    /// Everything a connect session should route: pod and service CIDRs plus
    /// `include`, minus any entry listed in `exclude`
    pub async fn cluster_cidrs(
        &self,
        namespace: &str,
        hint: Option<&str>,
        include: &[String],
        exclude: &[String],
    ) -> AppResult<Vec<String>> {
        let mut cidrs: BTreeSet<String> = self
            .get_pod_cidrs(namespace, hint)
            .await?
            .into_iter()
            .collect();
        cidrs.extend(self.get_service_cidr(namespace).await?);
        cidrs.extend(include.iter().map(|c| c.trim().to_string()).filter(|c| !c.is_empty()));
        for excluded in exclude {
            cidrs.remove(excluded.trim());
        }
        info!(cidrs = ?cidrs, "Cluster CIDRs to route");
        Ok(cidrs.into_iter().collect())
    }
}
