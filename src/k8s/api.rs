//! Cluster capability surface used by every component
//!
//! Commands, discovery and the expiry engine only talk to the cluster through
//! this trait, so they can run against the real API server (`K8sClient`) or an
//! in-memory cluster in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Service};
use std::time::Duration;

use crate::error::AppResult;

/// Kinds of objects whose metadata the tool writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ObjectKind {
    Pod,
    ConfigMap,
    Service,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List pods; an empty selector matches everything
    async fn list_pods(&self, namespace: &str, selector: &str) -> AppResult<Vec<Pod>>;

    async fn list_services(&self, namespace: &str, selector: &str) -> AppResult<Vec<Service>>;

    async fn list_config_maps(&self, namespace: &str, selector: &str)
        -> AppResult<Vec<ConfigMap>>;

    async fn list_nodes(&self) -> AppResult<Vec<Node>>;

    async fn get_pod(&self, name: &str, namespace: &str) -> AppResult<Pod>;

    async fn get_service(&self, name: &str, namespace: &str) -> AppResult<Service>;

    async fn get_deployment(&self, name: &str, namespace: &str) -> AppResult<Deployment>;

    async fn create_pod(&self, pod: &Pod, namespace: &str) -> AppResult<Pod>;

    async fn create_service(&self, service: &Service, namespace: &str) -> AppResult<Service>;

    async fn create_config_map(&self, config_map: &ConfigMap, namespace: &str)
        -> AppResult<ConfigMap>;

    /// Replace a service with the given object
    async fn update_service(&self, service: &Service, namespace: &str) -> AppResult<Service>;

    /// Delete a pod. Deleting a pod that no longer exists succeeds.
    async fn remove_pod(&self, name: &str, namespace: &str) -> AppResult<()>;

    async fn remove_config_map(&self, name: &str, namespace: &str) -> AppResult<()>;

    async fn remove_service(&self, name: &str, namespace: &str) -> AppResult<()>;

    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32)
        -> AppResult<()>;

    /// Set a single annotation on an object, leaving the others untouched
    async fn annotate(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> AppResult<()>;

    /// Block until the pod is running or the timeout elapses
    async fn wait_pod_running(
        &self,
        name: &str,
        namespace: &str,
        timeout: Duration,
    ) -> AppResult<Pod>;
}
