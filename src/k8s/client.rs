//! Kubernetes client wrapper for KubeBridge

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::wait::{await_condition, conditions},
    Client, Config,
};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::api::{ClusterApi, ObjectKind};
use crate::error::{AppError, AppResult};

/// Wrapper around kube::Client implementing the cluster capability surface
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8sClient using the default kubeconfig or in-cluster config
    #[instrument(skip_all)]
    pub async fn new() -> AppResult<Self> {
        let config = Config::infer()
            .await
            .map_err(|e| AppError::Config(format!("failed to infer kube config: {}", e)))?;
        let client = Client::try_from(config)?;

        info!("Connected to Kubernetes cluster");

        Ok(Self { client })
    }

    /// Create a K8sClient from an explicit kubeconfig file
    #[instrument]
    pub async fn from_kubeconfig(path: &str) -> AppResult<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| AppError::Config(format!("failed to read {}: {}", path, e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| AppError::Config(format!("invalid kubeconfig {}: {}", path, e)))?;
        let client = Client::try_from(config)?;

        info!("Connected to Kubernetes cluster");

        Ok(Self { client })
    }

    /// Connect using the kubeconfig named in the configuration, if any
    pub async fn connect(config: &crate::config::Config) -> AppResult<Self> {
        match config.kubeconfig.as_deref() {
            Some(path) if !path.is_empty() => Self::from_kubeconfig(path).await,
            _ => Self::new().await,
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Check if cluster is reachable
    pub async fn health_check(&self) -> AppResult<bool> {
        let version = self.client.apiserver_version().await?;
        info!(version = %version.git_version, "Kubernetes cluster is healthy");
        Ok(true)
    }
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

/// Map a 404 on delete to success; someone else already removed the object
fn ignore_not_found<T>(result: Result<T, kube::Error>, kind: &str, name: &str) -> AppResult<()> {
    match result {
        Ok(_) => {
            info!(kind, name, "Deleted");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(kind, name, "Already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterApi for K8sClient {
    async fn list_pods(&self, namespace: &str, selector: &str) -> AppResult<Vec<Pod>> {
        let list = self.pods(namespace).list(&list_params(selector)).await?;
        Ok(list.items)
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> AppResult<Vec<Service>> {
        let list = self.services(namespace).list(&list_params(selector)).await?;
        Ok(list.items)
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        selector: &str,
    ) -> AppResult<Vec<ConfigMap>> {
        let list = self.config_maps(namespace).list(&list_params(selector)).await?;
        Ok(list.items)
    }

    async fn list_nodes(&self) -> AppResult<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> AppResult<Pod> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn get_service(&self, name: &str, namespace: &str) -> AppResult<Service> {
        Ok(self.services(namespace).get(name).await?)
    }

    async fn get_deployment(&self, name: &str, namespace: &str) -> AppResult<Deployment> {
        Ok(self.deployments(namespace).get(name).await?)
    }

    #[instrument(skip(self, pod), fields(pod_name = %pod.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn create_pod(&self, pod: &Pod, namespace: &str) -> AppResult<Pod> {
        let created = self.pods(namespace).create(&PostParams::default(), pod).await?;
        info!("Created pod");
        Ok(created)
    }

    #[instrument(skip(self, service), fields(service_name = %service.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn create_service(&self, service: &Service, namespace: &str) -> AppResult<Service> {
        let created = self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await?;
        info!("Created service");
        Ok(created)
    }

    #[instrument(skip(self, config_map), fields(config_map_name = %config_map.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn create_config_map(
        &self,
        config_map: &ConfigMap,
        namespace: &str,
    ) -> AppResult<ConfigMap> {
        let created = self
            .config_maps(namespace)
            .create(&PostParams::default(), config_map)
            .await?;
        info!("Created config map");
        Ok(created)
    }

    #[instrument(skip(self, service), fields(service_name = %service.metadata.name.as_deref().unwrap_or("unknown")))]
    async fn update_service(&self, service: &Service, namespace: &str) -> AppResult<Service> {
        let name = service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| AppError::internal("service without a name"))?;
        let updated = self
            .services(namespace)
            .replace(name, &PostParams::default(), service)
            .await?;
        info!("Updated service");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn remove_pod(&self, name: &str, namespace: &str) -> AppResult<()> {
        let result = self.pods(namespace).delete(name, &DeleteParams::default()).await;
        ignore_not_found(result, "pod", name)
    }

    #[instrument(skip(self))]
    async fn remove_config_map(&self, name: &str, namespace: &str) -> AppResult<()> {
        let result = self
            .config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await;
        ignore_not_found(result, "configmap", name)
    }

    #[instrument(skip(self))]
    async fn remove_service(&self, name: &str, namespace: &str) -> AppResult<()> {
        let result = self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await;
        ignore_not_found(result, "service", name)
    }

    #[instrument(skip(self))]
    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> AppResult<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(name, replicas, "Scaled deployment");
        Ok(())
    }

    async fn annotate(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> AppResult<()> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), json!(value));
        let patch = json!({ "metadata": { "annotations": annotations } });
        let params = PatchParams::default();
        match kind {
            ObjectKind::Pod => {
                self.pods(namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            ObjectKind::ConfigMap => {
                self.config_maps(namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
            ObjectKind::Service => {
                self.services(namespace)
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await?;
            }
        }
        debug!(%kind, name, key, "Annotated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn wait_pod_running(
        &self,
        name: &str,
        namespace: &str,
        timeout: Duration,
    ) -> AppResult<Pod> {
        let running = await_condition(self.pods(namespace), name, conditions::is_pod_running());
        match tokio::time::timeout(timeout, running).await {
            Ok(Ok(Some(pod))) => Ok(pod),
            Ok(Ok(None)) => Err(AppError::not_found("pod", name)),
            Ok(Err(e)) => Err(AppError::internal(&format!(
                "failed waiting for pod {}: {}",
                name, e
            ))),
            Err(_) => Err(AppError::internal(&format!(
                "pod {} not running after {}s",
                name,
                timeout.as_secs()
            ))),
        }
    }
}
