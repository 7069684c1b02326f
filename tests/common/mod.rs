//! In-memory cluster shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, NodeSpec, Pod, PodSpec, PodStatus, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubebridge::error::{AppError, AppResult};
use kubebridge::k8s::{ClusterApi, ObjectKind};
use kubebridge::registry::meta::{
    ANNOTATION_CONFIG, ANNOTATION_HEARTBEAT, ANNOTATION_LOCK, CONTROL_BY_VALUE, LABEL_CONTROL_BY,
    LABEL_ROLE,
};

pub const NAMESPACE: &str = "default";

#[derive(Default)]
struct State {
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    config_maps: BTreeMap<String, ConfigMap>,
    deployments: BTreeMap<String, Deployment>,
    nodes: Vec<Node>,
    /// Names whose deletion or scaling fails
    broken: BTreeSet<String>,
    calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    if selector.is_empty() {
        return true;
    }
    let labels = match labels {
        Some(labels) => labels,
        None => return false,
    };
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => false,
    })
}

pub fn meta(
    name: &str,
    labels: &[(&str, &str)],
    annotations: &[(&str, &str)],
) -> ObjectMeta {
    let to_map = |pairs: &[(&str, &str)]| -> Option<BTreeMap<String, String>> {
        (!pairs.is_empty()).then(|| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
    };
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        labels: to_map(labels),
        annotations: to_map(annotations),
        ..Default::default()
    }
}

/// A pod created by the tool with the given role, heartbeat and config
pub fn shadow_pod(name: &str, role: &str, heartbeat: i64, config: &str) -> Pod {
    let heartbeat = heartbeat.to_string();
    let mut annotations = vec![(ANNOTATION_HEARTBEAT, heartbeat.as_str())];
    if !config.is_empty() {
        annotations.push((ANNOTATION_CONFIG, config));
    }
    Pod {
        metadata: meta(
            name,
            &[(LABEL_CONTROL_BY, CONTROL_BY_VALUE), (LABEL_ROLE, role)],
            &annotations,
        ),
        ..Default::default()
    }
}

pub fn tagged_config_map(name: &str, heartbeat: i64) -> ConfigMap {
    ConfigMap {
        metadata: meta(
            name,
            &[(LABEL_CONTROL_BY, CONTROL_BY_VALUE)],
            &[(ANNOTATION_HEARTBEAT, heartbeat.to_string().as_str())],
        ),
        ..Default::default()
    }
}

pub fn user_service(name: &str, selector: &[(&str, &str)], annotations: &[(&str, &str)]) -> Service {
    Service {
        metadata: meta(name, &[], annotations),
        spec: Some(ServiceSpec {
            selector: Some(
                selector
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            cluster_ip: Some("10.96.0.10".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deployment(name: &str, replicas: i32) -> Deployment {
    let labels: BTreeMap<String, String> =
        [("app".to_string(), name.to_string())].into_iter().collect();
    Deployment {
        metadata: meta(name, &[], &[]),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn running_pod(name: &str, ip: &str, host_network: bool) -> Pod {
    Pod {
        metadata: meta(name, &[], &[]),
        spec: Some(PodSpec {
            host_network: Some(host_network),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
    }
}

pub fn node(pod_cidr: Option<&str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(format!("node-{}", pod_cidr.unwrap_or("none"))),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            pod_cidr: pod_cidr.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn ClusterApi> {
        Arc::new(self.clone())
    }

    pub fn add_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().pods.insert(name, pod);
    }

    pub fn add_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().services.insert(name, service);
    }

    pub fn add_config_map(&self, config_map: ConfigMap) {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().config_maps.insert(name, config_map);
    }

    pub fn add_deployment(&self, deployment: Deployment) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().deployments.insert(name, deployment);
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    /// Make every mutation of `name` fail
    pub fn break_object(&self, name: &str) {
        self.state.lock().unwrap().broken.insert(name.to_string());
    }

    pub fn repair_object(&self, name: &str) {
        self.state.lock().unwrap().broken.remove(name);
    }

    pub fn has_pod(&self, name: &str) -> bool {
        self.state.lock().unwrap().pods.contains_key(name)
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.state.lock().unwrap().services.contains_key(name)
    }

    pub fn has_config_map(&self, name: &str) -> bool {
        self.state.lock().unwrap().config_maps.contains_key(name)
    }

    pub fn replicas(&self, name: &str) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(name)
            .and_then(|d| d.spec.as_ref()?.replicas)
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(name).cloned()
    }

    pub fn lock_of(&self, service: &str) -> Option<String> {
        self.service(service)?
            .metadata
            .annotations?
            .get(ANNOTATION_LOCK)
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = call.rsplit(' ').next().unwrap_or_default().to_string();
        state.calls.push(call);
        if state.broken.contains(&name) {
            return Err(AppError::internal("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self, _namespace: &str, selector: &str) -> AppResult<Vec<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .values()
            .filter(|p| labels_match(p.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn list_services(&self, _namespace: &str, selector: &str) -> AppResult<Vec<Service>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .services
            .values()
            .filter(|s| labels_match(s.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn list_config_maps(&self, _namespace: &str, selector: &str) -> AppResult<Vec<ConfigMap>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .config_maps
            .values()
            .filter(|c| labels_match(c.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn list_nodes(&self) -> AppResult<Vec<Node>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn get_pod(&self, name: &str, _namespace: &str) -> AppResult<Pod> {
        let state = self.state.lock().unwrap();
        state
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found("pod", name))
    }

    async fn get_service(&self, name: &str, _namespace: &str) -> AppResult<Service> {
        let state = self.state.lock().unwrap();
        state
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found("service", name))
    }

    async fn get_deployment(&self, name: &str, _namespace: &str) -> AppResult<Deployment> {
        let state = self.state.lock().unwrap();
        state
            .deployments
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found("deployment", name))
    }

    async fn create_pod(&self, pod: &Pod, _namespace: &str) -> AppResult<Pod> {
        self.add_pod(pod.clone());
        Ok(pod.clone())
    }

    async fn create_service(&self, service: &Service, _namespace: &str) -> AppResult<Service> {
        self.add_service(service.clone());
        Ok(service.clone())
    }

    async fn create_config_map(&self, config_map: &ConfigMap, _namespace: &str) -> AppResult<ConfigMap> {
        self.add_config_map(config_map.clone());
        Ok(config_map.clone())
    }

    async fn update_service(&self, service: &Service, _namespace: &str) -> AppResult<Service> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.record(format!("update service {}", name))?;
        let mut state = self.state.lock().unwrap();
        if !state.services.contains_key(&name) {
            return Err(AppError::not_found("service", &name));
        }
        state.services.insert(name, service.clone());
        Ok(service.clone())
    }

    async fn remove_pod(&self, name: &str, _namespace: &str) -> AppResult<()> {
        self.record(format!("delete pod {}", name))?;
        self.state.lock().unwrap().pods.remove(name);
        Ok(())
    }

    async fn remove_config_map(&self, name: &str, _namespace: &str) -> AppResult<()> {
        self.record(format!("delete configmap {}", name))?;
        self.state.lock().unwrap().config_maps.remove(name);
        Ok(())
    }

    async fn remove_service(&self, name: &str, _namespace: &str) -> AppResult<()> {
        self.record(format!("delete service {}", name))?;
        self.state.lock().unwrap().services.remove(name);
        Ok(())
    }

    async fn scale_deployment(&self, name: &str, _namespace: &str, replicas: i32) -> AppResult<()> {
        self.record(format!("scale deployment {}", name))?;
        let mut state = self.state.lock().unwrap();
        let deployment = state
            .deployments
            .get_mut(name)
            .ok_or_else(|| AppError::not_found("deployment", name))?;
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        Ok(())
    }

    async fn annotate(
        &self,
        kind: ObjectKind,
        name: &str,
        _namespace: &str,
        key: &str,
        value: &str,
    ) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        let meta = match kind {
            ObjectKind::Pod => state.pods.get_mut(name).map(|o| &mut o.metadata),
            ObjectKind::ConfigMap => state.config_maps.get_mut(name).map(|o| &mut o.metadata),
            ObjectKind::Service => state.services.get_mut(name).map(|o| &mut o.metadata),
        }
        .ok_or_else(|| AppError::not_found("object", name))?;
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn wait_pod_running(&self, name: &str, namespace: &str, _timeout: Duration) -> AppResult<Pod> {
        let mut pod = self.get_pod(name, namespace).await?;
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some("10.244.0.42".to_string()),
            ..Default::default()
        });
        Ok(pod)
    }
}
