//! Kubernetes resource builders for KubeBridge
//!
//! Functions to create the shadow pods, router pods, services and key config
//! maps a session places in the cluster. Every object carries the control-by
//! label so a later cleanup pass can find it without any local memory.

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, KeyToPath, Pod, PodSpec,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use crate::registry::meta::{
    Role, ANNOTATION_CONFIG, ANNOTATION_HEARTBEAT, CONTROL_BY_VALUE, LABEL_CONTROL_BY, LABEL_ROLE,
};

pub const SSH_PORT: i32 = 22;
pub const CONNECT_PREFIX: &str = "kb-connect-";
pub const EXCHANGE_INFIX: &str = "-kb-exchange-";
pub const MESH_INFIX: &str = "-kb-mesh-";
pub const ROUTER_SUFFIX: &str = "-kb-router";
pub const STUNTMAN_SUFFIX: &str = "-kb-stuntman";
pub const KEY_SUFFIX: &str = "-key";

/// Label the router pod carries so a meshed service can select it
pub const LABEL_ROUTER: &str = "kubebridge.io/router";
/// Label the mesh shadow carries so the mesh service can select it
pub const LABEL_MESH: &str = "kubebridge.io/mesh";

const AUTHORIZED_KEY: &str = "authorized";

/// Short lowercase random suffix for object names
pub fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..5].to_string()
}

pub fn router_name(service: &str) -> String {
    format!("{}{}", service, ROUTER_SUFFIX)
}

pub fn stuntman_name(service: &str) -> String {
    format!("{}{}", service, STUNTMAN_SUFFIX)
}

pub fn mesh_name(service: &str, version: &str) -> String {
    format!("{}{}{}", service, MESH_INFIX, version)
}

pub fn key_config_map_name(shadow: &str) -> String {
    format!("{}{}", shadow, KEY_SUFFIX)
}

/// Labels every object created by the tool carries
pub fn control_labels() -> BTreeMap<String, String> {
    [(LABEL_CONTROL_BY.to_string(), CONTROL_BY_VALUE.to_string())]
        .into_iter()
        .collect()
}

fn heartbeat_annotations(now: i64) -> BTreeMap<String, String> {
    [(ANNOTATION_HEARTBEAT.to_string(), now.to_string())]
        .into_iter()
        .collect()
}

/// Description of a shadow pod to create
#[derive(Debug, Clone)]
pub struct ShadowSpec {
    pub name: String,
    pub role: Role,
    pub image: String,
    /// Extra labels, e.g. the exchanged deployment's selector
    pub labels: BTreeMap<String, String>,
    /// Config blob recording what must be undone when the shadow is orphaned
    pub config: Option<String>,
}

/// Create the shadow pod: an sshd container whose authorized key comes from
/// the config map named by `key_config_map_name`
pub fn shadow_pod(spec: &ShadowSpec, now: i64) -> Pod {
    let mut labels = control_labels();
    labels.extend(spec.labels.clone());
    labels.insert(LABEL_ROLE.to_string(), spec.role.to_string());

    let mut annotations = heartbeat_annotations(now);
    if let Some(config) = &spec.config {
        annotations.insert(ANNOTATION_CONFIG.to_string(), config.clone());
    }

    let key_volume = "ssh-public-key".to_string();

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "standalone".to_string(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: SSH_PORT,
                    name: Some("ssh".to_string()),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: key_volume.clone(),
                    mount_path: "/root/.ssh/authorized_keys".to_string(),
                    sub_path: Some(AUTHORIZED_KEY.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: key_volume,
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(key_config_map_name(&spec.name)),
                    items: Some(vec![KeyToPath {
                        key: AUTHORIZED_KEY.to_string(),
                        path: AUTHORIZED_KEY.to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Config map holding the public key a shadow pod accepts
pub fn key_config_map(shadow: &str, public_key: &str, now: i64) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(key_config_map_name(shadow)),
            labels: Some(control_labels()),
            annotations: Some(heartbeat_annotations(now)),
            ..Default::default()
        },
        data: Some(
            [(AUTHORIZED_KEY.to_string(), public_key.trim().to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

/// Router pod splitting traffic between the stuntman service (original pods)
/// and the mesh service (local process) based on a version header
pub fn router_pod(
    service: &str,
    image: &str,
    ports: &[i32],
    version_mark: &str,
    now: i64,
) -> Pod {
    let name = router_name(service);
    let mut labels = control_labels();
    labels.insert(LABEL_ROLE.to_string(), Role::MeshRouter.to_string());
    labels.insert(LABEL_ROUTER.to_string(), service.to_string());

    let mut annotations = heartbeat_annotations(now);
    annotations.insert(
        ANNOTATION_CONFIG.to_string(),
        format!("service={}", service),
    );

    let ports_env = ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let env = [
        ("ROUTER_PORTS", ports_env),
        ("ROUTER_DEFAULT_TARGET", stuntman_name(service)),
        ("ROUTER_MESH_TARGET", mesh_name(service, version_mark)),
        ("ROUTER_VERSION_MARK", version_mark.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    })
    .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "router".to_string(),
                image: Some(image.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                env: Some(env),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ContainerPort {
                            container_port: *p,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }],
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Copy of `original` selecting the original pods, so the router can still
/// reach them once the original service is pointed at the router. It carries
/// its own heartbeat so `clean` finds it even when no router was created.
pub fn stuntman_service(
    original: &Service,
    name: &str,
    selector: BTreeMap<String, String>,
    now: i64,
) -> Service {
    let ports = original
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();
    service_with(name, selector, ports, Some(now))
}

/// Service selecting the mesh shadow pod; carries a heartbeat
pub fn mesh_service(name: &str, selector: BTreeMap<String, String>, ports: &[i32], now: i64) -> Service {
    let ports = ports
        .iter()
        .map(|p| ServicePort {
            name: Some(format!("port-{}", p)),
            port: *p,
            target_port: Some(IntOrString::Int(*p)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    service_with(name, selector, ports, Some(now))
}

fn service_with(
    name: &str,
    selector: BTreeMap<String, String>,
    ports: Vec<ServicePort>,
    heartbeat: Option<i64>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(control_labels()),
            annotations: heartbeat.map(heartbeat_annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(ports),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ports a service exposes, as target container ports
pub fn service_target_ports(service: &Service) -> Vec<i32> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| match &p.target_port {
                    Some(IntOrString::Int(port)) => *port,
                    _ => p.port,
                })
                .collect()
        })
        .unwrap_or_default()
}
