//! Persisted state layout
//!
//! Object labels and annotations on live cluster objects are the only durable
//! state the tool owns. This module defines the keys, parses them, and turns
//! object metadata into storage-neutral records the expiry engine works on.

use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::k8s::ObjectKind;

pub const LABEL_CONTROL_BY: &str = "kubebridge.io/control-by";
pub const CONTROL_BY_VALUE: &str = "kubebridge";
pub const LABEL_ROLE: &str = "kubebridge.io/role";
pub const ANNOTATION_HEARTBEAT: &str = "kubebridge.io/last-heartbeat";
pub const ANNOTATION_CONFIG: &str = "kubebridge.io/config";
pub const ANNOTATION_LOCK: &str = "kubebridge.io/lock";
pub const ANNOTATION_SELECTOR: &str = "kubebridge.io/selector";

/// Label selector matching every object created by the tool
pub fn control_by_selector() -> String {
    format!("{}={}", LABEL_CONTROL_BY, CONTROL_BY_VALUE)
}

/// What a shadow pod is for
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Role {
    #[strum(serialize = "connect-shadow")]
    ConnectShadow,
    #[strum(serialize = "exchange-shadow")]
    ExchangeShadow,
    #[strum(serialize = "mesh-router")]
    MeshRouter,
    #[strum(serialize = "mesh-shadow")]
    MeshShadow,
}

/// Parse a unix-seconds timestamp; anything unparsable or non-positive is `None`
pub fn parse_timestamp(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().filter(|ts| *ts > 0)
}

/// Parse a `k1=v1,k2=v2` config blob. Entries without `=` are skipped.
pub fn parse_config(blob: &str) -> BTreeMap<String, String> {
    blob.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

pub fn format_config(entries: &[(&str, &str)]) -> String {
    entries
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Storage-neutral view of one object the tool created
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowRecord {
    pub kind: ObjectKind,
    pub name: String,
    pub role: Option<Role>,
    pub heartbeat: Option<i64>,
    pub config: BTreeMap<String, String>,
    /// The cluster has already been asked to delete the object
    pub deleting: bool,
}

impl ShadowRecord {
    fn from_meta(kind: ObjectKind, meta: &ObjectMeta) -> Self {
        let annotation = |key: &str| {
            meta.annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .map(String::as_str)
        };
        let role = meta
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_ROLE))
            .and_then(|r| Role::from_str(r).ok());

        Self {
            kind,
            name: meta.name.clone().unwrap_or_default(),
            role,
            heartbeat: annotation(ANNOTATION_HEARTBEAT).and_then(parse_timestamp),
            config: annotation(ANNOTATION_CONFIG)
                .map(parse_config)
                .unwrap_or_default(),
            deleting: meta.deletion_timestamp.is_some(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self::from_meta(ObjectKind::Pod, &pod.metadata)
    }

    pub fn from_config_map(config_map: &ConfigMap) -> Self {
        Self::from_meta(ObjectKind::ConfigMap, &config_map.metadata)
    }

    pub fn from_service(service: &Service) -> Self {
        Self::from_meta(ObjectKind::Service, &service.metadata)
    }
}

/// A service carrying a lock annotation
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub service: String,
    /// `None` when the annotation is present but unparsable
    pub locked_at: Option<i64>,
}

impl LockRecord {
    pub fn from_service(service: &Service) -> Option<Self> {
        let value = service.metadata.annotations.as_ref()?.get(ANNOTATION_LOCK)?;
        Some(Self {
            service: service.metadata.name.clone().unwrap_or_default(),
            locked_at: parse_timestamp(value),
        })
    }

    /// A lock nobody can vouch for: too old or unreadable
    pub fn is_abandoned(&self, timeout_secs: i64, now: i64) -> bool {
        match self.locked_at {
            Some(ts) => now - ts > timeout_secs,
            None => true,
        }
    }
}
