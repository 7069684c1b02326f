//! Kubernetes integration module for KubeBridge
//!
//! This module handles all interactions with the cluster:
//! - The `ClusterApi` capability surface and its kube-backed implementation
//! - Builders for shadow pods, router pods, services and key config maps
//! - Redirecting a service's selector and restoring it

mod api;
mod client;
pub mod resources;
pub mod routing;

pub use api::{ClusterApi, ObjectKind};
#[cfg(test)]
pub use api::MockClusterApi;
pub use client::K8sClient;
pub use routing::{recover_original_service, redirect_service, service_selector};
