//! Redirecting a service's selector and putting it back

use k8s_openapi::api::core::v1::Service;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::api::ClusterApi;
use super::resources::{router_name, stuntman_name};
use crate::error::AppResult;
use crate::registry::meta::ANNOTATION_SELECTOR;

pub fn service_selector(service: &Service) -> BTreeMap<String, String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.clone())
        .unwrap_or_default()
}

/// Point `service` at pods matching `selector`, remembering the original
/// selector in an annotation. A service already redirected keeps its first
/// recorded selector.
pub async fn redirect_service(
    cluster: &dyn ClusterApi,
    mut service: Service,
    namespace: &str,
    selector: BTreeMap<String, String>,
) -> AppResult<Service> {
    let original = serde_json::to_string(&service_selector(&service))?;
    let annotations = service.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations
        .entry(ANNOTATION_SELECTOR.to_string())
        .or_insert(original);

    if let Some(spec) = service.spec.as_mut() {
        spec.selector = Some(selector);
    }
    cluster.update_service(&service, namespace).await
}

/// Restore a meshed service's original selector and remove the router pod and
/// stuntman service. Objects already gone count as recovered.
pub async fn recover_original_service(
    cluster: &dyn ClusterApi,
    name: &str,
    namespace: &str,
) -> AppResult<()> {
    match cluster.get_service(name, namespace).await {
        Ok(mut service) => {
            let saved = service
                .metadata
                .annotations
                .as_mut()
                .and_then(|a| a.remove(ANNOTATION_SELECTOR));
            if let Some(saved) = saved {
                match serde_json::from_str::<BTreeMap<String, String>>(&saved) {
                    Ok(selector) => {
                        if let Some(spec) = service.spec.as_mut() {
                            spec.selector = Some(selector);
                        }
                    }
                    Err(e) => warn!(service = name, error = %e, "Malformed saved selector, dropping it"),
                }
                cluster.update_service(&service, namespace).await?;
                info!(service = name, "Restored original selector");
            }
        }
        Err(e) if e.is_not_found() => {
            warn!(service = name, "Service to recover no longer exists");
        }
        Err(e) => return Err(e),
    }

    cluster.remove_service(&stuntman_name(name), namespace).await?;
    cluster.remove_pod(&router_name(name), namespace).await?;
    Ok(())
}
