//! `exchange`: replace a deployment's pods with a shadow that forwards
//! traffic to this machine
//!
//! The deployment is scaled to zero and a shadow pod carrying its selector
//! labels takes over its services. The original replica count is stored on
//! the shadow so `clean` can scale the deployment back if this process dies.

use k8s_openapi::api::apps::v1::Deployment;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use super::pid::PidFile;
use super::{create_shadow, keep_alive, now, remove_shadow, run_inbound, Context, Expose};
use crate::error::AppResult;
use crate::k8s::resources::{key_config_map_name, random_suffix, ShadowSpec, EXCHANGE_INFIX};
use crate::k8s::{service_selector, ObjectKind};
use crate::lock::LockCoordinator;
use crate::registry::meta::format_config;
use crate::registry::Role;

pub const COMPONENT: &str = "exchange";

#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub deployment: String,
    pub expose: Vec<Expose>,
}

fn match_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone())
        .unwrap_or_default()
}

fn pod_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default()
}

/// Names of the services whose selector matches the deployment's pods
pub async fn services_selecting(ctx: &Context, deployment: &Deployment) -> AppResult<Vec<String>> {
    let labels = pod_labels(deployment);
    let services = ctx.cluster.list_services(ctx.namespace(), "").await?;
    Ok(services
        .iter()
        .filter(|svc| {
            let selector = service_selector(svc);
            !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
        })
        .filter_map(|svc| svc.metadata.name.clone())
        .collect())
}

/// Lock every service, or none: on contention the locks already taken are
/// released again
pub async fn lock_all(locks: &LockCoordinator, services: &[String], ns: &str) -> AppResult<()> {
    let now = now();
    for (i, service) in services.iter().enumerate() {
        if let Err(e) = locks.acquire(service, ns, now).await {
            release_all(locks, &services[..i], ns).await;
            return Err(e);
        }
    }
    Ok(())
}

pub async fn release_all(locks: &LockCoordinator, services: &[String], ns: &str) {
    for service in services {
        if let Err(e) = locks.release(service, ns).await {
            warn!(service = %service, error = %e, "Failed to release lock");
        }
    }
}

pub async fn run(ctx: &Context, opts: &ExchangeOptions) -> AppResult<()> {
    let ns = ctx.namespace();
    let deployment = ctx.cluster.get_deployment(&opts.deployment, ns).await?;
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    let _pid_file = PidFile::create(&ctx.config.state_dir, COMPONENT)?;
    let locks = LockCoordinator::from_config(ctx.cluster.clone(), &ctx.config);
    let services = services_selecting(ctx, &deployment).await?;
    lock_all(&locks, &services, ns).await?;

    let mut labels = match_labels(&deployment);
    labels.extend(pod_labels(&deployment));
    let shadow = create_shadow(
        ctx,
        ShadowSpec {
            name: format!("{}{}{}", opts.deployment, EXCHANGE_INFIX, random_suffix()),
            role: Role::ExchangeShadow,
            image: ctx.config.image.clone(),
            labels,
            config: Some(format_config(&[
                ("app", opts.deployment.as_str()),
                ("replicas", replicas.to_string().as_str()),
            ])),
        },
    )
    .await;
    let shadow = match shadow {
        Ok(shadow) => shadow,
        Err(e) => {
            release_all(&locks, &services, ns).await;
            return Err(e);
        }
    };

    info!(deployment = %opts.deployment, from = replicas, "Scaling deployment to 0");
    let scaled = ctx.cluster.scale_deployment(&opts.deployment, ns, 0).await;
    release_all(&locks, &services, ns).await;

    let result = match scaled {
        Ok(()) => {
            let heartbeat = keep_alive(
                ctx,
                &[
                    (ObjectKind::Pod, shadow.name.clone()),
                    (ObjectKind::ConfigMap, key_config_map_name(&shadow.name)),
                ],
            );
            let result = run_inbound(ctx, &shadow, &opts.expose).await;
            heartbeat.stop().await;
            result
        }
        Err(e) => Err(e),
    };

    recover(ctx, &opts.deployment, replicas).await;
    remove_shadow(ctx, &shadow).await;
    info!("Exchange session ended");
    result
}

async fn recover(ctx: &Context, deployment: &str, replicas: i32) {
    info!(deployment, replicas, "Recovering origin deployment");
    if let Err(e) = ctx
        .cluster
        .scale_deployment(deployment, ctx.namespace(), replicas)
        .await
    {
        error!(deployment, error = %e, "Failed to scale deployment back, run clean to retry");
    }
}
