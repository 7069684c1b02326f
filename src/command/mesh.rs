//! `mesh`: send part of a service's traffic to this machine
//!
//! The service selector is pointed at a router pod. The router sends
//! requests carrying the version mark to the mesh service (the shadow), and
//! everything else to the stuntman service (the original pods).

use k8s_openapi::api::core::v1::Service;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::pid::PidFile;
use super::{create_shadow, keep_alive, now, remove_shadow, run_inbound, Context, Expose, Shadow};
use crate::error::{AppError, AppResult};
use crate::k8s::resources::{
    key_config_map_name, mesh_name, mesh_service, random_suffix, router_name, router_pod,
    service_target_ports, stuntman_name, stuntman_service, ShadowSpec, LABEL_MESH, LABEL_ROUTER,
};
use crate::k8s::{recover_original_service, redirect_service, service_selector, ObjectKind};
use crate::lock::LockCoordinator;
use crate::registry::Role;

pub const COMPONENT: &str = "mesh";

#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub service: String,
    pub expose: Vec<Expose>,
    /// Header value routed to this machine; random when absent
    pub version_mark: Option<String>,
}

/// Objects a mesh session placed in the cluster
struct MeshSetup {
    shadow: Shadow,
    mesh_service: String,
    /// This session created the router and must put the service back
    owns_router: bool,
}

pub async fn run(ctx: &Context, opts: &MeshOptions) -> AppResult<()> {
    let ns = ctx.namespace();
    let version = opts
        .version_mark
        .clone()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(random_suffix);

    let _pid_file = PidFile::create(&ctx.config.state_dir, COMPONENT)?;
    let locks = LockCoordinator::from_config(ctx.cluster.clone(), &ctx.config);
    locks.acquire(&opts.service, ns, now()).await?;
    let prepared = setup(ctx, &opts.service, &version).await;
    if let Err(e) = locks.release(&opts.service, ns).await {
        warn!(service = %opts.service, error = %e, "Failed to release lock");
    }
    let setup = prepared?;
    info!(service = %opts.service, version = %version, "Requests with this version mark now reach this machine");

    let mut targets = vec![
        (ObjectKind::Pod, setup.shadow.name.clone()),
        (ObjectKind::ConfigMap, key_config_map_name(&setup.shadow.name)),
        (ObjectKind::Service, setup.mesh_service.clone()),
    ];
    if setup.owns_router {
        targets.push((ObjectKind::Pod, router_name(&opts.service)));
        targets.push((ObjectKind::Service, stuntman_name(&opts.service)));
    }
    let heartbeat = keep_alive(ctx, &targets);
    let result = run_inbound(ctx, &setup.shadow, &opts.expose).await;
    heartbeat.stop().await;

    teardown(ctx, &opts.service, &setup).await;
    info!("Mesh session ended");
    result
}

async fn setup(ctx: &Context, service_name: &str, version: &str) -> AppResult<MeshSetup> {
    let ns = ctx.namespace();
    let service = ctx.cluster.get_service(service_name, ns).await?;
    let ports = service_target_ports(&service);

    let owns_router = match ctx.cluster.get_pod(&router_name(service_name), ns).await {
        Ok(_) => {
            info!(service = service_name, "Router already in place, sharing it");
            false
        }
        Err(e) if e.is_not_found() => true,
        Err(e) => return Err(e),
    };
    if owns_router {
        create_router(ctx, &service, service_name, &ports, version).await?;
    }

    let shadow_name = mesh_name(service_name, version);
    let labels: BTreeMap<String, String> = [(LABEL_MESH.to_string(), shadow_name.clone())]
        .into_iter()
        .collect();
    let shadow = match create_shadow(
        ctx,
        ShadowSpec {
            name: shadow_name.clone(),
            role: Role::MeshShadow,
            image: ctx.config.image.clone(),
            labels: labels.clone(),
            config: None,
        },
    )
    .await
    {
        Ok(shadow) => shadow,
        Err(e) => {
            if owns_router {
                undo_router(ctx, service_name).await;
            }
            return Err(e);
        }
    };

    let mesh = mesh_service(&shadow_name, labels, &ports, now());
    if let Err(e) = ctx.cluster.create_service(&mesh, ns).await {
        remove_shadow(ctx, &shadow).await;
        if owns_router {
            undo_router(ctx, service_name).await;
        }
        return Err(e);
    }

    Ok(MeshSetup {
        shadow,
        mesh_service: shadow_name,
        owns_router,
    })
}

/// Router pod, stuntman service, then redirect the original service
async fn create_router(
    ctx: &Context,
    service: &Service,
    name: &str,
    ports: &[i32],
    version: &str,
) -> AppResult<()> {
    let ns = ctx.namespace();
    let original_selector = service_selector(service);

    let stuntman = stuntman_service(service, &stuntman_name(name), original_selector, now());
    ctx.cluster.create_service(&stuntman, ns).await?;

    let created = async {
        ctx.cluster
            .create_pod(&router_pod(name, &ctx.config.router_image, ports, version, now()), ns)
            .await?;
        ctx.cluster
            .wait_pod_running(&router_name(name), ns, ctx.config.pod_creation_wait())
            .await?;
        let router_selector = [(LABEL_ROUTER.to_string(), name.to_string())]
            .into_iter()
            .collect();
        redirect_service(ctx.cluster.as_ref(), service.clone(), ns, router_selector).await?;
        Ok::<(), AppError>(())
    }
    .await;

    match created {
        Ok(()) => {
            info!(service = name, "Service redirected to router");
            Ok(())
        }
        Err(e) => {
            undo_router(ctx, name).await;
            Err(e)
        }
    }
}

async fn undo_router(ctx: &Context, service: &str) {
    if let Err(e) = recover_original_service(ctx.cluster.as_ref(), service, ctx.namespace()).await {
        warn!(service, error = %e, "Failed to recover service, run clean to retry");
    }
}

async fn teardown(ctx: &Context, service: &str, setup: &MeshSetup) {
    if let Err(e) = ctx
        .cluster
        .remove_service(&setup.mesh_service, ctx.namespace())
        .await
    {
        warn!(name = %setup.mesh_service, error = %e, "Failed to remove mesh service");
    }
    remove_shadow(ctx, &setup.shadow).await;
    if setup.owns_router {
        info!(service, "Recovering original service");
        undo_router(ctx, service).await;
    }
}
