//! Subcommand implementations
//!
//! Each session places its shadow objects in the cluster, keeps their
//! heartbeat fresh while it runs, and removes them on the way out. Anything a
//! crashed session leaves behind is found later by `clean`.

pub mod clean;
pub mod connect;
pub mod exchange;
pub mod mesh;
pub mod pid;

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::k8s::resources::{key_config_map, key_config_map_name, shadow_pod, ShadowSpec};
use crate::k8s::{ClusterApi, ObjectKind};
use crate::registry::HeartbeatKeeper;
use crate::tunnel::{
    free_port, NameServer, PortForwardStage, ReverseTunnelStage, SshKeyPair, Supervisor,
};

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Everything a subcommand needs, built once in `main`
#[derive(Clone)]
pub struct Context {
    pub config: Config,
    pub cluster: Arc<dyn ClusterApi>,
    pub name_server: Arc<dyn NameServer>,
    /// Root token; cancelling it ends the session
    pub token: CancellationToken,
    pub debug: bool,
}

impl Context {
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Root of every session's key directory
    pub fn keys_root(&self) -> PathBuf {
        self.config.state_dir.join("keys")
    }

    /// Key directory of this process, `keys/<pid>`
    pub fn key_dir(&self) -> PathBuf {
        self.keys_root().join(std::process::id().to_string())
    }
}

/// A shadow pod that is running and reachable over ssh
#[derive(Debug, Clone)]
pub struct Shadow {
    pub name: String,
    pub ip: String,
    pub keys: SshKeyPair,
}

/// Generate a key pair, publish the public key, create the shadow pod and
/// wait until it runs. Anything created is removed again on failure.
pub async fn create_shadow(ctx: &Context, spec: ShadowSpec) -> AppResult<Shadow> {
    let ns = ctx.namespace();
    let keys = SshKeyPair::generate(&ctx.key_dir(), &spec.name).await?;

    info!(name = %spec.name, role = %spec.role, namespace = ns, "Creating shadow pod");
    let created = async {
        ctx.cluster
            .create_config_map(&key_config_map(&spec.name, &keys.public_key, now()), ns)
            .await?;
        ctx.cluster.create_pod(&shadow_pod(&spec, now()), ns).await?;
        let pod = ctx
            .cluster
            .wait_pod_running(&spec.name, ns, ctx.config.pod_creation_wait())
            .await?;
        pod.status
            .and_then(|s| s.pod_ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| AppError::internal("shadow pod has no IP"))
    }
    .await;

    match created {
        Ok(ip) => {
            info!(name = %spec.name, ip = %ip, "Shadow pod running");
            Ok(Shadow {
                name: spec.name,
                ip,
                keys,
            })
        }
        Err(e) => {
            remove_shadow_objects(ctx, &spec.name).await;
            keys.remove();
            Err(e)
        }
    }
}

async fn remove_shadow_objects(ctx: &Context, name: &str) {
    let ns = ctx.namespace();
    if let Err(e) = ctx.cluster.remove_pod(name, ns).await {
        warn!(name, error = %e, "Failed to remove shadow pod");
    }
    if let Err(e) = ctx.cluster.remove_config_map(&key_config_map_name(name), ns).await {
        warn!(name, error = %e, "Failed to remove key config map");
    }
}

/// Delete the shadow pod, its key config map and the local key files
pub async fn remove_shadow(ctx: &Context, shadow: &Shadow) {
    info!(name = %shadow.name, "Removing shadow pod");
    remove_shadow_objects(ctx, &shadow.name).await;
    shadow.keys.remove();
    // Only succeeds once no other shadow of this process keeps keys there
    let _ = std::fs::remove_dir(ctx.key_dir());
}

/// Running heartbeat loop of one session
pub struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Stop the loop and wait for it. Returns false, after logging, when the
    /// task did not end cleanly.
    pub async fn stop(self) -> bool {
        self.token.cancel();
        match self.handle.await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Heartbeat task failed, resources may be cleaned while in use");
                false
            }
        }
    }
}

/// Keep the heartbeat of `targets` fresh until the returned handle is stopped
/// or the session token is cancelled
pub fn keep_alive(ctx: &Context, targets: &[(ObjectKind, String)]) -> Heartbeat {
    let keeper = targets.iter().fold(
        HeartbeatKeeper::new(
            ctx.cluster.clone(),
            ctx.namespace(),
            ctx.config.heartbeat_interval(),
        ),
        |keeper, (kind, name)| keeper.watch(*kind, name),
    );
    let token = ctx.token.child_token();
    let handle = keeper.spawn(token.clone());
    Heartbeat { token, handle }
}

/// Forward every exposed port from the shadow pod to this machine and block
/// until the session is cancelled or a tunnel dies
pub async fn run_inbound(ctx: &Context, shadow: &Shadow, exposes: &[Expose]) -> AppResult<()> {
    let ssh_port = free_port()?;
    let mut supervisor = Supervisor::new(ctx.token.clone()).stage(PortForwardStage::new(
        &shadow.name,
        ctx.namespace(),
        ctx.config.kubeconfig.as_deref(),
        ssh_port,
        ctx.config.port_forward_wait(),
    ));
    for expose in exposes {
        supervisor = supervisor.stage(ReverseTunnelStage::new(
            ssh_port,
            shadow.keys.private_key.clone(),
            expose.remote,
            expose.local,
        ));
    }
    supervisor.start().await?;
    info!(shadow = %shadow.name, "Inbound traffic forwarded, press Ctrl+C to stop");
    supervisor.run().await
}

/// A port exposed from the shadow pod back to this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expose {
    pub local: u16,
    pub remote: u16,
}

impl std::str::FromStr for Expose {
    type Err = AppError;

    /// `8080` or `<local>:<remote>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| AppError::Config(format!("invalid port in expose '{}'", s)))
        };
        match s.split_once(':') {
            Some((local, remote)) => Ok(Self {
                local: parse(local)?,
                remote: parse(remote)?,
            }),
            None => {
                let port = parse(s)?;
                Ok(Self {
                    local: port,
                    remote: port,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_stop_reports_failed_task() {
        let finished = Heartbeat {
            token: CancellationToken::new(),
            handle: tokio::spawn(async {}),
        };
        assert!(finished.stop().await);

        let crashed = Heartbeat {
            token: CancellationToken::new(),
            handle: tokio::spawn(async { panic!("interval") }),
        };
        assert!(!crashed.stop().await);
    }

    #[test]
    fn test_parse_expose() {
        assert_eq!(
            "8080".parse::<Expose>().unwrap(),
            Expose {
                local: 8080,
                remote: 8080
            }
        );
        assert_eq!(
            "3000:80".parse::<Expose>().unwrap(),
            Expose {
                local: 3000,
                remote: 80
            }
        );
        assert!("abc".parse::<Expose>().is_err());
        assert!("0".parse::<Expose>().is_err());
        assert!("80:".parse::<Expose>().is_err());
    }
}
