//! `connect`: route the cluster's pod and service networks to this machine

use tracing::{info, warn};

use super::pid::PidFile;
use super::{create_shadow, keep_alive, remove_shadow, Context, Shadow};
use crate::error::AppResult;
use crate::k8s::resources::{key_config_map_name, random_suffix, ShadowSpec, CONNECT_PREFIX};
use crate::k8s::ObjectKind;
use crate::network::NetworkDiscovery;
use crate::registry::Role;
use crate::tunnel::{
    ensure_vpn_binary, free_port, DnsStage, PortForwardStage, Stage, Supervisor, VpnRequest,
    VpnStage,
};

pub const COMPONENT: &str = "connect";

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Extra CIDRs to route
    pub include_ips: Vec<String>,
    /// CIDRs removed from the discovered set
    pub exclude_ips: Vec<String>,
    /// Namespace to sample pod IPs from when nodes hide their pod CIDR
    pub pod_cidr_namespace: Option<String>,
    /// Leave the shadow pod in place on exit
    pub skip_cleanup: bool,
}

pub async fn run(ctx: &Context, opts: &ConnectOptions) -> AppResult<()> {
    let vpn_binary = ensure_vpn_binary(&ctx.config.vpn_binary, &ctx.config.vpn_install_command).await?;
    let _pid_file = PidFile::create(&ctx.config.state_dir, COMPONENT)?;

    let name = format!("{}{}", CONNECT_PREFIX, random_suffix());
    let shadow = create_shadow(
        ctx,
        ShadowSpec {
            name,
            role: Role::ConnectShadow,
            image: ctx.config.image.clone(),
            labels: Default::default(),
            config: None,
        },
    )
    .await?;

    let heartbeat = keep_alive(
        ctx,
        &[
            (ObjectKind::Pod, shadow.name.clone()),
            (ObjectKind::ConfigMap, key_config_map_name(&shadow.name)),
        ],
    );

    let result = session(ctx, opts, &shadow, vpn_binary).await;

    heartbeat.stop().await;

    if opts.skip_cleanup {
        warn!(name = %shadow.name, "Leaving shadow pod in place");
    } else {
        remove_shadow(ctx, &shadow).await;
    }
    info!("Connect session ended");
    result
}

async fn session(
    ctx: &Context,
    opts: &ConnectOptions,
    shadow: &Shadow,
    vpn_binary: std::path::PathBuf,
) -> AppResult<()> {
    let cidrs = NetworkDiscovery::new(ctx.cluster.as_ref(), &ctx.config)
        .cluster_cidrs(
            ctx.namespace(),
            opts.pod_cidr_namespace.as_deref(),
            &opts.include_ips,
            &opts.exclude_ips,
        )
        .await?;

    let ssh_port = free_port()?;
    let supervisor = Supervisor::new(ctx.token.clone())
        .stage(PortForwardStage::new(
            &shadow.name,
            ctx.namespace(),
            ctx.config.kubeconfig.as_deref(),
            ssh_port,
            ctx.config.port_forward_wait(),
        ))
        .stage(VpnStage::new(VpnRequest {
            binary: vpn_binary,
            ssh_port,
            private_key: shadow.keys.private_key.clone(),
            dns_server: shadow.ip.clone(),
            cidrs,
            debug: ctx.debug,
        }));
    let mut dns = DnsStage::new(ctx.name_server.clone(), &shadow.ip, ctx.namespace());
    run_with_dns(supervisor, &mut dns).await
}

/// Start the supervised stages, then switch the resolver. The resolver is
/// restored only after every supervised stage has stopped.
async fn run_with_dns(mut supervisor: Supervisor, dns: &mut dyn Stage) -> AppResult<()> {
    supervisor.start().await?;
    if let Err(e) = dns.start().await {
        supervisor.shutdown().await;
        return Err(e);
    }
    info!("All looks good, now you can access resources in the cluster");

    let result = supervisor.run().await;
    if let Err(e) = dns.stop().await {
        warn!(error = %e, "Failed to restore name server, run clean to retry");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        journal: Journal,
        fail_start: bool,
    }

    fn recorder(name: &'static str, journal: &Journal) -> Recorder {
        Recorder {
            name,
            journal: journal.clone(),
            fail_start: false,
        }
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&mut self) -> AppResult<()> {
            if self.fail_start {
                return Err(AppError::process(self.name, "refused"));
            }
            self.journal.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&mut self) -> AppResult<()> {
            self.journal.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    fn supervisor(token: &CancellationToken, journal: &Journal) -> Supervisor {
        Supervisor::new(token.clone())
            .stage(recorder("port-forward", journal))
            .stage(recorder("vpn", journal))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_resolver_restored_after_tunnel_is_down() {
        let journal = Journal::default();
        let token = CancellationToken::new();
        let mut dns = recorder("dns", &journal);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        run_with_dns(supervisor(&token, &journal), &mut dns)
            .await
            .unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "start port-forward",
                "start vpn",
                "start dns",
                "stop vpn",
                "stop port-forward",
                "stop dns"
            ]
        );
    }

    #[tokio::test]
    async fn test_resolver_failure_stops_tunnel() {
        let journal = Journal::default();
        let token = CancellationToken::new();
        let mut dns = recorder("dns", &journal);
        dns.fail_start = true;

        let err = run_with_dns(supervisor(&token, &journal), &mut dns)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dns"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["start port-forward", "start vpn", "stop vpn", "stop port-forward"]
        );
    }
}
