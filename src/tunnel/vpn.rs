//! VPN bridge over the ssh port-forward (sshuttle)

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

use super::process::{run_and_wait, ChildProcess};
use super::ssh::ssh_options;
use super::stage::Stage;
use crate::error::{AppError, AppResult};

/// Locate the VPN helper, running `install_command` once if it is missing
pub async fn ensure_vpn_binary(binary: &str, install_command: &str) -> AppResult<PathBuf> {
    if let Ok(path) = which::which(binary) {
        return Ok(path);
    }
    warn!(binary, command = install_command, "VPN helper not found, installing");
    if let Err(e) = run_and_wait("install", Command::new("sh").args(["-c", install_command])).await {
        warn!(error = %e, "Install command failed");
    }
    which::which(binary).map_err(|_| {
        AppError::process(
            "vpn",
            format!("'{}' not found in PATH and could not be installed", binary),
        )
    })
}

#[derive(Debug, Clone)]
pub struct VpnRequest {
    pub binary: PathBuf,
    pub ssh_port: u16,
    pub private_key: PathBuf,
    /// Shadow pod IP, used as the resolver for cluster names
    pub dns_server: String,
    pub cidrs: Vec<String>,
    pub debug: bool,
}

pub struct VpnStage {
    request: VpnRequest,
    process: Option<ChildProcess>,
}

impl VpnStage {
    pub fn new(request: VpnRequest) -> Self {
        Self {
            request,
            process: None,
        }
    }

    /// Subnets handed to the VPN helper. It needs at least one, so with
    /// nothing discovered only the shadow pod itself is routed.
    fn routes(&self) -> Vec<String> {
        if self.request.cidrs.is_empty() {
            vec![format!("{}/32", self.request.dns_server)]
        } else {
            self.request.cidrs.clone()
        }
    }

    fn command(&self) -> Command {
        let req = &self.request;
        let ssh = format!("ssh {}", ssh_options(&req.private_key).join(" "));
        let mut cmd = Command::new(&req.binary);
        cmd.arg("--dns")
            .args(["--to-ns", req.dns_server.as_str()])
            .args(["-e", ssh.as_str()])
            .arg("-r")
            .arg(format!("root@127.0.0.1:{}", req.ssh_port));
        if req.debug {
            cmd.arg("-v");
        }
        cmd.args(self.routes());
        cmd
    }
}

#[async_trait]
impl Stage for VpnStage {
    fn name(&self) -> &str {
        "vpn"
    }

    async fn start(&mut self) -> AppResult<()> {
        if self.request.cidrs.is_empty() {
            warn!(dns = %self.request.dns_server, "No cluster CIDR discovered, routing the shadow pod only");
        }
        let mut process = ChildProcess::spawn(self.name(), &mut self.command())?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if let Some(reason) = process.exited() {
            return Err(AppError::process(self.name(), reason));
        }
        info!(cidrs = ?self.request.cidrs, dns = %self.request.dns_server, "VPN started");
        self.process = Some(process);
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        if let Some(mut process) = self.process.take() {
            process.stop().await;
        }
        Ok(())
    }

    fn failure(&mut self) -> Option<String> {
        self.process.as_mut().and_then(ChildProcess::exited)
    }
}
