//! kubectl port-forward and ssh reverse tunnel stages

use async_trait::async_trait;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

use super::process::ChildProcess;
use super::stage::Stage;
use crate::error::{AppError, AppResult};
use crate::k8s::resources::SSH_PORT;

const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// Ask the OS for a free local port
pub fn free_port() -> AppResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Poll until something accepts connections on `port`
pub async fn wait_for_port(port: u16, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(CONNECT_RETRY).await;
    }
}

/// Forwards a local port to the shadow pod's sshd
pub struct PortForwardStage {
    pod: String,
    namespace: String,
    kubeconfig: Option<String>,
    local_port: u16,
    wait: Duration,
    process: Option<ChildProcess>,
}

impl PortForwardStage {
    pub fn new(
        pod: &str,
        namespace: &str,
        kubeconfig: Option<&str>,
        local_port: u16,
        wait: Duration,
    ) -> Self {
        Self {
            pod: pod.to_string(),
            namespace: namespace.to_string(),
            kubeconfig: kubeconfig.map(str::to_string),
            local_port,
            wait,
            process: None,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        cmd.arg("port-forward")
            .arg(format!("pod/{}", self.pod))
            .arg(format!("{}:{}", self.local_port, SSH_PORT))
            .args(["-n", self.namespace.as_str()]);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.args(["--kubeconfig", kubeconfig.as_str()]);
        }
        cmd
    }
}

#[async_trait]
impl Stage for PortForwardStage {
    fn name(&self) -> &str {
        "port-forward"
    }

    async fn start(&mut self) -> AppResult<()> {
        let mut process = ChildProcess::spawn(self.name(), &mut self.command())?;
        if !wait_for_port(self.local_port, self.wait).await {
            let reason = process
                .exited()
                .unwrap_or_else(|| format!("port {} not ready after {:?}", self.local_port, self.wait));
            process.stop().await;
            return Err(AppError::process(self.name(), reason));
        }
        info!(pod = %self.pod, port = self.local_port, "Port forward ready");
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

/// Common ssh options for connecting through a local port-forward to a pod
/// whose host key changes on every session
pub fn ssh_options(private_key: &Path) -> Vec<String> {
    vec![
        "-oStrictHostKeyChecking=no".to_string(),
        "-oUserKnownHostsFile=/dev/null".to_string(),
        "-oLogLevel=ERROR".to_string(),
        "-i".to_string(),
        private_key.display().to_string(),
    ]
}

/// Reverse tunnel: connections to `remote_port` inside the shadow pod reach
/// `local_port` on this machine
pub struct ReverseTunnelStage {
    ssh_port: u16,
    private_key: PathBuf,
    remote_port: u16,
    local_port: u16,
    process: Option<ChildProcess>,
}

impl ReverseTunnelStage {
    pub fn new(ssh_port: u16, private_key: PathBuf, remote_port: u16, local_port: u16) -> Self {
        Self {
            ssh_port,
            private_key,
            remote_port,
            local_port,
            process: None,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-N")
            .arg("-oExitOnForwardFailure=yes")
            .arg("-oServerAliveInterval=15")
            .args(ssh_options(&self.private_key))
            .arg("-p")
            .arg(self.ssh_port.to_string())
            .arg("-R")
            .arg(format!("0.0.0.0:{}:127.0.0.1:{}", self.remote_port, self.local_port))
            .arg("root@127.0.0.1");
        cmd
    }
}

#[async_trait]
impl Stage for ReverseTunnelStage {
    fn name(&self) -> &str {
        "reverse-tunnel"
    }

    async fn start(&mut self) -> AppResult<()> {
        let mut process = ChildProcess::spawn(self.name(), &mut self.command())?;
        // ssh exits quickly when the forward cannot be established
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Some(reason) = process.exited() {
            return Err(AppError::process(self.name(), reason));
        }
        debug!(remote = self.remote_port, local = self.local_port, "Reverse tunnel up");
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
